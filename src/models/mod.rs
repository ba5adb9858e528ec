//! Core data models for the tenant virtual filesystem.
//!
//! Everything here is a derived view: the only persistent state is the set of
//! objects in the backing store (plus instance records in the tenant
//! directory). Models serialize as JSON via `serde`, and the ones persisted in
//! SQLite map to rows via `sqlx::FromRow`.

pub mod file_item;
pub mod instance;
pub mod object;
pub mod operation;
