//! Storage, filesystem and content services.
//!
//! Layering, bottom-up: `gateway` (backend seam) with its `local_store`,
//! `memory_store` and `s3_store` backends; `paths` (the canonical key guard);
//! `vfs` on top of both; `archive`, `uploads` and `resolver` composed from
//! those. `reconcile` settles moves interrupted between copy and delete.

pub mod archive;
pub mod content_type;
pub mod gateway;
pub mod local_store;
pub mod memory_store;
pub mod paths;
pub mod presign;
pub mod reconcile;
pub mod resolver;
#[cfg(feature = "backend-s3")]
pub mod s3_store;
pub mod tenants;
pub mod uploads;
pub mod vfs;
