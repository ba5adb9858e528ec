//! HTTP handlers, grouped by surface.

pub mod fs_handlers;
pub mod health_handlers;
pub mod site_handlers;
pub mod transfer_handlers;
