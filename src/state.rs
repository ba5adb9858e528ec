//! Shared application state handed to every handler.

use crate::services::{
    archive::{ArchiveService, UnzipLimits},
    gateway::StorageGateway,
    local_store::LocalObjectStore,
    resolver::ContentResolver,
    tenants::SharedTenants,
    uploads::UploadCoordinator,
    vfs::VirtualFs,
};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};

/// Tunables the services are built with.
#[derive(Debug, Clone)]
pub struct ServiceLimits {
    pub max_presign_ttl: Duration,
    pub unzip: UnzipLimits,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub vfs: VirtualFs,
    pub archives: ArchiveService,
    pub uploads: UploadCoordinator,
    pub resolver: ContentResolver,
    /// Set when the local backend serves presigned transfers itself.
    pub local: Option<LocalObjectStore>,
    /// Apex domain for host-based site routing (`demo.example.com`).
    pub root_domain: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        db: Arc<SqlitePool>,
        gateway: StorageGateway,
        tenants: SharedTenants,
        local: Option<LocalObjectStore>,
        root_domain: Option<String>,
        limits: ServiceLimits,
    ) -> Self {
        let vfs = VirtualFs::new(gateway.clone(), tenants.clone());
        Self {
            db,
            archives: ArchiveService::new(vfs.clone(), limits.unzip),
            uploads: UploadCoordinator::new(vfs.clone(), limits.max_presign_ttl),
            resolver: ContentResolver::new(tenants, gateway),
            vfs,
            local,
            root_domain: root_domain
                .map(|domain| domain.trim().trim_matches('.').to_ascii_lowercase())
                .filter(|domain| !domain.is_empty())
                .map(Arc::from),
        }
    }
}
