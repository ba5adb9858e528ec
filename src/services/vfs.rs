//! Virtual filesystem: hierarchical directory semantics over the flat store.
//!
//! Every operation takes a tenant (instance id) and a tenant-relative path.
//! Paths are canonicalized before the tenant is even looked up, so a rejected
//! path never costs a backend call. Directories are key prefixes ending in
//! `/`, optionally backed by a zero-byte marker object.

use crate::{
    models::{
        file_item::{FileItem, Listing},
        object::{ObjectBody, ObjectMeta},
        operation::{BatchReport, EntryOutcome, ErrorKind},
    },
    services::{
        content_type,
        gateway::{StorageError, StorageGateway},
        paths::{self, PathError, ScopedKey, TenantRoot},
        reconcile::MoveJournal,
        tenants::{SharedTenants, TenantError},
    },
};
use bytes::Bytes;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    AccessDenied(PathError),
    #[error("{0}")]
    InvalidInput(String),
    #[error("`{0}` was modified concurrently")]
    Conflict(String),
    #[error("copied `{src}` to `{dst}` but the source could not be removed: {reason}")]
    Inconsistent {
        src: String,
        dst: String,
        reason: String,
    },
    #[error("{} of {} entries failed", .0.failed_count(), .0.entries.len())]
    PartialFailure(BatchReport),
    #[error("source `{key}` could not be read: {reason}")]
    SourceUnreadable { key: String, reason: String },
    #[error("archive is not a readable zip file: {0}")]
    InvalidArchive(String),
    #[error("`{0}` holds more objects than one operation may touch")]
    TooManyObjects(String),
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Tenants(#[from] TenantError),
}

impl VfsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VfsError::NotFound(_) | VfsError::SourceUnreadable { .. } => ErrorKind::NotFound,
            VfsError::AccessDenied(_) => ErrorKind::AccessDenied,
            VfsError::InvalidInput(_)
            | VfsError::InvalidArchive(_)
            | VfsError::TooManyObjects(_) => ErrorKind::InvalidInput,
            VfsError::Conflict(_) => ErrorKind::Conflict,
            VfsError::Inconsistent { .. } => ErrorKind::Inconsistent,
            VfsError::PartialFailure(_) => ErrorKind::PartialFailure,
            VfsError::Storage(_) | VfsError::Tenants(_) => ErrorKind::BackendError,
        }
    }
}

impl From<PathError> for VfsError {
    fn from(err: PathError) -> Self {
        match err {
            PathError::InvalidName(_) => VfsError::InvalidInput(err.to_string()),
            other => VfsError::AccessDenied(other),
        }
    }
}

impl From<StorageError> for VfsError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => VfsError::NotFound(format!("`{key}` not found")),
            StorageError::PreconditionFailed { key } => VfsError::Conflict(key),
            StorageError::InvalidObjectKey(key) => {
                VfsError::InvalidInput(format!("invalid object key `{key}`"))
            }
            other => VfsError::Storage(other),
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;

/// Turn a per-entry result into a report line.
pub(crate) fn outcome(entry: &str, key: &str, result: VfsResult<()>) -> EntryOutcome {
    match result {
        Ok(()) => EntryOutcome::ok(entry, key),
        Err(err) => EntryOutcome::failed(entry, Some(key.to_string()), err.kind(), err.to_string()),
    }
}

#[derive(Clone)]
pub struct VirtualFs {
    gateway: StorageGateway,
    tenants: SharedTenants,
    journal: MoveJournal,
}

impl VirtualFs {
    pub fn new(gateway: StorageGateway, tenants: SharedTenants) -> Self {
        let journal = MoveJournal::new(gateway.clone());
        Self {
            gateway,
            tenants,
            journal,
        }
    }

    pub fn gateway(&self) -> &StorageGateway {
        &self.gateway
    }

    /// Storage root of a hosting instance.
    pub async fn tenant_root(&self, tenant_id: &str) -> VfsResult<TenantRoot> {
        let instance = self
            .tenants
            .lookup_by_id(tenant_id)
            .await?
            .ok_or_else(|| VfsError::NotFound(format!("instance `{tenant_id}` not found")))?;
        let prefix = instance.root_prefix().ok_or_else(|| {
            VfsError::NotFound(format!("instance `{tenant_id}` has no website storage"))
        })?;
        Ok(TenantRoot::new(prefix)?)
    }

    /// Canonicalize `relative` and bind it to the tenant's root.
    pub async fn resolve(&self, tenant_id: &str, relative: &str) -> VfsResult<(TenantRoot, ScopedKey)> {
        let canonical = paths::normalize(relative)?;
        let root = self.tenant_root(tenant_id).await?;
        let key = root.scope(&canonical)?;
        Ok((root, key))
    }

    pub async fn list_directory(&self, tenant_id: &str, relative: &str) -> VfsResult<Listing> {
        let (root, dir) = self.resolve(tenant_id, relative).await?;
        let dir = dir.into_directory();
        let listing = self.gateway.list(dir.full()).await?;
        Ok(relativize(&root, listing))
    }

    /// Create `name/` inside `relative`. Returns the new directory's key.
    pub async fn create_directory(
        &self,
        tenant_id: &str,
        relative: &str,
        name: &str,
    ) -> VfsResult<String> {
        let name = paths::single_segment(name)?;
        let (root, parent) = self.resolve(tenant_id, relative).await?;
        let parent = parent.into_directory();
        let dir = root.scope_directory(&format!("{}{}", parent.relative(), name))?;
        self.gateway.put(dir.full(), Bytes::new(), None).await?;
        info!(tenant = tenant_id, key = dir.full(), "directory created");
        Ok(dir.relative().to_string())
    }

    /// Rename within the same parent. Directory keys carry their contents.
    pub async fn rename(
        &self,
        tenant_id: &str,
        old_relative: &str,
        new_name: &str,
    ) -> VfsResult<BatchReport> {
        let new_name = paths::single_segment(new_name)?;
        let (root, src) = self.resolve(tenant_id, old_relative).await?;
        if src.relative().is_empty() {
            return Err(VfsError::InvalidInput("the root directory cannot be renamed".into()));
        }
        let mut target = format!("{}{}", src.parent_relative(), new_name);
        if src.is_directory() {
            target.push('/');
        }
        let dst = root.scope(&target)?;
        self.transfer(tenant_id, &root, src, dst).await
    }

    /// Move to a new tenant-relative path. A destination ending in `/` names
    /// the target directory and keeps the source's name.
    pub async fn move_entry(
        &self,
        tenant_id: &str,
        old_relative: &str,
        new_relative: &str,
    ) -> VfsResult<BatchReport> {
        let (root, src) = self.resolve(tenant_id, old_relative).await?;
        if src.relative().is_empty() {
            return Err(VfsError::InvalidInput("the root directory cannot be moved".into()));
        }
        let requested = root.scope(new_relative)?;
        let dst = if requested.is_directory() {
            let suffix = if src.is_directory() { "/" } else { "" };
            root.scope(&format!(
                "{}{}{}",
                requested.relative(),
                src.file_name(),
                suffix
            ))?
        } else if src.is_directory() {
            requested.into_directory()
        } else {
            requested
        };
        self.transfer(tenant_id, &root, src, dst).await
    }

    async fn transfer(
        &self,
        tenant_id: &str,
        root: &TenantRoot,
        src: ScopedKey,
        dst: ScopedKey,
    ) -> VfsResult<BatchReport> {
        if src == dst {
            return Ok(BatchReport::from_entries(vec![EntryOutcome::ok(
                src.relative(),
                dst.relative(),
            )]));
        }

        if !src.is_directory() {
            self.move_object(src.full(), dst.full()).await?;
            info!(tenant = tenant_id, src = src.full(), dst = dst.full(), "object moved");
            return Ok(BatchReport::from_entries(vec![EntryOutcome::ok(
                src.relative(),
                dst.relative(),
            )]));
        }

        if dst.full().starts_with(src.full()) {
            return Err(VfsError::InvalidInput(format!(
                "cannot move `{}` into itself",
                src.relative()
            )));
        }

        let listing = self.gateway.list_recursive(src.full()).await?;
        if listing.truncated {
            return Err(VfsError::TooManyObjects(src.relative().to_string()));
        }
        let marker = self.gateway.head(src.full()).await?;
        if listing.items.is_empty() && marker.is_none() {
            return Err(VfsError::NotFound(format!("`{}` not found", src.relative())));
        }

        let mut entries = Vec::with_capacity(listing.items.len() + 1);
        for item in &listing.items {
            let Some(rest) = item.key.strip_prefix(src.full()) else {
                continue;
            };
            let entry = root.strip(&item.key).unwrap_or(&item.key).to_string();
            let target = match root.adopt(&format!("{}{}", dst.full(), rest)) {
                Ok(target) => target,
                Err(err) => {
                    entries.push(outcome(&entry, rest, Err(err.into())));
                    continue;
                }
            };
            let result = self.move_object(&item.key, target.full()).await;
            entries.push(outcome(&entry, target.relative(), result));
        }
        // The marker goes last so a partial move still shows the source.
        if marker.is_some() {
            let result = self.move_object(src.full(), dst.full()).await;
            entries.push(outcome(src.relative(), dst.relative(), result));
        }

        let report = BatchReport::from_entries(entries);
        info!(
            tenant = tenant_id,
            src = src.full(),
            dst = dst.full(),
            moved = report.entries.len() - report.failed_count(),
            failed = report.failed_count(),
            "directory moved"
        );
        if report.success {
            Ok(report)
        } else {
            Err(VfsError::PartialFailure(report))
        }
    }

    /// Journaled, etag-guarded copy-then-delete of one object.
    async fn move_object(&self, src: &str, dst: &str) -> VfsResult<()> {
        let meta = self
            .gateway
            .head(src)
            .await?
            .ok_or_else(|| VfsError::NotFound(format!("`{src}` not found")))?;
        let etag = meta.etag.as_deref();
        if etag.is_none() {
            warn!(key = src, "backend reported no etag; move is unguarded");
        }

        let intent = self.journal.record(src, dst, etag).await?;

        if let Err(err) = self.gateway.copy(src, dst, etag).await {
            if let Err(clear) = self.journal.clear(&intent).await {
                warn!(id = %intent.id, error = %clear, "could not clear move intent after failed copy");
            }
            return Err(err.into());
        }

        let removed = match etag {
            Some(etag) => self.gateway.delete_if_match(src, etag).await,
            None => self.gateway.delete(src).await,
        };
        match removed {
            Ok(()) => {
                if let Err(err) = self.journal.clear(&intent).await {
                    warn!(id = %intent.id, error = %err, "move finished but its intent remains");
                }
                Ok(())
            }
            Err(StorageError::PreconditionFailed { .. }) => {
                warn!(src, dst, "source changed during move; both copies kept");
                if let Err(err) = self.journal.clear(&intent).await {
                    warn!(id = %intent.id, error = %err, "could not clear move intent");
                }
                Err(VfsError::Conflict(src.to_string()))
            }
            Err(err) => {
                error!(src, dst, id = %intent.id, error = %err, "source delete failed after copy; left for reconciliation");
                Err(VfsError::Inconsistent {
                    src: src.to_string(),
                    dst: dst.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Delete a file, or a directory with everything beneath it.
    pub async fn delete(&self, tenant_id: &str, relative: &str) -> VfsResult<BatchReport> {
        let (root, key) = self.resolve(tenant_id, relative).await?;
        if key.relative().is_empty() {
            return Err(VfsError::InvalidInput("the root directory cannot be deleted".into()));
        }

        if !key.is_directory() {
            self.gateway.delete(key.full()).await?;
            info!(tenant = tenant_id, key = key.full(), "object deleted");
            return Ok(BatchReport::from_entries(vec![EntryOutcome::ok(
                key.relative(),
                key.relative(),
            )]));
        }

        let listing = self.gateway.list_recursive(key.full()).await?;
        if listing.truncated {
            return Err(VfsError::TooManyObjects(key.relative().to_string()));
        }
        let mut entries = Vec::with_capacity(listing.items.len() + 1);
        for item in &listing.items {
            let relative = root.strip(&item.key).unwrap_or(&item.key).to_string();
            let result = self.gateway.delete(&item.key).await.map_err(VfsError::from);
            entries.push(outcome(&relative, &relative, result));
        }
        let result = self.gateway.delete(key.full()).await.map_err(VfsError::from);
        entries.push(outcome(key.relative(), key.relative(), result));

        let report = BatchReport::from_entries(entries);
        info!(
            tenant = tenant_id,
            key = key.full(),
            deleted = report.entries.len() - report.failed_count(),
            failed = report.failed_count(),
            "directory deleted"
        );
        if report.success {
            Ok(report)
        } else {
            Err(VfsError::PartialFailure(report))
        }
    }

    pub async fn read_file(&self, tenant_id: &str, relative: &str) -> VfsResult<ObjectBody> {
        let (root, key) = self.resolve(tenant_id, relative).await?;
        if key.is_directory() {
            return Err(VfsError::InvalidInput(format!("`{}` is a directory", key.relative())));
        }
        let mut body = self
            .gateway
            .get(key.full())
            .await?
            .ok_or_else(|| VfsError::NotFound(format!("`{}` not found", key.relative())))?;
        body.meta = relative_meta(&root, body.meta);
        Ok(body)
    }

    pub async fn write_file(
        &self,
        tenant_id: &str,
        relative: &str,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> VfsResult<ObjectMeta> {
        let (root, key) = self.resolve(tenant_id, relative).await?;
        if key.is_directory() {
            return Err(VfsError::InvalidInput(format!("`{}` is a directory", key.relative())));
        }
        self.store(tenant_id, &root, &key, bytes, content_type).await
    }

    /// Store an uploaded file in `relative_dir`. Only the final segment of
    /// `filename` is kept.
    pub async fn upload_file(
        &self,
        tenant_id: &str,
        relative_dir: &str,
        filename: &str,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> VfsResult<ObjectMeta> {
        let name = paths::final_segment(filename)?;
        let (root, dir) = self.resolve(tenant_id, relative_dir).await?;
        let key = root.scope(&format!("{}{}", dir.into_directory().relative(), name))?;
        self.store(tenant_id, &root, &key, bytes, content_type).await
    }

    async fn store(
        &self,
        tenant_id: &str,
        root: &TenantRoot,
        key: &ScopedKey,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> VfsResult<ObjectMeta> {
        let content_type = content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| content_type::guess(key.file_name()));
        let meta = self.gateway.put(key.full(), bytes, Some(content_type)).await?;
        info!(tenant = tenant_id, key = key.full(), size = meta.size_bytes, "file stored");
        Ok(relative_meta(root, meta))
    }
}

fn relative_meta(root: &TenantRoot, mut meta: ObjectMeta) -> ObjectMeta {
    if let Some(relative) = root.strip(&meta.key) {
        meta.key = relative.to_string();
    }
    meta
}

/// Rewrite full keys of a listing to tenant-relative ones.
fn relativize(root: &TenantRoot, listing: Listing) -> Listing {
    let items = listing
        .items
        .into_iter()
        .filter_map(|item| {
            let key = root.strip(&item.key)?.to_string();
            Some(FileItem { key, ..item })
        })
        .collect();
    Listing {
        items,
        truncated: listing.truncated,
    }
}
