//! Presigned transfer URLs scoped to one tenant key.

use crate::{
    models::operation::TransferTicket,
    services::{
        content_type,
        gateway::PresignMethod,
        paths,
        vfs::{VfsError, VfsResult, VirtualFs},
    },
};
use std::time::Duration;
use tracing::info;

const MIN_TTL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct UploadCoordinator {
    vfs: VirtualFs,
    max_ttl: Duration,
}

impl UploadCoordinator {
    pub fn new(vfs: VirtualFs, max_ttl: Duration) -> Self {
        Self {
            vfs,
            max_ttl: max_ttl.max(MIN_TTL),
        }
    }

    /// Requested lifetime clamped to `[1s, max_ttl]`; absent means `max_ttl`.
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.max_ttl).clamp(MIN_TTL, self.max_ttl)
    }

    /// URL for a direct `PUT` of `filename` into `relative_dir`. Directory
    /// components in `filename` are discarded.
    pub async fn issue_upload_url(
        &self,
        tenant_id: &str,
        relative_dir: &str,
        filename: &str,
        content_type: Option<&str>,
        ttl: Option<Duration>,
    ) -> VfsResult<TransferTicket> {
        let name = paths::final_segment(filename)?;
        let (root, dir) = self.vfs.resolve(tenant_id, relative_dir).await?;
        let key = root.scope(&format!("{}{}", dir.into_directory().relative(), name))?;
        let content_type = content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| content_type::guess(name));
        let ttl = self.effective_ttl(ttl);

        let presigned = self
            .vfs
            .gateway()
            .presign(key.full(), PresignMethod::Put, ttl, Some(content_type))
            .await?;
        info!(tenant = tenant_id, key = key.full(), ttl_secs = ttl.as_secs(), "upload url issued");
        Ok(TransferTicket {
            key: key.relative().to_string(),
            url: presigned.url,
            expires_at: presigned.expires_at,
        })
    }

    /// URL for a direct `GET` of an existing file.
    pub async fn issue_download_url(
        &self,
        tenant_id: &str,
        relative_key: &str,
        ttl: Option<Duration>,
    ) -> VfsResult<TransferTicket> {
        let (_, key) = self.vfs.resolve(tenant_id, relative_key).await?;
        if key.is_directory() {
            return Err(VfsError::InvalidInput(format!("`{}` is a directory", key.relative())));
        }
        let gateway = self.vfs.gateway();
        if gateway.head(key.full()).await?.is_none() {
            return Err(VfsError::NotFound(format!("`{}` not found", key.relative())));
        }
        let ttl = self.effective_ttl(ttl);
        let presigned = gateway
            .presign(key.full(), PresignMethod::Get, ttl, None)
            .await?;
        info!(tenant = tenant_id, key = key.full(), ttl_secs = ttl.as_secs(), "download url issued");
        Ok(TransferTicket {
            key: key.relative().to_string(),
            url: presigned.url,
            expires_at: presigned.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::operation::ErrorKind,
        services::{
            memory_store::MemoryObjectStore,
            vfs::tests::{ROOT, vfs_over},
        },
    };
    use chrono::Utc;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryObjectStore>, UploadCoordinator) {
        let store = Arc::new(MemoryObjectStore::new());
        let uploads = UploadCoordinator::new(vfs_over(store.clone()), Duration::from_secs(3600));
        (store, uploads)
    }

    #[tokio::test]
    async fn hostile_filename_stays_in_tenant_directory() {
        let (store, uploads) = setup();
        let ticket = uploads
            .issue_upload_url("site-1", "", "../../other-tenant/secret.txt", None, None)
            .await
            .unwrap();

        assert_eq!(ticket.key, "secret.txt");
        let expected = urlencoding::encode(&format!("{ROOT}secret.txt")).into_owned();
        assert!(ticket.url.contains(&expected), "{}", ticket.url);
        assert_eq!(store.calls("presign"), 1);
    }

    #[tokio::test]
    async fn backslash_filenames_keep_the_last_segment() {
        let (_, uploads) = setup();
        let ticket = uploads
            .issue_upload_url("site-1", "img", "C:\\Users\\me\\photo.png", None, None)
            .await
            .unwrap();
        assert_eq!(ticket.key, "img/photo.png");
    }

    #[tokio::test]
    async fn rejects_traversal_dirs_and_empty_names_without_backend_calls() {
        let (store, uploads) = setup();
        let err = uploads
            .issue_upload_url("site-1", "../other", "a.txt", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);

        for name in ["", "..", "../", "///"] {
            let err = uploads
                .issue_upload_url("site-1", "", name, None, None)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "{name:?}");
        }
        assert_eq!(store.total_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_tenant_is_not_found() {
        let (_, uploads) = setup();
        let err = uploads
            .issue_upload_url("missing", "", "a.txt", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn ttl_is_clamped() {
        let (_, uploads) = setup();
        assert_eq!(uploads.effective_ttl(None), Duration::from_secs(3600));
        assert_eq!(
            uploads.effective_ttl(Some(Duration::from_secs(86_400))),
            Duration::from_secs(3600)
        );
        assert_eq!(uploads.effective_ttl(Some(Duration::ZERO)), Duration::from_secs(1));

        let ticket = uploads
            .issue_upload_url("site-1", "", "a.txt", None, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let remaining = ticket.expires_at - Utc::now();
        assert!(remaining.num_seconds() <= 60);
    }

    #[tokio::test]
    async fn download_requires_an_existing_file() {
        let (store, uploads) = setup();
        let err = uploads
            .issue_download_url("site-1", "nope.txt", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        store.seed(&format!("{ROOT}docs/a.pdf"), b"%PDF", Some("application/pdf"));
        let ticket = uploads
            .issue_download_url("site-1", "docs/a.pdf", Some(Duration::from_secs(120)))
            .await
            .unwrap();
        assert_eq!(ticket.key, "docs/a.pdf");
        assert!(ticket.url.contains("method=GET"));
    }
}
