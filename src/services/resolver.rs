//! Public content resolution: `(subdomain, path)` to a stored object.

use crate::services::{
    content_type,
    gateway::{StorageError, StorageGateway},
    paths::{self, PathError, TenantRoot},
    tenants::{SharedTenants, TenantError},
};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

const INDEX_DOCUMENT: &str = "index.html";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    AccessDenied(#[from] PathError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Tenants(#[from] TenantError),
}

/// A resolved object ready to be served.
#[derive(Debug, Clone)]
pub struct ServedContent {
    pub key: String,
    pub bytes: Bytes,
    pub content_type: String,
    pub etag: Option<String>,
    /// Server-side script source, served inert as plain text.
    pub script_source: bool,
}

#[derive(Clone)]
pub struct ContentResolver {
    tenants: SharedTenants,
    gateway: StorageGateway,
}

impl ContentResolver {
    pub fn new(tenants: SharedTenants, gateway: StorageGateway) -> Self {
        Self { tenants, gateway }
    }

    pub async fn resolve(&self, subdomain: &str, path: &str) -> Result<ServedContent, ResolveError> {
        let subdomain = subdomain.to_ascii_lowercase();
        let mut relative = paths::normalize(path)?;
        if relative.is_empty() || relative.ends_with('/') {
            relative.push_str(INDEX_DOCUMENT);
        }

        let instance = self
            .tenants
            .lookup_by_subdomain(&subdomain)
            .await?
            .ok_or_else(|| ResolveError::NotFound(format!("no site for `{subdomain}`")))?;
        let prefix = instance
            .root_prefix()
            .ok_or_else(|| ResolveError::NotFound(format!("`{subdomain}` is not a hosting site")))?;
        let key = TenantRoot::new(prefix)?.scope(&relative)?;

        let body = self
            .gateway
            .get(key.full())
            .await?
            .ok_or_else(|| ResolveError::NotFound(format!("`{}` not found", key.full())))?;

        let script_source = content_type::is_server_script(key.file_name());
        let content_type = if script_source {
            content_type::PLAIN_TEXT.to_string()
        } else {
            body.meta
                .content_type
                .filter(|ct| !ct.trim().is_empty())
                .unwrap_or_else(|| content_type::guess(key.file_name()).to_string())
        };
        debug!(key = key.full(), content_type, "resolved site content");

        Ok(ServedContent {
            key: key.full().to_string(),
            bytes: body.bytes,
            content_type,
            etag: body.meta.etag,
            script_source,
        })
    }
}

impl ResolveError {
    /// Log the true cause; visitors only ever see a generic status.
    pub fn log(&self, subdomain: &str, path: &str) {
        match self {
            ResolveError::NotFound(reason) => debug!(subdomain, path, reason, "site content not found"),
            ResolveError::AccessDenied(err) => {
                warn!(subdomain, path, error = %err, "site request rejected: access denied")
            }
            ResolveError::Storage(err) => {
                tracing::error!(subdomain, path, error = %err, "site content fetch failed")
            }
            ResolveError::Tenants(err) => {
                tracing::error!(subdomain, path, error = %err, "tenant lookup failed")
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ResolveError::NotFound(_) | ResolveError::AccessDenied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        memory_store::MemoryObjectStore,
        tenants::StaticTenantDirectory,
        vfs::tests::{ROOT, instances},
    };
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryObjectStore>, ContentResolver) {
        let store = Arc::new(MemoryObjectStore::new());
        let resolver = ContentResolver::new(
            Arc::new(StaticTenantDirectory(instances())),
            StorageGateway::new(store.clone(), 0, 10),
        );
        (store, resolver)
    }

    #[tokio::test]
    async fn empty_path_serves_index() {
        let (store, resolver) = setup();
        store.seed(&format!("{ROOT}index.html"), b"<h1>demo</h1>", Some("text/html"));

        let served = resolver.resolve("demo", "").await.unwrap();
        assert_eq!(served.key, "websites/demo/public_html/index.html");
        assert_eq!(served.content_type, "text/html");
        assert_eq!(served.bytes.as_ref(), b"<h1>demo</h1>");

        let served = resolver.resolve("DEMO", "/").await.unwrap();
        assert_eq!(served.key, "websites/demo/public_html/index.html");
    }

    #[tokio::test]
    async fn trailing_separator_serves_directory_index() {
        let (store, resolver) = setup();
        store.seed(&format!("{ROOT}blog/index.html"), b"blog", None);
        let served = resolver.resolve("demo", "blog/").await.unwrap();
        assert_eq!(served.key, format!("{ROOT}blog/index.html"));
        assert_eq!(served.content_type, "text/html; charset=utf-8");
    }

    #[tokio::test]
    async fn missing_object_and_unknown_site_are_not_found() {
        let (_, resolver) = setup();
        let err = resolver.resolve("demo", "").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
        let err = resolver.resolve("nobody", "").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[tokio::test]
    async fn scripts_are_served_as_plain_text() {
        let (store, resolver) = setup();
        store.seed(
            &format!("{ROOT}site.php"),
            b"<?php echo 'hi'; ?>",
            Some("application/x-httpd-php"),
        );
        let served = resolver.resolve("demo", "site.php").await.unwrap();
        assert_eq!(served.content_type, "text/plain; charset=utf-8");
        assert!(served.script_source);
        assert_eq!(served.bytes.as_ref(), b"<?php echo 'hi'; ?>");
    }

    #[tokio::test]
    async fn traversal_is_rejected_before_lookup() {
        let (store, resolver) = setup();
        let err = resolver
            .resolve("demo", "../../other/public_html/index.html")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::AccessDenied(_)));
        assert!(err.is_not_found());
        assert_eq!(store.total_calls(), 0);
    }

    #[tokio::test]
    async fn other_tenants_content_is_unreachable() {
        let (store, resolver) = setup();
        store.seed("websites/other/public_html/secret.html", b"x", None);
        let err = resolver
            .resolve("demo", "websites/other/public_html/secret.html")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }
}
