//! StorageGateway: typed access to the flat object store.
//!
//! [`ObjectGateway`] is the seam between the virtual filesystem and a concrete
//! backend (local disk, in-memory, S3/R2). Each method maps onto one backend
//! call. [`StorageGateway`] wraps a backend with the behaviour every caller
//! needs: bounded retries for transient faults and fully drained (or
//! explicitly truncated) listings.

use crate::models::{
    file_item::{FileItem, Listing},
    object::{ObjectBody, ObjectMeta},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::BTreeMap, future::Future, io, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

pub const DELIMITER: &str = "/";
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("precondition failed for `{key}`")]
    PreconditionFailed { key: String },
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Faults worth retrying: the request may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Backend(_) | StorageError::Sqlx(_) | StorageError::Io(_)
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One page of a delimiter-scoped listing.
#[derive(Debug, Default, Clone)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PresignMethod {
    Get,
    Put,
}

impl PresignMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PresignMethod::Get => "GET",
            PresignMethod::Put => "PUT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Some(PresignMethod::Get),
            "PUT" => Some(PresignMethod::Put),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Primitive object-store operations. One method, one backend call.
///
/// `get`/`head` report a missing object as `Ok(None)`; `delete` treats it as
/// success. `delete_if_match` and `copy` with `if_match` fail with
/// [`StorageError::PreconditionFailed`] when the object's current etag differs
/// (or the object is gone).
#[async_trait]
pub trait ObjectGateway: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
    ) -> StorageResult<ListPage>;

    async fn get(&self, key: &str) -> StorageResult<Option<ObjectBody>>;

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>>;

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<ObjectMeta>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn delete_if_match(&self, key: &str, etag: &str) -> StorageResult<()>;

    async fn copy(&self, src: &str, dst: &str, if_match: Option<&str>)
    -> StorageResult<ObjectMeta>;

    async fn presign(
        &self,
        key: &str,
        method: PresignMethod,
        ttl: Duration,
        content_type: Option<&str>,
    ) -> StorageResult<PresignedUrl>;
}

/// Explicit storage client injected into every component.
///
/// Cheap to clone; all clones share one backend.
#[derive(Clone)]
pub struct StorageGateway {
    backend: Arc<dyn ObjectGateway>,
    retries: usize,
    max_list_pages: usize,
}

impl StorageGateway {
    pub fn new(backend: Arc<dyn ObjectGateway>, retries: usize, max_list_pages: usize) -> Self {
        Self {
            backend,
            retries,
            max_list_pages: max_list_pages.max(1),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// List one directory level beneath `prefix`, merging files and
    /// sub-directories. The directory's own marker is excluded.
    pub async fn list(&self, prefix: &str) -> StorageResult<Listing> {
        self.drain(prefix, Some(DELIMITER)).await
    }

    /// List every object beneath `prefix` regardless of depth.
    pub async fn list_recursive(&self, prefix: &str) -> StorageResult<Listing> {
        self.drain(prefix, None).await
    }

    async fn drain(&self, prefix: &str, delimiter: Option<&str>) -> StorageResult<Listing> {
        let mut files = BTreeMap::new();
        let mut directories = BTreeMap::new();
        let mut token: Option<String> = None;
        let mut truncated = false;
        let mut pages = 0usize;

        loop {
            if pages == self.max_list_pages {
                warn!(
                    prefix,
                    pages, "listing stopped at page cap; result flagged as truncated"
                );
                truncated = true;
                break;
            }
            let backend = &self.backend;
            let current = token.as_deref();
            let page = with_retry(self.retries, move || {
                backend.list_page(prefix, delimiter, current)
            })
            .await?;
            pages += 1;

            for object in page.objects {
                if object.key == prefix {
                    continue;
                }
                let Some(name) = object.key.strip_prefix(prefix) else {
                    continue;
                };
                let item = FileItem {
                    name: name.to_string(),
                    key: object.key.clone(),
                    is_directory: object.is_directory_marker(),
                    size: Some(object.size_bytes),
                    last_modified: Some(object.last_modified),
                    etag: object.etag.clone(),
                };
                files.insert(object.key, item);
            }
            for common in page.common_prefixes {
                let Some(name) = common.strip_prefix(prefix) else {
                    continue;
                };
                let name = name.trim_end_matches('/').to_string();
                if name.is_empty() {
                    continue;
                }
                directories.entry(common.clone()).or_insert_with(|| FileItem {
                    name,
                    key: common,
                    is_directory: true,
                    size: None,
                    last_modified: None,
                    etag: None,
                });
            }

            match page.next_token {
                Some(next) if Some(next.as_str()) != token.as_deref() => token = Some(next),
                Some(_) => {
                    warn!(prefix, "backend repeated a continuation token; stopping");
                    truncated = true;
                    break;
                }
                None => break,
            }
        }

        debug!(
            prefix,
            pages,
            files = files.len(),
            directories = directories.len(),
            truncated,
            "listing drained"
        );

        let mut items: Vec<FileItem> = directories.into_values().collect();
        items.extend(files.into_values());
        Ok(Listing { items, truncated })
    }

    pub async fn get(&self, key: &str) -> StorageResult<Option<ObjectBody>> {
        let backend = &self.backend;
        with_retry(self.retries, move || backend.get(key)).await
    }

    pub async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        let backend = &self.backend;
        with_retry(self.retries, move || backend.head(key)).await
    }

    pub async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<ObjectMeta> {
        let backend = &self.backend;
        with_retry(self.retries, move || {
            backend.put(key, body.clone(), content_type)
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let backend = &self.backend;
        with_retry(self.retries, move || backend.delete(key)).await
    }

    pub async fn delete_if_match(&self, key: &str, etag: &str) -> StorageResult<()> {
        let backend = &self.backend;
        with_retry(self.retries, move || backend.delete_if_match(key, etag)).await
    }

    pub async fn copy(
        &self,
        src: &str,
        dst: &str,
        if_match: Option<&str>,
    ) -> StorageResult<ObjectMeta> {
        let backend = &self.backend;
        with_retry(self.retries, move || backend.copy(src, dst, if_match)).await
    }

    pub async fn presign(
        &self,
        key: &str,
        method: PresignMethod,
        ttl: Duration,
        content_type: Option<&str>,
    ) -> StorageResult<PresignedUrl> {
        self.backend.presign(key, method, ttl, content_type).await
    }
}

/// Run `op` up to `retries + 1` times, retrying only transient failures.
async fn with_retry<F, Fut, T>(retries: usize, mut op: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(attempt, error = %err, "transient storage failure; retrying");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_store::MemoryObjectStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gateway(store: Arc<MemoryObjectStore>, max_pages: usize) -> StorageGateway {
        StorageGateway::new(store, 2, max_pages)
    }

    #[tokio::test]
    async fn list_merges_files_and_directories() {
        let store = Arc::new(MemoryObjectStore::new());
        store.seed("site/index.html", b"<h1>hi</h1>", Some("text/html"));
        store.seed("site/", b"", None);
        store.seed("site/css/app.css", b"body{}", Some("text/css"));
        store.seed("site/img/", b"", None);
        store.seed("other/file.txt", b"x", None);

        let listing = gateway(store, 10).list("site/").await.unwrap();
        assert!(!listing.truncated);
        let names: Vec<_> = listing
            .items
            .iter()
            .map(|i| (i.name.as_str(), i.is_directory))
            .collect();
        assert_eq!(
            names,
            vec![("css", true), ("img", true), ("index.html", false)]
        );
    }

    #[tokio::test]
    async fn list_drains_every_page() {
        let store = Arc::new(MemoryObjectStore::with_page_size(2));
        for i in 0..7 {
            store.seed(&format!("p/f{i}.txt"), b"x", None);
        }
        let listing = gateway(store.clone(), 10).list("p/").await.unwrap();
        assert_eq!(listing.files().count(), 7);
        assert!(!listing.truncated);
        assert_eq!(store.calls("list_page"), 4);
    }

    #[tokio::test]
    async fn list_flags_truncation_at_page_cap() {
        let store = Arc::new(MemoryObjectStore::with_page_size(2));
        for i in 0..7 {
            store.seed(&format!("p/f{i}.txt"), b"x", None);
        }
        let listing = gateway(store, 2).list("p/").await.unwrap();
        assert!(listing.truncated);
        assert_eq!(listing.files().count(), 4);
    }

    #[tokio::test]
    async fn retries_only_transient_failures() {
        let attempts = AtomicUsize::new(0);
        let result: StorageResult<u8> = with_retry(2, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::Backend("flaky".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let attempts = AtomicUsize::new(0);
        let result: StorageResult<u8> = with_retry(2, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(StorageError::PreconditionFailed {
                    key: "k".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn presign_method_parses() {
        assert_eq!(PresignMethod::parse("put"), Some(PresignMethod::Put));
        assert_eq!(PresignMethod::parse("GET"), Some(PresignMethod::Get));
        assert_eq!(PresignMethod::parse("DELETE"), None);
    }
}
