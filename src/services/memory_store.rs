//! In-process object store.
//!
//! Useful for development (`--backend memory`) and as the gateway double in
//! tests: it counts every backend call so tests can assert that rejected
//! requests never reached storage.

use crate::{
    models::object::{ObjectBody, ObjectMeta},
    services::gateway::{
        ListPage, ObjectGateway, PresignMethod, PresignedUrl, StorageError, StorageResult,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Mutex,
    time::Duration,
};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Clone, Debug)]
struct Entry {
    meta: ObjectMeta,
    bytes: Bytes,
}

pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Entry>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failing_keys: Mutex<HashMap<String, BTreeSet<&'static str>>>,
    page_size: usize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(HashMap::new()),
            failing_keys: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    /// Insert an object without counting it as a backend call.
    pub fn seed(&self, key: &str, bytes: &[u8], content_type: Option<&str>) -> ObjectMeta {
        let bytes = Bytes::copy_from_slice(bytes);
        let meta = meta_for(key, &bytes, content_type.map(str::to_string));
        self.lock_objects()
            .insert(key.to_string(), Entry { meta: meta.clone(), bytes });
        meta
    }

    /// Total number of backend calls made through the trait.
    pub fn total_calls(&self) -> usize {
        self.lock_calls().values().sum()
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.lock_calls().get(operation).copied().unwrap_or(0)
    }

    /// Every stored key, in order.
    pub fn keys(&self) -> Vec<String> {
        self.lock_objects().keys().cloned().collect()
    }

    pub fn bytes_of(&self, key: &str) -> Option<Bytes> {
        self.lock_objects().get(key).map(|e| e.bytes.clone())
    }

    /// Make `operation` on `key` fail with a backend error from now on.
    pub fn fail_on(&self, operation: &'static str, key: &str) {
        self.failing_keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(key.to_string())
            .or_default()
            .insert(operation);
    }

    fn record(&self, operation: &'static str, key: &str) -> StorageResult<()> {
        *self.lock_calls().entry(operation).or_insert(0) += 1;
        let failing = self.failing_keys.lock().unwrap_or_else(|p| p.into_inner());
        if failing
            .get(key)
            .is_some_and(|ops| ops.contains(operation))
        {
            return Err(StorageError::Backend(format!(
                "injected {operation} failure for `{key}`"
            )));
        }
        Ok(())
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Entry>> {
        self.objects.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, usize>> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn meta_for(key: &str, bytes: &Bytes, content_type: Option<String>) -> ObjectMeta {
    ObjectMeta {
        key: key.to_string(),
        content_type,
        size_bytes: bytes.len() as i64,
        etag: Some(format!("{:x}", md5::compute(bytes))),
        last_modified: Utc::now(),
    }
}

#[async_trait]
impl ObjectGateway for MemoryObjectStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
    ) -> StorageResult<ListPage> {
        self.record("list_page", prefix)?;
        let objects = self.lock_objects();

        let mut rows: Vec<&Entry> = objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| continuation_token.is_none_or(|t| k.as_str() > t))
            .map(|(_, e)| e)
            .take(self.page_size + 1)
            .collect();

        let mut next_token = None;
        if rows.len() > self.page_size {
            rows.truncate(self.page_size);
            next_token = rows.last().map(|e| e.meta.key.clone());
        }

        let mut page = ListPage {
            next_token,
            ..ListPage::default()
        };
        let mut prefixes = BTreeSet::new();
        for entry in rows {
            let rest = &entry.meta.key[prefix.len()..];
            if let Some(delim) = delimiter {
                if let Some(pos) = rest.find(delim) {
                    prefixes.insert(format!("{prefix}{}", &rest[..pos + delim.len()]));
                    continue;
                }
            }
            page.objects.push(entry.meta.clone());
        }
        page.common_prefixes = prefixes.into_iter().collect();
        Ok(page)
    }

    async fn get(&self, key: &str) -> StorageResult<Option<ObjectBody>> {
        self.record("get", key)?;
        Ok(self.lock_objects().get(key).map(|e| ObjectBody {
            meta: e.meta.clone(),
            bytes: e.bytes.clone(),
        }))
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        self.record("head", key)?;
        Ok(self.lock_objects().get(key).map(|e| e.meta.clone()))
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<ObjectMeta> {
        self.record("put", key)?;
        if key.is_empty() {
            return Err(StorageError::InvalidObjectKey(key.to_string()));
        }
        let meta = meta_for(key, &body, content_type.map(str::to_string));
        self.lock_objects().insert(
            key.to_string(),
            Entry {
                meta: meta.clone(),
                bytes: body,
            },
        );
        Ok(meta)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.record("delete", key)?;
        self.lock_objects().remove(key);
        Ok(())
    }

    async fn delete_if_match(&self, key: &str, etag: &str) -> StorageResult<()> {
        self.record("delete_if_match", key)?;
        let mut objects = self.lock_objects();
        let current = objects
            .get(key)
            .is_some_and(|entry| entry.meta.etag.as_deref() == Some(etag));
        if !current {
            return Err(StorageError::PreconditionFailed {
                key: key.to_string(),
            });
        }
        objects.remove(key);
        Ok(())
    }

    async fn copy(
        &self,
        src: &str,
        dst: &str,
        if_match: Option<&str>,
    ) -> StorageResult<ObjectMeta> {
        self.record("copy", src)?;
        let mut objects = self.lock_objects();
        let source = objects
            .get(src)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(src.to_string()))?;
        if let Some(expected) = if_match {
            if source.meta.etag.as_deref() != Some(expected) {
                return Err(StorageError::PreconditionFailed {
                    key: src.to_string(),
                });
            }
        }
        let meta = ObjectMeta {
            key: dst.to_string(),
            last_modified: Utc::now(),
            ..source.meta
        };
        objects.insert(
            dst.to_string(),
            Entry {
                meta: meta.clone(),
                bytes: source.bytes,
            },
        );
        Ok(meta)
    }

    async fn presign(
        &self,
        key: &str,
        method: PresignMethod,
        ttl: Duration,
        _content_type: Option<&str>,
    ) -> StorageResult<PresignedUrl> {
        self.record("presign", key)?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|err| StorageError::Backend(format!("invalid ttl: {err}")))?;
        Ok(PresignedUrl {
            url: format!(
                "memory:///{}?method={}&exp={}",
                urlencoding::encode(key),
                method.as_str(),
                expires_at.timestamp()
            ),
            expires_at,
        })
    }
}
