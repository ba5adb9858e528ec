//! LocalObjectStore: a self-hosted object store backed by SQLite for metadata
//! and local disk for payloads.
//!
//! Payloads are sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{digest}` where the shards and digest
//! come from MD5(bucket/key). Keying the file by digest keeps object keys
//! (including directory markers ending in `/`) out of filesystem paths
//! entirely. Presigned URLs point back at this process (see
//! [`crate::handlers::transfer_handlers`]).

use crate::{
    models::object::{ObjectBody, ObjectMeta},
    services::{
        gateway::{
            ListPage, ObjectGateway, PresignMethod, PresignedUrl, StorageError, StorageResult,
        },
        presign::{SignedParams, UrlSigner},
    },
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MAX_KEYS_PER_PAGE: usize = 1000;

#[derive(Clone)]
pub struct LocalObjectStore {
    /// Shared SQLite connection pool used for metadata operations.
    db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,

    bucket: String,

    signer: UrlSigner,

    page_size: usize,
}

impl LocalObjectStore {
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
        signer: UrlSigner,
    ) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            bucket: bucket.into(),
            signer,
            page_size: MAX_KEYS_PER_PAGE,
        }
    }

    /// Override the listing page size (clamped to 1..=1000).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_KEYS_PER_PAGE);
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Verify a presigned request against this store's signing key.
    pub fn verify_presigned(&self, key: &str, method: PresignMethod, params: &SignedParams) -> bool {
        self.signer.verify(key, method, params)
    }

    /// Reject keys that can never be valid object keys: empty, overlong,
    /// absolute, or containing control characters or `..` segments.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        let invalid = || StorageError::InvalidObjectKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    /// Shard directories and file name for an object key.
    fn object_path(&self, key: &str) -> PathBuf {
        let digest = md5::compute(format!("{}/{}", self.bucket, key));
        let mut path = self.bucket_root();
        path.push(format!("{:02x}", digest[0]));
        path.push(format!("{:02x}", digest[1]));
        path.push(format!("{:x}", digest));
        path
    }

    async fn fetch_meta(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        let meta = sqlx::query_as::<_, ObjectMeta>(
            "SELECT key, content_type, size_bytes, etag, last_modified
             FROM objects WHERE bucket = ? AND key = ?",
        )
        .bind(&self.bucket)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(meta)
    }

    async fn upsert_meta(&self, meta: &ObjectMeta) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO objects (bucket, key, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(&self.bucket)
        .bind(&meta.key)
        .bind(&meta.content_type)
        .bind(meta.size_bytes)
        .bind(&meta.etag)
        .bind(meta.last_modified)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Stream-upload an object to disk and record its metadata.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes MD5/etag and size while streaming.
    /// - Renames into the final location, setting any previous payload aside.
    /// - Upserts the metadata row (overwrite semantics).
    ///
    /// Temp files are removed on every error path. If the upsert fails the
    /// previous payload is put back, so existing metadata never points at a
    /// missing or foreign file.
    pub async fn put_stream<S>(
        &self,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StorageResult<ObjectMeta>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        drop(file);

        let backup_path = parent.join(format!(".bak-{}", Uuid::new_v4()));
        let backup = match fs::rename(&file_path, &backup_path).await {
            Ok(()) => Some(backup_path),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            self.restore_payload(&file_path, backup.as_deref()).await;
            return Err(StorageError::Io(err));
        }

        let meta = ObjectMeta {
            key: key.to_string(),
            content_type,
            size_bytes,
            etag: Some(format!("{:x}", digest.compute())),
            last_modified: Utc::now(),
        };
        if let Err(err) = self.upsert_meta(&meta).await {
            self.restore_payload(&file_path, backup.as_deref()).await;
            return Err(err);
        }
        if let Some(backup) = backup {
            if let Err(err) = fs::remove_file(&backup).await {
                warn!(key, error = %err, "failed to remove replaced payload");
            }
        }
        debug!(key, size_bytes, "stored object");
        Ok(meta)
    }

    /// Undo a payload swap: move `backup` back over `file_path`, or drop the
    /// new payload when there was nothing to replace.
    async fn restore_payload(&self, file_path: &Path, backup: Option<&Path>) {
        let restored = match backup {
            Some(backup) => fs::rename(backup, file_path).await,
            None => fs::remove_file(file_path).await,
        };
        if let Err(err) = restored {
            warn!(
                path = %file_path.display(),
                error = %err,
                "failed to restore previous payload"
            );
        }
    }

    /// Open an object's payload for streaming. `None` when absent.
    pub async fn open_reader(&self, key: &str) -> StorageResult<Option<(ObjectMeta, File)>> {
        self.ensure_key_safe(key)?;
        let Some(meta) = self.fetch_meta(key).await? else {
            return Ok(None);
        };
        match File::open(self.object_path(key)).await {
            Ok(file) => Ok(Some((meta, file))),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(key, "metadata present but payload missing");
                Ok(None)
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// Up to `limit` rows under `prefix`, in key order, starting at `cursor`.
    async fn fetch_rows(
        &self,
        prefix: &str,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> StorageResult<Vec<ObjectMeta>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT key, content_type, size_bytes, etag, last_modified \
             FROM objects WHERE bucket = ",
        );
        builder.push_bind(&self.bucket);
        builder.push(" AND instr(key, ");
        builder.push_bind(prefix);
        builder.push(") = 1");

        match cursor {
            Some(Cursor::After(key)) => {
                builder.push(" AND key > ");
                builder.push_bind(key.clone());
            }
            Some(Cursor::From(bound)) => {
                builder.push(" AND key >= ");
                builder.push_bind(bound.clone());
            }
            None => {}
        }

        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(limit as i64);

        let rows = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    /// Remove a payload file and prune the shard directories it leaves empty.
    async fn remove_payload(&self, key: &str) -> StorageResult<()> {
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root()).await;
        }
        Ok(())
    }

    /// Recursively remove empty directories up to the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectGateway for LocalObjectStore {
    fn name(&self) -> &'static str {
        "local"
    }

    /// List objects in key order, grouping keys under `delimiter` into common
    /// prefixes. A page holds at most `page_size` entries, each common prefix
    /// counting once: the query seeks past a prefix as soon as it is emitted.
    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
    ) -> StorageResult<ListPage> {
        let mut cursor = continuation_token.map(decode_continuation_token).transpose()?;
        let mut page = ListPage::default();

        loop {
            let room = self.page_size - page.objects.len() - page.common_prefixes.len();
            let rows = self.fetch_rows(prefix, cursor.as_ref(), room + 1).await?;
            let more = rows.len() > room;

            let mut jumped = false;
            let mut finished = false;
            for obj in rows.into_iter().take(room) {
                let common =
                    delimiter.and_then(|delim| compute_common_prefix(&obj.key, prefix, delim));
                if let Some(common) = common {
                    match prefix_upper_bound(&common) {
                        Some(bound) => cursor = Some(Cursor::From(bound)),
                        None => finished = true,
                    }
                    page.common_prefixes.push(common);
                    jumped = true;
                    break;
                }
                cursor = Some(Cursor::After(obj.key.clone()));
                page.objects.push(obj);
            }

            if finished || (!jumped && !more) {
                break;
            }
            if page.objects.len() + page.common_prefixes.len() == self.page_size {
                page.next_token = cursor.as_ref().map(encode_continuation_token);
                break;
            }
        }

        Ok(page)
    }

    async fn get(&self, key: &str) -> StorageResult<Option<ObjectBody>> {
        self.ensure_key_safe(key)?;
        let Some(meta) = self.fetch_meta(key).await? else {
            return Ok(None);
        };
        match fs::read(self.object_path(key)).await {
            Ok(bytes) => Ok(Some(ObjectBody {
                meta,
                bytes: Bytes::from(bytes),
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(key, "metadata present but payload missing");
                Ok(None)
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        self.ensure_key_safe(key)?;
        self.fetch_meta(key).await
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<ObjectMeta> {
        let stream = futures::stream::once(async move { Ok::<_, io::Error>(body) });
        self.put_stream(key, content_type.map(str::to_string), stream)
            .await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        sqlx::query("DELETE FROM objects WHERE bucket = ? AND key = ?")
            .bind(&self.bucket)
            .bind(key)
            .execute(&*self.db)
            .await?;
        self.remove_payload(key).await
    }

    async fn delete_if_match(&self, key: &str, etag: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let result = sqlx::query("DELETE FROM objects WHERE bucket = ? AND key = ? AND etag = ?")
            .bind(&self.bucket)
            .bind(key)
            .bind(etag)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::PreconditionFailed {
                key: key.to_string(),
            });
        }
        self.remove_payload(key).await
    }

    async fn copy(
        &self,
        src: &str,
        dst: &str,
        if_match: Option<&str>,
    ) -> StorageResult<ObjectMeta> {
        self.ensure_key_safe(src)?;
        self.ensure_key_safe(dst)?;
        let source = self
            .fetch_meta(src)
            .await?
            .ok_or_else(|| StorageError::NotFound(src.to_string()))?;
        if let Some(expected) = if_match {
            if source.etag.as_deref() != Some(expected) {
                return Err(StorageError::PreconditionFailed {
                    key: src.to_string(),
                });
            }
        }
        if src == dst {
            return Ok(source);
        }

        let src_path = self.object_path(src);
        let dst_path = self.object_path(dst);
        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = dst_path.with_file_name(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(err) = fs::copy(&src_path, &tmp_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound(src.to_string())
            } else {
                StorageError::Io(err)
            });
        }
        let backup_path = dst_path.with_file_name(format!(".bak-{}", Uuid::new_v4()));
        let backup = match fs::rename(&dst_path, &backup_path).await {
            Ok(()) => Some(backup_path),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };
        if let Err(err) = fs::rename(&tmp_path, &dst_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            self.restore_payload(&dst_path, backup.as_deref()).await;
            return Err(StorageError::Io(err));
        }

        let meta = ObjectMeta {
            key: dst.to_string(),
            last_modified: Utc::now(),
            ..source
        };
        if let Err(err) = self.upsert_meta(&meta).await {
            self.restore_payload(&dst_path, backup.as_deref()).await;
            return Err(err);
        }
        if let Some(backup) = backup {
            let _ = fs::remove_file(&backup).await;
        }
        Ok(meta)
    }

    async fn presign(
        &self,
        key: &str,
        method: PresignMethod,
        ttl: Duration,
        content_type: Option<&str>,
    ) -> StorageResult<PresignedUrl> {
        self.ensure_key_safe(key)?;
        let (url, expires_at) = self.signer.sign(key, method, ttl, content_type);
        Ok(PresignedUrl { url, expires_at })
    }
}

/// Compute a synthetic "common prefix" for delimiter-scoped listings.
///
/// Returns `Some(prefix)` if the key lies in a sub-level beneath
/// `requested_prefix`, otherwise `None`.
fn compute_common_prefix(key: &str, requested_prefix: &str, delimiter: &str) -> Option<String> {
    let after_prefix = key.strip_prefix(requested_prefix)?;
    let pos = after_prefix.find(delimiter)?;
    let mut combined = String::from(requested_prefix);
    combined.push_str(&after_prefix[..pos + delimiter.len()]);
    Some(combined)
}

/// Where the next listing query resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    /// Strictly after the last object returned.
    After(String),
    /// At the first key not under an emitted common prefix.
    From(String),
}

/// Smallest string ordered after every key that starts with `prefix`.
/// `None` when no such string exists.
fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last {
            '\u{D7FF}' => Some('\u{E000}'),
            other => char::from_u32(other as u32 + 1),
        };
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

fn encode_continuation_token(cursor: &Cursor) -> String {
    let raw = match cursor {
        Cursor::After(key) => format!(">{key}"),
        Cursor::From(bound) => format!("={bound}"),
    };
    general_purpose::STANDARD.encode(raw)
}

fn decode_continuation_token(token: &str) -> StorageResult<Cursor> {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|raw| match raw.strip_prefix('>') {
            Some(key) => Some(Cursor::After(key.to_string())),
            None => raw.strip_prefix('=').map(|bound| Cursor::From(bound.to_string())),
        })
        .ok_or_else(|| StorageError::Backend(format!("malformed continuation token `{token}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::memory_pool, services::gateway::StorageGateway};
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> LocalObjectStore {
        let pool = memory_pool().await;
        LocalObjectStore::new(
            Arc::new(pool),
            dir.path(),
            "sites",
            UrlSigner::new("secret", "sites", "http://localhost:3000"),
        )
    }

    #[tokio::test]
    async fn put_get_roundtrip_records_metadata() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let meta = store
            .put("a/b.txt", Bytes::from_static(b"hello"), Some("text/plain"))
            .await
            .unwrap();
        assert_eq!(meta.size_bytes, 5);
        assert_eq!(meta.etag.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));

        let body = store.get("a/b.txt").await.unwrap().unwrap();
        assert_eq!(&body.bytes[..], b"hello");
        assert_eq!(body.meta.content_type.as_deref(), Some("text/plain"));
        assert!(store.get("a/missing.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_reader_streams_payload() {
        use tokio::io::AsyncReadExt;

        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.put("big.bin", Bytes::from(vec![7u8; 4096]), None).await.unwrap();

        let (meta, mut file) = store.open_reader("big.bin").await.unwrap().unwrap();
        assert_eq!(meta.size_bytes, 4096);
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len(), 4096);
        assert!(store.open_reader("nope.bin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directory_markers_are_plain_objects() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.put("docs/", Bytes::new(), None).await.unwrap();
        store.put("docs/a.txt", Bytes::from_static(b"a"), None).await.unwrap();
        let marker = store.head("docs/").await.unwrap().unwrap();
        assert_eq!(marker.size_bytes, 0);
        assert!(marker.is_directory_marker());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_prunes_payload() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.put("x.txt", Bytes::from_static(b"x"), None).await.unwrap();
        let path = store.object_path("x.txt");
        assert!(path.exists());
        store.delete("x.txt").await.unwrap();
        assert!(!path.exists());
        store.delete("x.txt").await.unwrap();
        assert!(store.head("x.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conditional_delete_checks_etag() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let meta = store.put("x.txt", Bytes::from_static(b"v1"), None).await.unwrap();
        store.put("x.txt", Bytes::from_static(b"v2"), None).await.unwrap();

        let err = store
            .delete_if_match("x.txt", meta.etag.as_deref().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PreconditionFailed { .. }));
        assert!(store.head("x.txt").await.unwrap().is_some());

        let current = store.head("x.txt").await.unwrap().unwrap();
        store
            .delete_if_match("x.txt", current.etag.as_deref().unwrap())
            .await
            .unwrap();
        assert!(store.head("x.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn copy_duplicates_payload_and_honours_if_match() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let meta = store.put("a.txt", Bytes::from_static(b"data"), Some("text/plain")).await.unwrap();

        let err = store.copy("a.txt", "b.txt", Some("bogus")).await.unwrap_err();
        assert!(matches!(err, StorageError::PreconditionFailed { .. }));

        let copied = store
            .copy("a.txt", "b.txt", meta.etag.as_deref())
            .await
            .unwrap();
        assert_eq!(copied.etag, meta.etag);
        let body = store.get("b.txt").await.unwrap().unwrap();
        assert_eq!(&body.bytes[..], b"data");
        assert_eq!(body.meta.content_type.as_deref(), Some("text/plain"));

        let missing = store.copy("nope.txt", "c.txt", None).await.unwrap_err();
        assert!(matches!(missing, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_overwrite_keeps_the_previous_payload() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let original = store.put("x.txt", Bytes::from_static(b"v1"), None).await.unwrap();

        sqlx::query(
            "CREATE TRIGGER reject_updates BEFORE UPDATE ON objects
             BEGIN SELECT RAISE(ABORT, 'metadata is read-only'); END",
        )
        .execute(&*store.db)
        .await
        .unwrap();

        let err = store.put("x.txt", Bytes::from_static(b"v2"), None).await.unwrap_err();
        assert!(matches!(err, StorageError::Sqlx(_)));

        let body = store.get("x.txt").await.unwrap().unwrap();
        assert_eq!(&body.bytes[..], b"v1");
        assert_eq!(body.meta.etag, original.etag);

        let shard = store.object_path("x.txt").parent().unwrap().to_path_buf();
        let mut leftovers = std::fs::read_dir(shard).unwrap().map(|e| e.unwrap().file_name());
        assert!(leftovers.all(|name| !name.to_string_lossy().starts_with('.')));
    }

    #[tokio::test]
    async fn failed_first_write_leaves_no_payload() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        sqlx::query(
            "CREATE TRIGGER reject_inserts BEFORE INSERT ON objects
             BEGIN SELECT RAISE(ABORT, 'metadata is read-only'); END",
        )
        .execute(&*store.db)
        .await
        .unwrap();

        assert!(store.put("y.txt", Bytes::from_static(b"v1"), None).await.is_err());
        assert!(!store.object_path("y.txt").exists());
        assert!(store.head("y.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_pages_through_gateway() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await.with_page_size(2);
        for key in ["p/", "p/a.txt", "p/b.txt", "p/c/d.txt", "p/c/e.txt", "p/f.txt", "q.txt"] {
            store.put(key, Bytes::from_static(b"1"), None).await.unwrap();
        }

        let first = store.list_page("p/", Some("/"), None).await.unwrap();
        assert!(first.next_token.is_some());

        let gateway = StorageGateway::new(Arc::new(store), 0, 100);
        let listing = gateway.list("p/").await.unwrap();
        let names: Vec<_> = listing.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a.txt", "b.txt", "f.txt"]);
        assert!(!listing.truncated);

        let all = gateway.list_recursive("p/").await.unwrap();
        assert_eq!(all.items.len(), 5);
    }

    #[tokio::test]
    async fn delimited_listing_skips_past_large_subdirectories() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await.with_page_size(2);
        store.put("p/a.txt", Bytes::from_static(b"1"), None).await.unwrap();
        for i in 0..40 {
            let key = format!("p/m/{i:02}.txt");
            store.put(&key, Bytes::from_static(b"1"), None).await.unwrap();
        }
        store.put("p/z.txt", Bytes::from_static(b"1"), None).await.unwrap();

        let first = store.list_page("p/", Some("/"), None).await.unwrap();
        let names: Vec<_> = first.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(names, vec!["p/a.txt"]);
        assert_eq!(first.common_prefixes, vec!["p/m/".to_string()]);

        let second = store
            .list_page("p/", Some("/"), first.next_token.as_deref())
            .await
            .unwrap();
        let names: Vec<_> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(names, vec!["p/z.txt"]);
        assert!(second.common_prefixes.is_empty());
        assert!(second.next_token.is_none());

        let gateway = StorageGateway::new(Arc::new(store), 0, 2);
        let listing = gateway.list("p/").await.unwrap();
        let names: Vec<_> = listing.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["m", "a.txt", "z.txt"]);
        assert!(!listing.truncated);
    }

    #[test]
    fn upper_bound_orders_after_the_prefix() {
        assert_eq!(prefix_upper_bound("p/m/").as_deref(), Some("p/m0"));
        assert_eq!(prefix_upper_bound("a\u{D7FF}").as_deref(), Some("a\u{E000}"));
        assert_eq!(prefix_upper_bound("a\u{10FFFF}").as_deref(), Some("b"));
        assert_eq!(prefix_upper_bound(""), None);
    }

    #[test]
    fn continuation_tokens_round_trip_and_reject_garbage() {
        let after = Cursor::After("p/a.txt".into());
        let from = Cursor::From("p/m0".into());
        assert_eq!(decode_continuation_token(&encode_continuation_token(&after)).unwrap(), after);
        assert_eq!(decode_continuation_token(&encode_continuation_token(&from)).unwrap(), from);
        assert!(decode_continuation_token("not base64!").is_err());
        assert!(decode_continuation_token(&general_purpose::STANDARD.encode("p/a.txt")).is_err());
    }

    #[tokio::test]
    async fn unsafe_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        for key in ["", "/abs", "a/../b", "a\\b"] {
            let err = store.put(key, Bytes::new(), None).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidObjectKey(_)), "{key}");
        }
    }

    #[test]
    fn common_prefix_grouping() {
        assert_eq!(
            compute_common_prefix("p/c/d.txt", "p/", "/").as_deref(),
            Some("p/c/")
        );
        assert_eq!(compute_common_prefix("p/a.txt", "p/", "/"), None);
        assert_eq!(compute_common_prefix("q/a.txt", "p/", "/"), None);
    }
}
