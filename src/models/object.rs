//! Metadata for a single stored object (blob) in the backing store.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Metadata describing one object, as reported by the storage gateway.
///
/// The struct does not carry the payload; see [`ObjectBody`] for reads.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Full object key inside the bucket's flat namespace.
    pub key: String,

    /// Content type (MIME type) recorded at upload time.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Entity tag, unquoted. Changes whenever the payload changes.
    pub etag: Option<String>,

    /// Timestamp when the object was last written.
    pub last_modified: DateTime<Utc>,
}

/// An object payload together with its metadata.
#[derive(Clone, Debug)]
pub struct ObjectBody {
    pub meta: ObjectMeta,
    pub bytes: Bytes,
}

impl ObjectMeta {
    /// True for zero-byte directory marker objects (`key` ends in `/`).
    pub fn is_directory_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}
