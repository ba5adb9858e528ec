//! Directory listing entries as presented to callers of the virtual filesystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a directory listing.
///
/// Computed on demand from a delimiter-scoped listing call and never cached.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileItem {
    /// Tenant-relative key. Directories keep their trailing `/`.
    pub key: String,

    /// Display name relative to the listed directory.
    pub name: String,

    pub is_directory: bool,

    /// Size in bytes; absent for directories.
    pub size: Option<i64>,

    pub last_modified: Option<DateTime<Utc>>,

    pub etag: Option<String>,
}

/// The result of listing one directory level.
///
/// `truncated` is set when pagination was cut short by the page cap; callers
/// must treat the item list as incomplete in that case.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub items: Vec<FileItem>,
    pub truncated: bool,
}

impl Listing {
    pub fn files(&self) -> impl Iterator<Item = &FileItem> {
        self.items.iter().filter(|item| !item.is_directory)
    }
}
