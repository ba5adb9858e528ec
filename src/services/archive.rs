//! Zip and unzip of tenant files, composed from VFS and gateway calls.
//!
//! Encoding and decoding run on the blocking pool; the resulting uploads run
//! concurrently with a fixed bound. Neither operation is atomic: a failed
//! unzip keeps the entries that were written and reports each one.

use crate::{
    models::operation::{BatchReport, EntryOutcome, ErrorKind},
    services::{
        content_type,
        gateway::StorageError,
        paths::{self, ScopedKey, SYSTEM_PREFIX},
        vfs::{VfsError, VfsResult, VirtualFs, outcome},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, stream};
use serde_json::json;
use std::{
    collections::HashSet,
    io::{Cursor, Read, Write},
};
use tracing::{info, warn};
use zip::{CompressionMethod, ZipArchive, ZipWriter, result::ZipError, write::SimpleFileOptions};

pub const UNZIP_MARKER_PREFIX: &str = "_system/unzip/";
const DEFAULT_ARCHIVE_NAME: &str = "archive.zip";

#[derive(Clone)]
pub struct ArchiveService {
    vfs: VirtualFs,
    limits: UnzipLimits,
}

/// Bounds applied while expanding an archive.
#[derive(Debug, Clone, Copy)]
pub struct UnzipLimits {
    /// Entry writes in flight at once.
    pub concurrency: usize,
    /// Largest decompressed size accepted for a single entry.
    pub max_entry_bytes: u64,
    /// Decompressed bytes accepted across the whole archive.
    pub max_total_bytes: u64,
}

/// One source file resolved for packing.
struct Source {
    key: ScopedKey,
    entry_name: String,
}

enum Payload {
    Ready { path: String, data: Bytes },
    Unsafe,
    Unreadable(String),
    Oversized(String),
}

struct DecodedEntry {
    name: String,
    payload: Payload,
}

impl ArchiveService {
    pub fn new(vfs: VirtualFs, limits: UnzipLimits) -> Self {
        Self {
            vfs,
            limits: UnzipLimits {
                concurrency: limits.concurrency.max(1),
                ..limits
            },
        }
    }

    /// Pack `sources` into one archive stored in `relative_dir`. Returns the
    /// archive's tenant-relative key.
    pub async fn zip(
        &self,
        tenant_id: &str,
        relative_dir: &str,
        sources: &[String],
        archive_name: Option<&str>,
    ) -> VfsResult<String> {
        if sources.is_empty() {
            return Err(VfsError::InvalidInput("nothing to archive".into()));
        }
        let (root, dir) = self.vfs.resolve(tenant_id, relative_dir).await?;
        let dir = dir.into_directory();
        let requested = sources
            .iter()
            .map(|source| root.scope(source))
            .collect::<Result<Vec<_>, _>>()?;
        let name = archive_file_name(archive_name, &requested)?;
        let archive_key = root.scope(&format!("{}{}", dir.relative(), name))?;

        let gateway = self.vfs.gateway();
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for key in requested {
            if key.is_directory() {
                let listing = gateway.list_recursive(key.full()).await?;
                if listing.truncated {
                    return Err(VfsError::TooManyObjects(key.relative().to_string()));
                }
                for item in listing.files() {
                    let child = root.adopt(&item.key)?;
                    if seen.insert(child.full().to_string()) {
                        files.push(child);
                    }
                }
            } else if seen.insert(key.full().to_string()) {
                files.push(key);
            }
        }
        files.retain(|key| key.full() != archive_key.full());
        if files.is_empty() {
            return Err(VfsError::InvalidInput("no files found to archive".into()));
        }

        let sources: Vec<Source> = files
            .into_iter()
            .map(|key| {
                let entry_name = key
                    .relative()
                    .strip_prefix(dir.relative())
                    .filter(|rest| !rest.is_empty())
                    .unwrap_or(key.relative())
                    .to_string();
                Source { key, entry_name }
            })
            .collect();

        let mut contents = Vec::with_capacity(sources.len());
        for source in &sources {
            let body = match gateway.get(source.key.full()).await {
                Ok(Some(body)) => body,
                Ok(None) => {
                    return Err(VfsError::SourceUnreadable {
                        key: source.key.relative().to_string(),
                        reason: "object not found".into(),
                    });
                }
                Err(err) => {
                    warn!(key = source.key.full(), error = %err, "zip source fetch failed");
                    return Err(VfsError::SourceUnreadable {
                        key: source.key.relative().to_string(),
                        reason: err.to_string(),
                    });
                }
            };
            contents.push((source.entry_name.clone(), body.bytes));
        }

        let entries = contents.len();
        let packed = tokio::task::spawn_blocking(move || pack(contents))
            .await
            .map_err(|err| StorageError::Backend(format!("zip task failed: {err}")))?
            .map_err(|err| StorageError::Backend(format!("zip encoding failed: {err}")))?;
        let size = packed.len();
        self.vfs
            .gateway()
            .put(archive_key.full(), packed, Some("application/zip"))
            .await?;

        info!(tenant = tenant_id, key = archive_key.full(), entries, size, "archive created");
        Ok(archive_key.relative().to_string())
    }

    /// Expand the archive at `archive_key` into `relative_dir`.
    pub async fn unzip(
        &self,
        tenant_id: &str,
        relative_dir: &str,
        archive_key: &str,
    ) -> VfsResult<BatchReport> {
        let (root, dir) = self.vfs.resolve(tenant_id, relative_dir).await?;
        let dir = dir.into_directory();
        let archive = root.scope(archive_key)?;
        if archive.is_directory() {
            return Err(VfsError::InvalidInput(format!(
                "`{}` is a directory",
                archive.relative()
            )));
        }

        let gateway = self.vfs.gateway();
        let body = gateway
            .get(archive.full())
            .await?
            .ok_or_else(|| VfsError::NotFound(format!("`{}` not found", archive.relative())))?;

        // A rerun invalidates the marker of any earlier run before writing.
        let marker_key = format!(
            "{UNZIP_MARKER_PREFIX}{}{}.done",
            dir.full(),
            archive.file_name()
        );
        debug_assert!(marker_key.starts_with(SYSTEM_PREFIX));
        gateway.delete(&marker_key).await?;

        let limits = self.limits;
        let decoded = tokio::task::spawn_blocking(move || decode(body.bytes, limits))
            .await
            .map_err(|err| StorageError::Backend(format!("unzip task failed: {err}")))?
            .map_err(|err| VfsError::InvalidArchive(err.to_string()))?;

        let mut outcomes = Vec::with_capacity(decoded.len());
        let mut uploads = Vec::new();
        for (index, entry) in decoded.into_iter().enumerate() {
            match entry.payload {
                Payload::Unsafe => {
                    warn!(tenant = tenant_id, entry = %entry.name, "unsafe archive entry skipped");
                    outcomes.push((
                        index,
                        EntryOutcome::failed(
                            entry.name,
                            None,
                            ErrorKind::AccessDenied,
                            "entry path escapes the target directory",
                        ),
                    ));
                }
                Payload::Oversized(reason) => {
                    warn!(
                        tenant = tenant_id,
                        entry = %entry.name,
                        %reason,
                        "oversized archive entry skipped"
                    );
                    outcomes.push((
                        index,
                        EntryOutcome::failed(entry.name, None, ErrorKind::InvalidInput, reason),
                    ));
                }
                Payload::Unreadable(reason) => outcomes.push((
                    index,
                    EntryOutcome::failed(entry.name, None, ErrorKind::InvalidInput, reason),
                )),
                Payload::Ready { path, data } => {
                    match root.scope(&format!("{}{}", dir.relative(), path)) {
                        Ok(key) => uploads.push((index, entry.name, key, data)),
                        Err(err) => outcomes.push((
                            index,
                            EntryOutcome::failed(
                                entry.name,
                                None,
                                ErrorKind::AccessDenied,
                                err.to_string(),
                            ),
                        )),
                    }
                }
            }
        }

        let written: Vec<(usize, EntryOutcome)> = stream::iter(uploads)
            .map(|(index, name, key, data)| async move {
                let content_type = content_type::guess(key.file_name());
                let result = gateway
                    .put(key.full(), data, Some(content_type))
                    .await
                    .map(|_| ())
                    .map_err(VfsError::from);
                (index, outcome(&name, key.relative(), result))
            })
            .buffer_unordered(self.limits.concurrency)
            .collect()
            .await;
        outcomes.extend(written);
        outcomes.sort_by_key(|(index, _)| *index);

        let report = BatchReport::from_entries(outcomes.into_iter().map(|(_, o)| o).collect());
        info!(
            tenant = tenant_id,
            archive = archive.full(),
            entries = report.entries.len(),
            failed = report.failed_count(),
            "archive expanded"
        );
        if !report.success {
            return Err(VfsError::PartialFailure(report));
        }

        let marker = json!({
            "archive": archive.relative(),
            "directory": dir.relative(),
            "entries": report.entries.len(),
            "completedAt": Utc::now(),
        });
        gateway
            .put(
                &marker_key,
                Bytes::from(marker.to_string()),
                Some("application/json"),
            )
            .await?;
        Ok(report)
    }
}

fn archive_file_name(requested: Option<&str>, sources: &[ScopedKey]) -> VfsResult<String> {
    match requested.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => {
            let name = paths::single_segment(name)?;
            if name.to_ascii_lowercase().ends_with(".zip") {
                Ok(name.to_string())
            } else {
                Ok(format!("{name}.zip"))
            }
        }
        None => match sources {
            [only] if !only.file_name().is_empty() => Ok(format!("{}.zip", only.file_name())),
            _ => Ok(DEFAULT_ARCHIVE_NAME.to_string()),
        },
    }
}

fn pack(contents: Vec<(String, Bytes)>) -> Result<Bytes, ZipError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in contents {
        writer.start_file(name, options)?;
        writer.write_all(&bytes)?;
    }
    Ok(Bytes::from(writer.finish()?.into_inner()))
}

/// Decompress every entry, holding at most `limits.max_total_bytes` in
/// memory. Entries past either cap are reported instead of read.
fn decode(bytes: Bytes, limits: UnzipLimits) -> Result<Vec<DecodedEntry>, ZipError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut entries = Vec::with_capacity(archive.len());
    let mut total: u64 = 0;
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let payload = match safe_entry_path(&name, file.enclosed_name().is_some()) {
            None => Payload::Unsafe,
            Some(path) => {
                let remaining = limits.max_total_bytes.saturating_sub(total);
                let budget = limits.max_entry_bytes.min(remaining);
                let oversized = || {
                    if budget < limits.max_entry_bytes {
                        Payload::Oversized(format!(
                            "archive expands past the {} byte limit",
                            limits.max_total_bytes
                        ))
                    } else {
                        Payload::Oversized(format!(
                            "entry expands past the {} byte limit",
                            limits.max_entry_bytes
                        ))
                    }
                };
                if file.size() > budget {
                    oversized()
                } else {
                    // The header size can lie; never read more than the budget.
                    let mut data = Vec::new();
                    match file.by_ref().take(budget.saturating_add(1)).read_to_end(&mut data) {
                        Ok(read) if read as u64 > budget => oversized(),
                        Ok(read) => {
                            total += read as u64;
                            Payload::Ready {
                                path,
                                data: Bytes::from(data),
                            }
                        }
                        Err(err) => {
                            Payload::Unreadable(format!("entry could not be decoded: {err}"))
                        }
                    }
                }
            }
        };
        entries.push(DecodedEntry { name, payload });
    }
    Ok(entries)
}

/// Normalized relative path of an archive entry, or `None` when the entry is
/// absolute or climbs out of the extraction directory.
fn safe_entry_path(name: &str, enclosed: bool) -> Option<String> {
    if !enclosed || name.starts_with('/') {
        return None;
    }
    paths::normalize(name).ok().filter(|path| !path.is_empty())
}
