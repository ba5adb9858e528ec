//! Result envelopes for the operation surface consumed by the UI and automation.
//!
//! Every operation answers with `{"success": true, ...}` or
//! `{"success": false, "error": "<kind>", "message": "..."}` and never lets a
//! failure escape as a transport-level error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error taxonomy shared by every operation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing object or tenant. Expected and non-fatal.
    NotFound,
    /// Path traversal or cross-tenant key attempt. Rejected before any
    /// backend call.
    AccessDenied,
    /// Network, auth or backend fault.
    BackendError,
    /// A multi-entry operation finished with mixed per-entry outcomes.
    PartialFailure,
    /// A concurrent writer changed an object between copy and delete.
    Conflict,
    /// Malformed caller input (empty names, separators in a single segment).
    InvalidInput,
    /// Copy succeeded but the source delete failed; duplicates remain until
    /// the reconciler runs.
    Inconsistent,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::BackendError => "backend_error",
            ErrorKind::PartialFailure => "partial_failure",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Inconsistent => "inconsistent",
        }
    }
}

/// Per-entry outcome for archive expansion and directory moves.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntryOutcome {
    /// Entry name as seen by the caller (zip-internal path or relative key).
    pub entry: String,

    /// Tenant-relative key written, when one was attempted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl EntryOutcome {
    pub fn ok(entry: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            key: Some(key.into()),
            success: true,
            error: None,
            message: None,
        }
    }

    pub fn failed(
        entry: impl Into<String>,
        key: Option<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            entry: entry.into(),
            key,
            success: false,
            error: Some(kind),
            message: Some(message.into()),
        }
    }
}

/// Itemized report of a multi-object operation.
///
/// `success` is false as soon as any entry failed; successful entries are
/// never rolled back.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub entries: Vec<EntryOutcome>,
    pub success: bool,
}

impl BatchReport {
    pub fn from_entries(entries: Vec<EntryOutcome>) -> Self {
        let success = entries.iter().all(|e| e.success);
        Self { entries, success }
    }

    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.success).count()
    }
}

/// A scoped, time-limited URL for a direct transfer against the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferTicket {
    /// Tenant-relative key the URL is bound to.
    pub key: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}
