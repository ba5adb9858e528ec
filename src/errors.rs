use crate::{
    models::operation::ErrorKind,
    services::{gateway::StorageError, vfs::VfsError},
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::fmt;

/// A lightweight wrapper for infrastructure errors (health, presigned
/// transfers) that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => AppError::not_found(format!("object `{key}` not found")),
            StorageError::InvalidObjectKey(key) => {
                AppError::new(StatusCode::BAD_REQUEST, format!("invalid object key `{key}`"))
            }
            StorageError::PreconditionFailed { key } => AppError::new(
                StatusCode::PRECONDITION_FAILED,
                format!("precondition failed for `{key}`"),
            ),
            other => {
                tracing::error!(error = %other, "storage failure");
                AppError::internal("storage backend error")
            }
        }
    }
}

/// HTTP status mirroring an operation error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::PartialFailure => StatusCode::MULTI_STATUS,
        ErrorKind::Inconsistent | ErrorKind::BackendError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Operation failures always answer with the discriminated JSON envelope:
/// `{"success": false, "error": "<kind>", "message": "..."}`.
impl IntoResponse for VfsError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let message = match &self {
            VfsError::Storage(err) => {
                tracing::error!(error = %err, "operation failed in storage backend");
                "storage backend error".to_string()
            }
            VfsError::Tenants(err) => {
                tracing::error!(error = %err, "tenant lookup failed");
                "tenant directory unavailable".to_string()
            }
            VfsError::Inconsistent { .. } => {
                tracing::error!(error = %self, "operation left duplicate objects");
                self.to_string()
            }
            other => {
                tracing::debug!(error = %other, kind = kind.as_str(), "operation rejected");
                other.to_string()
            }
        };

        let mut body = json!({
            "success": false,
            "error": kind,
            "message": message,
        });
        if let VfsError::PartialFailure(report) = self {
            if let (Value::Object(map), Ok(entries)) = (&mut body, serde_json::to_value(&report.entries)) {
                map.insert("entries".into(), entries);
            }
        }

        (status_for(kind), Json(body)).into_response()
    }
}
