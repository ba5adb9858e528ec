//! JSON operation surface over the virtual filesystem.
//!
//! Mounted under `/api/instances/{id}/fs/`. Every endpoint answers with
//! `{"success": true, ...}` on success or the error envelope produced by
//! `VfsError`'s `IntoResponse`; malformed bodies are reported the same way.

use crate::{
    models::{
        file_item::Listing,
        object::ObjectMeta,
        operation::{EntryOutcome, TransferTicket},
    },
    services::vfs::{VfsError, VfsResult},
    state::AppState,
};
use axum::{
    Json,
    extract::{
        Multipart, Path, Query, State,
        multipart::{MultipartError, MultipartRejection},
        rejection::{JsonRejection, QueryRejection},
    },
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Success envelope: `success: true` plus the operation's own fields.
#[derive(Serialize)]
pub struct Success<T> {
    success: bool,
    #[serde(flatten)]
    data: T,
}

type Reply<T> = Result<Json<Success<T>>, VfsError>;

fn ok<T>(data: T) -> Reply<T> {
    Ok(Json(Success {
        success: true,
        data,
    }))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> VfsResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| VfsError::InvalidInput(rejection.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> VfsResult<T> {
    params
        .map(|Query(value)| value)
        .map_err(|rejection| VfsError::InvalidInput(rejection.body_text()))
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct MkdirRequest {
    #[serde(default)]
    pub path: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    pub key: String,
    pub new_name: String,
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub key: String,
    pub destination: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct ZipRequest {
    #[serde(default)]
    pub path: String,
    pub keys: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UnzipRequest {
    #[serde(default)]
    pub path: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlRequest {
    #[serde(default)]
    pub path: String,
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadUrlRequest {
    pub key: String,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub key: String,
    pub content: String,
    #[serde(default)]
    pub encoding: ContentEncoding,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Serialize)]
pub struct KeyBody {
    key: String,
}

#[derive(Serialize)]
pub struct EntriesBody {
    entries: Vec<EntryOutcome>,
}

#[derive(Serialize)]
pub struct ObjectBodyOut {
    object: ObjectMeta,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    key: String,
    content: String,
    encoding: ContentEncoding,
    content_type: Option<String>,
    size: i64,
    etag: Option<String>,
}

fn ttl(seconds: Option<u64>) -> Option<Duration> {
    seconds.map(Duration::from_secs)
}

/// `GET /api/instances/{id}/fs/list?path=`
pub async fn list(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Result<Query<PathQuery>, QueryRejection>,
) -> Reply<Listing> {
    let params = query(params)?;
    ok(state.vfs.list_directory(&id, &params.path).await?)
}

/// `POST /api/instances/{id}/fs/mkdir`
pub async fn mkdir(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<MkdirRequest>, JsonRejection>,
) -> Reply<KeyBody> {
    let req = body(payload)?;
    let key = state.vfs.create_directory(&id, &req.path, &req.name).await?;
    ok(KeyBody { key })
}

/// `POST /api/instances/{id}/fs/rename`
pub async fn rename(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<RenameRequest>, JsonRejection>,
) -> Reply<EntriesBody> {
    let req = body(payload)?;
    let report = state.vfs.rename(&id, &req.key, &req.new_name).await?;
    ok(EntriesBody {
        entries: report.entries,
    })
}

/// `POST /api/instances/{id}/fs/move`
pub async fn move_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<MoveRequest>, JsonRejection>,
) -> Reply<EntriesBody> {
    let req = body(payload)?;
    let report = state.vfs.move_entry(&id, &req.key, &req.destination).await?;
    ok(EntriesBody {
        entries: report.entries,
    })
}

/// `POST /api/instances/{id}/fs/delete`
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<DeleteRequest>, JsonRejection>,
) -> Reply<EntriesBody> {
    let req = body(payload)?;
    let report = state.vfs.delete(&id, &req.key).await?;
    ok(EntriesBody {
        entries: report.entries,
    })
}

/// `POST /api/instances/{id}/fs/zip`
pub async fn zip(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ZipRequest>, JsonRejection>,
) -> Reply<KeyBody> {
    let req = body(payload)?;
    let key = state
        .archives
        .zip(&id, &req.path, &req.keys, req.name.as_deref())
        .await?;
    ok(KeyBody { key })
}

/// `POST /api/instances/{id}/fs/unzip`
pub async fn unzip(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UnzipRequest>, JsonRejection>,
) -> Reply<EntriesBody> {
    let req = body(payload)?;
    let report = state.archives.unzip(&id, &req.path, &req.key).await?;
    ok(EntriesBody {
        entries: report.entries,
    })
}

/// `POST /api/instances/{id}/fs/upload-url`
pub async fn upload_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UploadUrlRequest>, JsonRejection>,
) -> Reply<TransferTicket> {
    let req = body(payload)?;
    let ticket = state
        .uploads
        .issue_upload_url(
            &id,
            &req.path,
            &req.filename,
            req.content_type.as_deref(),
            ttl(req.ttl_seconds),
        )
        .await?;
    ok(ticket)
}

/// `POST /api/instances/{id}/fs/download-url`
pub async fn download_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<DownloadUrlRequest>, JsonRejection>,
) -> Reply<TransferTicket> {
    let req = body(payload)?;
    let ticket = state
        .uploads
        .issue_download_url(&id, &req.key, ttl(req.ttl_seconds))
        .await?;
    ok(ticket)
}

/// `GET /api/instances/{id}/fs/read?key=`
///
/// UTF-8 content is returned as-is; anything else as base64.
pub async fn read(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Result<Query<KeyQuery>, QueryRejection>,
) -> Reply<FileContent> {
    let params = query(params)?;
    let file = state.vfs.read_file(&id, &params.key).await?;
    let (content, encoding) = match std::str::from_utf8(&file.bytes) {
        Ok(text) => (text.to_string(), ContentEncoding::Utf8),
        Err(_) => (STANDARD.encode(&file.bytes), ContentEncoding::Base64),
    };
    ok(FileContent {
        key: file.meta.key,
        content,
        encoding,
        content_type: file.meta.content_type,
        size: file.meta.size_bytes,
        etag: file.meta.etag,
    })
}

/// `POST /api/instances/{id}/fs/write`
pub async fn write(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<WriteRequest>, JsonRejection>,
) -> Reply<ObjectBodyOut> {
    let req = body(payload)?;
    let bytes = match req.encoding {
        ContentEncoding::Utf8 => Bytes::from(req.content),
        ContentEncoding::Base64 => STANDARD
            .decode(req.content.as_bytes())
            .map(Bytes::from)
            .map_err(|err| VfsError::InvalidInput(format!("content is not valid base64: {err}")))?,
    };
    let object = state
        .vfs
        .write_file(&id, &req.key, bytes, req.content_type.as_deref())
        .await?;
    ok(ObjectBodyOut { object })
}

/// `POST /api/instances/{id}/fs/upload` (multipart: `path`, `file`)
pub async fn upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Reply<ObjectBodyOut> {
    let mut multipart =
        multipart.map_err(|rejection| VfsError::InvalidInput(rejection.body_text()))?;
    let invalid = |err: MultipartError| {
        VfsError::InvalidInput(format!("malformed multipart body: {}", err.body_text()))
    };

    let mut dir = String::new();
    let mut file: Option<(String, Option<String>, Bytes)> = None;
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("path") => dir = field.text().await.map_err(invalid)?,
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(invalid)?;
                file = Some((filename, content_type, bytes));
            }
            _ => {}
        }
    }

    let (filename, content_type, bytes) =
        file.ok_or_else(|| VfsError::InvalidInput("missing `file` field".into()))?;
    let object = state
        .vfs
        .upload_file(&id, &dir, &filename, bytes, content_type.as_deref())
        .await?;
    ok(ObjectBodyOut { object })
}
