//! Presigned transfers against the local backend.
//!
//! URLs issued by the local store point at `/_presigned/{*key}`. A request
//! is accepted only if the signature covers this key and method and has not
//! expired; bodies are streamed to and from disk without buffering.

use crate::{
    errors::AppError,
    models::object::ObjectMeta,
    services::{gateway::PresignMethod, local_store::LocalObjectStore, presign::SignedParams},
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::io;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

fn authorize(
    state: &AppState,
    key: &str,
    method: PresignMethod,
    params: Result<Query<SignedParams>, QueryRejection>,
) -> Result<(LocalObjectStore, SignedParams), AppError> {
    let store = state
        .local
        .clone()
        .ok_or_else(|| AppError::not_found("presigned transfers are not served by this backend"))?;
    let Ok(Query(params)) = params else {
        return Err(AppError::forbidden("missing or malformed signature"));
    };
    if !store.verify_presigned(key, method, &params) {
        warn!(key, method = method.as_str(), "rejected presigned request");
        return Err(AppError::forbidden("signature invalid or expired"));
    }
    Ok((store, params))
}

/// `PUT /_presigned/{*key}`: store the request body under `key`.
pub async fn presigned_upload(
    State(state): State<AppState>,
    Path(key): Path<String>,
    params: Result<Query<SignedParams>, QueryRejection>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let (store, params) = authorize(&state, &key, PresignMethod::Put, params)?;

    // A signed content type wins over whatever the client sends.
    let content_type = params.ct.filter(|ct| !ct.is_empty()).or_else(|| {
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    });

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let object = store.put_stream(&key, content_type, stream).await?;
    info!(key, size = object.size_bytes, "presigned upload stored");

    let mut resp_headers = HeaderMap::new();
    if let Some(etag) = object.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{etag}\"")) {
            resp_headers.insert(header::ETAG, value);
        }
    }
    Ok((StatusCode::OK, resp_headers))
}

/// `GET /_presigned/{*key}`: stream the object back.
pub async fn presigned_download(
    State(state): State<AppState>,
    Path(key): Path<String>,
    params: Result<Query<SignedParams>, QueryRejection>,
) -> Result<Response, AppError> {
    let (store, _) = authorize(&state, &key, PresignMethod::Get, params)?;
    let (meta, file) = store
        .open_reader(&key)
        .await?
        .ok_or_else(|| AppError::not_found(format!("object `{key}` not found")))?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectMeta) {
    let content_type = meta
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes.max(0)));
    if let Some(etag) = meta.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{etag}\"")) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
