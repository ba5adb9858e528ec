//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness: SQLite, object store, and (local backend)
//!   disk I/O

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::fs;
use uuid::Uuid;

const PROBE_KEY: &str = "_system/readyz";

/// `GET /healthz`
///
/// Always 200 with a plain JSON body; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 200 when every check passes, 503 otherwise. Each check is reported.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {v}")),
        Err(e) => CheckStatus::failed(format!("error: {e}")),
    };
    checks.insert("sqlite", sqlite);

    let gateway = state.vfs.gateway();
    let storage = match gateway.head(PROBE_KEY).await {
        Ok(_) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("{} backend: {e}", gateway.backend_name())),
    };
    checks.insert("storage", storage);

    if let Some(local) = state.local.as_ref() {
        // Write/read/delete a temp file under the payload directory.
        let tmp_path = local.base_path().join(format!(".readyz-{}", Uuid::new_v4()));
        let disk = match fs::write(&tmp_path, b"readyz").await {
            Ok(_) => {
                let check = match fs::read(&tmp_path).await {
                    Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
                    Ok(_) => CheckStatus::failed("file content mismatch".into()),
                    Err(e) => CheckStatus::failed(format!("could not read tmp file: {e}")),
                };
                if let Err(e) = fs::remove_file(&tmp_path).await {
                    tracing::warn!(path = %tmp_path.display(), error = %e, "could not remove readiness probe file");
                }
                check
            }
            Err(e) => CheckStatus::failed(format!("could not write tmp file: {e}")),
        };
        checks.insert("disk", disk);
    }

    let overall_ok = checks.values().all(|check| check.ok);
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
