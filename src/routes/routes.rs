//! Defines every HTTP route of the service.
//!
//! ## Structure
//! - **Health**
//!   - `GET /healthz`, `GET /readyz`
//!
//! - **Operation surface** (`/api/instances/{id}/fs/...`, JSON in and out)
//!   - `GET  list?path=`, `GET read?key=`
//!   - `POST mkdir`, `rename`, `move`, `delete`, `zip`, `unzip`,
//!     `upload-url`, `download-url`, `write`, `upload` (multipart)
//!
//! - **Presigned transfers** (local backend)
//!   - `PUT|GET /_presigned/{*key}?method=&exp=&ct=&sig=`
//!
//! - **Sites**
//!   - `GET /{subdomain}`, `GET /{subdomain}/`, `GET /{subdomain}/{*path}`
//!
//! Static segments take priority over `{subdomain}`. Requests addressed to
//! `{sub}.{root_domain}` are rewritten onto the site routes before routing.

use crate::{
    handlers::{
        fs_handlers,
        health_handlers::{healthz, readyz},
        site_handlers::{rewrite_site_host, serve_site_index, serve_site_path},
        transfer_handlers::{presigned_download, presigned_upload},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    middleware,
    response::Response,
    routing::{get, post, put},
};
use std::convert::Infallible;
use tower::{Layer, Service};

/// Largest body accepted by the multipart upload and file write endpoints.
const UPLOAD_BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Build the router for all routes, carrying `AppState` to every handler.
pub fn routes() -> Router<AppState> {
    let fs = Router::new()
        .route("/list", get(fs_handlers::list))
        .route("/read", get(fs_handlers::read))
        .route("/mkdir", post(fs_handlers::mkdir))
        .route("/rename", post(fs_handlers::rename))
        .route("/move", post(fs_handlers::move_entry))
        .route("/delete", post(fs_handlers::delete))
        .route("/zip", post(fs_handlers::zip))
        .route("/unzip", post(fs_handlers::unzip))
        .route("/upload-url", post(fs_handlers::upload_url))
        .route("/download-url", post(fs_handlers::download_url))
        .route(
            "/write",
            post(fs_handlers::write).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route(
            "/upload",
            post(fs_handlers::upload).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        );

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/api/instances/{id}/fs", fs)
        .route(
            "/_presigned/{*key}",
            put(presigned_upload).get(presigned_download),
        )
        // Site routes
        .route("/{subdomain}", get(serve_site_index))
        .route("/{subdomain}/", get(serve_site_index))
        .route("/{subdomain}/{*path}", get(serve_site_path))
}

/// The complete service: routes plus host-based site rewriting, which has to
/// run before routing and therefore wraps the router instead of being a
/// route layer.
pub fn app(
    state: AppState,
) -> impl Service<Request, Response = Response, Error = Infallible, Future: Send>
+ Clone
+ Send
+ 'static {
    middleware::from_fn_with_state(state.clone(), rewrite_site_host)
        .layer(routes().with_state(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::memory_pool,
        services::{
            archive::UnzipLimits,
            gateway::StorageGateway,
            local_store::LocalObjectStore,
            memory_store::MemoryObjectStore,
            presign::UrlSigner,
            tenants::StaticTenantDirectory,
            vfs::tests::{ROOT, instances},
        },
        state::ServiceLimits,
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use std::{sync::Arc, time::Duration};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn limits() -> ServiceLimits {
        ServiceLimits {
            max_presign_ttl: Duration::from_secs(3600),
            unzip: UnzipLimits {
                concurrency: 4,
                max_entry_bytes: 1 << 20,
                max_total_bytes: 8 << 20,
            },
        }
    }

    async fn memory_state() -> (Arc<MemoryObjectStore>, AppState) {
        let store = Arc::new(MemoryObjectStore::new());
        let state = AppState::new(
            Arc::new(memory_pool().await),
            StorageGateway::new(store.clone(), 0, 10),
            Arc::new(StaticTenantDirectory(instances())),
            None,
            Some("example.com".into()),
            limits(),
        );
        (store, state)
    }

    async fn send(state: &AppState, request: Request<Body>) -> Response {
        app(state.clone()).oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (_, state) = memory_state().await;
        let response = send(&state, get_req("/healthz")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_checks_database_and_storage() {
        let (_, state) = memory_state().await;
        let response = send(&state, get_req("/readyz")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["storage"]["ok"], true);
    }

    #[tokio::test]
    async fn serves_site_index_with_cache_headers() {
        let (store, state) = memory_state().await;
        store.seed(&format!("{ROOT}index.html"), b"<h1>demo</h1>", Some("text/html"));

        for uri in ["/demo", "/demo/"] {
            let response = send(&state, get_req(uri)).await;
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
            assert_eq!(response.headers()[header::CACHE_CONTROL], "public, max-age=60");
            assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&bytes[..], b"<h1>demo</h1>");
        }
    }

    #[tokio::test]
    async fn missing_site_content_is_404_and_not_cached() {
        let (_, state) = memory_state().await;
        let response = send(&state, get_req("/demo/missing.html")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");

        let response = send(&state, get_req("/nobody/index.html")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn script_sources_are_inert() {
        let (store, state) = memory_state().await;
        store.seed(
            &format!("{ROOT}site.php"),
            b"<?php phpinfo(); ?>",
            Some("application/x-httpd-php"),
        );
        let response = send(&state, get_req("/demo/site.php")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    }

    #[tokio::test]
    async fn site_host_is_rewritten_onto_site_routes() {
        let (store, state) = memory_state().await;
        store.seed(&format!("{ROOT}index.html"), b"home", Some("text/html"));
        store.seed(&format!("{ROOT}about/team.html"), b"team", Some("text/html"));

        let request = Request::builder()
            .uri("/")
            .header(header::HOST, "demo.example.com")
            .body(Body::empty())
            .unwrap();
        let response = send(&state, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"home");

        let request = Request::builder()
            .uri("/about/team.html")
            .header(header::HOST, "demo.example.com:8080")
            .body(Body::empty())
            .unwrap();
        let response = send(&state, request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .uri("/healthz")
            .header(header::HOST, "www.example.com")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&state, request).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn mkdir_then_list_over_http() {
        let (_, state) = memory_state().await;
        let response = send(
            &state,
            post_json("/api/instances/site-1/fs/mkdir", json!({"path": "", "name": "docs"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"success": true, "key": "docs/"}));

        let response = send(&state, get_req("/api/instances/site-1/fs/list?path=")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["truncated"], false);
        assert_eq!(body["items"][0]["name"], "docs");
        assert_eq!(body["items"][0]["isDirectory"], true);
    }

    #[tokio::test]
    async fn errors_use_the_discriminated_envelope() {
        let (store, state) = memory_state().await;

        let response = send(&state, get_req("/api/instances/site-1/fs/list?path=../x")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "access_denied");

        let response = send(&state, get_req("/api/instances/ghost/fs/list")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "not_found");

        let request = Request::builder()
            .method("POST")
            .uri("/api/instances/site-1/fs/rename")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = send(&state, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "invalid_input");

        assert_eq!(store.total_calls(), 0);
    }

    #[tokio::test]
    async fn write_read_and_rename_over_http() {
        let (store, state) = memory_state().await;
        let response = send(
            &state,
            post_json(
                "/api/instances/site-1/fs/write",
                json!({"key": "a.txt", "content": "hello"}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &state,
            post_json(
                "/api/instances/site-1/fs/rename",
                json!({"key": "a.txt", "newName": "b.txt"}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["entries"][0]["key"], "b.txt");

        let response = send(&state, get_req("/api/instances/site-1/fs/read?key=b.txt")).await;
        let body = json_body(response).await;
        assert_eq!(body["content"], "hello");
        assert_eq!(body["encoding"], "utf8");
        assert!(store.bytes_of(&format!("{ROOT}a.txt")).is_none());
    }

    #[tokio::test]
    async fn multipart_upload_keeps_final_segment() {
        let (store, state) = memory_state().await;
        let boundary = "XBOUNDARYX";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"path\"\r\n\r\nimg\r\n\
             --{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"../../x/logo.png\"\r\n\
             Content-Type: image/png\r\n\r\nPNGDATA\r\n--{boundary}--\r\n"
        );
        let request = Request::builder()
            .method("POST")
            .uri("/api/instances/site-1/fs/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();
        let response = send(&state, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["object"]["key"], "img/logo.png");
        assert_eq!(
            store.bytes_of(&format!("{ROOT}img/logo.png")).unwrap().as_ref(),
            b"PNGDATA"
        );
    }

    async fn local_state(dir: &TempDir) -> AppState {
        let pool = Arc::new(memory_pool().await);
        let signer = UrlSigner::new("test-secret", "sites", "http://localhost:3000");
        let local = LocalObjectStore::new(pool.clone(), dir.path(), "sites", signer);
        AppState::new(
            pool,
            StorageGateway::new(Arc::new(local.clone()), 0, 10),
            Arc::new(StaticTenantDirectory(instances())),
            Some(local),
            None,
            limits(),
        )
    }

    fn path_and_query(url: &str) -> String {
        url.trim_start_matches("http://localhost:3000").to_string()
    }

    #[tokio::test]
    async fn presigned_upload_then_download() {
        let dir = TempDir::new().unwrap();
        let state = local_state(&dir).await;

        let response = send(
            &state,
            post_json(
                "/api/instances/site-1/fs/upload-url",
                json!({"path": "", "filename": "../../other/notes.txt", "contentType": "text/plain"}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let ticket = json_body(response).await;
        assert_eq!(ticket["key"], "notes.txt");
        let upload_url = path_and_query(ticket["url"].as_str().unwrap());

        let request = Request::builder()
            .method("PUT")
            .uri(&upload_url)
            .body(Body::from("streamed payload"))
            .unwrap();
        assert_eq!(send(&state, request).await.status(), StatusCode::OK);

        // The signature is bound to PUT.
        let response = send(&state, get_req(&upload_url)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = send(
            &state,
            post_json(
                "/api/instances/site-1/fs/download-url",
                json!({"key": "notes.txt"}),
            ),
        )
        .await;
        let ticket = json_body(response).await;
        let download_url = path_and_query(ticket["url"].as_str().unwrap());

        let response = send(&state, get_req(&download_url)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"streamed payload");
    }

    #[tokio::test]
    async fn presigned_routes_reject_tampering() {
        let dir = TempDir::new().unwrap();
        let state = local_state(&dir).await;
        let request = Request::builder()
            .method("PUT")
            .uri("/_presigned/websites/demo/public_html/x.txt?method=PUT&exp=9999999999&sig=bogus")
            .body(Body::from("x"))
            .unwrap();
        assert_eq!(send(&state, request).await.status(), StatusCode::FORBIDDEN);

        let response = send(&state, get_req("/_presigned/websites/demo/public_html/x.txt")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
