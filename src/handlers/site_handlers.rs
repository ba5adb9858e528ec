//! Public site serving and host-based routing.
//!
//! - `GET /{subdomain}`, `GET /{subdomain}/`, `GET /{subdomain}/{*path}`
//! - Requests for `{sub}.{root_domain}` are rewritten to `/{sub}{path}` before
//!   routing, so `demo.example.com/about.html` is served like
//!   `/demo/about.html`.

use crate::{services::resolver::ResolveError, state::AppState};
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

const CACHE_SUCCESS: &str = "public, max-age=60";
const CACHE_ERROR: &str = "no-store";

/// `GET /{subdomain}` and `GET /{subdomain}/`
pub async fn serve_site_index(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
) -> Response {
    serve(&state, &subdomain, "").await
}

/// `GET /{subdomain}/{*path}`
pub async fn serve_site_path(
    State(state): State<AppState>,
    Path((subdomain, path)): Path<(String, String)>,
) -> Response {
    serve(&state, &subdomain, &path).await
}

async fn serve(state: &AppState, subdomain: &str, path: &str) -> Response {
    match state.resolver.resolve(subdomain, path).await {
        Ok(content) => {
            let mut response = Response::new(Body::from(content.bytes));
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(&content.content_type)
                    .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_SUCCESS));
            if content.script_source {
                headers.insert(
                    header::X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static("nosniff"),
                );
            }
            if let Some(etag) = content.etag.as_ref() {
                if let Ok(value) = HeaderValue::from_str(&format!("\"{etag}\"")) {
                    headers.insert(header::ETAG, value);
                }
            }
            response
        }
        Err(err) => {
            err.log(subdomain, path);
            error_response(&err)
        }
    }
}

fn error_response(err: &ResolveError) -> Response {
    let (status, text) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    };
    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_ERROR));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    (status, headers, text).into_response()
}

/// Subdomain label of `host` under `root_domain`, if any. The port is
/// ignored and `www` is never treated as a site.
pub fn site_from_host<'a>(host: &'a str, root_domain: &str) -> Option<&'a str> {
    let host = host.rsplit_once(':').map_or(host, |(name, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            name
        } else {
            host
        }
    });
    let label = host
        .len()
        .checked_sub(root_domain.len() + 1)
        .filter(|&split| {
            host.is_char_boundary(split)
                && host[split..].starts_with('.')
                && host[split + 1..].eq_ignore_ascii_case(root_domain)
        })
        .map(|split| &host[..split])?;
    if label.is_empty() || label.contains('.') || label.eq_ignore_ascii_case("www") {
        return None;
    }
    Some(label)
}

/// Rewrite `{sub}.{root_domain}/path` to `/{sub}/path`.
pub async fn rewrite_site_host(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(root_domain) = state.root_domain.as_deref() {
        let site = request
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| request.uri().host())
            .and_then(|host| site_from_host(host, root_domain))
            .map(str::to_ascii_lowercase);
        if let Some(site) = site {
            let path_and_query = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            match format!("/{site}{path_and_query}").parse::<Uri>() {
                Ok(uri) => {
                    debug!(site, %uri, "rewrote site host");
                    *request.uri_mut() = uri;
                }
                Err(err) => debug!(site, error = %err, "site host rewrite skipped"),
            }
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_site_label_from_host() {
        assert_eq!(site_from_host("demo.example.com", "example.com"), Some("demo"));
        assert_eq!(site_from_host("Demo.Example.com:8080", "example.com"), Some("Demo"));
        assert_eq!(site_from_host("www.example.com", "example.com"), None);
        assert_eq!(site_from_host("example.com", "example.com"), None);
        assert_eq!(site_from_host("a.b.example.com", "example.com"), None);
        assert_eq!(site_from_host("demoexample.com", "example.com"), None);
        assert_eq!(site_from_host("demo.other.org", "example.com"), None);
        assert_eq!(site_from_host("localhost:3000", "localhost"), None);
        assert_eq!(site_from_host("demo.localhost:3000", "localhost"), Some("demo"));
    }
}
