//! Request/response middleware for the HTTP edge.

use crate::core::registry::Globals;
use crate::types::msg::{err_not_found, http_status_envelope, time_now};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION, STRICT_TRANSPORT_SECURITY};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::Arc;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Render a control envelope as an HTTP response with matching status.
pub fn json_response(status: u16, msg: &crate::types::msg::ServerMessage) -> Response {
    let body = serde_json::to_vec(msg).unwrap_or_default();
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Add `Strict-Transport-Security` when a max-age is configured.
pub async fn hsts(
    State(globals): State<Arc<Globals>>,
    req: Request,
    next: Next,
) -> Response {
    let mut resp = next.run(req).await;
    if let Some(max_age) = &globals.tls_strict_max_age {
        if let Ok(value) = HeaderValue::from_str(&format!("max-age={max_age}")) {
            resp.headers_mut().insert(STRICT_TRANSPORT_SECURITY, value);
        }
    }
    resp
}

/// Add `Cache-Control` when a positive max-age is configured.
pub async fn cache_control(
    State(globals): State<Arc<Globals>>,
    req: Request,
    next: Next,
) -> Response {
    let mut resp = next.run(req).await;
    if globals.cache_max_age > 0 {
        if let Ok(value) = HeaderValue::from_str(&format!(
            "must-revalidate, public, max-age={}",
            globals.cache_max_age
        )) {
            resp.headers_mut().insert(CACHE_CONTROL, value);
        }
    }
    resp
}

/// Replace the body of any response with status 400 or above with the JSON
/// control envelope carrying the standard status text. The status itself is
/// written through unchanged.
pub async fn error_envelope(req: Request, next: Next) -> Response {
    let resp = next.run(req).await;
    let status = resp.status();
    if status.as_u16() < 400 {
        return resp;
    }
    let text = status.canonical_reason().unwrap_or("unknown");
    let msg = http_status_envelope(status.as_u16(), text, time_now());
    let mut out = json_response(status.as_u16(), &msg);
    // Keep any headers the handler set, but the body metadata is ours now.
    for (name, value) in resp.headers() {
        if name != CONTENT_TYPE && name != axum::http::header::CONTENT_LENGTH {
            out.headers_mut().insert(name.clone(), value.clone());
        }
    }
    out
}

/// Custom 404 response in the same envelope shape.
pub async fn serve_404() -> Response {
    json_response(404, &err_not_found("", "", time_now()))
}

/// Router answering every request with a 307 redirect to the HTTPS version
/// of the same URI.
pub fn tls_redirect_app(to_addr: &str) -> Router {
    let port = redirect_port(to_addr);
    Router::new().fallback(move |req: Request| async move { tls_redirect(&req, port) })
}

/// Target port for redirects; None when the TLS side listens on 443.
fn redirect_port(to_addr: &str) -> Option<u16> {
    let tail = to_addr.rsplit(':').next()?;
    match tail {
        "https" | "443" => None,
        other => other.parse::<u16>().ok().filter(|p| *p != 443),
    }
}

fn tls_redirect(req: &Request, to_port: Option<u16>) -> Response {
    let host_header = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    // Strip the port, if the Host header carries one.
    let host = host_header
        .rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map(|(h, _)| h)
        .unwrap_or(host_header);
    let authority = match to_port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let path_and_query = if path_and_query.is_empty() {
        "/"
    } else {
        path_and_query
    };
    let target = format!("https://{authority}{path_and_query}");
    match HeaderValue::from_str(&target) {
        Ok(location) => {
            let mut resp = StatusCode::TEMPORARY_REDIRECT.into_response();
            resp.headers_mut().insert(LOCATION, location);
            resp
        }
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::routing::get;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_error_envelope_wraps_4xx() {
        let app = Router::new()
            .route("/boom", get(|| async { StatusCode::FORBIDDEN }))
            .layer(axum::middleware::from_fn(error_envelope));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/boom")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            JSON_CONTENT_TYPE
        );
        let body = to_bytes(resp.into_body(), 1 << 16).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["ctrl"]["code"], 403);
        assert_eq!(v["ctrl"]["text"], "Forbidden");
    }

    #[tokio::test]
    async fn test_error_envelope_passes_2xx() {
        let app = Router::new()
            .route("/ok", get(|| async { "fine" }))
            .layer(axum::middleware::from_fn(error_envelope));
        let resp = app
            .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), 1 << 16).await.unwrap();
        assert_eq!(&body[..], b"fine");
    }

    #[tokio::test]
    async fn test_404_envelope() {
        let app = Router::new().fallback(serve_404);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/nowhere")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(resp.into_body(), 1 << 16).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["ctrl"]["text"], "not found");
    }

    #[tokio::test]
    async fn test_tls_redirect_preserves_uri() {
        let app = tls_redirect_app("0.0.0.0:8443");
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/v0/file/s/abc?asatt=1")
                    .header("host", "example.com:8080")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            resp.headers().get(LOCATION).unwrap(),
            "https://example.com:8443/v0/file/s/abc?asatt=1"
        );
    }

    #[tokio::test]
    async fn test_tls_redirect_default_port() {
        let app = tls_redirect_app(":https");
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("host", "example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.headers().get(LOCATION).unwrap(),
            "https://example.com/"
        );
    }
}
