//! Upload and download endpoints for large files.
//!
//! Both endpoints share a shape: answer CORS preflight from the backend's
//! headers, enforce the HTTP method, check the API key, authenticate, then
//! consult the backend again so it may add headers or short-circuit the
//! request (e.g. redirect to external blob storage).

use crate::auth::{
    auth_http_request, check_api_key, decode_auth_error, get_api_key, AuthArgs, AuthOutcome,
};
use crate::core::registry::Globals;
use crate::media::{
    decode_media_error, decode_store_error, force_attachment, resolve_mime_type, FileDef,
    HeadersRequest, HeadersResponse,
};
use crate::net::middleware::json_response;
use crate::types::msg::{
    err_auth_required, err_api_key_required, err_malformed, err_operation_not_allowed,
    err_too_large, err_unknown, http_status_envelope, info_challenge, no_err_params, time_now,
    ServerMessage,
};
use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_RANGE, CONTENT_TYPE, IF_MODIFIED_SINCE, RANGE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Bytes sniffed from the head of an upload to detect its MIME type.
const SNIFF_LEN: usize = 512;

fn reply(msg: &ServerMessage) -> Response {
    let code = msg.ctrl().map(|c| c.code).unwrap_or(500);
    json_response(code, msg)
}

/// Attach backend-provided headers to a response.
fn apply_headers(mut resp: Response, headers: &[(String, String)]) -> Response {
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            resp.headers_mut().append(name, value);
        }
    }
    resp
}

/// Preflight response: backend headers plus its status, defaulting to 204.
fn preflight_response(backend: HeadersResponse) -> Response {
    let status = if backend.status == 0 {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::from_u16(backend.status).unwrap_or(StatusCode::NO_CONTENT)
    };
    apply_headers(status.into_response(), &backend.headers)
}

/// Response for a backend that short-circuited with a status. The envelope
/// body is only written for methods that carry one.
fn short_circuit_response(status: u16, with_body: bool, now: DateTime<Utc>) -> Response {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if with_body {
        let text = code.canonical_reason().unwrap_or("unknown");
        json_response(status, &http_status_envelope(status, text, now))
    } else {
        code.into_response()
    }
}

fn remote_addr(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .unwrap_or("")
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

/// `GET`/`HEAD` handler serving stored files.
pub async fn large_file_serve(
    State(globals): State<Arc<Globals>>,
    req: Request<Body>,
) -> Response {
    let now = time_now();
    globals.stats.inc_file_downloads();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();
    let url = uri.to_string();
    let hreq = HeadersRequest {
        method: method.to_string(),
        url: url.clone(),
    };

    // Preflight comes before any security checks.
    if method == Method::OPTIONS {
        return match globals.media.headers(&hreq, true).await {
            Ok(backend) => preflight_response(backend),
            Err(err) => {
                tracing::warn!("media serve: {url} {err}");
                reply(&decode_media_error(&err, "", now))
            }
        };
    }

    if method != Method::GET && method != Method::HEAD {
        tracing::warn!("media serve: method '{method}' not allowed");
        return reply(&err_operation_not_allowed("", "", now));
    }

    let query = parse_query(uri.query());
    let form = HashMap::new();
    let args = AuthArgs {
        headers: &headers,
        query: &query,
        form: &form,
        remote_addr: remote_addr(&headers),
    };

    if !check_api_key(get_api_key(&args).as_deref(), &globals.api_keys) {
        tracing::warn!("media serve: invalid or missing API key");
        return reply(&err_api_key_required(now));
    }

    let uid = match auth_http_request(&args, &globals.auth, &globals.sessions) {
        Ok(AuthOutcome::Uid(uid)) => uid,
        Ok(AuthOutcome::Challenge(challenge)) => {
            return reply(&info_challenge("", now, &challenge));
        }
        Err(err) => return reply(&decode_auth_error(&err, "", now)),
    };
    if uid.is_zero() {
        return reply(&err_auth_required("", "", now));
    }

    // The backend may redirect to external blob storage here.
    let backend = match globals.media.headers(&hreq, true).await {
        Ok(backend) => backend,
        Err(err) => {
            tracing::warn!("media serve: {url} {err}");
            return reply(&decode_media_error(&err, "", now));
        }
    };
    if backend.status != 0 {
        tracing::info!("media serve: completed with status {} uid={uid}", backend.status);
        let resp = short_circuit_response(backend.status, method == Method::GET, now);
        return apply_headers(resp, &backend.headers);
    }

    if method == Method::HEAD {
        tracing::info!("media serve: completed HEAD uid={uid}");
        return apply_headers(StatusCode::OK.into_response(), &backend.headers);
    }

    let (fdef, data) = match globals.media.download(&url).await {
        Ok(found) => found,
        Err(err) => {
            tracing::warn!("media serve: {url} {err}");
            let resp = reply(&decode_media_error(&err, "", now));
            return apply_headers(resp, &backend.headers);
        }
    };

    // Force a download for markup and application types; the browser must
    // not interpret stored content in the server's origin.
    let as_attachment = query
        .get("asatt")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
        || force_attachment(&fdef.mime_type);

    tracing::info!("media serve: OK, uid={uid}");
    let resp = serve_content(&headers, &fdef.mime_type, as_attachment, fdef.updated_at, data);
    apply_headers(resp, &backend.headers)
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// `POST`/`PUT` handler receiving files and handing them to the configured
/// media backend.
pub async fn large_file_receive(
    State(globals): State<Arc<Globals>>,
    req: Request<Body>,
) -> Response {
    let now = time_now();
    globals.stats.inc_file_uploads();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();
    let hreq = HeadersRequest {
        method: method.to_string(),
        url: uri.to_string(),
    };

    if method == Method::OPTIONS {
        return match globals.media.headers(&hreq, false).await {
            Ok(backend) => preflight_response(backend),
            Err(err) => {
                tracing::info!("media upload: preflight failed {err}");
                reply(&decode_media_error(&err, "", now))
            }
        };
    }

    if method != Method::POST && method != Method::PUT && method != Method::HEAD {
        tracing::info!("media upload: method '{method}' not allowed");
        return reply(&err_operation_not_allowed("", "", now));
    }

    // The body has to be consumed before any of the checks: credentials may
    // arrive as multipart fields. The configured size cap applies here.
    let parsed = if method == Method::HEAD {
        UploadForm::default()
    } else {
        parse_upload_form(req).await
    };
    let msg_id = parsed.fields.get("id").cloned().unwrap_or_default();

    let query = parse_query(uri.query());
    let args = AuthArgs {
        headers: &headers,
        query: &query,
        form: &parsed.fields,
        remote_addr: remote_addr(&headers),
    };

    if !check_api_key(get_api_key(&args).as_deref(), &globals.api_keys) {
        return reply(&err_api_key_required(now));
    }

    let uid = match auth_http_request(&args, &globals.auth, &globals.sessions) {
        Ok(AuthOutcome::Uid(uid)) => uid,
        Ok(AuthOutcome::Challenge(challenge)) => {
            return reply(&info_challenge(&msg_id, now, &challenge));
        }
        Err(err) => return reply(&decode_auth_error(&err, &msg_id, now)),
    };
    if uid.is_zero() && parsed.fields.get("topic").map(String::as_str) != Some("newacc") {
        // Not authenticated and not the account-creation avatar path.
        return reply(&err_auth_required(&msg_id, "", now));
    }

    let backend = match globals.media.headers(&hreq, false).await {
        Ok(backend) => backend,
        Err(err) => {
            tracing::info!("media upload: headers check failed {err}");
            return reply(&decode_media_error(&err, "", now));
        }
    };
    if backend.status != 0 {
        tracing::info!("media upload: completed with status {}", backend.status);
        let with_body = method == Method::POST || method == Method::PUT;
        let resp = short_circuit_response(backend.status, with_body, now);
        return apply_headers(resp, &backend.headers);
    }

    if method == Method::HEAD {
        tracing::info!("media upload: completed HEAD");
        return apply_headers(StatusCode::OK.into_response(), &backend.headers);
    }

    let (data, client_content_type) = match parsed.file {
        Some(file) => file,
        None => {
            tracing::info!("media upload: invalid multipart form");
            let msg = match parsed.err {
                Some(FormError::TooLarge) => err_too_large(&msg_id, "", now),
                _ => err_malformed(&msg_id, "", now),
            };
            return apply_headers(reply(&msg), &backend.headers);
        }
    };
    if data.is_empty() {
        return apply_headers(reply(&err_unknown(&msg_id, "", now)), &backend.headers);
    }

    let sniff = &data[..data.len().min(SNIFF_LEN)];
    let mime_type = resolve_mime_type(sniff, client_content_type.as_deref());
    let mut fdef = FileDef::new(Uuid::new_v4().simple().to_string(), uid, mime_type);

    let (file_url, size) = match globals.media.upload(&mut fdef, data).await {
        Ok(uploaded) => uploaded,
        Err(err) => {
            tracing::info!("media upload: failed key {} {err}", fdef.location);
            if let Err(store_err) = globals.files.finish_upload(&fdef, false, 0) {
                tracing::debug!("media upload: discard failed record: {store_err}");
            }
            return apply_headers(reply(&decode_media_error(&err, &msg_id, now)), &backend.headers);
        }
    };

    let fdef = match globals.files.finish_upload(&fdef, true, size) {
        Ok(finalized) => finalized,
        Err(err) => {
            tracing::info!("media upload: failed to finalize key {} {err}", fdef.location);
            // Best-effort cleanup of the stored blob.
            if let Err(del_err) = globals.media.delete(&[fdef.location.clone()]).await {
                tracing::warn!("media upload: cleanup failed: {del_err}");
            }
            return apply_headers(reply(&decode_store_error(&err, &msg_id, now)), &backend.headers);
        }
    };

    let mut params = json!({ "url": file_url });
    if let Some(gc_period) = globals.media_gc_period {
        // How long the file is guaranteed to exist without being attached to
        // a message or topic.
        let expires = now + chrono::Duration::from_std(gc_period).unwrap_or_default();
        params["expires"] = json!(expires.to_rfc3339_opts(SecondsFormat::Millis, true));
    }

    tracing::info!("media upload: ok {} {}", fdef.id, fdef.location);
    apply_headers(
        reply(&no_err_params(&msg_id, "", now, params)),
        &backend.headers,
    )
}

// ---------------------------------------------------------------------------
// Multipart form parsing
// ---------------------------------------------------------------------------

#[derive(Default)]
struct UploadForm {
    fields: HashMap<String, String>,
    file: Option<(Bytes, Option<String>)>,
    err: Option<FormError>,
}

enum FormError {
    TooLarge,
    Malformed,
}

fn classify_multipart_error(err: axum::extract::multipart::MultipartError) -> FormError {
    if err.into_response().status() == StatusCode::PAYLOAD_TOO_LARGE {
        FormError::TooLarge
    } else {
        FormError::Malformed
    }
}

async fn parse_upload_form(req: Request<Body>) -> UploadForm {
    let mut out = UploadForm::default();
    let mut multipart = match Multipart::from_request(req, &()).await {
        Ok(multipart) => multipart,
        Err(_) => {
            out.err = Some(FormError::Malformed);
            return out;
        }
    };
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let name = field.name().unwrap_or_default().to_string();
                if name == "file" {
                    let content_type = field.content_type().map(str::to_string);
                    match field.bytes().await {
                        Ok(bytes) => out.file = Some((bytes, content_type)),
                        Err(err) => {
                            out.err = Some(classify_multipart_error(err));
                            return out;
                        }
                    }
                } else if !name.is_empty() {
                    match field.text().await {
                        Ok(value) => {
                            out.fields.insert(name, value);
                        }
                        Err(err) => {
                            out.err = Some(classify_multipart_error(err));
                            return out;
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                out.err = Some(classify_multipart_error(err));
                break;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Query parsing
// ---------------------------------------------------------------------------

fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a query string into a map; later duplicates win.
pub(crate) fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(query) = query else {
        return out;
    };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        out.insert(url_decode(key), url_decode(value));
    }
    out
}

// ---------------------------------------------------------------------------
// Content serving with ranges and conditionals
// ---------------------------------------------------------------------------

enum ParsedRange {
    Full,
    Single(u64, u64),
    Unsatisfiable,
}

fn parse_range(header: &str, total: u64) -> ParsedRange {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return ParsedRange::Full;
    };
    if spec.contains(',') {
        // Multipart ranges are not supported; serve the whole body.
        return ParsedRange::Full;
    }
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return ParsedRange::Full;
    };
    if total == 0 {
        return ParsedRange::Unsatisfiable;
    }
    if start_str.is_empty() {
        // Suffix range: the last N bytes.
        return match end_str.parse::<u64>() {
            Ok(0) | Err(_) => ParsedRange::Unsatisfiable,
            Ok(n) => ParsedRange::Single(total.saturating_sub(n), total - 1),
        };
    }
    let Ok(start) = start_str.parse::<u64>() else {
        return ParsedRange::Full;
    };
    if start >= total {
        return ParsedRange::Unsatisfiable;
    }
    let end = if end_str.is_empty() {
        total - 1
    } else {
        match end_str.parse::<u64>() {
            Ok(end) if end >= start => end.min(total - 1),
            _ => return ParsedRange::Full,
        }
    };
    ParsedRange::Single(start, end)
}

fn http_date(ts: DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Serve a blob honoring `Range` and `If-Modified-Since`.
fn serve_content(
    req_headers: &HeaderMap,
    mime_type: &str,
    as_attachment: bool,
    updated_at: DateTime<Utc>,
    data: Bytes,
) -> Response {
    let mut headers = Vec::new();
    if let Ok(value) = HeaderValue::from_str(mime_type) {
        headers.push((CONTENT_TYPE, value));
    }
    if as_attachment {
        headers.push((CONTENT_DISPOSITION, HeaderValue::from_static("attachment")));
    }
    if let Ok(value) = HeaderValue::from_str(&http_date(updated_at)) {
        headers.push((axum::http::header::LAST_MODIFIED, value));
    }
    headers.push((ACCEPT_RANGES, HeaderValue::from_static("bytes")));

    let finish = |status: StatusCode, body: Body, extra: Vec<(HeaderName, HeaderValue)>| {
        let mut resp = Response::builder().status(status);
        for (name, value) in headers.iter().chain(extra.iter()) {
            resp = resp.header(name, value);
        }
        resp.body(body)
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    };

    if let Some(since) = req_headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
    {
        // HTTP dates have second resolution.
        if updated_at.timestamp() <= since.timestamp() {
            return finish(StatusCode::NOT_MODIFIED, Body::empty(), Vec::new());
        }
    }

    let total = data.len() as u64;
    let range = req_headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v, total))
        .unwrap_or(ParsedRange::Full);
    match range {
        ParsedRange::Full => finish(StatusCode::OK, Body::from(data), Vec::new()),
        ParsedRange::Unsatisfiable => {
            let content_range = HeaderValue::from_str(&format!("bytes */{total}"))
                .unwrap_or(HeaderValue::from_static("bytes */0"));
            finish(
                StatusCode::RANGE_NOT_SATISFIABLE,
                Body::empty(),
                vec![(CONTENT_RANGE, content_range)],
            )
        }
        ParsedRange::Single(start, end) => {
            let slice = data.slice(start as usize..=end as usize);
            let content_range = HeaderValue::from_str(&format!("bytes {start}-{end}/{total}"))
                .unwrap_or(HeaderValue::from_static("bytes */0"));
            finish(
                StatusCode::PARTIAL_CONTENT,
                Body::from(slice),
                vec![(CONTENT_RANGE, content_range)],
            )
        }
    }
}
