//! Large-file (media) handling: pluggable blob backend, file metadata
//! store, MIME policy, and the upload/download endpoints.

pub mod endpoints;
pub mod fs;
pub mod gc;

use crate::types::msg::{err_malformed, err_not_found, err_unknown, ServerMessage};
use crate::types::Uid;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// MIME prefixes acceptable from a client-provided Content-Type. Anything
/// else is coerced to `application/octet-stream`.
pub const ALLOWED_MIME_TYPES: [&str; 6] = [
    "application/",
    "audio/",
    "font/",
    "image/",
    "text/",
    "video/",
];

/// Metadata of one stored blob.
#[derive(Debug, Clone)]
pub struct FileDef {
    /// Unique id assigned at upload time.
    pub id: String,
    /// Uploader.
    pub user: Uid,
    pub mime_type: String,
    /// Backend-specific storage location.
    pub location: String,
    pub updated_at: DateTime<Utc>,
    pub size: u64,
}

impl FileDef {
    pub fn new(id: impl Into<String>, user: Uid, mime_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user,
            mime_type: mime_type.into(),
            location: String::new(),
            updated_at: Utc::now(),
            size: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("file not found")]
    NotFound,
    #[error("media backend unavailable: {0}")]
    Unavailable(String),
    #[error("media backend failure: {0}")]
    Internal(String),
}

/// Headers query sent to the backend before the main operation: the backend
/// may add response headers, or short-circuit the request with a status
/// (e.g. a redirect to external blob storage).
#[derive(Debug, Clone)]
pub struct HeadersRequest {
    pub method: String,
    pub url: String,
}

#[derive(Debug, Clone, Default)]
pub struct HeadersResponse {
    pub headers: Vec<(String, String)>,
    /// Zero means "continue processing".
    pub status: u16,
}

/// Pluggable blob backend.
#[async_trait]
pub trait MediaHandler: Send + Sync {
    /// Consulted for CORS preflight and before serving/accepting a blob.
    async fn headers(
        &self,
        req: &HeadersRequest,
        serve: bool,
    ) -> Result<HeadersResponse, MediaError>;

    /// Store the blob, filling in the storage location; returns the download
    /// URL and the stored size.
    async fn upload(&self, fdef: &mut FileDef, data: Bytes) -> Result<(String, u64), MediaError>;

    /// Fetch metadata and content for a download URL.
    async fn download(&self, url: &str) -> Result<(FileDef, Bytes), MediaError>;

    /// Best-effort removal of stored blobs.
    async fn delete(&self, locations: &[String]) -> Result<(), MediaError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("malformed request")]
    Malformed,
    #[error("store failure: {0}")]
    Internal(String),
}

/// Metadata store for uploaded files.
pub trait FileStore: Send + Sync {
    /// Record a new upload in progress.
    fn start_upload(&self, fdef: &FileDef) -> Result<(), StoreError>;

    /// Mark an upload finished. On failure the record is dropped; on success
    /// the finalized definition is returned.
    fn finish_upload(
        &self,
        fdef: &FileDef,
        success: bool,
        size: u64,
    ) -> Result<FileDef, StoreError>;

    /// Fetch a file record by id.
    fn get(&self, id: &str) -> Result<FileDef, StoreError>;

    /// Drop up to `limit` finalized files never attached to a message and
    /// older than `older_than`. Returns the storage locations freed, for the
    /// blob backend to delete.
    fn delete_unused(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;
}

/// Render a store failure as a control envelope.
pub fn decode_store_error(
    err: &StoreError,
    id: &str,
    ts: DateTime<Utc>,
) -> ServerMessage {
    match err {
        StoreError::NotFound => err_not_found(id, "", ts),
        StoreError::Malformed => err_malformed(id, "", ts),
        StoreError::Internal(_) => err_unknown(id, "", ts),
    }
}

/// Render a media-backend failure as a control envelope.
pub fn decode_media_error(err: &MediaError, id: &str, ts: DateTime<Utc>) -> ServerMessage {
    match err {
        MediaError::NotFound => err_not_found(id, "", ts),
        MediaError::Unavailable(_) | MediaError::Internal(_) => err_unknown(id, "", ts),
    }
}

// ---------------------------------------------------------------------------
// MIME handling
// ---------------------------------------------------------------------------

/// Sniff the content type from the first bytes of a payload. Matches the
/// common web signatures; anything unrecognized that looks textual becomes
/// `text/plain`, the rest `application/octet-stream`.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let trimmed = skip_ws(data);
    for (tag, mime) in [
        ("<!DOCTYPE HTML", "text/html; charset=utf-8"),
        ("<HTML", "text/html; charset=utf-8"),
        ("<HEAD", "text/html; charset=utf-8"),
        ("<SCRIPT", "text/html; charset=utf-8"),
        ("<IFRAME", "text/html; charset=utf-8"),
        ("<BODY", "text/html; charset=utf-8"),
        ("<DIV", "text/html; charset=utf-8"),
        ("<P", "text/html; charset=utf-8"),
        ("<?XML", "text/xml; charset=utf-8"),
    ] {
        if starts_with_ignore_case(trimmed, tag.as_bytes()) {
            return mime;
        }
    }
    for (sig, mime) in [
        (&b"%PDF-"[..], "application/pdf"),
        (b"%!PS-Adobe-", "application/postscript"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"BM", "image/bmp"),
        (b"ID3", "audio/mpeg"),
        (b"OggS", "application/ogg"),
        (b"\x1aE\xdf\xa3", "video/webm"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b\x08", "application/x-gzip"),
        (b"wOFF", "font/woff"),
        (b"wOF2", "font/woff2"),
    ] {
        if data.starts_with(sig) {
            return mime;
        }
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" {
        match &data[8..12] {
            b"WEBP" => return "image/webp",
            b"WAVE" => return "audio/wave",
            b"AVI " => return "video/avi",
            _ => {}
        }
    }
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        return "video/mp4";
    }
    if looks_textual(data) {
        return "text/plain; charset=utf-8";
    }
    "application/octet-stream"
}

fn skip_ws(data: &[u8]) -> &[u8] {
    let mut i = 0;
    while i < data.len() && matches!(data[i], b'\t' | b'\n' | b'\x0c' | b'\r' | b' ') {
        i += 1;
    }
    &data[i..]
}

fn starts_with_ignore_case(data: &[u8], tag: &[u8]) -> bool {
    data.len() >= tag.len()
        && data[..tag.len()]
            .iter()
            .zip(tag)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
}

fn looks_textual(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    // A NUL or a run of non-whitespace control bytes marks binary data.
    !data
        .iter()
        .any(|&b| b == 0 || (b < 0x09) || (0x0e..0x20).contains(&b))
}

/// Parse `type/subtype; key=value; ...` into the lowercase media type and
/// its parameters. Returns None for anything that is not `type/subtype`.
pub fn parse_media_type(value: &str) -> Option<(String, Vec<(String, String)>)> {
    let mut parts = value.split(';');
    let mtype = parts.next()?.trim().to_lowercase();
    let (major, minor) = mtype.split_once('/')?;
    if major.is_empty() || minor.is_empty() || major.contains(char::is_whitespace) {
        return None;
    }
    let mut params = Vec::new();
    for part in parts {
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };
        let v = v.trim().trim_matches('"');
        params.push((k.trim().to_lowercase(), v.to_string()));
    }
    Some((mtype, params))
}

/// Re-assemble a media type string from its parsed parts.
pub fn format_media_type(mtype: &str, params: &[(String, String)]) -> String {
    let mut out = mtype.to_string();
    for (k, v) in params {
        out.push_str("; ");
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

/// Resolve the MIME type of an upload: sniff the payload, and only when the
/// sniff is inconclusive fall back to the client-provided Content-Type,
/// which must sit under an allowed top-level type.
pub fn resolve_mime_type(sniff_buf: &[u8], client_content_type: Option<&str>) -> String {
    let sniffed = detect_content_type(sniff_buf);
    if sniffed != "application/octet-stream" {
        return sniffed.to_string();
    }
    if let Some((mtype, params)) = client_content_type.and_then(parse_media_type) {
        if ALLOWED_MIME_TYPES
            .iter()
            .any(|allowed| mtype.starts_with(allowed))
        {
            let formatted = format_media_type(&mtype, &params);
            if !formatted.is_empty() {
                return formatted;
            }
        }
    }
    sniffed.to_string()
}

/// True when a download of this MIME type must be served as an attachment.
/// Forcing markup and application types to download is a security measure.
pub fn force_attachment(mime_type: &str) -> bool {
    mime_type.contains("html")
        || mime_type.contains("xml")
        || mime_type.starts_with("application/")
        || mime_type.starts_with("message/")
        || mime_type.starts_with("model/")
        || mime_type.starts_with("multipart/")
        || mime_type.starts_with("text/")
}
