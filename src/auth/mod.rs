//! HTTP request authentication.
//!
//! Credentials arrive in one of several places; extraction checks them in a
//! fixed precedence: dedicated header, canonical `Authorization` header,
//! query string, form body, cookies. The secret is handed to a pluggable
//! authenticator looked up by method name.

use crate::session::SessionStore;
use crate::types::msg::{err_auth_required, err_malformed, err_unknown, ServerMessage};
use crate::types::Uid;
use axum::http::HeaderMap;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Identity established by an authenticator.
#[derive(Debug, Clone)]
pub struct AuthRecord {
    pub uid: Uid,
}

/// Outcome of one authentication round.
pub enum AuthResponse {
    /// Authentication complete.
    Record(AuthRecord),
    /// The authenticator wants a second round; the payload goes back to the
    /// client verbatim.
    Challenge(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed credentials")]
    Malformed,
    #[error("authentication failed")]
    Failed,
    #[error("authenticator internal error: {0}")]
    Internal(String),
}

/// One logical authentication scheme, e.g. `basic` or `token`.
pub trait AuthHandler: Send + Sync {
    fn authenticate(&self, secret: &[u8], remote_addr: &str) -> Result<AuthResponse, AuthError>;
}

/// Authenticators configured at startup, looked up by lowercase method name.
#[derive(Default)]
pub struct AuthRegistry {
    handlers: HashMap<String, Arc<dyn AuthHandler>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: &str, handler: Arc<dyn AuthHandler>) {
        self.handlers.insert(method.to_lowercase(), handler);
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn AuthHandler>> {
        self.handlers.get(&method.to_lowercase()).cloned()
    }
}

/// The request surfaces credential extraction looks at. Form fields come
/// from either an urlencoded or a multipart body.
pub struct AuthArgs<'a> {
    pub headers: &'a HeaderMap,
    pub query: &'a HashMap<String, String>,
    pub form: &'a HashMap<String, String>,
    pub remote_addr: &'a str,
}

impl AuthArgs<'_> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    fn cookie(&self, name: &str) -> Option<String> {
        parse_cookie_value(self.header("cookie")?, name)
    }
}

/// Extract a named cookie from a `Cookie` header value.
pub fn parse_cookie_value(cookie_header: &str, name: &str) -> Option<String> {
    for pair in cookie_header.split(';') {
        let pair = pair.trim();
        if let Some((k, v)) = pair.split_once('=') {
            if k == name {
                return Some(v.to_string());
            }
        }
    }
    None
}

/// Get the API key: header, then query, then form, then cookie.
pub fn get_api_key(args: &AuthArgs<'_>) -> Option<String> {
    if let Some(key) = args.header("x-tinode-apikey") {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    if let Some(key) = args.query.get("apikey") {
        if !key.is_empty() {
            return Some(key.clone());
        }
    }
    if let Some(key) = args.form.get("apikey") {
        if !key.is_empty() {
            return Some(key.clone());
        }
    }
    args.cookie("apikey").filter(|k| !k.is_empty())
}

/// Validate an API key against the configured set. An empty configured set
/// accepts any non-empty key.
pub fn check_api_key(key: Option<&str>, allowed: &[String]) -> bool {
    match key {
        None | Some("") => false,
        Some(key) => allowed.is_empty() || allowed.iter().any(|k| k == key),
    }
}

/// Extract `(method, secret)` credentials, checking each source in order.
pub fn get_http_auth(args: &AuthArgs<'_>) -> Option<(String, String)> {
    for header in ["x-tinode-auth", "authorization"] {
        if let Some(value) = args.header(header) {
            let parts: Vec<&str> = value.split(' ').collect();
            if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
                return Some((parts[0].to_string(), parts[1].to_string()));
            }
        }
    }
    if let Some(method) = args.query.get("auth").filter(|m| !m.is_empty()) {
        // Query strings carry URL-safe base64; rewrite to standard.
        let secret = args
            .query
            .get("secret")
            .map(|s| s.replace('-', "+").replace('_', "/"))
            .unwrap_or_default();
        return Some((method.clone(), secret));
    }
    if let Some(method) = args.form.get("auth").filter(|m| !m.is_empty()) {
        let secret = args.form.get("secret").cloned().unwrap_or_default();
        return Some((method.clone(), secret));
    }
    if let (Some(method), Some(secret)) = (args.cookie("auth"), args.cookie("secret")) {
        if !method.is_empty() {
            return Some((method, secret));
        }
    }
    None
}

/// Result of authenticating a plain HTTP request.
pub enum AuthOutcome {
    /// Established identity; zero when no credentials resolved.
    Uid(Uid),
    /// The authenticator requested a second round.
    Challenge(Vec<u8>),
}

/// Authenticate a non-websocket HTTP request. With no credentials at all,
/// fall back to the session identified by the `sid` form field.
pub fn auth_http_request(
    args: &AuthArgs<'_>,
    registry: &AuthRegistry,
    sessions: &SessionStore,
) -> Result<AuthOutcome, AuthError> {
    if let Some((method, secret)) = get_http_auth(args) {
        let decoded = STANDARD
            .decode(&secret)
            .or_else(|_| STANDARD_NO_PAD.decode(&secret))
            .map_err(|_| {
                tracing::info!("media: invalid auth secret {method} '{secret}'");
                AuthError::Malformed
            })?;
        let Some(handler) = registry.get(&method) else {
            tracing::info!("media: unknown auth method {method}");
            return Ok(AuthOutcome::Uid(Uid::ZERO));
        };
        return match handler.authenticate(&decoded, args.remote_addr)? {
            AuthResponse::Record(rec) => Ok(AuthOutcome::Uid(rec.uid)),
            AuthResponse::Challenge(challenge) => Ok(AuthOutcome::Challenge(challenge)),
        };
    }
    let sid = args
        .form
        .get("sid")
        .or_else(|| args.query.get("sid"))
        .cloned()
        .unwrap_or_default();
    let uid = sessions.get(&sid).map(|s| s.uid()).unwrap_or(Uid::ZERO);
    Ok(AuthOutcome::Uid(uid))
}

/// Render an authentication failure as a control envelope.
pub fn decode_auth_error(err: &AuthError, id: &str, ts: DateTime<Utc>) -> ServerMessage {
    match err {
        AuthError::Malformed => err_malformed(id, "", ts),
        AuthError::Failed => err_auth_required(id, "", ts),
        AuthError::Internal(reason) => {
            tracing::warn!("authenticator failure: {reason}");
            err_unknown(id, "", ts)
        }
    }
}
