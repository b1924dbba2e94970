//! Client/server wire messages and control-envelope constructors.
//!
//! The JSON shapes mirror what clients and other cluster nodes expect:
//! a server message is an object with exactly one of `ctrl`, `data`,
//! `pres` or `info` set. Internal routing metadata (originating uid,
//! session to skip) never leaves the process.

use crate::types::Uid;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Wall-clock "now" in the resolution used on the wire (UTC, milliseconds).
pub fn time_now() -> DateTime<Utc> {
    Utc::now()
        .duration_round(TimeDelta::milliseconds(1))
        .unwrap_or_else(|_| Utc::now())
}

// ---------------------------------------------------------------------------
// Server-side messages
// ---------------------------------------------------------------------------

/// Generic response: `{ts, code, text, params?}`.
#[derive(Debug, Clone, Serialize)]
pub struct Ctrl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub code: u16,
    pub text: String,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Content message delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Data {
    pub topic: String,
    pub from: String,
    pub ts: DateTime<Utc>,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<Map<String, Value>>,
    pub content: Value,
}

/// Mode delta attached to an `acs` presence notification.
#[derive(Debug, Clone, Serialize, Default)]
pub struct AcsDelta {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub want: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub given: String,
}

/// Presence notification.
#[derive(Debug, Clone, Serialize)]
pub struct Pres {
    pub topic: String,
    pub src: String,
    pub what: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acs: Option<AcsDelta>,
}

/// Ephemeral notification (typing, read/recv receipts).
#[derive(Debug, Clone, Serialize)]
pub struct Info {
    pub topic: String,
    pub from: String,
    pub what: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// The single payload of a server message, externally tagged on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerPayload {
    Ctrl(Ctrl),
    Data(Data),
    Pres(Pres),
    Info(Info),
}

/// A server-originated message plus in-process routing metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    #[serde(flatten)]
    pub payload: ServerPayload,
    /// Affected user, e.g. the uid being evicted. Not serialized.
    #[serde(skip)]
    pub uid: Uid,
    /// Session to exclude from delivery. Not serialized.
    #[serde(skip)]
    pub skip_sid: Option<String>,
}

impl ServerMessage {
    pub fn new(payload: ServerPayload) -> Self {
        Self {
            payload,
            uid: Uid::ZERO,
            skip_sid: None,
        }
    }

    pub fn ctrl(&self) -> Option<&Ctrl> {
        match &self.payload {
            ServerPayload::Ctrl(c) => Some(c),
            _ => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match &self.payload {
            ServerPayload::Ctrl(_) => "ctrl",
            ServerPayload::Data(_) => "data",
            ServerPayload::Pres(_) => "pres",
            ServerPayload::Info(_) => "info",
        }
    }
}

// ---------------------------------------------------------------------------
// Client-side messages
// ---------------------------------------------------------------------------

/// Client request to leave a topic.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Leave {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unsub: bool,
}

/// Client content message to broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct Publish {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<Map<String, Value>>,
    pub content: Value,
}

/// A client-originated request as routed between nodes. Only the fields the
/// proxy needs are typed; meta payloads stay opaque to this layer.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ClientMessage {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Routing topic name.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    /// Topic name as the requesting client knows it.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub original: String,
    /// External form of the uid the request acts for.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub as_user: String,
    /// True when the request was initiated by the client itself rather than
    /// synthesized by the server (e.g. session teardown).
    #[serde(skip)]
    pub init: bool,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leave: Option<Leave>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<Publish>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<Value>,
}

// ---------------------------------------------------------------------------
// Reply constructors
// ---------------------------------------------------------------------------

fn ctrl_msg(
    code: u16,
    text: &str,
    id: impl Into<Option<String>>,
    topic: impl Into<Option<String>>,
    ts: DateTime<Utc>,
) -> ServerMessage {
    ServerMessage::new(ServerPayload::Ctrl(Ctrl {
        id: id.into().filter(|s| !s.is_empty()),
        topic: topic.into().filter(|s| !s.is_empty()),
        code,
        text: text.to_string(),
        ts,
        params: None,
    }))
}

/// 200 with response parameters.
pub fn no_err_params(id: &str, topic: &str, ts: DateTime<Utc>, params: Value) -> ServerMessage {
    let mut msg = ctrl_msg(200, "ok", id.to_string(), topic.to_string(), ts);
    if let ServerPayload::Ctrl(c) = &mut msg.payload {
        c.params = Some(params);
    }
    msg
}

/// 300: the authenticator requested a second round.
pub fn info_challenge(id: &str, ts: DateTime<Utc>, challenge: &[u8]) -> ServerMessage {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    let mut msg = ctrl_msg(300, "challenge", id.to_string(), None, ts);
    if let ServerPayload::Ctrl(c) = &mut msg.payload {
        c.params = Some(json!({ "challenge": STANDARD.encode(challenge) }));
    }
    msg
}

pub fn err_api_key_required(ts: DateTime<Utc>) -> ServerMessage {
    ctrl_msg(403, "valid API key required", None, None, ts)
}

pub fn err_auth_required(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl_msg(401, "authentication required", id.to_string(), topic.to_string(), ts)
}

pub fn err_malformed(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl_msg(400, "malformed", id.to_string(), topic.to_string(), ts)
}

pub fn err_operation_not_allowed(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl_msg(405, "operation or method not allowed", id.to_string(), topic.to_string(), ts)
}

pub fn err_too_large(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl_msg(413, "too large", id.to_string(), topic.to_string(), ts)
}

pub fn err_not_found(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl_msg(404, "not found", id.to_string(), topic.to_string(), ts)
}

pub fn err_unknown(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl_msg(500, "internal error", id.to_string(), topic.to_string(), ts)
}

/// 503: the topic is suspended or being deleted.
pub fn err_locked_reply(msg: &ClientMessage, ts: DateTime<Utc>) -> ServerMessage {
    ctrl_msg(503, "locked", msg.id.clone(), msg.original.clone(), ts)
}

/// 502: the topic master node cannot be reached.
pub fn err_cluster_unreachable_reply(msg: &ClientMessage, ts: DateTime<Utc>) -> ServerMessage {
    ctrl_msg(502, "cluster unreachable", msg.id.clone(), msg.original.clone(), ts)
}

/// Plain status-text envelope used by the HTTP error interceptor.
pub fn http_status_envelope(code: u16, text: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl_msg(code, text, None, None, ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_wire_shape() {
        let msg = err_locked_reply(
            &ClientMessage {
                id: "123".into(),
                original: "grpXYZ".into(),
                ..Default::default()
            },
            time_now(),
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert!(v.get("ctrl").is_some());
        assert_eq!(v["ctrl"]["code"], 503);
        assert_eq!(v["ctrl"]["text"], "locked");
        assert_eq!(v["ctrl"]["id"], "123");
        assert_eq!(v["ctrl"]["topic"], "grpXYZ");
        // Internal routing fields must not leak.
        assert!(v.get("uid").is_none());
        assert!(v.get("skip_sid").is_none());
    }

    #[test]
    fn test_ctrl_params() {
        let msg = no_err_params("1", "", time_now(), json!({"url": "/v0/file/s/abc"}));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["ctrl"]["code"], 200);
        assert_eq!(v["ctrl"]["params"]["url"], "/v0/file/s/abc");
        assert!(v["ctrl"].get("topic").is_none());
    }

    #[test]
    fn test_data_payload_tag() {
        let msg = ServerMessage::new(ServerPayload::Data(Data {
            topic: "grpXYZ".into(),
            from: Uid(7).user_id(),
            ts: time_now(),
            seq: 42,
            head: None,
            content: json!("hello"),
        }));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["data"]["seq"], 42);
        assert!(v.get("ctrl").is_none());
    }
}
