//! Read-only snapshot of server internals for debugging.

use crate::core::registry::Globals;
use crate::types::msg::time_now;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILDSTAMP: &str = match option_env!("HERALD_BUILDSTAMP") {
    Some(stamp) => stamp,
    None => "undef",
};

#[derive(Serialize)]
struct DebugSession {
    #[serde(skip_serializing_if = "String::is_empty")]
    remote_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    ua: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    uid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    sid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    clnode: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    subs: Vec<String>,
}

#[derive(Serialize)]
struct DebugTopic {
    topic: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    xorig: String,
    is_proxy: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    per_user: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    per_subs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sessions: Vec<String>,
}

#[derive(Serialize)]
struct DebugCachedUser {
    uid: String,
    unread: i64,
    topics: i64,
}

#[derive(Serialize)]
struct DebugDump {
    server_version: &'static str,
    build_id: &'static str,
    ts: DateTime<Utc>,
    sessions: Vec<DebugSession>,
    topics: Vec<DebugTopic>,
    user_cache: Vec<DebugCachedUser>,
    stats: crate::ops::stats::StatsSnapshot,
}

/// `GET` handler walking sessions, topics and the user cache.
pub async fn serve_status(State(globals): State<Arc<Globals>>) -> Response {
    let mut dump = DebugDump {
        server_version: SERVER_VERSION,
        build_id: BUILDSTAMP,
        ts: time_now(),
        sessions: Vec::with_capacity(globals.sessions.len()),
        topics: Vec::new(),
        user_cache: Vec::new(),
        stats: globals.stats.snapshot(),
    };
    globals.sessions.range(|sid, sess| {
        dump.sessions.push(DebugSession {
            remote_addr: sess.remote_addr.clone(),
            ua: sess.user_agent(),
            uid: sess.uid().user_id(),
            sid: sid.to_string(),
            clnode: sess.cluster_node.clone(),
            subs: sess.sub_names(),
        });
    });
    globals.hub.range(|handle| {
        let snap = handle.snapshot();
        dump.topics.push(DebugTopic {
            topic: handle.name.clone(),
            xorig: snap.xoriginal,
            is_proxy: snap.is_proxy,
            per_user: snap.per_user,
            per_subs: snap.per_subs,
            sessions: snap.session_sids,
        });
    });
    globals.users.range(|uid, entry| {
        dump.user_cache.push(DebugCachedUser {
            uid: uid.user_id(),
            unread: entry.unread,
            topics: entry.topics,
        });
    });
    Json(dump).into_response()
}
