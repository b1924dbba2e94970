//! Shared harness for integration tests: registry assembly, a recording
//! cluster transport, and request builders.

// Not every test file uses every helper.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::Request;
use herald::auth::{AuthHandler, AuthRecord, AuthRegistry, AuthResponse};
use herald::cluster::{Cluster, ClusterError, ClusterResp, ClusterSess, ProxyReq};
use herald::core::registry::{Globals, GlobalsBuilder};
use herald::hub::Hub;
use herald::media::fs::{FsMediaHandler, MemFileStore};
use herald::net::http::build_router;
use herald::ops::{spawn_publisher, Stats, StatsHandle};
use herald::session::SessionStore;
use herald::types::msg::{ClientMessage, ServerMessage};
use herald::types::Uid;
use herald::users::{UserCache, UserCacheHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Cluster transport fake: records forwards, optionally failing them.
#[derive(Default)]
pub struct RecordingCluster {
    pub fail: bool,
    pub master_calls: Mutex<Vec<(ProxyReq, String)>>,
    pub gone: Mutex<Vec<String>>,
}

impl RecordingCluster {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl Cluster for RecordingCluster {
    fn route_to_topic_master(
        &self,
        req: ProxyReq,
        _msg: Option<&ClientMessage>,
        topic: &str,
        _sess: &ClusterSess,
    ) -> Result<(), ClusterError> {
        self.master_calls.lock().push((req, topic.to_string()));
        if self.fail {
            Err(ClusterError::Unreachable("peer-1".into()))
        } else {
            Ok(())
        }
    }

    fn route_to_topic_intra_cluster(
        &self,
        _topic: &str,
        _msg: &ServerMessage,
        _skip_sid: Option<&str>,
    ) -> Result<(), ClusterError> {
        Ok(())
    }

    fn topic_proxy_gone(&self, topic: &str) -> Result<(), ClusterError> {
        self.gone.lock().push(topic.to_string());
        Ok(())
    }
}

/// Authenticator accepting any secret as a fixed uid.
pub struct StaticAuth(pub Uid);

impl AuthHandler for StaticAuth {
    fn authenticate(
        &self,
        _secret: &[u8],
        _remote_addr: &str,
    ) -> Result<AuthResponse, herald::auth::AuthError> {
        Ok(AuthResponse::Record(AuthRecord { uid: self.0 }))
    }
}

pub struct TestServer {
    pub globals: Arc<Globals>,
    pub files: Arc<MemFileStore>,
    pub users_handle: UserCacheHandle,
    pub stats_handle: StatsHandle,
    pub upload_dir: tempfile::TempDir,
}

/// Assemble a registry backed by temp-dir media storage and a `token`
/// authenticator mapping every secret to uid 7.
pub fn test_server(gc_enabled: bool) -> TestServer {
    let upload_dir = tempfile::tempdir().expect("tempdir");
    let sessions = Arc::new(SessionStore::new());
    let cluster: Arc<dyn Cluster> = Arc::new(RecordingCluster::default());
    let hub = Hub::spawn(cluster.clone(), sessions.clone(), Duration::from_secs(5));
    let files = Arc::new(MemFileStore::new());
    let media = Arc::new(FsMediaHandler::new(upload_dir.path(), files.clone()));
    let (users, users_handle) = UserCache::spawn();
    let stats = Arc::new(Stats::new());
    let stats_handle = spawn_publisher(stats.clone(), Duration::from_secs(60));
    let mut auth = AuthRegistry::new();
    auth.register("token", Arc::new(StaticAuth(Uid(7))));

    let globals = GlobalsBuilder {
        sessions,
        hub,
        cluster,
        media,
        files: files.clone(),
        auth,
        users,
        stats,
        api_keys: vec!["testkey".to_string()],
        tls_redirect_http: None,
        tls_strict_max_age: None,
        cache_max_age: 0,
        max_file_upload_size: 1 << 20,
        media_gc_period: gc_enabled.then(|| Duration::from_secs(60)),
    }
    .build();
    TestServer {
        globals,
        files,
        users_handle,
        stats_handle,
        upload_dir,
    }
}

pub fn router(server: &TestServer) -> axum::Router {
    build_router(server.globals.clone())
}

/// Multipart upload request with the standard auth fields.
pub fn upload_request(file_bytes: &[u8], content_type: &str, extra: &[(&str, &str)]) -> Request<Body> {
    let boundary = "heraldtestboundary";
    let mut body = Vec::new();
    let mut push_field = |name: &str, value: &str| {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
        );
    };
    for (name, value) in extra {
        push_field(name, value);
    }
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(file_bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/v0/file/u")
        .header("x-tinode-apikey", "testkey")
        .header("authorization", "token c2VjcmV0")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .expect("request")
}
