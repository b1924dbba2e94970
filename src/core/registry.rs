//! Process-wide handles shared by every component.
//!
//! Everything here is constructed once before any listener starts and torn
//! down strictly after every other subsystem has quiesced. Components take
//! the registry as an `Arc` parameter rather than reaching for ambient
//! state.

use crate::auth::AuthRegistry;
use crate::cluster::Cluster;
use crate::hub::Hub;
use crate::media::{FileStore, MediaHandler};
use crate::ops::Stats;
use crate::session::SessionStore;
use crate::users::UserCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Externally managed subsystem that only needs to be stopped at shutdown,
/// e.g. a plugin connection or the gRPC server.
pub trait RemoteHandle: Send + Sync {
    fn name(&self) -> &str;
    /// Stop immediately; must not block.
    fn stop(&self);
}

pub struct Globals {
    shutting_down: AtomicBool,
    pub sessions: Arc<SessionStore>,
    pub hub: Arc<Hub>,
    pub cluster: Arc<dyn Cluster>,
    pub media: Arc<dyn MediaHandler>,
    pub files: Arc<dyn FileStore>,
    pub auth: AuthRegistry,
    pub users: Arc<UserCache>,
    pub stats: Arc<Stats>,
    /// Accepted API keys; empty accepts any non-empty key.
    pub api_keys: Vec<String>,
    /// Plaintext address answering with redirects to the TLS listener.
    pub tls_redirect_http: Option<String>,
    /// HSTS max-age value; absent disables the header.
    pub tls_strict_max_age: Option<String>,
    /// `Cache-Control` max-age seconds; zero disables the header.
    pub cache_max_age: u32,
    /// Upload size cap in bytes; zero disables the cap.
    pub max_file_upload_size: u64,
    /// Orphan GC cadence; absent when the collector is disabled.
    pub media_gc_period: Option<Duration>,
    /// Optional gRPC server, stopped without draining streams.
    pub grpc_server: Mutex<Option<Box<dyn RemoteHandle>>>,
    /// Plugin connections terminated at shutdown.
    pub plugins: Mutex<Vec<Box<dyn RemoteHandle>>>,
}

impl Globals {
    pub fn shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn set_grpc_server(&self, server: Box<dyn RemoteHandle>) {
        *self.grpc_server.lock() = Some(server);
    }

    pub fn add_plugin(&self, plugin: Box<dyn RemoteHandle>) {
        self.plugins.lock().push(plugin);
    }

    /// Stop the gRPC server, if one is configured. GracefulStop would hang
    /// on long-lived streams, so this is an immediate stop.
    pub fn grpc_shutdown(&self) {
        if let Some(server) = self.grpc_server.lock().take() {
            tracing::info!("stopping gRPC server {}", server.name());
            server.stop();
        }
    }

    /// Terminate every plugin connection.
    pub fn plugins_shutdown(&self) {
        for plugin in self.plugins.lock().drain(..) {
            tracing::info!("terminating plugin connection {}", plugin.name());
            plugin.stop();
        }
    }
}

/// Everything needed to assemble the registry.
pub struct GlobalsBuilder {
    pub sessions: Arc<SessionStore>,
    pub hub: Arc<Hub>,
    pub cluster: Arc<dyn Cluster>,
    pub media: Arc<dyn MediaHandler>,
    pub files: Arc<dyn FileStore>,
    pub auth: AuthRegistry,
    pub users: Arc<UserCache>,
    pub stats: Arc<Stats>,
    pub api_keys: Vec<String>,
    pub tls_redirect_http: Option<String>,
    pub tls_strict_max_age: Option<String>,
    pub cache_max_age: u32,
    pub max_file_upload_size: u64,
    pub media_gc_period: Option<Duration>,
}

impl GlobalsBuilder {
    pub fn build(self) -> Arc<Globals> {
        Arc::new(Globals {
            shutting_down: AtomicBool::new(false),
            sessions: self.sessions,
            hub: self.hub,
            cluster: self.cluster,
            media: self.media,
            files: self.files,
            auth: self.auth,
            users: self.users,
            stats: self.stats,
            api_keys: self.api_keys,
            tls_redirect_http: self.tls_redirect_http,
            tls_strict_max_age: self.tls_strict_max_age,
            cache_max_age: self.cache_max_age,
            max_file_upload_size: self.max_file_upload_size,
            media_gc_period: self.media_gc_period,
            grpc_server: Mutex::new(None),
            plugins: Mutex::new(Vec::new()),
        })
    }
}
