//! Command-line interface.

use crate::auth::AuthRegistry;
use crate::cluster::{Cluster, NullCluster};
use crate::core::config::Config;
use crate::core::registry::GlobalsBuilder;
use crate::hub::Hub;
use crate::media::fs::{FsMediaHandler, MemFileStore};
use crate::media::gc::run_garbage_collection;
use crate::media::{FileStore, MediaHandler};
use crate::net::http::{build_router, listen_and_serve, signal_handler, Teardown};
use crate::ops::{init_tracing, spawn_publisher, Stats};
use crate::session::SessionStore;
use crate::users::UserCache;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const STATS_PUBLISH_PERIOD: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "herald", about = "Clustered real-time messaging server", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the server.
    Start(StartArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Configuration file; defaults to HERALD_CONFIG or config/herald.toml.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Wire every subsystem and serve until a shutdown signal arrives.
pub async fn run_start(args: StartArgs) -> Result<()> {
    let cfg = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_from_env()?,
    };
    cfg.validate()?;
    let _log_handle = init_tracing(cfg.log.level.as_deref(), cfg.log.json)?;
    tracing::info!("herald v{} starting", env!("CARGO_PKG_VERSION"));

    let sessions = Arc::new(SessionStore::new());
    // Outside a cluster every proxy forward reports unreachable; a real
    // transport is installed here when clustering is configured.
    let cluster: Arc<dyn Cluster> = Arc::new(NullCluster);
    let hub = Hub::spawn(
        cluster.clone(),
        sessions.clone(),
        cfg.idle_proxy_topic_timeout(),
    );
    let files: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
    let media: Arc<dyn MediaHandler> = Arc::new(FsMediaHandler::new(
        cfg.media.upload_dir.clone(),
        files.clone(),
    ));
    let (users, users_handle) = UserCache::spawn();
    let stats = Arc::new(Stats::new());
    let stats_handle = spawn_publisher(stats.clone(), STATS_PUBLISH_PERIOD);

    let globals = GlobalsBuilder {
        sessions,
        hub,
        cluster,
        media: media.clone(),
        files: files.clone(),
        auth: AuthRegistry::new(),
        users,
        stats,
        api_keys: cfg.http.api_keys.clone(),
        tls_redirect_http: cfg
            .http
            .tls
            .as_ref()
            .and_then(|tls| tls.redirect_http.clone()),
        tls_strict_max_age: cfg
            .http
            .tls
            .as_ref()
            .and_then(|tls| tls.strict_max_age.clone()),
        cache_max_age: cfg.http.cache_max_age,
        max_file_upload_size: cfg.media.max_upload_size,
        media_gc_period: cfg.media_gc_period(),
    }
    .build();

    let gc = cfg
        .media_gc_period()
        .map(|period| run_garbage_collection(files, media, period, cfg.media.gc_block_size));

    let app = build_router(globals.clone());
    let stop = signal_handler();
    let teardown = Teardown {
        users: users_handle,
        stats: stats_handle,
    };
    listen_and_serve(globals, app, &cfg, stop, teardown).await?;

    if let Some(gc) = gc {
        gc.stop().await;
    }
    tracing::info!("shutdown complete");
    Ok(())
}
