//! Process-local statistics counters and their publisher.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Counters updated from hot paths with relaxed atomics.
#[derive(Default)]
pub struct Stats {
    file_uploads_total: AtomicU64,
    file_downloads_total: AtomicU64,
    live_sessions: AtomicI64,
    live_topics: AtomicI64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    pub file_uploads_total: u64,
    pub file_downloads_total: u64,
    pub live_sessions: i64,
    pub live_topics: i64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_file_uploads(&self) {
        self.file_uploads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_file_downloads(&self) {
        self.file_downloads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_live_sessions(&self, delta: i64) {
        self.live_sessions.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn add_live_topics(&self, delta: i64) {
        self.live_topics.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            file_uploads_total: self.file_uploads_total.load(Ordering::Relaxed),
            file_downloads_total: self.file_downloads_total.load(Ordering::Relaxed),
            live_sessions: self.live_sessions.load(Ordering::Relaxed),
            live_topics: self.live_topics.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the periodic stats publisher.
pub struct StatsHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl StatsHandle {
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.join.await;
    }
}

/// Publish a snapshot to the log on a fixed cadence until stopped.
pub fn spawn_publisher(stats: Arc<Stats>, period: Duration) -> StatsHandle {
    let (stop, mut stopped) = watch::channel(false);
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snap = stats.snapshot();
                    tracing::debug!(
                        uploads = snap.file_uploads_total,
                        downloads = snap.file_downloads_total,
                        sessions = snap.live_sessions,
                        topics = snap.live_topics,
                        "stats"
                    );
                }
                _ = stopped.changed() => return,
            }
        }
    });
    StatsHandle { stop, join }
}
