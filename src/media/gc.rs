//! Garbage collection of uploaded files that were never attached to a
//! message.

use crate::media::{FileStore, MediaHandler};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Grace period before an unattached upload becomes collectable.
const ORPHAN_GRACE: Duration = Duration::from_secs(3600);

/// Handle to a running garbage collector.
pub struct GcHandle {
    stop_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl GcHandle {
    /// Stop the collector and wait for it to finish the current pass.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = self.join.await;
    }
}

/// Run the orphan-file sweeper every `period`, deleting at most `block_size`
/// files per pass. The first tick is jittered to `0.75*period +
/// uniform(0, 0.5)*period` so cluster nodes do not sweep in lockstep.
pub fn run_garbage_collection(
    files: Arc<dyn FileStore>,
    media: Arc<dyn MediaHandler>,
    period: Duration,
    block_size: usize,
) -> GcHandle {
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let join = tokio::spawn(async move {
        let first = period / 2 + period / 4 + period.mul_f64(rand::thread_rng().gen::<f64>() * 0.5);
        tokio::select! {
            () = tokio::time::sleep(first) => {}
            _ = stop_rx.recv() => return,
        }
        loop {
            sweep(files.as_ref(), media.as_ref(), block_size).await;
            tokio::select! {
                () = tokio::time::sleep(period) => {}
                _ = stop_rx.recv() => return,
            }
        }
    });
    GcHandle { stop_tx, join }
}

async fn sweep(files: &dyn FileStore, media: &dyn MediaHandler, block_size: usize) {
    let cutoff = chrono::Utc::now()
        - chrono::Duration::from_std(ORPHAN_GRACE).unwrap_or_else(|_| chrono::Duration::hours(1));
    match files.delete_unused(cutoff, block_size) {
        Ok(locations) => {
            if locations.is_empty() {
                return;
            }
            tracing::debug!("media gc: removing {} orphaned files", locations.len());
            if let Err(err) = media.delete(&locations).await {
                tracing::warn!("media gc: {err}");
            }
        }
        Err(err) => tracing::warn!("media gc: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fs::{FsMediaHandler, MemFileStore};
    use crate::media::{FileDef, FileStore};
    use crate::types::Uid;
    use bytes::Bytes;
    use crate::media::MediaHandler as _;

    #[tokio::test(start_paused = true)]
    async fn test_gc_stops_promptly() {
        let store = Arc::new(MemFileStore::new());
        let dir = tempfile::tempdir().unwrap();
        let media = Arc::new(FsMediaHandler::new(dir.path(), store.clone()));
        let gc = run_garbage_collection(store, media, Duration::from_secs(60), 10);
        gc.stop().await;
    }

    #[tokio::test]
    async fn test_fresh_uploads_survive_a_sweep() {
        let store = Arc::new(MemFileStore::new());
        let dir = tempfile::tempdir().unwrap();
        let media = Arc::new(FsMediaHandler::new(dir.path(), store.clone()));

        let mut fdef = FileDef::new("orphan", Uid(1), "text/plain");
        media
            .upload(&mut fdef, Bytes::from_static(b"data"))
            .await
            .unwrap();
        store.finish_upload(&fdef, true, 4).unwrap();

        // Within the grace period nothing is collected.
        sweep(store.as_ref(), media.as_ref(), 10).await;
        assert_eq!(store.len(), 1);
        assert!(dir.path().join("orphan").exists());

        // Past the grace period the record and blob both go.
        let future = chrono::Utc::now() + chrono::Duration::hours(1);
        let locations = store.delete_unused(future, 10).unwrap();
        media.delete(&locations).await.unwrap();
        assert!(store.is_empty());
        assert!(!dir.path().join("orphan").exists());
    }
}
