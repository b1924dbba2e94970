//! Cache of per-user counters used by presence and the debug dump.
//!
//! Updates arrive on a channel and are applied by a refresher task, so
//! writers never contend on the map from hot paths.

use crate::types::Uid;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default)]
pub struct CachedUser {
    pub unread: i64,
    pub topics: i64,
}

#[derive(Debug)]
enum UserUpdate {
    Unread { uid: Uid, delta: i64 },
    Topics { uid: Uid, delta: i64 },
    Stop,
}

pub struct UserCache {
    entries: RwLock<HashMap<Uid, CachedUser>>,
    tx: mpsc::UnboundedSender<UserUpdate>,
}

/// Owns the refresher task; dropped last during shutdown.
pub struct UserCacheHandle {
    tx: mpsc::UnboundedSender<UserUpdate>,
    join: JoinHandle<()>,
}

impl UserCacheHandle {
    /// Stop the refresher after it has drained pending updates.
    pub async fn shutdown(self) {
        let _ = self.tx.send(UserUpdate::Stop);
        let _ = self.join.await;
    }
}

impl UserCache {
    /// Create the cache and start its refresher task.
    pub fn spawn() -> (Arc<UserCache>, UserCacheHandle) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cache = Arc::new(UserCache {
            entries: RwLock::new(HashMap::new()),
            tx: tx.clone(),
        });
        let worker = cache.clone();
        let join = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                match update {
                    UserUpdate::Unread { uid, delta } => {
                        let mut entries = worker.entries.write();
                        let entry = entries.entry(uid).or_default();
                        entry.unread = (entry.unread + delta).max(0);
                    }
                    UserUpdate::Topics { uid, delta } => {
                        let mut entries = worker.entries.write();
                        let entry = entries.entry(uid).or_default();
                        entry.topics = (entry.topics + delta).max(0);
                        if entry.topics == 0 && entry.unread == 0 && delta < 0 {
                            entries.remove(&uid);
                        }
                    }
                    UserUpdate::Stop => return,
                }
            }
        });
        (cache, UserCacheHandle { tx, join })
    }

    pub fn add_unread(&self, uid: Uid, delta: i64) {
        let _ = self.tx.send(UserUpdate::Unread { uid, delta });
    }

    pub fn add_topics(&self, uid: Uid, delta: i64) {
        let _ = self.tx.send(UserUpdate::Topics { uid, delta });
    }

    pub fn get(&self, uid: Uid) -> Option<CachedUser> {
        self.entries.read().get(&uid).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every cached user, for the debug dump.
    pub fn range<F: FnMut(Uid, CachedUser)>(&self, mut f: F) {
        for (uid, entry) in self.entries.read().iter() {
            f(*uid, *entry);
        }
    }
}
