//! Registry of live topics and the sink for topic self-eviction.
//!
//! The hub owns a map of topic handles and a loop that consumes
//! [`TopicUnreg`] requests — a topic asking for its own removal after going
//! idle. Shutting the hub down tears every topic down and waits for each to
//! confirm.

use crate::cluster::Cluster;
use crate::session::SessionStore;
use crate::topic::{ExitRequest, Topic, TopicHandle};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Request to remove a topic from the hub.
#[derive(Debug)]
pub struct TopicUnreg {
    /// Routing name of the topic to remove.
    pub rcpt_to: String,
}

pub struct Hub {
    topics: RwLock<HashMap<String, TopicHandle>>,
    unreg_tx: mpsc::UnboundedSender<TopicUnreg>,
    shutdown_tx: mpsc::Sender<oneshot::Sender<()>>,
    cluster: Arc<dyn Cluster>,
    store: Arc<SessionStore>,
    idle_proxy_timeout: Duration,
}

impl Hub {
    /// Create the hub and start its service loop.
    pub fn spawn(
        cluster: Arc<dyn Cluster>,
        store: Arc<SessionStore>,
        idle_proxy_timeout: Duration,
    ) -> Arc<Hub> {
        let (unreg_tx, unreg_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let hub = Arc::new(Hub {
            topics: RwLock::new(HashMap::new()),
            unreg_tx,
            shutdown_tx,
            cluster,
            store,
            idle_proxy_timeout,
        });
        tokio::spawn(hub.clone().run(unreg_rx, shutdown_rx));
        hub
    }

    /// Sender feeding the hub's unreg loop; topics use it to self-evict.
    pub fn unreg_sender(&self) -> mpsc::UnboundedSender<TopicUnreg> {
        self.unreg_tx.clone()
    }

    pub fn topic(&self, name: &str) -> Option<TopicHandle> {
        self.topics.read().get(name).cloned()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Visit every live topic handle, for the debug dump.
    pub fn range<F: FnMut(&TopicHandle)>(&self, mut f: F) {
        for handle in self.topics.read().values() {
            f(handle);
        }
    }

    /// Get the proxy topic for a remote master, starting its task if it is
    /// not running yet.
    pub fn get_or_spawn_proxy(&self, name: &str, xoriginal: &str, is_chan: bool) -> TopicHandle {
        if let Some(handle) = self.topic(name) {
            return handle;
        }
        let mut topics = self.topics.write();
        // A racing caller may have inserted the topic while the read lock
        // was released.
        if let Some(handle) = topics.get(name) {
            return handle.clone();
        }
        let (handle, topic) = Topic::new_proxy(
            name,
            xoriginal,
            is_chan,
            self.cluster.clone(),
            self.store.clone(),
            self.unreg_tx.clone(),
            self.idle_proxy_timeout,
        );
        topics.insert(name.to_string(), handle.clone());
        tokio::spawn(topic.run_proxy());
        handle
    }

    /// Stop every topic and wait for the hub loop to confirm completion.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.shutdown_tx.send(done_tx).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    async fn run(
        self: Arc<Self>,
        mut unreg_rx: mpsc::UnboundedReceiver<TopicUnreg>,
        mut shutdown_rx: mpsc::Receiver<oneshot::Sender<()>>,
    ) {
        loop {
            tokio::select! {
                Some(unreg) = unreg_rx.recv() => {
                    let removed = self.topics.write().remove(&unreg.rcpt_to);
                    if let Some(handle) = removed {
                        handle.mark_deleted();
                        let _ = handle.exit.send(ExitRequest { done: None }).await;
                        tracing::debug!("hub: topic {} unregistered", unreg.rcpt_to);
                    }
                }
                Some(done) = shutdown_rx.recv() => {
                    let topics: Vec<TopicHandle> = {
                        let mut map = self.topics.write();
                        map.drain().map(|(_, handle)| handle).collect()
                    };
                    for handle in topics {
                        handle.mark_deleted();
                        let (topic_done_tx, topic_done_rx) = oneshot::channel();
                        if handle
                            .exit
                            .send(ExitRequest { done: Some(topic_done_tx) })
                            .await
                            .is_ok()
                        {
                            let _ = topic_done_rx.await;
                        }
                    }
                    let _ = done.send(());
                    return;
                }
                else => return,
            }
        }
    }
}
