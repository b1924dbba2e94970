//! Connected-client sessions and the process-wide session store.
//!
//! A session outlives any individual topic subscription. The topic side
//! holds the authoritative attachment map; the session side mirrors it in
//! `subs` so teardown can detach from every topic. Both sides are kept in
//! step under the session's own lock.

use crate::topic::{BroadcastRequest, LeaveRequest, MetaRequest, SessionUpdate};
use crate::types::msg::ServerMessage;
use crate::types::Uid;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// How long an enqueue to a session's output queue may block before the
/// message is dropped.
const QUEUE_OUT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Output queue depth per session.
const SEND_QUEUE_LEN: usize = 128;

/// Handle inside a session for one attached topic: the four send-only
/// channels of that topic.
#[derive(Clone)]
pub struct Subscription {
    /// Client content messages to broadcast.
    pub broadcast: mpsc::Sender<BroadcastRequest>,
    /// Leave requests.
    pub done: mpsc::Sender<LeaveRequest>,
    /// Metadata get/set requests.
    pub meta: mpsc::Sender<MetaRequest>,
    /// Session updates (user agent, background transition).
    pub supd: mpsc::Sender<SessionUpdate>,
}

/// Counts cluster requests queued on behalf of this session; teardown waits
/// for the count to drain.
#[derive(Default)]
pub struct InflightReqs {
    count: AtomicUsize,
    drained: Notify,
}

impl InflightReqs {
    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    pub fn done(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "inflight counter underflow");
        if prev == 1 {
            self.drained.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every queued request has completed.
    pub async fn wait(&self) {
        loop {
            if self.is_empty() {
                return;
            }
            let notified = self.drained.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// A live client connection.
pub struct Session {
    /// Opaque session id.
    pub sid: String,
    uid: RwLock<Uid>,
    user_agent: RwLock<String>,
    pub remote_addr: String,
    /// Name of the cluster node this session originates at, when the session
    /// itself is multiplexed from another node.
    pub cluster_node: Option<String>,
    /// Attached topics. This mutex doubles as the per-session lock the proxy
    /// actor takes around its join-confirmation critical section.
    pub subs: Mutex<HashMap<String, Subscription>>,
    /// Pending cluster work that blocks teardown; absent for multiplexed
    /// sessions which drain on their owning node.
    pub inflight_reqs: Option<InflightReqs>,
    send: mpsc::Sender<ServerMessage>,
    terminated: AtomicBool,
}

impl Session {
    /// Create a session and hand back the receiving end of its output queue.
    pub fn new(
        sid: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (send, recv) = mpsc::channel(SEND_QUEUE_LEN);
        let sess = Arc::new(Self {
            sid: sid.into(),
            uid: RwLock::new(Uid::ZERO),
            user_agent: RwLock::new(String::new()),
            remote_addr: remote_addr.into(),
            cluster_node: None,
            subs: Mutex::new(HashMap::new()),
            inflight_reqs: Some(InflightReqs::default()),
            send,
            terminated: AtomicBool::new(false),
        });
        (sess, recv)
    }

    pub fn uid(&self) -> Uid {
        *self.uid.read()
    }

    pub fn set_uid(&self, uid: Uid) {
        *self.uid.write() = uid;
    }

    pub fn user_agent(&self) -> String {
        self.user_agent.read().clone()
    }

    pub fn set_user_agent(&self, ua: impl Into<String>) {
        *self.user_agent.write() = ua.into();
    }

    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Enqueue a message on the session's output queue. Returns false if the
    /// queue did not accept the message within the queue timeout; the caller
    /// logs and drops rather than blocking.
    pub async fn queue_out(&self, msg: ServerMessage) -> bool {
        if self.terminated() {
            return false;
        }
        self.send.send_timeout(msg, QUEUE_OUT_TIMEOUT).await.is_ok()
    }

    /// Record a topic attachment. Caller holds whatever ordering guarantees
    /// it needs; this only touches the session's own map.
    pub fn add_sub(&self, topic: &str, sub: Subscription) {
        self.subs.lock().insert(topic.to_string(), sub);
    }

    pub fn del_sub(&self, topic: &str) {
        self.subs.lock().remove(topic);
    }

    pub fn get_sub(&self, topic: &str) -> Option<Subscription> {
        self.subs.lock().get(topic).cloned()
    }

    /// Remove the topic from this session's map. Idempotent; safe to call
    /// whether or not the topic still lists the session.
    pub fn detach_topic(&self, topic: &str) {
        self.del_sub(topic);
    }

    /// Sorted list of attached topic names, for the debug dump.
    pub fn sub_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subs.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        self.subs.lock().clear();
    }
}

/// Process-wide store of live sessions, keyed by sid.
#[derive(Default)]
pub struct SessionStore {
    cache: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sess: Arc<Session>) {
        self.cache.write().insert(sess.sid.clone(), sess);
    }

    pub fn get(&self, sid: &str) -> Option<Arc<Session>> {
        self.cache.read().get(sid).cloned()
    }

    pub fn delete(&self, sid: &str) -> Option<Arc<Session>> {
        self.cache.write().remove(sid)
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every live session. The callback must not call back into the
    /// store.
    pub fn range<F: FnMut(&str, &Arc<Session>)>(&self, mut f: F) {
        for (sid, sess) in self.cache.read().iter() {
            f(sid, sess);
        }
    }

    /// Terminate every session and empty the store. Output queues are closed
    /// once the last reference to each session drops.
    pub fn shutdown(&self) {
        let mut cache = self.cache.write();
        for sess in cache.values() {
            sess.terminate();
        }
        cache.clear();
    }
}
