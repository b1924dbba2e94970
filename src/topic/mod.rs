//! Topic state and channel plumbing.
//!
//! A topic is a single task owning all of its own state; the rest of the
//! process talks to it exclusively through the senders bundled in
//! [`TopicHandle`]. Debug introspection reads a snapshot the task publishes
//! after membership changes instead of reaching into the task.

pub mod proxy;

use crate::cluster::{Cluster, ClusterResp};
use crate::hub::TopicUnreg;
use crate::session::{Session, SessionStore};
use crate::types::msg::{ClientMessage, ServerMessage};
use crate::types::{topic_cat, AccessMode, TopicCat, Uid};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// Channel depths. Joins and master responses burst hardest.
const REG_QUEUE_LEN: usize = 32;
const BROADCAST_QUEUE_LEN: usize = 16;
const META_QUEUE_LEN: usize = 8;
const PROXY_QUEUE_LEN: usize = 32;

/// Local session wants to join.
pub struct JoinRequest {
    pub msg: ClientMessage,
    pub sess: Arc<Session>,
}

/// Local session wants to leave, or is being torn down by the server.
pub struct LeaveRequest {
    pub msg: ClientMessage,
    pub sess: Arc<Session>,
}

/// User-generated content to broadcast.
pub struct BroadcastRequest {
    pub msg: ClientMessage,
    pub sess: Arc<Session>,
}

/// Metadata get/set.
pub struct MetaRequest {
    pub msg: ClientMessage,
    pub sess: Arc<Session>,
}

/// Session update: a `me`-topic user-agent refresh when `sess` is absent,
/// a background-to-foreground transition otherwise.
pub struct SessionUpdate {
    pub sess: Option<Arc<Session>>,
    pub user_agent: String,
}

/// Server-side message produced locally (presence, info).
pub struct ServerRequest {
    pub msg: ServerMessage,
    /// Originating session, excluded from intra-cluster fan-out.
    pub sess: Option<Arc<Session>>,
}

/// Hub is tearing the topic down.
pub struct ExitRequest {
    pub done: Option<oneshot::Sender<()>>,
}

const STATUS_ACTIVE: u32 = 0;
const STATUS_PAUSED: u32 = 1;
const STATUS_DELETED: u32 = 2;

/// Read-only view of a topic's membership, refreshed by the topic task.
#[derive(Debug, Clone, Default)]
pub struct TopicSnapshot {
    pub xoriginal: String,
    pub is_proxy: bool,
    pub session_sids: Vec<String>,
    pub per_user: Vec<String>,
    pub per_subs: Vec<String>,
}

/// Cheaply cloneable handle to a running topic task.
#[derive(Clone)]
pub struct TopicHandle {
    pub name: String,
    pub reg: mpsc::Sender<JoinRequest>,
    pub unreg: mpsc::Sender<LeaveRequest>,
    pub client_msg: mpsc::Sender<BroadcastRequest>,
    pub server_msg: mpsc::Sender<ServerRequest>,
    pub meta: mpsc::Sender<MetaRequest>,
    pub supd: mpsc::Sender<SessionUpdate>,
    pub proxy: mpsc::Sender<ClusterResp>,
    pub exit: mpsc::Sender<ExitRequest>,
    status: Arc<AtomicU32>,
    snapshot: Arc<RwLock<TopicSnapshot>>,
}

impl TopicHandle {
    pub fn is_inactive(&self) -> bool {
        self.status.load(Ordering::Acquire) != STATUS_ACTIVE
    }

    pub fn pause(&self) {
        self.status.store(STATUS_PAUSED, Ordering::Release);
    }

    pub fn resume(&self) {
        self.status.store(STATUS_ACTIVE, Ordering::Release);
    }

    pub fn mark_deleted(&self) {
        self.status.store(STATUS_DELETED, Ordering::Release);
    }

    pub fn snapshot(&self) -> TopicSnapshot {
        self.snapshot.read().clone()
    }
}

pub(crate) struct TopicReceivers {
    reg: mpsc::Receiver<JoinRequest>,
    unreg: mpsc::Receiver<LeaveRequest>,
    client_msg: mpsc::Receiver<BroadcastRequest>,
    server_msg: mpsc::Receiver<ServerRequest>,
    meta: mpsc::Receiver<MetaRequest>,
    supd: mpsc::Receiver<SessionUpdate>,
    proxy: mpsc::Receiver<ClusterResp>,
    exit: mpsc::Receiver<ExitRequest>,
}

/// A session attached to this topic, as the topic sees it.
pub(crate) struct AttachedSession {
    pub sess: Arc<Session>,
    pub uid: Uid,
    pub is_chan_sub: bool,
}

/// Per-user mode pair.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PerUserData {
    pub mode_want: AccessMode,
    pub mode_given: AccessMode,
}

/// Topic state owned by its task. Constructed through [`Topic::new_proxy`]
/// and consumed by [`Topic::run_proxy`].
pub struct Topic {
    pub name: String,
    pub xoriginal: String,
    pub(crate) cat: TopicCat,
    pub(crate) is_chan: bool,
    pub(crate) last_id: u64,
    pub(crate) sessions: HashMap<String, AttachedSession>,
    pub(crate) per_user: HashMap<Uid, PerUserData>,
    pub(crate) per_subs: HashSet<String>,
    pub(crate) rx: TopicReceivers,
    pub(crate) handle: TopicHandle,
    pub(crate) cluster: Arc<dyn Cluster>,
    pub(crate) store: Arc<SessionStore>,
    pub(crate) hub_unreg: mpsc::UnboundedSender<TopicUnreg>,
    pub(crate) idle_timeout: Duration,
}

impl Topic {
    /// Build a proxy topic for a master hosted on another node. Returns the
    /// handle to hand out and the state to drive with [`Topic::run_proxy`].
    pub fn new_proxy(
        name: &str,
        xoriginal: &str,
        is_chan: bool,
        cluster: Arc<dyn Cluster>,
        store: Arc<SessionStore>,
        hub_unreg: mpsc::UnboundedSender<TopicUnreg>,
        idle_timeout: Duration,
    ) -> (TopicHandle, Topic) {
        let (reg_tx, reg_rx) = mpsc::channel(REG_QUEUE_LEN);
        let (unreg_tx, unreg_rx) = mpsc::channel(REG_QUEUE_LEN);
        let (client_tx, client_rx) = mpsc::channel(BROADCAST_QUEUE_LEN);
        let (server_tx, server_rx) = mpsc::channel(BROADCAST_QUEUE_LEN);
        let (meta_tx, meta_rx) = mpsc::channel(META_QUEUE_LEN);
        let (supd_tx, supd_rx) = mpsc::channel(META_QUEUE_LEN);
        let (proxy_tx, proxy_rx) = mpsc::channel(PROXY_QUEUE_LEN);
        let (exit_tx, exit_rx) = mpsc::channel(1);
        let handle = TopicHandle {
            name: name.to_string(),
            reg: reg_tx,
            unreg: unreg_tx,
            client_msg: client_tx,
            server_msg: server_tx,
            meta: meta_tx,
            supd: supd_tx,
            proxy: proxy_tx,
            exit: exit_tx,
            status: Arc::new(AtomicU32::new(STATUS_ACTIVE)),
            snapshot: Arc::new(RwLock::new(TopicSnapshot {
                xoriginal: xoriginal.to_string(),
                is_proxy: true,
                ..Default::default()
            })),
        };
        let topic = Topic {
            name: name.to_string(),
            xoriginal: xoriginal.to_string(),
            cat: topic_cat(name),
            is_chan,
            last_id: 0,
            sessions: HashMap::new(),
            per_user: HashMap::new(),
            per_subs: HashSet::new(),
            rx: TopicReceivers {
                reg: reg_rx,
                unreg: unreg_rx,
                client_msg: client_rx,
                server_msg: server_rx,
                meta: meta_rx,
                supd: supd_rx,
                proxy: proxy_rx,
                exit: exit_rx,
            },
            handle: handle.clone(),
            cluster,
            store,
            hub_unreg,
            idle_timeout,
        };
        (handle, topic)
    }

    pub(crate) fn is_inactive(&self) -> bool {
        self.handle.is_inactive()
    }

    /// Topic name as `uid` knows it. For one-to-one topics that is the other
    /// party's user id.
    pub(crate) fn original(&self, uid: Uid) -> String {
        if self.cat == TopicCat::P2P {
            if let Some(other) = self.per_user.keys().find(|u| **u != uid) {
                return other.user_id();
            }
        }
        self.xoriginal.clone()
    }

    pub(crate) fn add_session(&mut self, sess: Arc<Session>, uid: Uid, is_chan_sub: bool) {
        // Non-channel subscribers always get a per-user entry, so mode
        // updates have somewhere to land.
        if !is_chan_sub {
            self.per_user.entry(uid).or_default();
        }
        self.sessions.insert(
            sess.sid.clone(),
            AttachedSession {
                sess,
                uid,
                is_chan_sub,
            },
        );
        self.refresh_snapshot();
    }

    /// Remove a session if it is attached under a matching uid. A zero uid
    /// matches any attachment.
    pub(crate) fn rem_session(&mut self, sid: &str, uid: Uid) -> Option<AttachedSession> {
        let matches = self
            .sessions
            .get(sid)
            .is_some_and(|att| uid.is_zero() || att.uid == uid);
        if !matches {
            return None;
        }
        let removed = self.sessions.remove(sid);
        self.refresh_snapshot();
        removed
    }

    pub(crate) fn refresh_snapshot(&self) {
        let mut snap = self.handle.snapshot.write();
        snap.session_sids = self.sessions.keys().cloned().collect();
        snap.per_user = self.per_user.keys().map(Uid::user_id).collect();
        snap.per_subs = self.per_subs.iter().cloned().collect();
    }
}
