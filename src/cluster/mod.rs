//! Facade over the cluster transport.
//!
//! The wire schema between nodes is owned by the transport implementation
//! and opaque here. The proxy topic only needs three operations: forward a
//! request to the topic master, fan a server message out to interested
//! nodes, and announce that the local proxy is gone.

use crate::types::msg::{ClientMessage, ServerMessage};
use crate::types::Uid;
use thiserror::Error;

/// Kind of a request forwarded from a proxy topic to its master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyReq {
    Join,
    Leave,
    Broadcast,
    Meta,
    Call,
    MeUserAgent,
    BgSession,
}

/// Session identity forwarded with a cluster request. For `supd` forwards
/// this is synthesized rather than taken from a live session.
#[derive(Debug, Clone, Default)]
pub struct ClusterSess {
    pub sid: String,
    pub uid: Uid,
    pub user_agent: String,
}

/// A response or asynchronous push from a topic master, delivered on the
/// proxy channel of the topic it concerns.
#[derive(Debug, Clone)]
pub struct ClusterResp {
    pub srv_msg: ServerMessage,
    /// Originating session id, or `"*"` for a broadcast to every attached
    /// session.
    pub orig_sid: String,
    /// Kind of the request this responds to.
    pub orig_req: ProxyReq,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node {0} unreachable")]
    Unreachable(String),
    #[error("cluster not configured")]
    NotConfigured,
    #[error("partitioned from the cluster")]
    Partitioned,
}

/// Cluster transport operations used by proxy topics.
pub trait Cluster: Send + Sync {
    /// Forward a request to the master of `topic`. A returned error means
    /// the forward itself failed, not that the master refused.
    fn route_to_topic_master(
        &self,
        req: ProxyReq,
        msg: Option<&ClientMessage>,
        topic: &str,
        sess: &ClusterSess,
    ) -> Result<(), ClusterError>;

    /// Route a server-side message to every node with an interested
    /// subscriber of `topic`.
    fn route_to_topic_intra_cluster(
        &self,
        topic: &str,
        msg: &ServerMessage,
        skip_sid: Option<&str>,
    ) -> Result<(), ClusterError>;

    /// Tell the master that the local proxy for `topic` is shutting down.
    fn topic_proxy_gone(&self, topic: &str) -> Result<(), ClusterError>;

    /// Shut the local cluster node down. Default is a no-op for transports
    /// with nothing to release.
    fn shutdown(&self) {}
}

/// Stand-in used when the node runs outside a cluster. Every forward fails
/// as unreachable; proxy topics then answer sessions accordingly.
#[derive(Debug, Default)]
pub struct NullCluster;

impl Cluster for NullCluster {
    fn route_to_topic_master(
        &self,
        _req: ProxyReq,
        _msg: Option<&ClientMessage>,
        _topic: &str,
        _sess: &ClusterSess,
    ) -> Result<(), ClusterError> {
        Err(ClusterError::NotConfigured)
    }

    fn route_to_topic_intra_cluster(
        &self,
        _topic: &str,
        _msg: &ServerMessage,
        _skip_sid: Option<&str>,
    ) -> Result<(), ClusterError> {
        Err(ClusterError::NotConfigured)
    }

    fn topic_proxy_gone(&self, _topic: &str) -> Result<(), ClusterError> {
        Err(ClusterError::NotConfigured)
    }
}
