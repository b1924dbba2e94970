//! Event loop for a topic whose master lives on another node.
//!
//! The loop serializes every mutation of the topic's local state. Requests
//! from locally attached sessions are forwarded to the master through the
//! cluster facade; master responses come back on the proxy channel and are
//! applied here. A leave detaches the session locally before the master
//! confirms, because by the time the confirmation arrives the session may
//! already be gone from the store.

use crate::cluster::{ClusterResp, ClusterSess, ProxyReq};
use crate::hub::TopicUnreg;
use crate::session::{Session, Subscription};
use crate::topic::{JoinRequest, LeaveRequest, SessionUpdate, Topic};
use crate::types::msg::{
    err_cluster_unreachable_reply, err_locked_reply, time_now, Leave, Pres, ServerMessage,
    ServerPayload,
};
use crate::types::{grp_to_chn, is_channel, parse_user_id, TopicCat, Uid};
use tokio::time::Instant;

/// What an event handler wants done with the idle-kill timer.
enum TimerCmd {
    Arm,
    Stop,
}

fn cluster_sess(sess: &Session) -> ClusterSess {
    ClusterSess {
        sid: sess.sid.clone(),
        uid: sess.uid(),
        user_agent: sess.user_agent(),
    }
}

impl Topic {
    /// Drive the proxy topic until the hub tears it down.
    pub async fn run_proxy(mut self) {
        let kill_timer = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(kill_timer);
        let mut timer_armed = false;

        loop {
            let timer_cmd = tokio::select! {
                Some(req) = self.rx.reg.recv() => {
                    self.handle_join_request(req).await;
                    None
                }
                Some(req) = self.rx.unreg.recv() => {
                    self.handle_leave_event(req).await
                }
                Some(req) = self.rx.client_msg.recv() => {
                    if let Err(err) = self.cluster.route_to_topic_master(
                        ProxyReq::Broadcast,
                        Some(&req.msg),
                        &self.name,
                        &cluster_sess(&req.sess),
                    ) {
                        tracing::warn!(
                            "proxy topic[{}]: route broadcast request from proxy to master failed - {err}",
                            self.name
                        );
                        self.reply_unreachable(&req.sess, &req.msg).await;
                    }
                    None
                }
                Some(req) = self.rx.server_msg.recv() => {
                    match &req.msg.payload {
                        ServerPayload::Pres(_) | ServerPayload::Info(_) => {
                            let skip = req.sess.as_ref().map(|s| s.sid.as_str());
                            if let Err(err) = self.cluster.route_to_topic_intra_cluster(
                                &self.name,
                                &req.msg,
                                skip,
                            ) {
                                tracing::warn!(
                                    "proxy topic[{}]: intra-cluster route failed - {err}",
                                    self.name
                                );
                            }
                        }
                        _ => {
                            tracing::error!(
                                "proxy topic[{}]: unexpected server-side message {}",
                                self.name,
                                req.msg.describe()
                            );
                        }
                    }
                    None
                }
                Some(req) = self.rx.meta.recv() => {
                    if let Err(err) = self.cluster.route_to_topic_master(
                        ProxyReq::Meta,
                        Some(&req.msg),
                        &self.name,
                        &cluster_sess(&req.sess),
                    ) {
                        tracing::warn!(
                            "proxy topic[{}]: route meta request from proxy to master failed - {err}",
                            self.name
                        );
                        self.reply_unreachable(&req.sess, &req.msg).await;
                    }
                    None
                }
                Some(upd) = self.rx.supd.recv() => {
                    self.handle_session_update(upd);
                    None
                }
                Some(resp) = self.rx.proxy.recv() => {
                    self.proxy_master_response(resp).await
                }
                Some(sd) = self.rx.exit.recv() => {
                    // Tell sessions to drop the topic before the master is
                    // notified, so nothing re-enqueues through stale subs.
                    for att in self.sessions.values() {
                        att.sess.detach_topic(&self.name);
                    }
                    self.sessions.clear();
                    self.refresh_snapshot();
                    if let Err(err) = self.cluster.topic_proxy_gone(&self.name) {
                        tracing::warn!(
                            "proxy topic[{}] shutdown: failed to notify master - {err}",
                            self.name
                        );
                    }
                    if let Some(done) = sd.done {
                        let _ = done.send(());
                    }
                    return;
                }
                () = &mut kill_timer, if timer_armed => {
                    timer_armed = false;
                    let _ = self.hub_unreg.send(TopicUnreg {
                        rcpt_to: self.name.clone(),
                    });
                    None
                }
            };

            match timer_cmd {
                Some(TimerCmd::Arm) => {
                    kill_timer
                        .as_mut()
                        .reset(Instant::now() + self.idle_timeout);
                    timer_armed = true;
                }
                Some(TimerCmd::Stop) => timer_armed = false,
                None => {}
            }
        }
    }

    async fn reply_unreachable(&self, sess: &Session, msg: &crate::types::msg::ClientMessage) {
        if !sess
            .queue_out(err_cluster_unreachable_reply(msg, time_now()))
            .await
        {
            tracing::warn!(
                "proxy topic[{}]: failed to queue error reply - sid {}",
                self.name,
                sess.sid
            );
        }
    }

    async fn handle_join_request(&mut self, req: JoinRequest) {
        if self.is_inactive() {
            let _ = req.sess.queue_out(err_locked_reply(&req.msg, time_now())).await;
        } else if let Err(err) = self.cluster.route_to_topic_master(
            ProxyReq::Join,
            Some(&req.msg),
            &self.name,
            &cluster_sess(&req.sess),
        ) {
            // The ctrl response would normally arrive on the proxy channel;
            // the forward itself failed, so answer here.
            tracing::warn!(
                "proxy topic[{}]: route join request from proxy to master failed - {err}",
                self.name
            );
            self.reply_unreachable(&req.sess, &req.msg).await;
        }
        if let Some(reqs) = &req.sess.inflight_reqs {
            reqs.done();
        }
    }

    async fn handle_leave_event(&mut self, mut req: LeaveRequest) -> Option<TimerCmd> {
        let client_initiated = req.msg.init;
        let (ok, timer_cmd) = self.handle_proxy_leave_request(&mut req);
        if !ok {
            tracing::warn!(
                "proxy topic[{}]: failed to update proxy topic state for leave request - sid {}",
                self.name,
                req.sess.sid
            );
            self.reply_unreachable(&req.sess, &req.msg).await;
        }
        if client_initiated {
            if let Some(reqs) = &req.sess.inflight_reqs {
                reqs.done();
            }
        }
        timer_cmd
    }

    /// Detach the session locally, then forward the leave to the master.
    /// Returns whether the local state change succeeded and what to do with
    /// the idle timer.
    fn handle_proxy_leave_request(&mut self, req: &mut LeaveRequest) -> (bool, Option<TimerCmd>) {
        let mut as_uid = if req.msg.init {
            parse_user_id(&req.msg.as_user)
        } else {
            Uid::ZERO
        };

        if as_uid.is_zero() {
            match self.sessions.get(&req.sess.sid) {
                Some(att) => as_uid = att.uid,
                None => {
                    tracing::warn!(
                        "proxy topic[{}]: leave request sent for unknown session",
                        self.name
                    );
                    return (false, None);
                }
            }
        }

        // Remove the session without waiting for the master's response: by
        // the time it arrives the session may be gone from the store and no
        // longer findable by sid.
        let removed = self.rem_session(&req.sess.sid, as_uid);
        if removed.is_some() {
            req.sess.del_sub(&self.name);
        }
        if !req.msg.init {
            // Set the uid explicitly so the master's multiplexed session
            // knows which of its hosted sessions to drop.
            req.msg.as_user = as_uid.user_id();
            req.msg.leave = Some(Leave::default());
            req.msg.init = true;
        }
        if req.msg.original.is_empty() {
            req.msg.original = if self.cat == TopicCat::Grp && self.is_chan {
                // Channel topic: the original name depends on the
                // subscription type of the departing session.
                if removed.as_ref().is_some_and(|att| att.is_chan_sub) {
                    grp_to_chn(&self.xoriginal)
                } else {
                    self.xoriginal.clone()
                }
            } else {
                self.original(as_uid)
            };
        }

        if let Err(err) = self.cluster.route_to_topic_master(
            ProxyReq::Leave,
            Some(&req.msg),
            &self.name,
            &cluster_sess(&req.sess),
        ) {
            tracing::warn!(
                "proxy topic[{}]: route leave request from proxy to master failed - {err}",
                self.name
            );
        }

        let timer_cmd = self.sessions.is_empty().then_some(TimerCmd::Arm);
        (removed.is_some(), timer_cmd)
    }

    fn handle_session_update(&mut self, upd: SessionUpdate) {
        let mut req_type = ProxyReq::MeUserAgent;
        let mut fwd = ClusterSess {
            user_agent: upd.user_agent,
            ..ClusterSess::default()
        };
        if let Some(sess) = &upd.sess {
            // Subscribed user may not match the session user; look up who is
            // actually attached.
            let Some(att) = self.sessions.get(&sess.sid) else {
                tracing::warn!(
                    "proxy topic[{}]: sess update request from detached session - sid {}",
                    self.name,
                    sess.sid
                );
                return;
            };
            req_type = ProxyReq::BgSession;
            fwd.uid = att.uid;
            fwd.sid = sess.sid.clone();
            fwd.user_agent = sess.user_agent();
        }
        if let Err(err) = self
            .cluster
            .route_to_topic_master(req_type, None, &self.name, &fwd)
        {
            tracing::warn!(
                "proxy topic[{}]: route sess update request from proxy to master failed - {err}",
                self.name
            );
        }
    }

    /// Apply a master topic response to an earlier request, or an
    /// asynchronous push.
    async fn proxy_master_response(&mut self, resp: ClusterResp) -> Option<TimerCmd> {
        if let ServerPayload::Pres(pres) = &resp.srv_msg.payload {
            if pres.what == "acs" && pres.acs.is_some() {
                self.update_acs_from_pres(pres);
            }
        }

        if resp.orig_sid == "*" {
            match &resp.srv_msg.payload {
                ServerPayload::Pres(_) | ServerPayload::Data(_) | ServerPayload::Info(_) => {
                    self.handle_proxy_broadcast(resp.srv_msg).await;
                }
                ServerPayload::Ctrl(_) => {
                    self.proxy_ctrl_broadcast(resp.srv_msg).await;
                }
            }
            return None;
        }

        let sess = self.store.get(&resp.orig_sid);
        if sess.is_none() {
            tracing::warn!(
                "proxy topic[{}]: session {} not found; already terminated?",
                self.name,
                resp.orig_sid
            );
        }
        let mut timer_cmd = None;
        match resp.orig_req {
            ProxyReq::Join => {
                if let (Some(sess), Some(ctrl)) = (&sess, resp.srv_msg.ctrl()) {
                    if ctrl.code < 300 {
                        let subscribed_topic = ctrl.topic.clone().unwrap_or_default();
                        {
                            let mut subs = sess.subs.lock();
                            // Re-check liveness under the session lock so the
                            // attach cannot race session termination.
                            if let Some(live) = self.store.get(&resp.orig_sid) {
                                self.add_session(
                                    live,
                                    resp.srv_msg.uid,
                                    is_channel(&subscribed_topic),
                                );
                                subs.insert(
                                    self.name.clone(),
                                    Subscription {
                                        broadcast: self.handle.client_msg.clone(),
                                        done: self.handle.unreg.clone(),
                                        meta: self.handle.meta.clone(),
                                        supd: self.handle.supd.clone(),
                                    },
                                );
                            }
                        }
                        timer_cmd = Some(TimerCmd::Stop);
                    } else if self.sessions.is_empty() {
                        timer_cmd = Some(TimerCmd::Arm);
                    }
                }
            }
            ProxyReq::Broadcast | ProxyReq::Meta | ProxyReq::Call => {
                // No local state to update.
            }
            ProxyReq::Leave => {
                if let Some(ctrl) = resp.srv_msg.ctrl() {
                    if ctrl.code < 300 {
                        if let Some(sess) = &sess {
                            self.rem_session(&sess.sid, sess.uid());
                        }
                    }
                    if self.sessions.is_empty() {
                        timer_cmd = Some(TimerCmd::Arm);
                    }
                }
            }
            other => {
                tracing::error!(
                    "proxy topic[{}]: response references unexpected request type {:?}",
                    self.name,
                    other
                );
            }
        }

        if let Some(sess) = sess {
            if !sess.queue_out(resp.srv_msg).await {
                tracing::error!(
                    "proxy topic[{}]: timeout in sending response - sid {}",
                    self.name,
                    sess.sid
                );
            }
        }
        timer_cmd
    }

    /// Fan a Data, Info or Pres message out to every attached session.
    async fn handle_proxy_broadcast(&mut self, msg: ServerMessage) {
        if self.is_inactive() {
            // Topic is paused or being deleted.
            return;
        }
        if let ServerPayload::Data(data) = &msg.payload {
            self.last_id = data.seq;
        }
        let skip = msg.skip_sid.clone();
        for att in self.sessions.values() {
            if skip.as_deref() == Some(att.sess.sid.as_str()) {
                continue;
            }
            if !att.sess.queue_out(msg.clone()).await {
                tracing::warn!(
                    "proxy topic[{}]: broadcast dropped - sid {}",
                    self.name,
                    att.sess.sid
                );
            }
        }
    }

    /// Apply a ctrl broadcast from the master, currently only user eviction.
    async fn proxy_ctrl_broadcast(&mut self, msg: ServerMessage) {
        let Some(ctrl) = msg.ctrl() else { return };
        if ctrl.code != 205 || ctrl.text != "evicted" {
            return;
        }
        if msg.uid.is_zero() {
            // Protocol violation by the peer; there is no safe way to decide
            // which sessions to drop, so crash rather than limp on.
            tracing::error!(
                "proxy topic[{}]: proxy received evict message with empty uid",
                self.name
            );
            panic!(
                "proxy topic[{}]: evict message with empty uid",
                self.name
            );
        }
        let sids: Vec<String> = self.sessions.keys().cloned().collect();
        for sid in sids {
            // Proxy topics only hold ordinary sessions, never multiplexed
            // ones.
            if let Some(att) = self.rem_session(&sid, msg.uid) {
                att.sess.detach_topic(&self.name);
                if msg.skip_sid.as_deref() != Some(att.sess.sid.as_str()) {
                    let _ = att.sess.queue_out(msg.clone()).await;
                }
            }
        }
    }

    /// Apply an acs change pushed by the master to the local per-user state.
    fn update_acs_from_pres(&mut self, pres: &Pres) {
        let uid = parse_user_id(&pres.src);
        if uid.is_zero() {
            if self.cat != TopicCat::Me {
                tracing::warn!(
                    "proxy topic[{}]: received acs change for invalid user id '{}'",
                    self.name,
                    pres.src
                );
            }
            return;
        }
        let Some(dacs) = &pres.acs else { return };
        // Start from the existing entry or a blank one; the whole change is
        // discarded if either half fails to parse.
        let mut pud = self.per_user.get(&uid).copied().unwrap_or_default();
        if let Err(err) = pud.mode_want.apply_mutation(&dacs.want) {
            tracing::warn!(
                "proxy topic[{}]: could not process acs change - want: {err}",
                self.name
            );
            return;
        }
        if let Err(err) = pud.mode_given.apply_mutation(&dacs.given) {
            tracing::warn!(
                "proxy topic[{}]: could not process acs change - given: {err}",
                self.name
            );
            return;
        }
        self.per_user.insert(uid, pud);
        self.refresh_snapshot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, ClusterError};
    use crate::session::SessionStore;
    use crate::types::msg::{AcsDelta, ClientMessage, Ctrl};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Cluster fake recording every forward; optionally failing them all.
    #[derive(Default)]
    struct RecordingCluster {
        fail: bool,
        calls: Mutex<Vec<(ProxyReq, String)>>,
        intra: Mutex<Vec<String>>,
        gone: Mutex<Vec<String>>,
    }

    impl RecordingCluster {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(ProxyReq, String)> {
            self.calls.lock().clone()
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
            self.calls.lock().push((req, topic.to_string()));
            if self.fail {
                Err(ClusterError::Unreachable("peer-1".into()))
            } else {
                Ok(())
            }
        }

        fn route_to_topic_intra_cluster(
            &self,
            topic: &str,
            _msg: &ServerMessage,
            _skip_sid: Option<&str>,
        ) -> Result<(), ClusterError> {
            self.intra.lock().push(topic.to_string());
            Ok(())
        }

        fn topic_proxy_gone(&self, topic: &str) -> Result<(), ClusterError> {
            self.gone.lock().push(topic.to_string());
            Ok(())
        }
    }

    struct Fixture {
        handle: crate::topic::TopicHandle,
        cluster: Arc<RecordingCluster>,
        store: Arc<SessionStore>,
        hub_rx: mpsc::UnboundedReceiver<TopicUnreg>,
    }

    fn spawn_proxy(name: &str, cluster: RecordingCluster, idle: Duration) -> Fixture {
        let cluster = Arc::new(cluster);
        let store = Arc::new(SessionStore::new());
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let (handle, topic) = Topic::new_proxy(
            name,
            name,
            false,
            cluster.clone(),
            store.clone(),
            hub_tx,
            idle,
        );
        tokio::spawn(topic.run_proxy());
        Fixture {
            handle,
            cluster,
            store,
            hub_rx,
        }
    }

    fn join_ctrl(name: &str, sid: &str, uid: Uid, code: u16) -> ClusterResp {
        let mut msg = ServerMessage::new(ServerPayload::Ctrl(Ctrl {
            id: None,
            topic: Some(name.to_string()),
            code,
            text: if code < 300 { "ok".into() } else { "not found".into() },
            ts: time_now(),
            params: None,
        }));
        msg.uid = uid;
        ClusterResp {
            srv_msg: msg,
            orig_sid: sid.to_string(),
            orig_req: ProxyReq::Join,
        }
    }

    async fn join(fx: &Fixture, sess: &Arc<Session>) {
        if let Some(reqs) = &sess.inflight_reqs {
            reqs.add(1);
        }
        fx.handle
            .reg
            .send(JoinRequest {
                msg: ClientMessage {
                    topic: fx.handle.name.clone(),
                    original: fx.handle.name.clone(),
                    init: true,
                    ..Default::default()
                },
                sess: sess.clone(),
            })
            .await
            .unwrap();
        fx.handle
            .proxy
            .send(join_ctrl(&fx.handle.name, &sess.sid, Uid(7), 200))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_success_attaches_session() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::default(), Duration::from_secs(5));
        let (sess, mut rx) = Session::new("s1", "127.0.0.1:1");
        fx.store.add(sess.clone());

        join(&fx, &sess).await;

        // The ctrl reply reaches the session and the subscription exists.
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.ctrl().unwrap().code, 200);
        assert!(sess.get_sub("grpXYZ").is_some());
        assert_eq!(fx.handle.snapshot().session_sids, vec!["s1".to_string()]);
        assert_eq!(fx.cluster.calls(), vec![(ProxyReq::Join, "grpXYZ".into())]);
        assert!(sess.inflight_reqs.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_refused_leaves_no_state() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::default(), Duration::from_secs(5));
        let (sess, mut rx) = Session::new("s1", "127.0.0.1:1");
        fx.store.add(sess.clone());

        if let Some(reqs) = &sess.inflight_reqs {
            reqs.add(1);
        }
        fx.handle
            .reg
            .send(JoinRequest {
                msg: ClientMessage {
                    topic: "grpXYZ".into(),
                    original: "grpXYZ".into(),
                    init: true,
                    ..Default::default()
                },
                sess: sess.clone(),
            })
            .await
            .unwrap();
        fx.handle
            .proxy
            .send(join_ctrl("grpXYZ", "s1", Uid::ZERO, 404))
            .await
            .unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.ctrl().unwrap().code, 404);
        assert!(sess.get_sub("grpXYZ").is_none());
        assert!(fx.handle.snapshot().session_sids.is_empty());
    }

    #[tokio::test]
    async fn test_join_forward_failure_is_unreachable() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::failing(), Duration::from_secs(5));
        let (sess, mut rx) = Session::new("s1", "127.0.0.1:1");
        fx.store.add(sess.clone());

        if let Some(reqs) = &sess.inflight_reqs {
            reqs.add(1);
        }
        fx.handle
            .reg
            .send(JoinRequest {
                msg: ClientMessage {
                    topic: "grpXYZ".into(),
                    original: "grpXYZ".into(),
                    init: true,
                    ..Default::default()
                },
                sess: sess.clone(),
            })
            .await
            .unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.ctrl().unwrap().code, 502);
        assert_eq!(reply.ctrl().unwrap().text, "cluster unreachable");
    }

    #[tokio::test]
    async fn test_inactive_topic_replies_locked() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::default(), Duration::from_secs(5));
        let (sess, mut rx) = Session::new("s1", "127.0.0.1:1");
        fx.store.add(sess.clone());
        fx.handle.pause();

        if let Some(reqs) = &sess.inflight_reqs {
            reqs.add(1);
        }
        fx.handle
            .reg
            .send(JoinRequest {
                msg: ClientMessage {
                    topic: "grpXYZ".into(),
                    original: "grpXYZ".into(),
                    init: true,
                    ..Default::default()
                },
                sess: sess.clone(),
            })
            .await
            .unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.ctrl().unwrap().code, 503);
        assert_eq!(reply.ctrl().unwrap().text, "locked");
        // Nothing was forwarded to the master.
        assert!(fx.cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_leave_detaches_eagerly() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::default(), Duration::from_secs(5));
        let (sess, mut rx) = Session::new("s1", "127.0.0.1:1");
        fx.store.add(sess.clone());
        join(&fx, &sess).await;
        let _ = rx.recv().await;

        if let Some(reqs) = &sess.inflight_reqs {
            reqs.add(1);
        }
        fx.handle
            .unreg
            .send(LeaveRequest {
                msg: ClientMessage {
                    topic: "grpXYZ".into(),
                    as_user: Uid(7).user_id(),
                    init: true,
                    ..Default::default()
                },
                sess: sess.clone(),
            })
            .await
            .unwrap();

        // The detach happens before any master response arrives.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if fx.handle.snapshot().session_sids.is_empty() && sess.get_sub("grpXYZ").is_none()
                {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session never detached");
        assert!(fx
            .cluster
            .calls()
            .contains(&(ProxyReq::Leave, "grpXYZ".into())));
    }

    #[tokio::test]
    async fn test_broadcast_forward_failure_replies_unreachable() {
        let fx = spawn_proxy("grpABC", RecordingCluster::failing(), Duration::from_secs(5));
        let (sess, mut rx) = Session::new("s2", "127.0.0.1:2");
        fx.store.add(sess.clone());
        fx.handle
            .client_msg
            .send(crate::topic::BroadcastRequest {
                msg: ClientMessage {
                    topic: "grpABC".into(),
                    original: "grpABC".into(),
                    init: true,
                    ..Default::default()
                },
                sess: sess.clone(),
            })
            .await
            .unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.ctrl().unwrap().code, 502);
        assert_eq!(reply.ctrl().unwrap().text, "cluster unreachable");
    }

    #[tokio::test]
    async fn test_data_broadcast_advances_last_id() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::default(), Duration::from_secs(5));
        let (sess, mut rx) = Session::new("s1", "127.0.0.1:1");
        fx.store.add(sess.clone());
        join(&fx, &sess).await;
        let _ = rx.recv().await;

        let data = ServerMessage::new(ServerPayload::Data(crate::types::msg::Data {
            topic: "grpXYZ".into(),
            from: Uid(9).user_id(),
            ts: time_now(),
            seq: 11,
            head: None,
            content: serde_json::json!("hi"),
        }));
        fx.handle
            .proxy
            .send(ClusterResp {
                srv_msg: data,
                orig_sid: "*".into(),
                orig_req: ProxyReq::Broadcast,
            })
            .await
            .unwrap();

        let got = rx.recv().await.unwrap();
        match got.payload {
            ServerPayload::Data(d) => assert_eq!(d.seq, 11),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eviction_broadcast_skips_skip_sid() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::default(), Duration::from_secs(5));
        let (s1, mut rx1) = Session::new("s1", "127.0.0.1:1");
        let (s2, mut rx2) = Session::new("s2", "127.0.0.1:2");
        fx.store.add(s1.clone());
        fx.store.add(s2.clone());
        join(&fx, &s1).await;
        let _ = rx1.recv().await;
        join(&fx, &s2).await;
        let _ = rx2.recv().await;

        let mut evict = ServerMessage::new(ServerPayload::Ctrl(Ctrl {
            id: None,
            topic: Some("grpXYZ".into()),
            code: 205,
            text: "evicted".into(),
            ts: time_now(),
            params: None,
        }));
        evict.uid = Uid(7);
        evict.skip_sid = Some("s2".into());
        fx.handle
            .proxy
            .send(ClusterResp {
                srv_msg: evict,
                orig_sid: "*".into(),
                orig_req: ProxyReq::Broadcast,
            })
            .await
            .unwrap();

        // s1 is notified, s2 is detached silently.
        let got = rx1.recv().await.unwrap();
        assert_eq!(got.ctrl().unwrap().code, 205);
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if fx.handle.snapshot().session_sids.is_empty() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("eviction never emptied the topic");
        assert!(s1.get_sub("grpXYZ").is_none());
        assert!(s2.get_sub("grpXYZ").is_none());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_requests_unreg() {
        let mut fx = spawn_proxy(
            "grpXYZ",
            RecordingCluster::default(),
            Duration::from_millis(50),
        );
        let (sess, mut rx) = Session::new("s1", "127.0.0.1:1");
        fx.store.add(sess.clone());
        join(&fx, &sess).await;
        let _ = rx.recv().await;

        if let Some(reqs) = &sess.inflight_reqs {
            reqs.add(1);
        }
        fx.handle
            .unreg
            .send(LeaveRequest {
                msg: ClientMessage {
                    topic: "grpXYZ".into(),
                    as_user: Uid(7).user_id(),
                    init: true,
                    ..Default::default()
                },
                sess: sess.clone(),
            })
            .await
            .unwrap();

        let unreg = tokio::time::timeout(Duration::from_secs(5), fx.hub_rx.recv())
            .await
            .expect("idle timer never fired")
            .unwrap();
        assert_eq!(unreg.rcpt_to, "grpXYZ");
    }

    #[tokio::test]
    async fn test_exit_detaches_and_notifies_master() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::default(), Duration::from_secs(5));
        let (sess, mut rx) = Session::new("s1", "127.0.0.1:1");
        fx.store.add(sess.clone());
        join(&fx, &sess).await;
        let _ = rx.recv().await;

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        fx.handle
            .exit
            .send(crate::topic::ExitRequest {
                done: Some(done_tx),
            })
            .await
            .unwrap();
        done_rx.await.unwrap();

        assert!(sess.get_sub("grpXYZ").is_none());
        assert_eq!(fx.cluster.gone.lock().clone(), vec!["grpXYZ".to_string()]);
    }

    #[tokio::test]
    async fn test_server_pres_routes_intra_cluster() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::default(), Duration::from_secs(5));
        let pres = ServerMessage::new(ServerPayload::Pres(Pres {
            topic: "grpXYZ".into(),
            src: Uid(3).user_id(),
            what: "on".into(),
            user_agent: None,
            seq: None,
            acs: None,
        }));
        fx.handle
            .server_msg
            .send(crate::topic::ServerRequest {
                msg: pres,
                sess: None,
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if fx.cluster.intra.lock().contains(&"grpXYZ".to_string()) {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("pres never routed intra-cluster");
    }

    #[tokio::test]
    async fn test_supd_from_attached_session_forwards_bg() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::default(), Duration::from_secs(5));
        let (sess, mut rx) = Session::new("s1", "127.0.0.1:1");
        sess.set_user_agent("client/1.0");
        fx.store.add(sess.clone());
        join(&fx, &sess).await;
        let _ = rx.recv().await;

        fx.handle
            .supd
            .send(SessionUpdate {
                sess: Some(sess.clone()),
                user_agent: String::new(),
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if fx
                    .cluster
                    .calls()
                    .contains(&(ProxyReq::BgSession, "grpXYZ".into()))
                {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("bg session update never forwarded");
    }

    #[tokio::test]
    async fn test_supd_user_agent_refresh_without_session() {
        let fx = spawn_proxy("usrMe", RecordingCluster::default(), Duration::from_secs(5));
        fx.handle
            .supd
            .send(SessionUpdate {
                sess: None,
                user_agent: "client/2.0".into(),
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if fx
                    .cluster
                    .calls()
                    .contains(&(ProxyReq::MeUserAgent, "usrMe".into()))
                {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("user-agent refresh never forwarded");
    }

    #[tokio::test]
    async fn test_supd_from_detached_session_is_dropped() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::default(), Duration::from_secs(5));
        let (sess, _rx) = Session::new("sX", "127.0.0.1:1");
        fx.store.add(sess.clone());
        fx.handle
            .supd
            .send(SessionUpdate {
                sess: Some(sess),
                user_agent: String::new(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_meta_forward_failure_replies_unreachable() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::failing(), Duration::from_secs(5));
        let (sess, mut rx) = Session::new("s1", "127.0.0.1:1");
        fx.store.add(sess.clone());
        fx.handle
            .meta
            .send(crate::topic::MetaRequest {
                msg: ClientMessage {
                    topic: "grpXYZ".into(),
                    original: "grpXYZ".into(),
                    init: true,
                    get: Some(serde_json::json!({"what": "desc"})),
                    ..Default::default()
                },
                sess: sess.clone(),
            })
            .await
            .unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.ctrl().unwrap().code, 502);
    }

    #[tokio::test]
    async fn test_acs_pres_updates_per_user() {
        let fx = spawn_proxy("grpXYZ", RecordingCluster::default(), Duration::from_secs(5));
        let pres = ServerMessage::new(ServerPayload::Pres(Pres {
            topic: "grpXYZ".into(),
            src: Uid(12).user_id(),
            what: "acs".into(),
            user_agent: None,
            seq: None,
            acs: Some(AcsDelta {
                want: "+JRW".into(),
                given: "+JR".into(),
            }),
        }));
        fx.handle
            .proxy
            .send(ClusterResp {
                srv_msg: pres,
                orig_sid: "*".into(),
                orig_req: ProxyReq::Broadcast,
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if fx
                    .handle
                    .snapshot()
                    .per_user
                    .contains(&Uid(12).user_id())
                {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("acs change never applied");
    }
}
