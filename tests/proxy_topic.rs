//! Proxy-topic scenarios driven through the hub, the way the rest of the
//! process uses them.

mod common;

use common::RecordingCluster;
use herald::cluster::{ClusterResp, ProxyReq};
use herald::hub::Hub;
use herald::session::{Session, SessionStore};
use herald::topic::{JoinRequest, LeaveRequest};
use herald::types::msg::{time_now, ClientMessage, Ctrl, ServerMessage, ServerPayload};
use herald::types::Uid;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    hub: Arc<Hub>,
    cluster: Arc<RecordingCluster>,
    store: Arc<SessionStore>,
}

fn fixture(idle: Duration) -> Fixture {
    let cluster = Arc::new(RecordingCluster::default());
    let store = Arc::new(SessionStore::new());
    let hub = Hub::spawn(cluster.clone(), store.clone(), idle);
    Fixture {
        hub,
        cluster,
        store,
    }
}

fn join_ok(topic: &str, sid: &str, uid: Uid) -> ClusterResp {
    let mut msg = ServerMessage::new(ServerPayload::Ctrl(Ctrl {
        id: None,
        topic: Some(topic.to_string()),
        code: 200,
        text: "ok".into(),
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

async fn attach(fx: &Fixture, topic: &str, sess: &Arc<Session>, uid: Uid) {
    let handle = fx.hub.get_or_spawn_proxy(topic, topic, false);
    if let Some(reqs) = &sess.inflight_reqs {
        reqs.add(1);
    }
    handle
        .reg
        .send(JoinRequest {
            msg: ClientMessage {
                topic: topic.to_string(),
                original: topic.to_string(),
                init: true,
                ..Default::default()
            },
            sess: sess.clone(),
        })
        .await
        .unwrap();
    handle.proxy.send(join_ok(topic, &sess.sid, uid)).await.unwrap();
}

#[tokio::test]
async fn test_join_through_hub_installs_subscription() {
    let fx = fixture(Duration::from_secs(5));
    let (sess, mut rx) = Session::new("s1", "127.0.0.1:1");
    fx.store.add(sess.clone());

    attach(&fx, "grpHub", &sess, Uid(3)).await;
    let reply = rx.recv().await.unwrap();
    assert_eq!(reply.ctrl().unwrap().code, 200);
    assert!(sess.get_sub("grpHub").is_some());
    assert_eq!(
        fx.cluster.master_calls.lock().clone(),
        vec![(ProxyReq::Join, "grpHub".to_string())]
    );
    // Queued work drained; the session could tear down now.
    sess.inflight_reqs.as_ref().unwrap().wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_eviction_removes_topic_from_hub() {
    let fx = fixture(Duration::from_millis(50));
    let (sess, mut rx) = Session::new("s1", "127.0.0.1:1");
    fx.store.add(sess.clone());
    attach(&fx, "grpIdle", &sess, Uid(3)).await;
    let _ = rx.recv().await;

    let handle = fx.hub.topic("grpIdle").unwrap();
    if let Some(reqs) = &sess.inflight_reqs {
        reqs.add(1);
    }
    handle
        .unreg
        .send(LeaveRequest {
            msg: ClientMessage {
                topic: "grpIdle".into(),
                as_user: Uid(3).user_id(),
                init: true,
                ..Default::default()
            },
            sess: sess.clone(),
        })
        .await
        .unwrap();

    // The leave empties the topic; the idle timer then asks the hub to drop
    // it, and the hub notifies the master that the proxy is gone.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if fx.hub.topic("grpIdle").is_none() && !fx.cluster.gone.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("idle topic never evicted");
    assert_eq!(fx.cluster.gone.lock().clone(), vec!["grpIdle".to_string()]);
    assert!(sess.get_sub("grpIdle").is_none());
}

#[tokio::test]
async fn test_join_response_for_vanished_session_is_dropped() {
    let fx = fixture(Duration::from_secs(5));
    let (sess, _rx) = Session::new("gone", "127.0.0.1:1");
    fx.store.add(sess.clone());
    let handle = fx.hub.get_or_spawn_proxy("grpGone", "grpGone", false);

    // The session disconnects before the master's answer arrives.
    fx.store.delete("gone");
    handle.proxy.send(join_ok("grpGone", "gone", Uid(3))).await.unwrap();

    // No attachment happens on either side.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.snapshot().session_sids.is_empty());
    assert!(sess.get_sub("grpGone").is_none());
}

#[tokio::test]
async fn test_hub_shutdown_detaches_all_sessions() {
    let fx = fixture(Duration::from_secs(5));
    let (s1, mut rx1) = Session::new("s1", "127.0.0.1:1");
    let (s2, mut rx2) = Session::new("s2", "127.0.0.1:2");
    fx.store.add(s1.clone());
    fx.store.add(s2.clone());
    attach(&fx, "grpA", &s1, Uid(3)).await;
    attach(&fx, "grpB", &s2, Uid(4)).await;
    let _ = rx1.recv().await;
    let _ = rx2.recv().await;

    fx.hub.shutdown().await;

    assert_eq!(fx.hub.topic_count(), 0);
    assert!(s1.get_sub("grpA").is_none());
    assert!(s2.get_sub("grpB").is_none());
    let mut gone = fx.cluster.gone.lock().clone();
    gone.sort();
    assert_eq!(gone, vec!["grpA".to_string(), "grpB".to_string()]);
}
