//! Control protocol dispatch against a mock peer link.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout};

use webexec::auth::Authorizer;
use webexec::pane::{PaneError, PaneRegistry, SinkClosed, WinSize};
use webexec::peer::{ControlEngine, ControlMessage, PeerLink, SharedPayload};

struct StaticAuthorizer {
    authorized: String,
}

impl Authorizer for StaticAuthorizer {
    fn is_authorized(&self, fingerprints: &[String]) -> bool {
        !self.authorized.is_empty() && fingerprints.iter().any(|fp| *fp == self.authorized)
    }
}

/// Stands in for a peer: records control responses and channel-open
/// requests instead of touching WebRTC.
struct MockLink {
    registry: Arc<PaneRegistry>,
    authorized: AtomicBool,
    responses: Mutex<Vec<ControlMessage>>,
    opened: StdMutex<Vec<(String, u32, Option<u64>)>>,
    pending_restore: StdMutex<Option<(u32, u64)>>,
    closed: AtomicBool,
}

impl MockLink {
    fn new(registry: Arc<PaneRegistry>, authorized: bool) -> Arc<Self> {
        Arc::new(Self {
            registry,
            authorized: AtomicBool::new(authorized),
            responses: Mutex::new(Vec::new()),
            opened: StdMutex::new(Vec::new()),
            pending_restore: StdMutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    async fn wait_for_response(&self, reference: u64) -> ControlMessage {
        let deadline = async {
            loop {
                {
                    let responses = self.responses.lock().await;
                    if let Some(found) = responses
                        .iter()
                        .find(|r| r.args.get("ref") == Some(&json!(reference)))
                    {
                        return found.clone();
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(Duration::from_secs(5), deadline)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for a response to {reference}"))
    }
}

#[async_trait]
impl PeerLink for MockLink {
    fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    fn set_authorized(&self) {
        self.authorized.store(true, Ordering::SeqCst);
    }

    fn set_pending_restore(&self, pane_id: u32, marker: u64) {
        *self.pending_restore.lock().expect("pending lock") = Some((pane_id, marker));
    }

    fn take_pending_restore(&self, pane_id: u32) -> Option<u64> {
        let mut pending = self.pending_restore.lock().expect("pending lock");
        match *pending {
            Some((id, marker)) if id == pane_id => {
                *pending = None;
                Some(marker)
            }
            _ => None,
        }
    }

    async fn send_control(&self, bytes: Vec<u8>) -> Result<(), SinkClosed> {
        let message: ControlMessage = serde_json::from_slice(&bytes).expect("well-formed frame");
        self.responses.lock().await.push(message);
        Ok(())
    }

    async fn open_pane_channel(
        &self,
        label: String,
        pane_id: u32,
        replay_from: Option<u64>,
    ) -> Result<(), PaneError> {
        self.registry.ensure_running(pane_id).await?;
        self.opened
            .lock()
            .expect("opened lock")
            .push((label, pane_id, replay_from));
        Ok(())
    }

    async fn close(&self, _reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn build_engine(authorized_token: &str) -> (Arc<ControlEngine>, Arc<PaneRegistry>, SharedPayload) {
    let registry = Arc::new(PaneRegistry::new(64 * 1024));
    let authorizer = Arc::new(StaticAuthorizer {
        authorized: authorized_token.to_string(),
    });
    let payload: SharedPayload = Arc::new(RwLock::new(Vec::new()));
    let engine = Arc::new(ControlEngine::new(
        Arc::clone(&registry),
        authorizer,
        Arc::clone(&payload),
    ));
    (engine, registry, payload)
}

fn frame(message_id: u64, kind: &str, args: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "time": 0,
        "message_id": message_id,
        "type": kind,
        "args": args,
    }))
    .expect("frame")
}

fn link_of(mock: &Arc<MockLink>) -> Arc<dyn PeerLink> {
    Arc::clone(mock) as Arc<dyn PeerLink>
}

#[tokio::test]
async fn auth_with_a_known_token_acks_and_authorizes() {
    let (engine, registry, _) = build_engine("goodtoken");
    let link = MockLink::new(registry, false);

    engine.dispatch(
        link_of(&link),
        &frame(1, "auth", json!({ "token": "goodtoken" })),
    );
    let response = link.wait_for_response(1).await;
    assert_eq!(response.kind, "ack");
    assert_eq!(response.args["body"], json!("authed"));
    assert!(link.is_authorized());
}

#[tokio::test]
async fn auth_is_idempotent() {
    let (engine, registry, _) = build_engine("goodtoken");
    let link = MockLink::new(registry, true);

    engine.dispatch(
        link_of(&link),
        &frame(5, "auth", json!({ "token": "goodtoken" })),
    );
    let response = link.wait_for_response(5).await;
    assert_eq!(response.kind, "ack");
    assert!(link.is_authorized());
}

#[tokio::test]
async fn auth_with_a_bad_token_nacks_and_closes_the_peer() {
    let (engine, registry, _) = build_engine("goodtoken");
    let link = MockLink::new(registry, false);

    engine.dispatch(link_of(&link), &frame(2, "auth", json!({ "token": "bad" })));
    let response = link.wait_for_response(2).await;
    assert_eq!(response.kind, "nack");
    assert!(link.closed.load(Ordering::SeqCst));
    assert!(!link.is_authorized());
}

#[tokio::test]
async fn everything_but_auth_nacks_while_unauthorized() {
    let (engine, registry, _) = build_engine("goodtoken");
    let link = MockLink::new(registry, false);

    engine.dispatch(link_of(&link), &frame(3, "get_payload", json!({})));
    let response = link.wait_for_response(3).await;
    assert_eq!(response.kind, "nack");
    assert_eq!(response.args["description"], json!("not authorized"));
}

#[tokio::test]
async fn unknown_message_type_nacks() {
    let (engine, registry, _) = build_engine("t");
    let link = MockLink::new(registry, true);

    engine.dispatch(link_of(&link), &frame(4, "bogus_op", json!({})));
    let response = link.wait_for_response(4).await;
    assert_eq!(response.kind, "nack");
    assert_eq!(response.args["description"], json!("unknown_message"));
}

#[tokio::test]
async fn unparseable_message_nacks_with_ref_zero() {
    let (engine, registry, _) = build_engine("t");
    let link = MockLink::new(registry, true);

    engine.dispatch(link_of(&link), b"{not json");
    let response = link.wait_for_response(0).await;
    assert_eq!(response.kind, "nack");
}

#[tokio::test]
async fn duplicate_message_ids_each_get_a_response() {
    let (engine, registry, _) = build_engine("t");
    let link = MockLink::new(registry, true);

    engine.dispatch(link_of(&link), &frame(9, "get_payload", json!({})));
    engine.dispatch(link_of(&link), &frame(9, "get_payload", json!({})));

    let deadline = async {
        loop {
            let count = link
                .responses
                .lock()
                .await
                .iter()
                .filter(|r| r.args.get("ref") == Some(&json!(9)))
                .count();
            if count >= 2 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(5), deadline)
        .await
        .expect("both duplicates answered");
}

#[tokio::test]
async fn set_payload_round_trips_through_get_payload() {
    let (engine, registry, payload) = build_engine("t");
    let link = MockLink::new(registry, true);
    let body = json!(["Better payload"]);

    engine.dispatch(
        link_of(&link),
        &frame(777, "set_payload", json!({ "payload": body })),
    );
    let response = link.wait_for_response(777).await;
    assert_eq!(response.kind, "ack");
    assert_eq!(response.args["body"], body);
    assert_eq!(&*payload.read().await, body.to_string().as_bytes());

    engine.dispatch(link_of(&link), &frame(778, "get_payload", json!({})));
    let response = link.wait_for_response(778).await;
    assert_eq!(response.args["body"], body);
}

#[tokio::test]
async fn add_pane_opens_a_channel_labeled_with_the_ref() {
    let (engine, registry, _) = build_engine("t");
    let link = MockLink::new(Arc::clone(&registry), true);

    engine.dispatch(
        link_of(&link),
        &frame(
            456,
            "add_pane",
            json!({ "rows": 12, "cols": 34, "command": ["sleep", "30"] }),
        ),
    );
    let response = link.wait_for_response(456).await;
    assert_eq!(response.kind, "ack");
    let pane_id = response.args["body"].as_u64().expect("pane id body") as u32;

    let opened = link.opened.lock().expect("opened lock").clone();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].0, format!("456:{pane_id}"));
    assert_eq!(opened[0].1, pane_id);
    assert_eq!(opened[0].2, Some(0));

    registry.close_pane(pane_id).await;
}

#[tokio::test]
async fn resize_acks_with_the_request_ref() {
    let (engine, registry, _) = build_engine("t");
    let link = MockLink::new(Arc::clone(&registry), true);
    let pane = registry
        .add_pane(
            vec!["sleep".into(), "30".into()],
            WinSize { rows: 12, cols: 34 },
        )
        .await
        .expect("spawn");

    engine.dispatch(
        link_of(&link),
        &frame(
            456,
            "resize",
            json!({ "pane_id": pane.id, "rows": 80, "cols": 24 }),
        ),
    );
    let response = link.wait_for_response(456).await;
    assert_eq!(response.kind, "ack");
    assert_eq!(response.args["body"], json!(""));

    registry.close_pane(pane.id).await;
}

#[tokio::test]
async fn resize_of_an_unknown_pane_nacks() {
    let (engine, registry, _) = build_engine("t");
    let link = MockLink::new(registry, true);

    engine.dispatch(
        link_of(&link),
        &frame(
            11,
            "resize",
            json!({ "pane_id": 9999, "rows": 80, "cols": 24 }),
        ),
    );
    let response = link.wait_for_response(11).await;
    assert_eq!(response.kind, "nack");
}

#[tokio::test]
async fn mark_then_restore_then_reconnect_replays_from_the_marker() {
    let (engine, registry, _) = build_engine("t");
    let link = MockLink::new(Arc::clone(&registry), true);
    let pane = registry
        .add_pane(vec!["sleep".into(), "30".into()], WinSize::default())
        .await
        .expect("spawn");

    engine.dispatch(
        link_of(&link),
        &frame(100, "mark", json!({ "pane_id": pane.id })),
    );
    let response = link.wait_for_response(100).await;
    assert_eq!(response.kind, "ack");
    let marker = response.args["body"].as_u64().expect("marker");

    engine.dispatch(
        link_of(&link),
        &frame(
            101,
            "restore",
            json!({ "pane_id": pane.id, "marker": marker }),
        ),
    );
    let response = link.wait_for_response(101).await;
    assert_eq!(response.kind, "ack");
    assert_eq!(response.args["body"], json!(""));

    engine.dispatch(
        link_of(&link),
        &frame(102, "reconnect_pane", json!({ "pane_id": pane.id })),
    );
    let response = link.wait_for_response(102).await;
    assert_eq!(response.kind, "ack");
    assert_eq!(response.args["body"], json!(pane.id));

    let opened = link.opened.lock().expect("opened lock").clone();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].0, format!("102:{}", pane.id));
    assert_eq!(opened[0].2, Some(marker));

    registry.close_pane(pane.id).await;
}

#[tokio::test]
async fn reconnect_without_restore_binds_live() {
    let (engine, registry, _) = build_engine("t");
    let link = MockLink::new(Arc::clone(&registry), true);
    let pane = registry
        .add_pane(vec!["sleep".into(), "30".into()], WinSize::default())
        .await
        .expect("spawn");

    // Older clients spell the pane id as `id`.
    engine.dispatch(
        link_of(&link),
        &frame(457, "reconnect_pane", json!({ "id": pane.id })),
    );
    let response = link.wait_for_response(457).await;
    assert_eq!(response.kind, "ack");
    assert_eq!(response.args["body"], json!(pane.id));

    let opened = link.opened.lock().expect("opened lock").clone();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].0, format!("457:{}", pane.id));
    assert_eq!(opened[0].2, None, "no pending restore means a live bind");

    registry.close_pane(pane.id).await;
}

#[tokio::test]
async fn restore_with_a_never_issued_marker_acks_unknown_marker() {
    let (engine, registry, _) = build_engine("t");
    let link = MockLink::new(Arc::clone(&registry), true);
    let pane = registry
        .add_pane(vec!["sleep".into(), "30".into()], WinSize::default())
        .await
        .expect("spawn");

    engine.dispatch(
        link_of(&link),
        &frame(
            12,
            "restore",
            json!({ "pane_id": pane.id, "marker": 1_000_000 }),
        ),
    );
    let response = link.wait_for_response(12).await;
    assert_eq!(response.kind, "ack");
    assert_eq!(response.args["body"], json!("UnknownMarker"));

    registry.close_pane(pane.id).await;
}

#[tokio::test]
async fn restore_from_an_evicted_marker_acks_marker_expired() {
    // A tiny buffer so the pane's own output evicts offset zero.
    let registry = Arc::new(PaneRegistry::new(4));
    let authorizer = Arc::new(StaticAuthorizer {
        authorized: "t".to_string(),
    });
    let payload: SharedPayload = Arc::new(RwLock::new(Vec::new()));
    let engine = Arc::new(ControlEngine::new(
        Arc::clone(&registry),
        authorizer,
        payload,
    ));
    let link = MockLink::new(Arc::clone(&registry), true);
    let pane = registry
        .add_pane(
            vec!["echo".into(), "0123456789".into()],
            WinSize::default(),
        )
        .await
        .expect("spawn");

    let pane_id = pane.id;
    let deadline = async {
        loop {
            if registry.mark_now(pane_id).await.expect("mark") > 4 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(5), deadline)
        .await
        .expect("pane output overflowed the buffer");

    engine.dispatch(
        link_of(&link),
        &frame(13, "restore", json!({ "pane_id": pane_id, "marker": 0 })),
    );
    let response = link.wait_for_response(13).await;
    assert_eq!(response.kind, "ack");
    assert_eq!(response.args["body"], json!("MarkerExpired"));

    registry.close_pane(pane_id).await;
}

#[tokio::test]
async fn reconnect_to_an_unknown_pane_nacks() {
    let (engine, registry, _) = build_engine("t");
    let link = MockLink::new(registry, true);

    engine.dispatch(
        link_of(&link),
        &frame(13, "reconnect_pane", json!({ "pane_id": 4242 })),
    );
    let response = link.wait_for_response(13).await;
    assert_eq!(response.kind, "nack");
    assert!(link.opened.lock().expect("opened lock").is_empty());
}
