//! The control protocol: JSON messages on the `%` channel, dispatched to
//! the pane registry and answered with acks carrying the request's id.

use crate::auth::Authorizer;
use crate::pane::{MarkerError, PaneError, PaneRegistry, SinkClosed, WinSize};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// The agent-global payload blob clients stash their state in.
pub type SharedPayload = Arc<RwLock<Vec<u8>>>;

/// Wire envelope for everything on the control channel, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Sender clock, nanoseconds since the epoch.
    #[serde(default)]
    pub time: i64,
    pub message_id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Deserialize)]
struct AuthArgs {
    token: String,
}

#[derive(Debug, Deserialize)]
struct AddPaneArgs {
    #[serde(default)]
    rows: u16,
    #[serde(default)]
    cols: u16,
    command: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ResizeArgs {
    pane_id: u32,
    rows: u16,
    cols: u16,
}

#[derive(Debug, Deserialize)]
struct PaneIdArgs {
    /// Older clients send `id`.
    #[serde(alias = "id")]
    pane_id: u32,
}

#[derive(Debug, Deserialize)]
struct RestoreArgs {
    pane_id: u32,
    marker: u64,
}

#[derive(Debug, Deserialize)]
struct SetPayloadArgs {
    payload: Value,
}

/// What the control engine needs from the peer that delivered a message.
/// The production implementation is [`crate::peer::Peer`]; tests use a mock.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn is_authorized(&self) -> bool;
    fn set_authorized(&self);
    /// Remember a replay point for the peer's next binding to `pane_id`.
    fn set_pending_restore(&self, pane_id: u32, marker: u64);
    fn take_pending_restore(&self, pane_id: u32) -> Option<u64>;
    async fn send_control(&self, bytes: Vec<u8>) -> Result<(), SinkClosed>;
    /// Open a server-initiated data channel bound to `pane_id`.
    async fn open_pane_channel(
        &self,
        label: String,
        pane_id: u32,
        replay_from: Option<u64>,
    ) -> Result<(), PaneError>;
    async fn close(&self, reason: &str);
}

pub struct ControlEngine {
    registry: Arc<PaneRegistry>,
    authorizer: Arc<dyn Authorizer>,
    payload: SharedPayload,
    next_message_id: AtomicU64,
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

impl ControlEngine {
    pub fn new(
        registry: Arc<PaneRegistry>,
        authorizer: Arc<dyn Authorizer>,
        payload: SharedPayload,
    ) -> Self {
        Self {
            registry,
            authorizer,
            payload,
            next_message_id: AtomicU64::new(1),
        }
    }

    /// Parse one inbound control message and run its handler on its own
    /// task, so a slow pane spawn never blocks an unrelated resize. Acks go
    /// out as handlers complete; the `ref` field disambiguates.
    pub fn dispatch(self: &Arc<Self>, link: Arc<dyn PeerLink>, raw: &[u8]) {
        let message: ControlMessage = match serde_json::from_slice(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "unparseable control message");
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine
                        .nack(&link, 0, format!("bad control message: {err}"))
                        .await;
                });
                return;
            }
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.handle(link, message).await;
        });
    }

    async fn handle(&self, link: Arc<dyn PeerLink>, message: ControlMessage) {
        let reference = message.message_id;
        debug!(kind = %message.kind, message_id = reference, "control message");
        if message.kind != "auth" && !link.is_authorized() {
            self.nack(&link, reference, "not authorized".to_string())
                .await;
            return;
        }
        match message.kind.as_str() {
            "auth" => self.handle_auth(link, message).await,
            "add_pane" => self.handle_add_pane(link, message).await,
            "resize" => self.handle_resize(link, message).await,
            "reconnect_pane" => self.handle_reconnect(link, message).await,
            "mark" => self.handle_mark(link, message).await,
            "restore" => self.handle_restore(link, message).await,
            "set_payload" => self.handle_set_payload(link, message).await,
            "get_payload" => self.handle_get_payload(link, message).await,
            "ping" => self.ack(&link, reference, Value::String(String::new())).await,
            _ => {
                self.nack(&link, reference, "unknown_message".to_string())
                    .await
            }
        }
    }

    async fn handle_auth(&self, link: Arc<dyn PeerLink>, message: ControlMessage) {
        let reference = message.message_id;
        let Some(args) = self.parse::<AuthArgs>(&link, &message).await else {
            return;
        };
        if self.authorizer.is_authorized(&[args.token]) {
            link.set_authorized();
            self.ack(&link, reference, Value::String("authed".to_string()))
                .await;
        } else {
            self.nack(&link, reference, "Unauthorized".to_string()).await;
            link.close("Unauthorized").await;
        }
    }

    async fn handle_add_pane(&self, link: Arc<dyn PeerLink>, message: ControlMessage) {
        let reference = message.message_id;
        let Some(args) = self.parse::<AddPaneArgs>(&link, &message).await else {
            return;
        };
        let winsize = if args.rows > 0 && args.cols > 0 {
            WinSize {
                rows: args.rows,
                cols: args.cols,
            }
        } else {
            WinSize::default()
        };
        let pane = match self.registry.add_pane(args.command, winsize).await {
            Ok(pane) => pane,
            Err(err) => return self.nack(&link, reference, err.to_string()).await,
        };
        let label = format!("{reference}:{}", pane.id);
        if let Err(err) = link.open_pane_channel(label, pane.id, Some(0)).await {
            return self.nack(&link, reference, err.to_string()).await;
        }
        self.ack(&link, reference, json!(pane.id)).await;
    }

    async fn handle_resize(&self, link: Arc<dyn PeerLink>, message: ControlMessage) {
        let reference = message.message_id;
        let Some(args) = self.parse::<ResizeArgs>(&link, &message).await else {
            return;
        };
        let winsize = WinSize {
            rows: args.rows,
            cols: args.cols,
        };
        match self.registry.resize(args.pane_id, winsize).await {
            Ok(()) => self.ack(&link, reference, Value::String(String::new())).await,
            Err(err) => self.nack(&link, reference, err.to_string()).await,
        }
    }

    async fn handle_reconnect(&self, link: Arc<dyn PeerLink>, message: ControlMessage) {
        let reference = message.message_id;
        let Some(args) = self.parse::<PaneIdArgs>(&link, &message).await else {
            return;
        };
        // Same semantics as a client-opened `>pane_id` channel: replay only
        // when a restore marker is pending, otherwise bind live.
        let replay_from = link.take_pending_restore(args.pane_id);
        let label = format!("{reference}:{}", args.pane_id);
        match link
            .open_pane_channel(label, args.pane_id, replay_from)
            .await
        {
            Ok(()) => self.ack(&link, reference, json!(args.pane_id)).await,
            Err(err) => self.nack(&link, reference, err.to_string()).await,
        }
    }

    async fn handle_mark(&self, link: Arc<dyn PeerLink>, message: ControlMessage) {
        let reference = message.message_id;
        let Some(args) = self.parse::<PaneIdArgs>(&link, &message).await else {
            return;
        };
        match self.registry.mark_now(args.pane_id).await {
            Ok(marker) => self.ack(&link, reference, json!(marker)).await,
            Err(err) => self.nack(&link, reference, err.to_string()).await,
        }
    }

    async fn handle_restore(&self, link: Arc<dyn PeerLink>, message: ControlMessage) {
        let reference = message.message_id;
        let Some(args) = self.parse::<RestoreArgs>(&link, &message).await else {
            return;
        };
        match self.registry.check_marker(args.pane_id, args.marker).await {
            Ok(()) => {
                link.set_pending_restore(args.pane_id, args.marker);
                self.ack(&link, reference, Value::String(String::new())).await;
            }
            // A bad marker is still an ack; the body names the failure.
            Err(PaneError::Marker(MarkerError::Expired(_))) => {
                self.ack(&link, reference, Value::String("MarkerExpired".to_string()))
                    .await;
            }
            Err(PaneError::Marker(MarkerError::Unknown(_))) => {
                self.ack(&link, reference, Value::String("UnknownMarker".to_string()))
                    .await;
            }
            Err(err) => self.nack(&link, reference, err.to_string()).await,
        }
    }

    async fn handle_set_payload(&self, link: Arc<dyn PeerLink>, message: ControlMessage) {
        let reference = message.message_id;
        let Some(args) = self.parse::<SetPayloadArgs>(&link, &message).await else {
            return;
        };
        let bytes = args.payload.to_string().into_bytes();
        *self.payload.write().await = bytes;
        self.ack(&link, reference, args.payload).await;
    }

    async fn handle_get_payload(&self, link: Arc<dyn PeerLink>, message: ControlMessage) {
        let reference = message.message_id;
        let bytes = self.payload.read().await.clone();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        self.ack(&link, reference, body).await;
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        &self,
        link: &Arc<dyn PeerLink>,
        message: &ControlMessage,
    ) -> Option<T> {
        match serde_json::from_value(message.args.clone()) {
            Ok(args) => Some(args),
            Err(err) => {
                self.nack(
                    link,
                    message.message_id,
                    format!("bad {} args: {err}", message.kind),
                )
                .await;
                None
            }
        }
    }

    async fn ack(&self, link: &Arc<dyn PeerLink>, reference: u64, body: Value) {
        self.respond(link, "ack", json!({ "ref": reference, "body": body }))
            .await;
    }

    async fn nack(&self, link: &Arc<dyn PeerLink>, reference: u64, description: String) {
        debug!(reference, %description, "nack");
        self.respond(
            link,
            "nack",
            json!({ "ref": reference, "description": description }),
        )
        .await;
    }

    async fn respond(&self, link: &Arc<dyn PeerLink>, kind: &str, args: Value) {
        let envelope = ControlMessage {
            time: now_nanos(),
            message_id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            kind: kind.to_string(),
            args,
        };
        match serde_json::to_vec(&envelope) {
            Ok(bytes) => {
                if link.send_control(bytes).await.is_err() {
                    debug!("control channel gone while responding");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize control response"),
        }
    }

    /// Keep-alive ping sent by the peer's timer task.
    pub fn ping_frame(&self) -> Vec<u8> {
        let envelope = ControlMessage {
            time: now_nanos(),
            message_id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            kind: "ping".to_string(),
            args: json!({}),
        };
        serde_json::to_vec(&envelope).expect("ping frame serializes")
    }
}
