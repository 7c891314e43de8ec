//! One remote client connection: its peer connection, control channel,
//! pane bindings, keep-alive and lifecycle timers.

pub mod control;

use crate::config::Config;
use crate::pane::{parse_label, ChannelSink, ChannelTarget, PaneError, PaneRegistry, SinkClosed};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

pub use control::{ControlEngine, ControlMessage, PeerLink, SharedPayload};

/// Label of the distinguished control channel.
pub const CONTROL_LABEL: &str = "%";

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("ICE gathering timed out")]
    SignalingTimeout,
    #[error("connection failed")]
    ConnectionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub disconnect_timeout: Duration,
    pub failed_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub gathering_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            disconnect_timeout: Duration::from_secs(6),
            failed_timeout: Duration::from_secs(6),
            keep_alive_interval: Duration::from_secs(1),
            gathering_timeout: Duration::from_secs(3),
        }
    }
}

impl From<&Config> for PeerConfig {
    fn from(config: &Config) -> Self {
        Self {
            disconnect_timeout: config.disconnect_timeout(),
            failed_timeout: config.failed_timeout(),
            keep_alive_interval: config.keep_alive_interval(),
            gathering_timeout: config.gathering_timeout(),
        }
    }
}

pub struct Peer {
    pub id: Uuid,
    pub fingerprint: String,
    me: Weak<Peer>,
    pc: Arc<RTCPeerConnection>,
    registry: Arc<PaneRegistry>,
    engine: Arc<ControlEngine>,
    cfg: PeerConfig,
    hub: Weak<PeerHub>,
    authorized: AtomicBool,
    state: StdMutex<PeerState>,
    control: AsyncMutex<Option<Arc<RTCDataChannel>>>,
    /// Replay point for this peer's next binding to a pane, set by `restore`.
    pending_restore: StdMutex<Option<(u32, u64)>>,
    /// (pane_id, binding_id) pairs this peer currently holds.
    bindings: StdMutex<Vec<(u32, u64)>>,
    last_activity: StdMutex<Instant>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    /// Create a peer around a fresh peer connection and register it with the
    /// hub. `authorized` is true when the signaling path already vetted the
    /// fingerprint; an unauthorized peer may still upgrade via `auth`.
    pub async fn connect(
        fingerprint: String,
        authorized: bool,
        registry: Arc<PaneRegistry>,
        engine: Arc<ControlEngine>,
        cfg: PeerConfig,
        hub: &Arc<PeerHub>,
    ) -> Result<Arc<Self>, PeerError> {
        let api = APIBuilder::new()
            .with_setting_engine(SettingEngine::default())
            .build();
        let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);

        let peer = Arc::new_cyclic(|me| Peer {
            id: Uuid::new_v4(),
            fingerprint,
            me: me.clone(),
            pc,
            registry,
            engine,
            cfg,
            hub: Arc::downgrade(hub),
            authorized: AtomicBool::new(authorized),
            state: StdMutex::new(PeerState::Connecting),
            control: AsyncMutex::new(None),
            pending_restore: StdMutex::new(None),
            bindings: StdMutex::new(Vec::new()),
            last_activity: StdMutex::new(Instant::now()),
            tasks: StdMutex::new(Vec::new()),
        });
        hub.insert(Arc::clone(&peer)).await;
        peer.install_handlers();
        peer.spawn_keep_alive();
        info!(peer_id = %peer.id, fingerprint = %peer.fingerprint, authorized, "peer created");
        Ok(peer)
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().expect("peer state lock poisoned")
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    fn set_state(&self, state: PeerState) {
        *self.state.lock().expect("peer state lock poisoned") = state;
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .expect("last activity lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("last activity lock poisoned")
            .elapsed()
    }

    /// Answer an SDP offer without waiting for candidates; they trickle
    /// through the signaling broker afterwards.
    pub async fn handle_offer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, PeerError> {
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Answer an SDP offer with candidates inlined: wait for ICE gathering
    /// up to the configured budget, then return the current local
    /// description.
    pub async fn handle_offer_gathered(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, PeerError> {
        self.pc.set_remote_description(offer).await?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        let timed_out = timeout(self.cfg.gathering_timeout, gathered.recv())
            .await
            .is_err();
        if timed_out {
            debug!(peer_id = %self.id, "ICE gathering budget elapsed, answering with partial candidates");
        }
        match self.pc.local_description().await {
            Some(answer) => Ok(answer),
            None if timed_out => Err(PeerError::SignalingTimeout),
            None => Err(PeerError::ConnectionFailed),
        }
    }

    /// Queue locally gathered ICE candidates (serialized init JSON) into `tx`.
    pub fn forward_local_candidates(&self, tx: tokio::sync::mpsc::Sender<String>) {
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_string(&init) {
                        Ok(json) => {
                            if tx.try_send(json).is_err() {
                                debug!("candidate queue full, dropping candidate");
                            }
                        }
                        Err(err) => warn!(error = %err, "failed to serialize candidate"),
                    },
                    Err(err) => warn!(error = %err, "failed to convert candidate"),
                }
            })
        }));
    }

    pub async fn add_remote_candidate(&self, init: RTCIceCandidateInit) -> Result<(), PeerError> {
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    fn install_handlers(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let peer = Arc::clone(&peer);
                Box::pin(async move {
                    peer.route_channel(dc).await;
                })
            }));

        let peer = Arc::clone(self);
        self.pc.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let peer = Arc::clone(&peer);
                Box::pin(async move {
                    peer.handle_connection_state(state).await;
                })
            },
        ));
    }

    async fn route_channel(self: Arc<Self>, dc: Arc<RTCDataChannel>) {
        let label = dc.label().to_string();
        debug!(peer_id = %self.id, %label, "data channel announced");
        if label == CONTROL_LABEL {
            let peer = Arc::clone(&self);
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let peer = Arc::clone(&peer);
                Box::pin(async move {
                    peer.touch();
                    let link: Arc<dyn PeerLink> = Arc::clone(&peer) as Arc<dyn PeerLink>;
                    peer.engine.dispatch(link, &msg.data);
                })
            }));
            *self.control.lock().await = Some(dc);
            return;
        }

        // Everything else waits for the channel to open, then either spawns
        // a pane or rebinds an existing one.
        let peer = Arc::clone(&self);
        let opened = Arc::clone(&dc);
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                peer.handle_pane_channel(opened, label).await;
            })
        }));
    }

    async fn handle_pane_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>, label: String) {
        if !self.authorized.load(Ordering::SeqCst) {
            warn!(peer_id = %self.id, %label, "channel from unauthorized peer");
            let _ = dc.send_text("Failed: not authorized".to_string()).await;
            let _ = dc.close().await;
            return;
        }
        let target = match parse_label(&label) {
            Ok(target) => target,
            Err(err) => {
                let _ = dc.send_text(format!("Failed: {err}")).await;
                let _ = dc.close().await;
                return;
            }
        };
        let outcome = match target {
            ChannelTarget::Control => return,
            ChannelTarget::Attach { pane_id } => {
                let replay_from = self.take_pending_restore(pane_id);
                self.bind_channel(dc.clone(), pane_id, replay_from).await
            }
            ChannelTarget::NewPane { winsize, command } => {
                let sized = winsize.is_some();
                let winsize = winsize.unwrap_or_default();
                match self.registry.add_pane(command, winsize).await {
                    Ok(pane) => {
                        let greeting = if sized {
                            format!("{},{winsize}", pane.id)
                        } else {
                            pane.id.to_string()
                        };
                        let _ = dc.send_text(greeting).await;
                        self.bind_channel(dc.clone(), pane.id, Some(0)).await
                    }
                    Err(err) => Err(err),
                }
            }
        };
        if let Err(err) = outcome {
            warn!(peer_id = %self.id, %label, error = %err, "failed to bind channel");
            let _ = dc.send_text(format!("Failed: {err}")).await;
            let _ = dc.close().await;
        }
    }

    /// Attach `dc` to a pane: replay if asked, register the binding, route
    /// channel input into the PTY and detach when the channel closes.
    async fn bind_channel(
        self: &Arc<Self>,
        dc: Arc<RTCDataChannel>,
        pane_id: u32,
        replay_from: Option<u64>,
    ) -> Result<(), PaneError> {
        let sink: Arc<dyn ChannelSink> = Arc::new(RtcChannelSink {
            label: dc.label().to_string(),
            dc: Arc::clone(&dc),
        });
        let binding_id = self.registry.attach(pane_id, sink, replay_from).await?;
        self.bindings
            .lock()
            .expect("bindings lock poisoned")
            .push((pane_id, binding_id));

        let peer = Arc::clone(self);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let peer = Arc::clone(&peer);
            Box::pin(async move {
                peer.touch();
                if let Err(err) = peer.registry.write(pane_id, &msg.data).await {
                    debug!(pane_id, error = %err, "dropping input for closed pane");
                }
            })
        }));

        let peer = Arc::clone(self);
        dc.on_close(Box::new(move || {
            let peer = Arc::clone(&peer);
            Box::pin(async move {
                peer.registry.detach(pane_id, binding_id).await;
                peer.bindings
                    .lock()
                    .expect("bindings lock poisoned")
                    .retain(|&(_, b)| b != binding_id);
                debug!(peer_id = %peer.id, pane_id, "pane channel closed");
            })
        }));
        Ok(())
    }

    async fn handle_connection_state(self: Arc<Self>, state: RTCPeerConnectionState) {
        info!(peer_id = %self.id, ?state, "connection state changed");
        match state {
            RTCPeerConnectionState::Connected => {
                self.set_state(PeerState::Connected);
                self.touch();
            }
            RTCPeerConnectionState::Disconnected => {
                self.set_state(PeerState::Disconnected);
                let peer = Arc::clone(&self);
                let handle = tokio::spawn(async move {
                    sleep(peer.cfg.disconnect_timeout).await;
                    if peer.state() == PeerState::Disconnected {
                        info!(peer_id = %peer.id, "disconnect grace period elapsed");
                        peer.close("disconnect timeout").await;
                    }
                });
                self.tasks.lock().expect("tasks lock poisoned").push(handle);
            }
            RTCPeerConnectionState::Failed => {
                self.set_state(PeerState::Failed);
                self.teardown().await;
            }
            RTCPeerConnectionState::Closed => {
                self.set_state(PeerState::Closed);
                self.teardown().await;
            }
            _ => {}
        }
    }

    fn spawn_keep_alive(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(peer.cfg.keep_alive_interval);
            loop {
                ticker.tick().await;
                match peer.state() {
                    PeerState::Closed | PeerState::Failed => break,
                    PeerState::Connecting | PeerState::Connected
                        if peer.idle_for() > peer.cfg.failed_timeout =>
                    {
                        warn!(peer_id = %peer.id, "no traffic within the failed timeout");
                        peer.set_state(PeerState::Failed);
                        peer.teardown().await;
                        break;
                    }
                    _ => {}
                }
                let control = peer.control.lock().await.clone();
                if let Some(dc) = control {
                    let frame = peer.engine.ping_frame();
                    if dc.send(&Bytes::from(frame)).await.is_err() {
                        debug!(peer_id = %peer.id, "keep-alive send failed");
                    }
                }
            }
        });
        self.tasks.lock().expect("tasks lock poisoned").push(handle);
    }

    /// Close the connection; the `Closed` state event performs the cleanup.
    pub async fn close(&self, reason: &str) {
        info!(peer_id = %self.id, reason, "closing peer");
        if let Err(err) = self.pc.close().await {
            debug!(peer_id = %self.id, error = %err, "peer connection close");
        }
    }

    /// Drop everything this peer holds. Panes themselves stay alive in the
    /// registry; only this peer's bindings go away.
    async fn teardown(&self) {
        let bindings: Vec<(u32, u64)> = self
            .bindings
            .lock()
            .expect("bindings lock poisoned")
            .drain(..)
            .collect();
        for (pane_id, binding_id) in bindings {
            self.registry.detach(pane_id, binding_id).await;
        }
        *self.control.lock().await = None;
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id).await;
        }
        // Last: one of these tasks may be the caller.
        for task in self
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .drain(..)
        {
            task.abort();
        }
    }

    fn take_pending_restore(&self, pane_id: u32) -> Option<u64> {
        let mut pending = self
            .pending_restore
            .lock()
            .expect("pending restore lock poisoned");
        match *pending {
            Some((id, marker)) if id == pane_id => {
                *pending = None;
                Some(marker)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl PeerLink for Peer {
    fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    fn set_authorized(&self) {
        self.authorized.store(true, Ordering::SeqCst);
    }

    fn set_pending_restore(&self, pane_id: u32, marker: u64) {
        *self
            .pending_restore
            .lock()
            .expect("pending restore lock poisoned") = Some((pane_id, marker));
    }

    fn take_pending_restore(&self, pane_id: u32) -> Option<u64> {
        Peer::take_pending_restore(self, pane_id)
    }

    async fn send_control(&self, bytes: Vec<u8>) -> Result<(), SinkClosed> {
        let control = self.control.lock().await.clone();
        let Some(dc) = control else {
            return Err(SinkClosed);
        };
        dc.send(&Bytes::from(bytes))
            .await
            .map(|_| ())
            .map_err(|_| SinkClosed)
    }

    async fn open_pane_channel(
        &self,
        label: String,
        pane_id: u32,
        replay_from: Option<u64>,
    ) -> Result<(), PaneError> {
        self.registry.ensure_running(pane_id).await?;
        let me = self.me.upgrade().ok_or(PaneError::Unknown(pane_id))?;
        let dc = self
            .pc
            .create_data_channel(&label, None)
            .await
            .map_err(|err| PaneError::Io {
                pane_id,
                reason: err.to_string(),
            })?;
        let opened = Arc::clone(&dc);
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                if let Err(err) = me.bind_channel(opened, pane_id, replay_from).await {
                    warn!(pane_id, error = %err, "failed to bind server-opened channel");
                }
            })
        }));
        Ok(())
    }

    async fn close(&self, reason: &str) {
        Peer::close(self, reason).await;
    }
}

struct RtcChannelSink {
    label: String,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl ChannelSink for RtcChannelSink {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), SinkClosed> {
        self.dc
            .send(&Bytes::copy_from_slice(bytes))
            .await
            .map(|_| ())
            .map_err(|_| SinkClosed)
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

/// All live peers, for shutdown fan-out and diagnostics.
#[derive(Default)]
pub struct PeerHub {
    peers: RwLock<HashMap<Uuid, Arc<Peer>>>,
}

impl PeerHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, peer: Arc<Peer>) {
        self.peers.write().await.insert(peer.id, peer);
    }

    pub async fn remove(&self, id: Uuid) {
        self.peers.write().await.remove(&id);
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn shutdown(&self) {
        let peers: Vec<Arc<Peer>> = self.peers.write().await.drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.close("agent shutdown").await;
        }
    }
}
