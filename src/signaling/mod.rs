//! Signaling broker: pairs SDP offers with nascent peers and shuttles ICE
//! candidates until the peer-to-peer transport stands on its own.

pub mod http;
pub mod sock;

use crate::auth::Authorizer;
use crate::pane::PaneRegistry;
use crate::peer::{ControlEngine, Peer, PeerConfig, PeerHub, SharedPayload};
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Bound on locally gathered candidates waiting for a poll.
const CANDIDATE_QUEUE: usize = 8;
const OFFER_ID_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to encode: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode: {0}")]
    Decode(String),
}

/// Compact wire form of an offer or answer: base64 over JSON. Symmetric
/// with [`decode_offer`].
pub fn encode_offer<T: Serialize>(value: &T) -> Result<String, SignalError> {
    let json = serde_json::to_vec(value).map_err(SignalError::Encode)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}

pub fn decode_offer<T: DeserializeOwned>(encoded: &str) -> Result<T, SignalError> {
    let json = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| SignalError::Decode(err.to_string()))?;
    serde_json::from_slice(&json).map_err(|err| SignalError::Decode(err.to_string()))
}

/// Pull the DTLS certificate fingerprint out of an SDP blob, normalized to
/// lowercase hex without separators.
pub fn extract_fingerprint(sdp: &str) -> Option<String> {
    for line in sdp.lines() {
        let Some(rest) = line.trim().strip_prefix("a=fingerprint:") else {
            continue;
        };
        let value = rest.split_whitespace().nth(1)?;
        return Some(value.replace(':', "").to_lowercase());
    }
    None
}

/// A pending offer: the peer it created plus its candidate queues. Entries
/// self-destruct after the configured TTL whatever their state.
pub struct LiveOffer {
    pub id: String,
    pub peer: Arc<Peer>,
    outbound: AsyncMutex<mpsc::Receiver<String>>,
    incoming_tx: mpsc::Sender<String>,
}

impl LiveOffer {
    /// Next locally gathered candidate, or `None` if the queue is idle past
    /// `wait`.
    pub async fn next_candidate(&self, wait: Duration) -> Option<String> {
        let mut outbound = self.outbound.lock().await;
        tokio::time::timeout(wait, outbound.recv()).await.ok()?
    }

    /// Queue a remote candidate for delivery to the peer connection.
    pub async fn push_remote_candidate(&self, candidate: String) {
        if self.incoming_tx.send(candidate).await.is_err() {
            debug!(offer_id = %self.id, "offer already torn down, dropping candidate");
        }
    }
}

/// Everything the signaling endpoints share.
pub struct AgentState {
    pub authorizer: Arc<dyn Authorizer>,
    pub registry: Arc<PaneRegistry>,
    pub engine: Arc<ControlEngine>,
    pub hub: Arc<PeerHub>,
    pub payload: SharedPayload,
    pub peer_cfg: PeerConfig,
    pub offer_ttl: Duration,
    offers: AsyncMutex<HashMap<String, Arc<LiveOffer>>>,
}

impl AgentState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        registry: Arc<PaneRegistry>,
        engine: Arc<ControlEngine>,
        hub: Arc<PeerHub>,
        payload: SharedPayload,
        peer_cfg: PeerConfig,
        offer_ttl: Duration,
    ) -> Self {
        Self {
            authorizer,
            registry,
            engine,
            hub,
            payload,
            peer_cfg,
            offer_ttl,
            offers: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Register a pending offer for `peer`: wire up both candidate
    /// directions and arm the TTL sweep.
    pub async fn create_offer(self: &Arc<Self>, peer: Arc<Peer>) -> Arc<LiveOffer> {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(OFFER_ID_LEN)
            .map(char::from)
            .collect();

        let (candidate_tx, candidate_rx) = mpsc::channel(CANDIDATE_QUEUE);
        peer.forward_local_candidates(candidate_tx);

        let (incoming_tx, mut incoming_rx) = mpsc::channel::<String>(CANDIDATE_QUEUE);
        let incoming_peer = Arc::clone(&peer);
        tokio::spawn(async move {
            while let Some(candidate) = incoming_rx.recv().await {
                let init = RTCIceCandidateInit {
                    candidate,
                    ..Default::default()
                };
                if let Err(err) = incoming_peer.add_remote_candidate(init).await {
                    warn!(error = %err, "failed to add remote candidate");
                }
            }
        });

        let offer = Arc::new(LiveOffer {
            id: id.clone(),
            peer,
            outbound: AsyncMutex::new(candidate_rx),
            incoming_tx,
        });
        self.offers.lock().await.insert(id.clone(), Arc::clone(&offer));

        let state = Arc::clone(self);
        let ttl = self.offer_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if state.offers.lock().await.remove(&id).is_some() {
                info!(offer_id = %id, "offer expired");
            }
        });

        offer
    }

    pub async fn offer(&self, id: &str) -> Option<Arc<LiveOffer>> {
        self.offers.lock().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use serde_json::json;

    #[test]
    fn offer_encoding_round_trips() {
        let offer = json!({ "type": "offer", "sdp": "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\n" });
        let encoded = encode_offer(&offer).expect("encode");
        let decoded: serde_json::Value = decode_offer(&encoded).expect("decode");
        assert_eq!(decoded, offer);
        // And the reverse on the byte side.
        assert_eq!(encode_offer(&decoded).expect("re-encode"), encoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_offer::<serde_json::Value>("not base64!!!").is_err());
        let not_json = base64::engine::general_purpose::STANDARD.encode(b"not json");
        assert!(decode_offer::<serde_json::Value>(&not_json).is_err());
    }

    #[test]
    fn fingerprint_is_extracted_and_normalized() {
        let sdp = "v=0\r\n\
                   a=ice-ufrag:abcd\r\n\
                   a=fingerprint:sha-256 AA:BB:CC:DD:EE:FF\r\n\
                   a=setup:actpass\r\n";
        assert_eq!(
            extract_fingerprint(sdp).expect("fingerprint"),
            "aabbccddeeff"
        );
    }

    #[test]
    fn sdp_without_fingerprint_yields_none() {
        assert_eq!(extract_fingerprint("v=0\r\na=ice-ufrag:x\r\n"), None);
    }
}
