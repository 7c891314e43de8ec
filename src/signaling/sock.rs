//! Local IPC: signaling and layout endpoints on a UNIX socket under the
//! agent's runtime directory.

use super::{extract_fingerprint, AgentState};
use crate::peer::Peer;
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// How long a candidate poll hangs before reporting connection state.
const POLL_WAIT: Duration = Duration::from_secs(5);

pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/layout", get(get_layout).post(set_layout))
        .route("/offer", post(post_offer))
        .route("/offer/{id}", get(poll_candidate).put(put_candidate))
        .with_state(state)
}

async fn handle_status() -> &'static str {
    "READY"
}

async fn get_layout(State(state): State<Arc<AgentState>>) -> Vec<u8> {
    state.payload.read().await.clone()
}

async fn set_layout(State(state): State<Arc<AgentState>>, body: Bytes) {
    *state.payload.write().await = body.to_vec();
}

/// Accept a raw SDP offer, pair it with a new peer and answer immediately;
/// candidates trickle through `GET`/`PUT /offer/{id}`.
async fn post_offer(
    State(state): State<Arc<AgentState>>,
    Json(offer): Json<RTCSessionDescription>,
) -> Response {
    let fingerprints: Vec<String> = extract_fingerprint(&offer.sdp).into_iter().collect();
    let authorized = state.authorizer.is_authorized(&fingerprints);
    let fingerprint = fingerprints
        .into_iter()
        .next()
        .unwrap_or_else(|| "unknown".to_string());

    let peer = match Peer::connect(
        fingerprint,
        authorized,
        Arc::clone(&state.registry),
        Arc::clone(&state.engine),
        state.peer_cfg.clone(),
        &state.hub,
    )
    .await
    {
        Ok(peer) => peer,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to create a new peer: {err}"),
            )
                .into_response();
        }
    };

    // Candidate plumbing has to exist before the answer starts gathering.
    let live = state.create_offer(Arc::clone(&peer)).await;
    let answer = match peer.handle_offer(offer).await {
        Ok(answer) => answer,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Peer failed to listen: {err}"),
            )
                .into_response();
        }
    };
    Json(json!({ "type": "answer", "sdp": answer.sdp, "id": live.id })).into_response()
}

/// Long-poll the next locally gathered candidate for a pending offer.
async fn poll_candidate(
    State(state): State<Arc<AgentState>>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    let Some(live) = state.offer(&id).await else {
        return (StatusCode::BAD_REQUEST, "offer id is unknown").into_response();
    };
    if let Some(candidate) = live.next_candidate(POLL_WAIT).await {
        return candidate.into_response();
    }
    match live.peer.connection_state() {
        RTCPeerConnectionState::Connected => {
            (StatusCode::NO_CONTENT, "Connection established").into_response()
        }
        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
            (StatusCode::SERVICE_UNAVAILABLE, "Connection failed").into_response()
        }
        _ => StatusCode::OK.into_response(),
    }
}

/// Deliver a remote candidate for a pending offer.
async fn put_candidate(
    State(state): State<Arc<AgentState>>,
    UrlPath(id): UrlPath<String>,
    body: String,
) -> Response {
    let Some(live) = state.offer(&id).await else {
        return (StatusCode::BAD_REQUEST, "offer id is unknown").into_response();
    };
    live.push_remote_candidate(body).await;
    StatusCode::OK.into_response()
}

/// Serve the IPC endpoints on `path`, replacing any stale socket file.
pub async fn serve(state: Arc<AgentState>, path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        info!(path = %path.display(), "removing stale socket file");
        std::fs::remove_file(path)?;
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) =
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))
            {
                warn!(error = %err, "failed to set runtime dir permissions");
            }
        }
    }
    let listener = tokio::net::UnixListener::bind(path)?;
    info!(path = %path.display(), "socket signaling listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
