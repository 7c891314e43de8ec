//! The public HTTP endpoint remote clients use to connect.

use super::{decode_offer, encode_offer, AgentState};
use crate::peer::Peer;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub fingerprint: String,
    #[allow(dead_code)]
    pub api_version: u32,
    pub offer: String,
}

pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
            }
            ApiError::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            ApiError::Internal(reason) => {
                (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response()
            }
        }
    }
}

pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/connect", post(handle_connect))
        .with_state(state)
}

/// Authorize the client's fingerprint, pair its offer with a new peer and
/// answer with the gathered local description.
async fn handle_connect(
    State(state): State<Arc<AgentState>>,
    Json(request): Json<ConnectRequest>,
) -> Result<String, ApiError> {
    let fingerprint = request.fingerprint.trim().to_lowercase();
    if !state.authorizer.is_authorized(&[fingerprint.clone()]) {
        warn!(%fingerprint, "rejecting connect from unauthorized fingerprint");
        return Err(ApiError::Unauthorized);
    }
    let offer: RTCSessionDescription = decode_offer(&request.offer)
        .map_err(|err| ApiError::BadRequest(format!("bad offer: {err}")))?;

    let peer = Peer::connect(
        fingerprint,
        true,
        Arc::clone(&state.registry),
        Arc::clone(&state.engine),
        state.peer_cfg.clone(),
        &state.hub,
    )
    .await
    .map_err(|err| ApiError::Internal(format!("failed to create a new peer: {err}")))?;

    let answer = peer
        .handle_offer_gathered(offer)
        .await
        .map_err(|err| ApiError::Internal(format!("failed to answer: {err}")))?;
    info!(peer_id = %peer.id, "answered /connect offer");
    encode_offer(&answer).map_err(|err| ApiError::Internal(err.to_string()))
}

/// Serve `/connect` on the public TCP address.
pub async fn serve(state: Arc<AgentState>, address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(%address, "http signaling listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
