//! Carrier media WebSocket endpoint
//!
//! `wss://…/v1/telnyx/media/{call_control_id}?token=…`. The token must
//! match the configured constant exactly or the upgrade is refused. Frames
//! are forwarded verbatim to the call's event queue; all parsing happens
//! inside the session's ingest.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::AppState;
use crate::call::CallEvent;

#[derive(Debug, Deserialize)]
pub struct MediaQuery {
    #[serde(default)]
    token: String,
}

pub async fn handle(
    ws: WebSocketUpgrade,
    Path(call_control_id): Path<String>,
    Query(query): Query<MediaQuery>,
    State(state): State<AppState>,
) -> Response {
    let expected = state.config.server.media_stream_token.as_bytes();
    let token_ok: bool = query.token.as_bytes().ct_eq(expected).into();
    if !token_ok {
        warn!(call_control_id = %call_control_id, "media ws rejected: bad token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| run_socket(socket, call_control_id, state))
}

async fn run_socket(mut socket: WebSocket, call_control_id: String, state: AppState) {
    if !state.manager.has_session(&call_control_id).await {
        warn!(call_control_id = %call_control_id, "media ws for unknown call; closing");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    info!(call_control_id = %call_control_id, "media ws connected");
    state
        .manager
        .enqueue(&call_control_id, CallEvent::MediaConnected)
        .await;

    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Text(text)) => {
                state
                    .manager
                    .enqueue(&call_control_id, CallEvent::MediaText(text.to_string()))
                    .await;
            }
            Ok(Message::Binary(bytes)) => {
                // The carrier speaks JSON text frames; binary is unexpected
                debug!(
                    call_control_id = %call_control_id,
                    len = bytes.len(),
                    "ignoring binary media ws frame"
                );
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(call_control_id = %call_control_id, error = %e, "media ws error");
                break;
            }
        }
    }

    info!(call_control_id = %call_control_id, "media ws disconnected");
    state
        .manager
        .enqueue(&call_control_id, CallEvent::MediaClosed)
        .await;
}
