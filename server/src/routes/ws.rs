//! WebSocket handler, one sync session per connection.
//!
//! DESIGN
//! ======
//! The root path doubles as the websocket endpoint: an upgrade request
//! becomes a session, anything else is served the index document. On upgrade
//! the handler generates a session ID, registers it with the relay and enters
//! a `select!` loop:
//! - Incoming client text → forwarded to the relay queue untouched
//! - Outbound text queued by the relay → written to the socket
//!
//! The socket task never inspects or mutates state; the relay owns that.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → `Connected` (relay queues the snapshot)
//! 2. Client text → `Inbound`
//! 3. Close, transport error, or eviction by the relay → `Disconnected`

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tower::ServiceExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::relay::{RelayHandle, SESSION_CHANNEL_CAPACITY};
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_root(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    request: Request,
) -> Response {
    match upgrade {
        Ok(ws) => {
            let relay = state.relay.clone();
            ws.on_upgrade(move |socket| run_ws(socket, relay))
        }
        Err(_) => match state.assets.clone().oneshot(request).await {
            Ok(response) => response.into_response(),
            Err(never) => match never {},
        },
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, relay: RelayHandle) {
    let session_id = Uuid::new_v4();

    // Per-session queue the relay writes snapshots and broadcasts into.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(SESSION_CHANNEL_CAPACITY);
    if !relay.connect(session_id, outbound_tx).await {
        warn!(%session_id, "ws: relay unavailable, closing");
        return;
    }

    info!(%session_id, "ws: session opened");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(%session_id, error = %e, "ws: transport error");
                        break;
                    }
                };
                let text = match msg {
                    Message::Text(text) => text.as_str().to_owned(),
                    Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => text.to_owned(),
                        Err(_) => {
                            warn!(%session_id, len = bytes.len(), "ws: dropping non-utf8 binary message");
                            continue;
                        }
                    },
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                if !relay.inbound(session_id, text).await {
                    break;
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(text) = outbound else {
                    info!(%session_id, "ws: session evicted by relay");
                    break;
                };
                if let Err(e) = socket.send(Message::Text(text.into())).await {
                    debug!(%session_id, error = %e, "ws: send failed");
                    break;
                }
            }
        }
    }

    relay.disconnect(session_id).await;
    info!(%session_id, "ws: session closed");
}
