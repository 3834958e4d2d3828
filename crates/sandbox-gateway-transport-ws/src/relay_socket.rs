//! Relay WebSocket endpoints
//!
//! Each socket gets a writer task draining its relay queue and a read loop
//! that decodes frames and hands them to the hub.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use sandbox_gateway_core::relay::{RelayCommand, RelayConnection, Role, SessionRelay};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// `GET /relay`: viewer clients
pub async fn client_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve(socket, state.relay, Role::Client))
}

/// `GET /relay/agent`: in-sandbox agents
pub async fn agent_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve(socket, state.relay, Role::Agent))
}

async fn serve(socket: WebSocket, relay: Arc<SessionRelay>, role: Role) {
    let RelayConnection { id, mut events, .. } = relay.connect(role).await;
    info!(conn = %id, ?role, "Relay socket connected");

    let (mut sender, mut receiver) = socket.split();

    // Outbound: relay queue -> socket
    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(conn = %id, error = %e, "Failed to encode relay event");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound: socket -> relay
    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!(conn = %id, "Ignoring non UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            // Ping/pong handled by axum
            Ok(_) => continue,
            Err(e) => {
                debug!(conn = %id, error = %e, "Relay socket read failed");
                break;
            }
        };

        let command: RelayCommand = match serde_json::from_str(&text) {
            Ok(command) => command,
            Err(e) => {
                warn!(conn = %id, error = %e, "Ignoring malformed relay frame");
                continue;
            }
        };

        // Commands may run for a long time; they are not serialized per sandbox
        if matches!(command, RelayCommand::CommandInput { .. }) {
            let relay = relay.clone();
            tokio::spawn(async move { relay.handle(id, command).await });
        } else {
            relay.handle(id, command).await;
        }
    }

    relay.disconnect(id).await;
    if let Err(e) = writer.await {
        debug!(conn = %id, error = %e, "Relay writer task ended abnormally");
    }
    info!(conn = %id, "Relay socket disconnected");
}
