//! WebSocket endpoint agents connect to.
//!
//! `GET /ws/agent/{id}` upgrades into one session per agent. Two loops run
//! per connection:
//!
//! - **Writer**: drains the agent's mailbox and ships each `ServerMessage`
//!   as a JSON text frame, interleaving Ping frames to detect half-open
//!   connections.
//! - **Reader**: parses each inbound text frame as an `AgentMessage` and
//!   awaits the session handler before reading the next frame, which is
//!   what gives the protocol its in-order processing guarantee.
//!
//! Disconnects deregister the session; the heartbeat sweep in the daemon
//! decides when the agent itself counts as offline.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kh_protocol::AgentMessage;

use crate::registry::AgentRegistry;
use crate::session::SessionHandler;

/// Seconds between Ping frames on an otherwise idle socket.
const WS_PING_INTERVAL_SECS: u64 = 30;

#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<AgentRegistry>,
    pub handler: SessionHandler,
}

/// Build the agent-facing router.
pub fn router(state: WsState) -> Router {
    Router::new()
        .route("/ws/agent/{agent_id}", get(agent_ws))
        .with_state(state)
}

async fn agent_ws(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<Uuid>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, agent_id, state))
}

async fn run_session(socket: WebSocket, agent_id: Uuid, state: WsState) {
    info!(agent_id = %agent_id, "agent connected");
    let mailbox = state.registry.register(agent_id);
    let (mut sink, mut stream) = socket.split();

    // Writer: mailbox -> socket, with periodic pings.
    let writer = tokio::spawn(async move {
        let mut ping = interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        loop {
            tokio::select! {
                outbound = mailbox.recv_async() => {
                    let Ok(message) = outbound else { break };
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(agent_id = %agent_id, error = %err, "unserializable frame dropped");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: socket -> handler, strictly in order.
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(agent_id = %agent_id, error = %err, "socket read error");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                let message: AgentMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(agent_id = %agent_id, error = %err, "malformed agent frame dropped");
                        continue;
                    }
                };
                if let Err(err) = state.handler.handle_message(agent_id, message).await {
                    warn!(agent_id = %agent_id, error = %err, "agent frame handling failed");
                }
            }
            Message::Close(_) => break,
            // Pong and binary frames carry nothing we consume.
            _ => {}
        }
    }

    state.registry.deregister(agent_id);
    writer.abort();
    info!(agent_id = %agent_id, "agent disconnected");
}
