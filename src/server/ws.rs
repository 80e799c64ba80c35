//! Presence WebSocket endpoint.
//!
//! Each connection registers the user with the [`PresenceHub`], receives a
//! snapshot of who is currently online, then a live feed of join/leave
//! events. The matching leave is guaranteed on every exit path: clean close,
//! transport error, lagged channel, or a missed pong.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::api::SharedState;
use crate::presence::PresenceEvent;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub user_id: String,
}

/// Frames sent to the client over the presence socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsFrame {
    Snapshot { online: Vec<String> },
    Join { user_id: String },
    Leave { user_id: String },
}

impl From<PresenceEvent> for WsFrame {
    fn from(event: PresenceEvent) -> Self {
        match event {
            PresenceEvent::Join { user_id } => WsFrame::Join { user_id },
            PresenceEvent::Leave { user_id } => WsFrame::Leave { user_id },
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.user_id))
}

async fn handle_socket(socket: WebSocket, state: SharedState, user_id: String) {
    let (mut sender, receiver) = socket.split();

    // Snapshot and subscription come from the same lock acquisition, so the
    // feed starts exactly where the snapshot ends.
    let (online, rx) = state.presence.subscribe();
    state.presence.join(&user_id);
    debug!(user_id = %user_id, "presence socket opened");

    let snapshot = serde_json::to_string(&WsFrame::Snapshot { online })
        .unwrap_or_else(|_| String::from("{\"type\":\"snapshot\",\"online\":[]}"));
    if sender.send(Message::Text(snapshot.into())).await.is_ok() {
        run_socket_loop(&mut sender, receiver, rx).await;
    }

    // All exit paths funnel through here.
    state.presence.leave(&user_id);
    debug!(user_id = %user_id, "presence socket closed");
    let _ = sender.send(Message::Close(None)).await;
}

/// Core socket loop with ping/pong keepalive.
///
/// Exits when the client closes, the transport errors, the hub shuts down,
/// or no Pong arrives within [`PONG_TIMEOUT`] of a Ping.
async fn run_socket_loop(
    sender: &mut SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<PresenceEvent>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let frame = WsFrame::from(event);
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(_) => continue,
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
