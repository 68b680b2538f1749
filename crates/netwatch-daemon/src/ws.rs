//! WebSocket handler for real-time updates

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    // subscribe before the greeting so nothing published after it is missed
    let mut events = state.hub.subscribe();
    let subscriber = events.id();

    info!(subscriber, "WebSocket client connected");

    let hello = json!({
        "type": "hello",
        "message": "Connected to netwatch",
        "version": env!("CARGO_PKG_VERSION"),
        "ts": Utc::now(),
    });
    if sender
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        state.hub.unsubscribe(events);
        return;
    }

    loop {
        tokio::select! {
            // Forward hub events to client
            event = events.recv() => {
                let Some(event) = event else {
                    debug!(subscriber, "Event hub closed");
                    break;
                };
                match serde_json::to_string(event.as_ref()) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, kind = event.kind(), "Failed to encode event"),
                }
            }

            // Handle incoming messages from client
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Handle ping/pong for keepalive
                        if text.as_str().trim() == "ping" {
                            let pong = json!({ "type": "pong" }).to_string();
                            if sender.send(Message::Text(pong.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let dropped = events.dropped();
    state.hub.unsubscribe(events);
    info!(subscriber, dropped, "WebSocket client disconnected");
}
