// crates/server/src/ws.rs
//! WebSocket broadcast: `node.created`, `analysis.completed` and periodic
//! `daemon.status` frames as `{type, data, timestamp}` JSON.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let mut events = state.events.subscribe();
    debug!("websocket subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(frame) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    // Lagged subscribers skip missed frames and continue.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "websocket subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Pings are answered by axum; text is ignored.
                    Some(Err(_)) => break,
                }
            }
        }
    }
    debug!("websocket subscriber disconnected");
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_handler))
}
