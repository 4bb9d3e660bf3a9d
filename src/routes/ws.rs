//! `GET /ws` – live stream of pipeline events.
//!
//! Every connected client gets its own broadcast receiver. A client that
//! falls behind is told how many events it missed and keeps going.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::sink::PipelineEvent;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.events.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, rx))
}

async fn stream_events(mut socket: WebSocket, mut rx: broadcast::Receiver<PipelineEvent>) {
    // ---
    info!("WebSocket client connected");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(e) => {
                                error!("Failed to encode {} event: {}", event.kind(), e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            debug!("WebSocket send failed, closing");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged behind by {} events", n);
                        let lag = json!({ "type": "lag_warning", "lagged_by": n }).to_string();
                        if socket.send(Message::Text(lag.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    // Clients have nothing to say
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}
