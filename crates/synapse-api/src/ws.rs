//! `/pipeline` WebSocket namespace.
//!
//! Subscribers receive topology-change events as JSON envelopes
//! `{"event": "pipeline:…", "data": {…}}`, optionally filtered to one
//! model via `?model=`.

use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub model: Option<String>,
}

pub async fn pipeline_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| pipeline_session(socket, state, query.model))
}

async fn pipeline_session(mut socket: WebSocket, state: AppState, model: Option<String>) {
    let mut events = state.bus.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(e) => e,
                    // Slow consumer: skip the lost window and continue
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "websocket subscriber lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                if let Some(model) = &model {
                    if event.model() != model {
                        continue;
                    }
                }

                let envelope = serde_json::json!({
                    "event": event.name(),
                    "data": event,
                });
                let Ok(text) = serde_json::to_string(&envelope) else {
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    debug!("pipeline websocket session closed");
}
