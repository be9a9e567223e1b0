use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;

use crate::api::AppState;
use crate::scheduler::{StopUpdate, StopView};

/// Client subscription message
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ClientMessage {
    /// Restrict updates to the given stop keys (empty = all stops)
    Subscribe { stop_keys: Vec<String> },
}

/// Server message sent to clients
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ServerMessage {
    /// Initial connection acknowledgment
    Connected { message: String },
    /// Full state of all monitored stops (sent on connect)
    Snapshot { stops: Vec<StopView> },
    /// One stop's state changed during a poll
    StopChanged { update: StopUpdate },
}

/// WebSocket endpoint for stop estimate updates
pub async fn ws_stops(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates_rx = state.updates_tx.subscribe();

    let connected = ServerMessage::Connected {
        message: "Connected to stop updates. Optionally send a subscribe message with stop_keys."
            .to_string(),
    };
    if let Ok(json) = serde_json::to_string(&connected) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    // Initial snapshot so clients do not wait a full poll for state
    let mut stops = Vec::with_capacity(state.stops.len());
    for handle in state.stops.iter() {
        stops.push(handle.view().await);
    }
    if let Ok(json) = serde_json::to_string(&ServerMessage::Snapshot { stops }) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    // Channel to communicate subscriptions from receiver task to sender task
    let (sub_tx, mut sub_rx) = tokio::sync::mpsc::channel::<HashSet<String>>(16);

    // Forward broadcast updates to the WebSocket
    let forward = tokio::spawn(async move {
        // None means all stops
        let mut subscribed: Option<HashSet<String>> = None;
        loop {
            tokio::select! {
                Some(keys) = sub_rx.recv() => {
                    subscribed = if keys.is_empty() { None } else { Some(keys) };
                }
                result = updates_rx.recv() => match result {
                    Ok(update) => {
                        let wanted = subscribed
                            .as_ref()
                            .map_or(true, |keys| keys.contains(&update.stop_key));
                        if !wanted {
                            continue;
                        }
                        let msg = ServerMessage::StopChanged { update };
                        if let Ok(json) = serde_json::to_string(&msg) {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "WebSocket client lagged behind stop updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Text(text) = msg {
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Subscribe { stop_keys }) => {
                    let _ = sub_tx.send(stop_keys.into_iter().collect()).await;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Ignoring malformed WebSocket message");
                }
            }
        }
    }

    forward.abort();
}

/// WebSocket endpoint streaming upstream API request diagnostics
pub async fn ws_requests(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_requests_socket(socket, state))
}

async fn handle_requests_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut requests_rx = state.requests_tx.subscribe();

    let forward = tokio::spawn(async move {
        loop {
            match requests_rx.recv().await {
                Ok(log) => {
                    if let Ok(json) = serde_json::to_string(&log) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Diagnostics client lagged behind request logs");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Drain (and ignore) client messages until the socket closes
    while let Some(Ok(_)) = receiver.next().await {}

    forward.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_uses_type_tag() {
        let msg = ServerMessage::Connected {
            message: "hello".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"connected""#));
    }

    #[test]
    fn test_client_subscribe_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "subscribe", "stop_keys": ["de-brouckère"]}"#)
                .unwrap();
        let ClientMessage::Subscribe { stop_keys } = msg;
        assert_eq!(stop_keys, vec!["de-brouckère".to_string()]);
    }
}
