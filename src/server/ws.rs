//! Client WebSocket channel to a live hub
//!
//! Text frames carry JSON `HubCommand`s inbound and `HubEvent`s outbound.

use super::{authorize_control, error_response, AppState};
use crate::hub::{HubCommand, HubHandle};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

const MAX_COMMAND_BYTES: usize = 1024 * 1024;

pub(super) async fn session_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize_control(&state, &headers) {
        return resp;
    }
    let Some(hub) = state.hubs.get(&session_id).await else {
        return error_response(StatusCode::NOT_FOUND, "no live hub for session");
    };
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn send_json(ws_tx: &mut SplitSink<WebSocket, Message>, payload: &impl Serialize) -> bool {
    match serde_json::to_string(payload) {
        Ok(text) => ws_tx.send(Message::Text(text.into())).await.is_ok(),
        Err(err) => {
            warn!(error = %err, "failed to serialize hub event");
            false
        }
    }
}

async fn send_error(ws_tx: &mut SplitSink<WebSocket, Message>, message: &str) -> bool {
    send_json(ws_tx, &json!({ "type": "error", "message": message })).await
}

async fn handle_socket(socket: WebSocket, hub: HubHandle) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = hub.subscribe();
    debug!(session_id = %hub.session_id(), "Client socket connected");

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => {
                    if !send_json(&mut ws_tx, &event).await {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %hub.session_id(), skipped, "Client socket lagged behind hub events");
                }
                Err(RecvError::Closed) => break,
            },
            () = hub.closed() => {
                let _ = send_error(&mut ws_tx, "session hub closed").await;
                break;
            }
            maybe_msg = ws_rx.next() => {
                let Some(Ok(msg)) = maybe_msg else {
                    break;
                };
                match msg {
                    Message::Text(text) => {
                        if text.len() > MAX_COMMAND_BYTES {
                            if !send_error(&mut ws_tx, "command too large").await {
                                break;
                            }
                            continue;
                        }
                        match serde_json::from_str::<HubCommand>(text.as_str()) {
                            Ok(HubCommand::ProviderCrashed { .. }) => {
                                if !send_error(&mut ws_tx, "crash reports come from the provider").await {
                                    break;
                                }
                            }
                            Ok(command) => {
                                if hub.send(command).await.is_err() {
                                    let _ = send_error(&mut ws_tx, "session hub closed").await;
                                    break;
                                }
                            }
                            Err(e) => {
                                if !send_error(&mut ws_tx, &format!("invalid command: {e}")).await {
                                    break;
                                }
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        if ws_tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) | Message::Pong(_) => {}
                }
            }
        }
    }
    debug!(session_id = %hub.session_id(), "Client socket disconnected");
}
