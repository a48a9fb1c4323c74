use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    middleware::AuthUser,
    state::AppState,
    websocket::types::{ClientMessage, ErrorPayload, WsMessage},
};

use super::connection::ConnectionId;

const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Realtime chat socket.
///
/// Clients join conversation rooms, resolve conversations and send live
/// messages; peers in the room receive `receive_message` events. The caller
/// is authenticated before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, user_id: Uuid, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let connection_id = state.ws_connections.add_connection(user_id, tx.clone());

    // Task: send messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to serialize outgoing message: {}", e),
            }
        }
    });

    // Task: receive messages from WebSocket
    let state_clone = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    process_client_message(&text, connection_id, &state_clone).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Heartbeat task
    let tx_heartbeat = tx.clone();
    let mut heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if tx_heartbeat.send(WsMessage::Ping).is_err() {
                break;
            }
        }
    });

    // Stop all tasks when any one finishes
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            heartbeat_task.abort();
        },
        _ = &mut recv_task => {
            send_task.abort();
            heartbeat_task.abort();
        },
        _ = &mut heartbeat_task => {
            send_task.abort();
            recv_task.abort();
        }
    }

    state.ws_connections.remove_connection(connection_id);

    tracing::info!(
        %user_id,
        %connection_id,
        active = state.ws_connections.connection_count(),
        "WebSocket closed"
    );
}

/// Dispatch one client frame. Errors are reported back as `error` frames;
/// the connection always stays open.
async fn process_client_message(text: &str, connection_id: ConnectionId, state: &AppState) {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(%connection_id, "Invalid client message: {}", e);
            state.ws_connections.send_to_connection(
                connection_id,
                WsMessage::Error(ErrorPayload {
                    message: format!("Invalid message format: {}", e),
                }),
            );
            return;
        }
    };

    match client_msg {
        ClientMessage::JoinRoom(request) => {
            state.gateway.join_room(connection_id, request.room_id);
        }

        // Detached: the reply may take a store round-trip.
        ClientMessage::CreateConversation(request) => {
            let gateway = state.gateway.clone();
            tokio::spawn(async move {
                gateway.resolve_or_create_conversation(connection_id, request).await;
            });
        }

        // Awaited in place so one connection's messages keep their order.
        ClientMessage::SendMessage(event) => {
            state.gateway.send_message(connection_id, event).await;
        }

        ClientMessage::Ping => {
            state.ws_connections.send_to_connection(connection_id, WsMessage::Pong);
        }
    }
}
