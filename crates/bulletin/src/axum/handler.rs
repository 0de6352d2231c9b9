use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::BulletinState;
use crate::engine::SyncState;
use crate::protocol::{decode_message, encode_message, ClientMessage, ServerMessage};

/// Handles WebSocket connections for individual presentation clients
///
/// The client receives the current state on connect and again after every
/// change. It may send `ClientMessage`s as lib0-framed binary or plain JSON.
pub struct WebSocketHandler {
    socket: WebSocket,
    state: BulletinState,
}

impl WebSocketHandler {
    /// Create a new WebSocket handler
    pub fn new(socket: WebSocket, state: BulletinState) -> Self {
        Self { socket, state }
    }

    /// Handle the WebSocket connection
    pub async fn handle(self) {
        let (mut ws_sender, mut ws_receiver) = self.socket.split();
        let client_id = Uuid::new_v4().to_string();

        // Error replies from the receiver side go out through the sender task
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        let mut updates = self.state.engine().watch();

        info!(
            "New WebSocket connection established for client {}",
            client_id
        );

        let mut sender_task = {
            let client_id = client_id.clone();
            tokio::spawn(async move {
                let initial = current_state(&mut updates);
                if !send_message(&mut ws_sender, &initial, &client_id).await {
                    return;
                }

                loop {
                    let message = tokio::select! {
                        changed = updates.changed() => match changed {
                            Ok(()) => current_state(&mut updates),
                            Err(_) => break,
                        },
                        Some(message) = rx.recv() => message,
                        else => break,
                    };

                    if !send_message(&mut ws_sender, &message, &client_id).await {
                        break;
                    }
                }
                debug!("Sender task ended for client {}", client_id);
            })
        };

        let mut receiver_task = {
            let state = self.state.clone();
            let client_id = client_id.clone();

            tokio::spawn(async move {
                while let Some(msg) = ws_receiver.next().await {
                    let decoded = match msg {
                        Ok(Message::Binary(data)) => decode_message::<ClientMessage>(&data),
                        Ok(Message::Text(text)) => {
                            serde_json::from_str::<ClientMessage>(text.as_str())
                                .map_err(crate::BulletinError::from)
                        }
                        Ok(Message::Close(_)) => {
                            info!("Client {} closed connection normally", client_id);
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("WebSocket error for client {}: {}", client_id, e);
                            break;
                        }
                    };

                    match decoded {
                        Ok(message) => {
                            if let Some(reply) =
                                handle_client_message(&state, &client_id, message).await
                            {
                                let _ = tx.send(reply);
                            }
                        }
                        Err(e) => {
                            error!("Error decoding message from client {}: {}", client_id, e);
                            let _ = tx.send(ServerMessage::Error {
                                message: format!("Error processing message: {}", e),
                            });
                        }
                    }
                }
                debug!("Receiver task ended for client {}", client_id);
            })
        };

        // Wait for either task to complete (indicating connection should close)
        let completion_reason = tokio::select! {
            _ = &mut sender_task => "sender task completed",
            _ = &mut receiver_task => "receiver task completed",
        };

        sender_task.abort();
        receiver_task.abort();

        info!(
            "WebSocket connection ending for client {} ({})",
            client_id, completion_reason
        );
    }
}

fn current_state(updates: &mut watch::Receiver<SyncState>) -> ServerMessage {
    ServerMessage::State {
        state: updates.borrow_and_update().clone(),
    }
}

/// Encode and send one message; returns false once the socket is unusable
async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
    client_id: &str,
) -> bool {
    match encode_message(message) {
        Ok(encoded) => {
            if let Err(e) = sender.send(Message::Binary(encoded.into())).await {
                error!(
                    "Failed to send WebSocket message to client {}: {}",
                    client_id, e
                );
                return false;
            }
            true
        }
        Err(e) => {
            error!("Failed to encode message for client {}: {}", client_id, e);
            true
        }
    }
}

/// Run a client request against the engine
///
/// The resulting state reaches the client through the watch channel; only
/// rejected requests produce a direct reply.
async fn handle_client_message(
    state: &BulletinState,
    client_id: &str,
    message: ClientMessage,
) -> Option<ServerMessage> {
    let engine = state.engine();

    match message {
        ClientMessage::MarkRead { id } => {
            debug!("Client {} marking '{}' read", client_id, id);
            engine.mark_read(&id).await;
        }
        ClientMessage::MarkAllRead => {
            debug!("Client {} marking all read", client_id);
            engine.mark_all_read().await;
        }
        ClientMessage::Refresh { audience } => {
            // The cache must hold the same audience the feed subscription filters on
            if let Some(requested) = audience.filter(|requested| *requested != state.audience()) {
                warn!(
                    "Client {} asked to refresh audience '{}', serving '{}'",
                    client_id,
                    requested,
                    state.audience()
                );
                return Some(ServerMessage::Error {
                    message: format!(
                        "Refresh is limited to audience '{}'",
                        state.audience()
                    ),
                });
            }
            debug!(
                "Client {} requesting refresh for audience '{}'",
                client_id,
                state.audience()
            );
            engine.fetch(state.audience()).await;
        }
    }
    None
}
