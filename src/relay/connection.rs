use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use super::RelayState;

pub async fn handle_room_socket(websocket: WebSocket, state: Arc<RelayState>, room_id: String, participant_id: String) {
    tracing::info!(room_id = %room_id, participant_id = %participant_id, "New relay WebSocket connection");

    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let connection_id = match state.register(&room_id, &participant_id, tx).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(room_id = %room_id, participant_id = %participant_id, error = %e, "Failed to register connection");
            return;
        }
    };

    // Spawn task to send frames to the client
    let sender_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::text(text)).await {
                tracing::error!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) => {
                if message.is_close() {
                    break;
                }
                let Ok(text) = message.to_str() else {
                    continue;
                };
                if let Err(e) = state.publish(&room_id, &participant_id, text).await {
                    tracing::warn!(
                        room_id = %room_id,
                        participant_id = %participant_id,
                        error = %e,
                        raw_message = %text,
                        "Dropping frame"
                    );
                }
            }
            Err(e) => {
                tracing::error!(room_id = %room_id, participant_id = %participant_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    state.unregister(&room_id, connection_id).await;
    sender_task.abort();
    tracing::info!(room_id = %room_id, participant_id = %participant_id, "Relay WebSocket connection closed");
}
