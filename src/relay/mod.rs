//! Self-hosted WebSocket relay implementing the session channel server side.
//!
//! Every room is a topic. Frames are fanned out to every connection in the
//! room, the sender's included, and the latest lifecycle and roster state is
//! retained so (re)connecting clients can resync.

mod connection;
mod routes;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

pub use routes::routes;

use crate::channel::{Envelope, RetainedSnapshot};
use crate::error::{ClassroomError, Result};
use crate::model::{ParticipantId, RoomId};

pub type ConnectionId = u64;

struct RelayConnection {
    participant_id: ParticipantId,
    sender: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct RelayRoom {
    connections: HashMap<ConnectionId, RelayConnection>,
    retained: RetainedSnapshot,
}

pub struct RelayState {
    rooms: RwLock<HashMap<RoomId, RelayRoom>>,
    next_connection: AtomicU64,
}

impl RelayState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        })
    }

    /// Adds a connection and sends it the retained snapshot followed by
    /// `sync_complete`.
    pub async fn register(
        &self,
        room_id: &str,
        participant_id: &str,
        sender: mpsc::UnboundedSender<String>,
    ) -> Result<ConnectionId> {
        let connection_id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_default();

        for envelope in room.retained.replay() {
            sender
                .send(serde_json::to_string(&envelope)?)
                .map_err(|_| ClassroomError::transport("connection closed during resync"))?;
        }
        sender
            .send(serde_json::to_string(&Envelope::sync_complete(room_id))?)
            .map_err(|_| ClassroomError::transport("connection closed during resync"))?;

        room.connections.insert(
            connection_id,
            RelayConnection {
                participant_id: participant_id.to_string(),
                sender,
            },
        );
        tracing::info!(
            room_id = %room_id,
            participant_id = %participant_id,
            connection_id,
            connections = room.connections.len(),
            "Relay connection registered"
        );
        Ok(connection_id)
    }

    /// Validates and fans out one frame received from `participant_id`.
    pub async fn publish(&self, room_id: &str, participant_id: &str, frame: &str) -> Result<()> {
        let envelope: Envelope = serde_json::from_str(frame)?;
        if envelope.room_id != room_id || envelope.sender_id != participant_id {
            return Err(ClassroomError::Unauthorized(format!(
                "{participant_id} cannot publish as {} in room {}",
                envelope.sender_id, envelope.room_id
            )));
        }

        let text = serde_json::to_string(&envelope)?;
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| ClassroomError::internal(format!("room {room_id} is not registered")))?;
        room.retained.record(&envelope);
        for connection in room.connections.values() {
            let _ = connection.sender.send(text.clone());
        }
        tracing::debug!(
            room_id = %room_id,
            sender_id = %participant_id,
            family = envelope.message.family(),
            seq = envelope.seq,
            "Relayed message"
        );
        Ok(())
    }

    /// Removes a connection. A participant's retained presence goes with its
    /// last connection. The lifecycle record outlives every connection so the
    /// room can be resumed; an empty room without one is dropped.
    pub async fn unregister(&self, room_id: &str, connection_id: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        let Some(connection) = room.connections.remove(&connection_id) else {
            return;
        };

        let still_connected = room
            .connections
            .values()
            .any(|c| c.participant_id == connection.participant_id);
        if !still_connected {
            room.retained.forget_participant(&connection.participant_id);
        }
        tracing::info!(
            room_id = %room_id,
            participant_id = %connection.participant_id,
            connection_id,
            "Relay connection closed"
        );

        if room.connections.is_empty() && room.retained.lifecycle().is_none() {
            rooms.remove(room_id);
            tracing::info!(room_id = %room_id, "Room closed on relay");
        }
    }

    pub async fn snapshot(&self, room_id: &str) -> Option<RetainedSnapshot> {
        self.rooms.read().await.get(room_id).map(|room| room.retained.clone())
    }

    /// Rooms with at least one live connection.
    pub async fn room_count(&self) -> usize {
        self.rooms
            .read()
            .await
            .values()
            .filter(|room| !room.connections.is_empty())
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.rooms.read().await.values().map(|room| room.connections.len()).sum()
    }
}
