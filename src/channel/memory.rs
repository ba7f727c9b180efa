//! In-process broker with the same delivery semantics as the relay.
//!
//! Used by tests and simulations. `disconnect`/`reconnect` model transport
//! loss for one participant: while offline it neither sends nor receives, and
//! on reconnection it gets the retained snapshot followed by `sync_complete`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::link::ChannelLink;
use super::message::{ChannelMessage, Envelope};
use super::retained::RetainedSnapshot;
use super::{ChannelEvent, ChannelState, SessionChannel};
use crate::error::{ClassroomError, Result};
use crate::model::{ParticipantId, RoomId};

#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<RoomId, HubRoom>,
}

#[derive(Default)]
struct HubRoom {
    endpoints: HashMap<ParticipantId, Endpoint>,
    retained: RetainedSnapshot,
}

struct Endpoint {
    link: Arc<ChannelLink>,
    online: bool,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a channel for `participant_id` on `room_id`.
    pub fn connect(&self, room_id: &str, participant_id: &str) -> MemoryChannel {
        let link = Arc::new(ChannelLink::new(room_id, participant_id));
        {
            let mut state = self.state();
            let room = state.rooms.entry(room_id.to_string()).or_default();
            room.endpoints.insert(
                participant_id.to_string(),
                Endpoint {
                    link: link.clone(),
                    online: true,
                },
            );
            link.set_state(ChannelState::Connected);
            replay_to(&link, room);
        }

        tracing::debug!(room_id = %room_id, participant_id = %participant_id, "Memory channel connected");
        MemoryChannel {
            hub: self.clone(),
            link,
        }
    }

    pub fn disconnect(&self, room_id: &str, participant_id: &str) {
        let mut state = self.state();
        if let Some(endpoint) = state
            .rooms
            .get_mut(room_id)
            .and_then(|room| room.endpoints.get_mut(participant_id))
        {
            endpoint.online = false;
            endpoint.link.set_state(ChannelState::Disconnected);
        }
    }

    pub fn reconnect(&self, room_id: &str, participant_id: &str) {
        let mut state = self.state();
        if let Some(room) = state.rooms.get_mut(room_id) {
            if let Some(endpoint) = room.endpoints.get_mut(participant_id) {
                endpoint.online = true;
                let link = endpoint.link.clone();
                link.set_state(ChannelState::Connected);
                replay_to(&link, room);
            }
        }
    }

    pub fn retained(&self, room_id: &str) -> RetainedSnapshot {
        self.state()
            .rooms
            .get(room_id)
            .map(|room| room.retained.clone())
            .unwrap_or_default()
    }

    fn broadcast(&self, envelope: Envelope) {
        let mut state = self.state();
        let Some(room) = state.rooms.get_mut(&envelope.room_id) else {
            return;
        };
        room.retained.record(&envelope);
        for endpoint in room.endpoints.values().filter(|e| e.online) {
            endpoint.link.deliver(ChannelEvent::Message(envelope.clone()));
        }
    }

    fn remove(&self, room_id: &str, participant_id: &str) {
        let mut state = self.state();
        if let Some(room) = state.rooms.get_mut(room_id) {
            room.endpoints.remove(participant_id);
            room.retained.forget_participant(participant_id);
        }
    }
}

fn replay_to(link: &ChannelLink, room: &HubRoom) {
    for envelope in room.retained.replay() {
        link.deliver(ChannelEvent::Message(envelope));
    }
    link.deliver(ChannelEvent::Message(Envelope::sync_complete(link.room_id())));
}

pub struct MemoryChannel {
    hub: MemoryHub,
    link: Arc<ChannelLink>,
}

#[async_trait]
impl SessionChannel for MemoryChannel {
    fn room_id(&self) -> &str {
        self.link.room_id()
    }

    fn participant_id(&self) -> &str {
        self.link.participant_id()
    }

    fn state(&self) -> ChannelState {
        self.link.state()
    }

    fn publish(&self, message: ChannelMessage) -> Result<()> {
        if !self.link.is_connected() {
            return Err(ClassroomError::ChannelDisconnected(self.link.room_id().to_string()));
        }
        let envelope = self.link.next_envelope(message);
        self.hub.broadcast(envelope);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.link.subscribe()
    }

    async fn close(&self) {
        self.hub.remove(self.link.room_id(), self.link.participant_id());
        self.link.set_state(ChannelState::Disconnected);
    }
}
