use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::message::{ChannelMessage, Envelope};
use super::{ChannelEvent, ChannelState};
use crate::model::{ParticipantId, RoomId};

/// Client-side endpoint state shared by the channel adapters.
///
/// Events delivered before anyone subscribed are held back and handed to the
/// first subscriber, so a snapshot replayed right after connecting is never lost.
pub(crate) struct ChannelLink {
    room_id: RoomId,
    participant_id: ParticipantId,
    state: Mutex<ChannelState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
    backlog: Mutex<Vec<ChannelEvent>>,
    seq: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelLink {
    pub(crate) fn new(room_id: impl Into<RoomId>, participant_id: impl Into<ParticipantId>) -> Self {
        Self {
            room_id: room_id.into(),
            participant_id: participant_id.into(),
            state: Mutex::new(ChannelState::Connecting),
            subscribers: Mutex::new(Vec::new()),
            backlog: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn room_id(&self) -> &str {
        &self.room_id
    }

    pub(crate) fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub(crate) fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Updates the state and notifies subscribers when it actually changed.
    pub(crate) fn set_state(&self, next: ChannelState) {
        let changed = {
            let mut state = lock(&self.state);
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            tracing::info!(
                room_id = %self.room_id,
                participant_id = %self.participant_id,
                state = ?next,
                "Session channel state changed"
            );
            self.deliver(ChannelEvent::StateChanged(next));
        }
    }

    pub(crate) fn next_envelope(&self, message: ChannelMessage) -> Envelope {
        Envelope {
            room_id: self.room_id.clone(),
            sender_id: self.participant_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            message,
        }
    }

    pub(crate) fn deliver(&self, event: ChannelEvent) {
        let mut subscribers = lock(&self.subscribers);
        if subscribers.is_empty() {
            lock(&self.backlog).push(event);
            return;
        }
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = lock(&self.subscribers);
        if subscribers.is_empty() {
            for event in lock(&self.backlog).drain(..) {
                let _ = tx.send(event);
            }
        }
        subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backlog_goes_to_first_subscriber() {
        let link = ChannelLink::new("r1", "p1");
        link.set_state(ChannelState::Connected);
        link.deliver(ChannelEvent::Message(Envelope::sync_complete("r1")));

        let mut first = link.subscribe();
        assert_eq!(
            first.try_recv().ok(),
            Some(ChannelEvent::StateChanged(ChannelState::Connected))
        );
        assert!(matches!(first.try_recv(), Ok(ChannelEvent::Message(_))));

        let mut second = link.subscribe();
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let link = ChannelLink::new("r1", "p1");
        let a = link.next_envelope(ChannelMessage::SyncComplete);
        let b = link.next_envelope(ChannelMessage::SyncComplete);
        assert_eq!((a.seq, b.seq), (1, 2));
        assert_eq!(a.sender_id, "p1");
    }

    #[test]
    fn test_unchanged_state_is_not_reported() {
        let link = ChannelLink::new("r1", "p1");
        let mut rx = link.subscribe();
        link.set_state(ChannelState::Connecting);
        assert!(rx.try_recv().is_err());
        link.set_state(ChannelState::Disconnected);
        assert_eq!(
            rx.try_recv().ok(),
            Some(ChannelEvent::StateChanged(ChannelState::Disconnected))
        );
    }
}
