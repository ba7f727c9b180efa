use std::collections::BTreeMap;

use serde::Serialize;

use super::message::{ChannelMessage, Envelope, PresenceUpdate};
use crate::model::{ParticipantId, RoomSession};

/// Latest lifecycle and roster state of one room topic.
///
/// Replayed to every (re)connecting subscriber so it can resync without the
/// full message history. Strokes are deliberately not retained.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RetainedSnapshot {
    lifecycle: Option<Envelope>,
    presence: BTreeMap<ParticipantId, RetainedPresence>,
}

#[derive(Debug, Clone, Serialize)]
struct RetainedPresence {
    announce: Envelope,
    /// Deltas published since `announce`, in arrival order.
    deltas: Vec<Envelope>,
}

impl RetainedSnapshot {
    pub fn record(&mut self, envelope: &Envelope) {
        match &envelope.message {
            ChannelMessage::Lifecycle { session } => {
                let newer = match self.lifecycle() {
                    Some(current) => session.supersedes(current),
                    None => true,
                };
                if newer {
                    self.lifecycle = Some(envelope.clone());
                }
            }
            ChannelMessage::Presence { update } => self.record_presence(update, envelope),
            ChannelMessage::Stroke { .. } | ChannelMessage::Signal { .. } | ChannelMessage::SyncComplete => {}
        }
    }

    fn record_presence(&mut self, update: &PresenceUpdate, envelope: &Envelope) {
        let participant_id = update.participant_id();
        match update {
            PresenceUpdate::Announce { updated_at, .. } => {
                let stale = self
                    .presence
                    .get(participant_id)
                    .and_then(|p| presence_stamp(&p.announce))
                    .is_some_and(|retained| retained > *updated_at);
                if !stale {
                    self.presence.insert(
                        participant_id.to_string(),
                        RetainedPresence {
                            announce: envelope.clone(),
                            deltas: Vec::new(),
                        },
                    );
                }
            }
            PresenceUpdate::Delta { .. } => {
                if let Some(retained) = self.presence.get_mut(participant_id) {
                    retained.deltas.push(envelope.clone());
                }
            }
            PresenceUpdate::Leave { .. } => {
                self.presence.remove(participant_id);
            }
        }
    }

    pub fn forget_participant(&mut self, participant_id: &str) {
        self.presence.remove(participant_id);
    }

    pub fn lifecycle(&self) -> Option<&RoomSession> {
        match self.lifecycle.as_ref().map(|e| &e.message) {
            Some(ChannelMessage::Lifecycle { session }) => Some(session),
            _ => None,
        }
    }

    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.presence.keys().cloned().collect()
    }

    /// Envelopes to send a (re)connecting subscriber, lifecycle first.
    pub fn replay(&self) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        if let Some(lifecycle) = &self.lifecycle {
            envelopes.push(lifecycle.clone());
        }
        for retained in self.presence.values() {
            envelopes.push(retained.announce.clone());
            envelopes.extend(retained.deltas.iter().cloned());
        }
        envelopes
    }
}

fn presence_stamp(envelope: &Envelope) -> Option<u64> {
    match &envelope.message {
        ChannelMessage::Presence { update } => Some(update.updated_at()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Participant, PresencePatch, Role, SessionStatus};

    fn envelope(sender: &str, message: ChannelMessage) -> Envelope {
        Envelope {
            room_id: "r1".into(),
            sender_id: sender.into(),
            seq: 1,
            message,
        }
    }

    fn lifecycle(status: SessionStatus, updated_at: u64) -> Envelope {
        let mut session = RoomSession::waiting("r1", "t1", updated_at);
        session.status = status;
        envelope("t1", ChannelMessage::Lifecycle { session })
    }

    fn announce(id: &str, updated_at: u64) -> Envelope {
        envelope(
            id,
            ChannelMessage::Presence {
                update: PresenceUpdate::Announce {
                    participant: Participant::new(id, id, Role::Student, 0),
                    updated_at,
                },
            },
        )
    }

    fn delta(id: &str, updated_at: u64) -> Envelope {
        envelope(
            id,
            ChannelMessage::Presence {
                update: PresenceUpdate::Delta {
                    participant_id: id.into(),
                    patch: PresencePatch {
                        is_muted: Some(true),
                        ..Default::default()
                    },
                    updated_at,
                },
            },
        )
    }

    #[test]
    fn test_lifecycle_keeps_newest() {
        let mut snapshot = RetainedSnapshot::default();
        snapshot.record(&lifecycle(SessionStatus::Started, 20));
        snapshot.record(&lifecycle(SessionStatus::Waiting, 10));
        assert_eq!(snapshot.lifecycle().map(|s| s.status), Some(SessionStatus::Started));

        snapshot.record(&lifecycle(SessionStatus::Ended, 30));
        assert_eq!(snapshot.lifecycle().map(|s| s.status), Some(SessionStatus::Ended));
    }

    #[test]
    fn test_presence_replay_order_and_reset_on_announce() {
        let mut snapshot = RetainedSnapshot::default();
        snapshot.record(&announce("s1", 1));
        snapshot.record(&delta("s1", 2));
        snapshot.record(&lifecycle(SessionStatus::Waiting, 5));

        let replay = snapshot.replay();
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[0].message.family(), "lifecycle");

        snapshot.record(&announce("s1", 3));
        assert_eq!(snapshot.replay().len(), 2);
    }

    #[test]
    fn test_delta_without_announce_is_dropped() {
        let mut snapshot = RetainedSnapshot::default();
        snapshot.record(&delta("ghost", 2));
        assert!(snapshot.replay().is_empty());
    }

    #[test]
    fn test_leave_and_forget() {
        let mut snapshot = RetainedSnapshot::default();
        snapshot.record(&announce("s1", 1));
        snapshot.record(&announce("s2", 1));
        snapshot.record(&envelope(
            "s1",
            ChannelMessage::Presence {
                update: PresenceUpdate::Leave {
                    participant_id: "s1".into(),
                    updated_at: 2,
                },
            },
        ));
        assert_eq!(snapshot.participant_ids(), vec!["s2".to_string()]);

        snapshot.forget_participant("s2");
        assert!(snapshot.participant_ids().is_empty());
    }
}
