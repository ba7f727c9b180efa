use serde::{Deserialize, Serialize};

use crate::model::{Participant, ParticipantId, PresencePatch, RoomId, RoomSession, Stroke, Timestamp};

/// Sender id used for frames originated by the relay itself.
pub const RELAY_SENDER: &str = "relay";

/// One message on a room topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub room_id: RoomId,
    pub sender_id: ParticipantId,
    /// Per-sender, per-connection sequence number.
    pub seq: u64,
    pub message: ChannelMessage,
}

impl Envelope {
    pub fn sync_complete(room_id: impl Into<RoomId>) -> Self {
        Self {
            room_id: room_id.into(),
            sender_id: RELAY_SENDER.to_string(),
            seq: 0,
            message: ChannelMessage::SyncComplete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelMessage {
    Lifecycle { session: RoomSession },
    Presence { update: PresenceUpdate },
    Stroke { stroke: Stroke },
    Signal { signal: SignalMessage },
    /// Marks the end of the retained snapshot replayed on (re)connect.
    SyncComplete,
}

impl ChannelMessage {
    pub fn family(&self) -> &'static str {
        match self {
            ChannelMessage::Lifecycle { .. } => "lifecycle",
            ChannelMessage::Presence { .. } => "presence",
            ChannelMessage::Stroke { .. } => "stroke",
            ChannelMessage::Signal { .. } => "signal",
            ChannelMessage::SyncComplete => "sync_complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceUpdate {
    /// Full own record; doubles as the heartbeat.
    Announce {
        participant: Participant,
        updated_at: Timestamp,
    },
    Delta {
        participant_id: ParticipantId,
        patch: PresencePatch,
        updated_at: Timestamp,
    },
    Leave {
        participant_id: ParticipantId,
        updated_at: Timestamp,
    },
}

impl PresenceUpdate {
    pub fn participant_id(&self) -> &str {
        match self {
            PresenceUpdate::Announce { participant, .. } => &participant.participant_id,
            PresenceUpdate::Delta { participant_id, .. } | PresenceUpdate::Leave { participant_id, .. } => {
                participant_id
            }
        }
    }

    pub fn updated_at(&self) -> Timestamp {
        match self {
            PresenceUpdate::Announce { updated_at, .. }
            | PresenceUpdate::Delta { updated_at, .. }
            | PresenceUpdate::Leave { updated_at, .. } => *updated_at,
        }
    }
}

/// Peer negotiation addressed to a single participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub to: ParticipantId,
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, SessionStatus};

    #[test]
    fn test_lifecycle_wire_format() {
        let mut session = RoomSession::waiting("r1", "t1", 10);
        session.status = SessionStatus::Started;
        session.started_at = Some(10);
        let envelope = Envelope {
            room_id: "r1".into(),
            sender_id: "t1".into(),
            seq: 1,
            message: ChannelMessage::Lifecycle { session },
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["message"]["kind"], "lifecycle");
        assert_eq!(json["message"]["session"]["status"], "started");
        assert_eq!(json["message"]["session"]["started_at"], 10);
    }

    #[test]
    fn test_presence_delta_parses() {
        let json = r#"{
            "room_id": "r1",
            "sender_id": "s1",
            "seq": 4,
            "message": {
                "kind": "presence",
                "update": {
                    "type": "delta",
                    "participant_id": "s1",
                    "patch": {"hand_raised": true},
                    "updated_at": 99
                }
            }
        }"#;

        let envelope: Envelope = serde_json::from_str(json).unwrap();
        match envelope.message {
            ChannelMessage::Presence { update } => {
                assert_eq!(update.participant_id(), "s1");
                assert_eq!(update.updated_at(), 99);
                assert!(matches!(
                    update,
                    PresenceUpdate::Delta { ref patch, .. } if patch.hand_raised == Some(true)
                ));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_signal_and_sync_complete_tags() {
        let signal = ChannelMessage::Signal {
            signal: SignalMessage {
                to: "p2".into(),
                payload: SignalPayload::Offer { sdp: "v=0".into() },
            },
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["kind"], "signal");
        assert_eq!(json["signal"]["payload"]["type"], "offer");

        let sync = serde_json::to_string(&Envelope::sync_complete("r1")).unwrap();
        assert!(sync.contains(r#""kind":"sync_complete""#));
        assert!(sync.contains(RELAY_SENDER));
    }

    #[test]
    fn test_announce_accessors() {
        let update = PresenceUpdate::Announce {
            participant: Participant::new("p1", "Ada", Role::Student, 5),
            updated_at: 7,
        };
        assert_eq!(update.participant_id(), "p1");
        assert_eq!(update.updated_at(), 7);
        assert_eq!(
            ChannelMessage::Presence { update }.family(),
            "presence"
        );
    }
}
