//! Presence roster replica.
//!
//! Each client is the single writer of its own [`Participant`] record and
//! holds read-only replicas of everybody else's. Replicas are reconciled with
//! last-writer-wins on the author's `updated_at` and pruned by any observer
//! once no traffic has been seen from them within the grace window.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::channel::PresenceUpdate;
use crate::model::{Participant, ParticipantId, PresencePatch, Timestamp};

#[derive(Debug, Clone, PartialEq)]
pub enum RosterChange {
    Joined(Participant),
    /// Same id announced with a later `joined_at`: a new process replaced
    /// one that never sent `leave`.
    Rejoined(Participant),
    Updated(Participant),
    Left(ParticipantId),
    /// Liveness refresh with no visible change.
    Unchanged,
    Ignored,
}

#[derive(Debug, Clone)]
struct RemoteEntry {
    participant: Participant,
    updated_at: Timestamp,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct Roster {
    local: Participant,
    local_updated_at: Timestamp,
    remotes: BTreeMap<ParticipantId, RemoteEntry>,
    /// `updated_at` of the leave (or prune) that removed a participant.
    tombstones: HashMap<ParticipantId, Timestamp>,
    grace: Duration,
}

impl Roster {
    pub fn new(local: Participant, grace: Duration) -> Self {
        Self {
            local,
            local_updated_at: 0,
            remotes: BTreeMap::new(),
            tombstones: HashMap::new(),
            grace,
        }
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    pub fn get(&self, participant_id: &str) -> Option<&Participant> {
        if participant_id == self.local.participant_id {
            return Some(&self.local);
        }
        self.remotes.get(participant_id).map(|entry| &entry.participant)
    }

    pub fn remote_ids(&self) -> Vec<ParticipantId> {
        self.remotes.keys().cloned().collect()
    }

    /// Number of participants including the local one.
    pub fn count(&self) -> usize {
        self.remotes.len() + 1
    }

    fn stamp(&mut self, now: Timestamp) -> Timestamp {
        self.local_updated_at = now.max(self.local_updated_at + 1);
        self.local_updated_at
    }

    /// Applies a change to the local record and returns the delta to publish,
    /// or `None` when nothing actually changed.
    pub fn apply_local(&mut self, patch: PresencePatch, now: Timestamp) -> Option<PresenceUpdate> {
        let before = self.local.clone();
        patch.apply_to(&mut self.local);
        if self.local == before {
            return None;
        }
        Some(PresenceUpdate::Delta {
            participant_id: self.local.participant_id.clone(),
            patch,
            updated_at: self.stamp(now),
        })
    }

    pub fn announce(&mut self, now: Timestamp) -> PresenceUpdate {
        PresenceUpdate::Announce {
            participant: self.local.clone(),
            updated_at: self.stamp(now),
        }
    }

    pub fn leave(&mut self, now: Timestamp) -> PresenceUpdate {
        PresenceUpdate::Leave {
            participant_id: self.local.participant_id.clone(),
            updated_at: self.stamp(now),
        }
    }

    /// Folds a presence update received from `sender` into the replica.
    pub fn apply_remote(&mut self, update: &PresenceUpdate, sender: &str, seen: Instant) -> RosterChange {
        let participant_id = update.participant_id();
        if participant_id != sender {
            tracing::warn!(
                participant_id = %participant_id,
                sender = %sender,
                "Ignoring presence update for another participant"
            );
            return RosterChange::Ignored;
        }
        if participant_id == self.local.participant_id {
            return RosterChange::Ignored;
        }

        let updated_at = update.updated_at();
        match update {
            PresenceUpdate::Announce { participant, .. } => {
                if self
                    .tombstones
                    .get(participant_id)
                    .is_some_and(|left_at| *left_at >= updated_at)
                {
                    return RosterChange::Ignored;
                }
                self.tombstones.remove(participant_id);

                match self.remotes.get_mut(participant_id) {
                    Some(entry) if participant.joined_at > entry.participant.joined_at => {
                        tracing::info!(participant_id = %participant_id, "Participant rejoined roster");
                        *entry = RemoteEntry {
                            participant: participant.clone(),
                            updated_at,
                            last_seen: seen,
                        };
                        RosterChange::Rejoined(participant.clone())
                    }
                    Some(entry) if participant.joined_at < entry.participant.joined_at => RosterChange::Ignored,
                    Some(entry) => {
                        entry.last_seen = seen;
                        if updated_at <= entry.updated_at {
                            return RosterChange::Unchanged;
                        }
                        entry.updated_at = updated_at;
                        if entry.participant == *participant {
                            return RosterChange::Unchanged;
                        }
                        entry.participant = participant.clone();
                        RosterChange::Updated(participant.clone())
                    }
                    None => {
                        tracing::info!(
                            participant_id = %participant_id,
                            role = %participant.role,
                            "Participant joined roster"
                        );
                        self.remotes.insert(
                            participant_id.to_string(),
                            RemoteEntry {
                                participant: participant.clone(),
                                updated_at,
                                last_seen: seen,
                            },
                        );
                        RosterChange::Joined(participant.clone())
                    }
                }
            }
            PresenceUpdate::Delta { patch, .. } => {
                let Some(entry) = self.remotes.get_mut(participant_id) else {
                    return RosterChange::Ignored;
                };
                entry.last_seen = seen;
                if updated_at <= entry.updated_at {
                    return RosterChange::Unchanged;
                }
                entry.updated_at = updated_at;
                patch.apply_to(&mut entry.participant);
                RosterChange::Updated(entry.participant.clone())
            }
            PresenceUpdate::Leave { .. } => {
                if self
                    .remotes
                    .get(participant_id)
                    .is_some_and(|entry| entry.updated_at > updated_at)
                {
                    return RosterChange::Ignored;
                }
                let left_at = self.tombstones.entry(participant_id.to_string()).or_insert(0);
                *left_at = (*left_at).max(updated_at);
                match self.remotes.remove(participant_id) {
                    Some(_) => {
                        tracing::info!(participant_id = %participant_id, "Participant left roster");
                        RosterChange::Left(participant_id.to_string())
                    }
                    None => RosterChange::Ignored,
                }
            }
        }
    }

    /// Drops replicas not heard from within the grace window.
    pub fn prune(&mut self, now: Instant) -> Vec<ParticipantId> {
        let stale: Vec<ParticipantId> = self
            .remotes
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > self.grace)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(entry) = self.remotes.remove(id) {
                tracing::info!(participant_id = %id, "Pruned stale participant");
                self.tombstones.insert(id.clone(), entry.updated_at);
            }
        }
        stale
    }

    /// Local participant first, then remotes by join time.
    pub fn snapshot(&self) -> Vec<Participant> {
        let mut remotes: Vec<Participant> = self.remotes.values().map(|e| e.participant.clone()).collect();
        remotes.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.participant_id.cmp(&b.participant_id))
        });
        let mut roster = Vec::with_capacity(remotes.len() + 1);
        roster.push(self.local.clone());
        roster.extend(remotes);
        roster
    }
}
