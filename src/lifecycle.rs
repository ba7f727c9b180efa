//! Session State Machine: `waiting -> started -> ended`.
//!
//! Only the teacher authors transitions. Every client, the teacher included,
//! folds lifecycle records from the channel into its replica with
//! last-writer-wins on `updated_at` (status rank breaks ties), so replicas
//! converge regardless of delivery order.

use serde::Serialize;

use crate::error::{ClassroomError, Result};
use crate::model::{ParticipantId, Role, RoomId, RoomSession, SessionStatus, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    local_id: ParticipantId,
    role: Role,
    session: RoomSession,
}

impl SessionStateMachine {
    pub fn new(room_id: impl Into<RoomId>, local_id: impl Into<ParticipantId>, role: Role) -> Self {
        Self {
            local_id: local_id.into(),
            role,
            session: RoomSession::pending(room_id),
        }
    }

    pub fn session(&self) -> &RoomSession {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Creates the room record when the teacher finds none after resync.
    pub fn open_as_teacher(&mut self, now: Timestamp) -> Option<RoomSession> {
        if self.role != Role::Teacher || !self.session.is_pending() {
            return None;
        }
        self.session = RoomSession::waiting(self.session.room_id.clone(), self.local_id.clone(), now);
        tracing::info!(room_id = %self.session.room_id, teacher_id = %self.local_id, "Room record created");
        Some(self.session.clone())
    }

    /// Record the teacher publishes after every resync: a new room record when
    /// none was replayed, otherwise its current one so a relay that lost the
    /// room gets it back. Republishing is a no-op for replicas under LWW.
    pub fn resync_record(&mut self, now: Timestamp) -> Option<RoomSession> {
        if let Some(created) = self.open_as_teacher(now) {
            return Some(created);
        }
        let owns = self.session.teacher_id.as_deref() == Some(self.local_id.as_str());
        (self.role == Role::Teacher && owns).then(|| self.session.clone())
    }

    /// Returns the record to publish; nothing changes on error.
    pub fn request_start(&mut self, now: Timestamp) -> Result<RoomSession> {
        self.request(SessionStatus::Waiting, SessionStatus::Started, "start", now)
    }

    pub fn request_end(&mut self, now: Timestamp) -> Result<RoomSession> {
        self.request(SessionStatus::Started, SessionStatus::Ended, "end", now)
    }

    fn request(
        &mut self,
        from: SessionStatus,
        to: SessionStatus,
        command: &str,
        now: Timestamp,
    ) -> Result<RoomSession> {
        self.authorize()?;
        if self.session.status != from {
            return Err(ClassroomError::InvalidTransition {
                from: self.session.status.to_string(),
                command: command.to_string(),
            });
        }

        let stamp = now.max(self.session.updated_at + 1);
        let mut next = self.session.clone();
        next.teacher_id.get_or_insert_with(|| self.local_id.clone());
        next.status = to;
        next.updated_at = stamp;
        match to {
            SessionStatus::Started => next.started_at = Some(stamp),
            SessionStatus::Ended => next.ended_at = Some(stamp),
            SessionStatus::Waiting => {}
        }

        tracing::info!(room_id = %next.room_id, from = %from, to = %to, "Lifecycle transition requested");
        self.session = next.clone();
        Ok(next)
    }

    fn authorize(&self) -> Result<()> {
        let is_owner = self
            .session
            .teacher_id
            .as_ref()
            .map_or(true, |teacher| *teacher == self.local_id);
        if self.role != Role::Teacher || !is_owner {
            return Err(ClassroomError::Unauthorized(self.local_id.clone()));
        }
        Ok(())
    }

    /// Folds a lifecycle record received from `sender` into the replica.
    ///
    /// Records not authored by their own teacher, or not newer than the
    /// replica, are ignored. Returns the status change, if any.
    pub fn observe_remote_transition(&mut self, incoming: &RoomSession, sender: &str) -> Option<Transition> {
        if incoming.room_id != self.session.room_id {
            return None;
        }
        let Some(author) = incoming.teacher_id.as_deref() else {
            return None;
        };
        if author != sender {
            tracing::warn!(room_id = %incoming.room_id, sender = %sender, "Ignoring lifecycle record from non-teacher");
            return None;
        }
        if let Some(known) = self.session.teacher_id.as_deref() {
            if known != author {
                tracing::warn!(room_id = %incoming.room_id, teacher_id = %author, "Ignoring lifecycle record from unknown teacher");
                return None;
            }
        }
        if !incoming.supersedes(&self.session) {
            return None;
        }

        let from = self.session.status;
        self.session = incoming.clone();
        (from != incoming.status).then_some(Transition {
            from,
            to: incoming.status,
        })
    }

    pub fn can_start_session(&self) -> bool {
        self.role == Role::Teacher && self.session.status == SessionStatus::Waiting
    }

    pub fn can_join_video(&self) -> bool {
        self.session.status == SessionStatus::Started
    }

    pub fn is_waiting_for_teacher(&self) -> bool {
        self.role == Role::Student && self.session.status == SessionStatus::Waiting
    }

    pub fn is_ended(&self) -> bool {
        self.session.status == SessionStatus::Ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn teacher() -> SessionStateMachine {
        let mut machine = SessionStateMachine::new("r1", "t1", Role::Teacher);
        machine.open_as_teacher(100);
        machine
    }

    fn record(status: SessionStatus, updated_at: Timestamp) -> RoomSession {
        let mut session = RoomSession::waiting("r1", "t1", updated_at);
        session.status = status;
        session
    }

    #[test]
    fn test_teacher_start_and_end() {
        let mut machine = teacher();
        assert!(machine.can_start_session());

        let started = machine.request_start(200).unwrap();
        assert_eq!(started.status, SessionStatus::Started);
        assert_eq!(started.started_at, Some(200));
        assert!(machine.can_join_video());

        let ended = machine.request_end(300).unwrap();
        assert_eq!(ended.ended_at, Some(300));
        assert!(machine.is_ended());
    }

    #[test]
    fn test_resync_record_republishes_current_state() {
        let mut machine = SessionStateMachine::new("r1", "t1", Role::Teacher);
        let created = machine.resync_record(100).unwrap();
        assert_eq!(created.status, SessionStatus::Waiting);

        machine.request_start(200).unwrap();
        let again = machine.resync_record(300).unwrap();
        assert_eq!(again.status, SessionStatus::Started);
        assert_eq!(again.updated_at, 200);

        let mut student = SessionStateMachine::new("r1", "s1", Role::Student);
        assert!(student.resync_record(100).is_none());
        student.observe_remote_transition(&again, "t1");
        assert!(student.resync_record(400).is_none());
    }

    #[test]
    fn test_student_request_is_unauthorized() {
        let mut machine = SessionStateMachine::new("r1", "s1", Role::Student);
        machine.observe_remote_transition(&record(SessionStatus::Waiting, 10), "t1");

        let before = machine.session().clone();
        assert!(matches!(machine.request_start(20), Err(ClassroomError::Unauthorized(_))));
        assert_eq!(machine.session(), &before);
        assert!(machine.is_waiting_for_teacher());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut machine = teacher();
        assert!(matches!(
            machine.request_end(150),
            Err(ClassroomError::InvalidTransition { .. })
        ));

        machine.request_start(200).unwrap();
        machine.request_end(300).unwrap();
        let ended = machine.session().clone();
        assert!(machine.request_start(400).is_err());
        assert!(machine.request_end(400).is_err());
        assert_eq!(machine.session(), &ended);
    }

    #[test]
    fn test_local_stamp_is_strictly_newer() {
        let mut machine = teacher();
        let started = machine.request_start(50).unwrap();
        assert_eq!(started.updated_at, 101);
    }

    #[test]
    fn test_open_only_once_and_only_for_teacher() {
        let mut machine = teacher();
        assert!(machine.open_as_teacher(500).is_none());

        let mut student = SessionStateMachine::new("r1", "s1", Role::Student);
        assert!(student.open_as_teacher(1).is_none());
    }

    #[test]
    fn test_student_follows_teacher() {
        let mut student = SessionStateMachine::new("r1", "s1", Role::Student);
        assert!(student.observe_remote_transition(&record(SessionStatus::Waiting, 10), "t1").is_none());
        assert!(student.is_waiting_for_teacher());
        assert!(!student.can_join_video());

        let transition = student.observe_remote_transition(&record(SessionStatus::Started, 20), "t1");
        assert_eq!(
            transition,
            Some(Transition {
                from: SessionStatus::Waiting,
                to: SessionStatus::Started
            })
        );
        assert!(!student.is_waiting_for_teacher());
        assert!(student.can_join_video());
    }

    #[test]
    fn test_stale_and_forged_records_ignored() {
        let mut student = SessionStateMachine::new("r1", "s1", Role::Student);
        student.observe_remote_transition(&record(SessionStatus::Started, 20), "t1");

        assert!(student.observe_remote_transition(&record(SessionStatus::Waiting, 10), "t1").is_none());
        assert!(student.observe_remote_transition(&record(SessionStatus::Ended, 30), "s2").is_none());

        let mut impostor = record(SessionStatus::Ended, 40);
        impostor.teacher_id = Some("mallory".into());
        assert!(student.observe_remote_transition(&impostor, "mallory").is_none());
        assert_eq!(student.status(), SessionStatus::Started);
    }

    #[test]
    fn test_teacher_echo_is_noop() {
        let mut machine = teacher();
        let started = machine.request_start(200).unwrap();
        assert!(machine.observe_remote_transition(&started, "t1").is_none());
        assert_eq!(machine.status(), SessionStatus::Started);
    }

    fn status_from(n: u8) -> SessionStatus {
        match n {
            0 => SessionStatus::Waiting,
            1 => SessionStatus::Started,
            _ => SessionStatus::Ended,
        }
    }

    proptest! {
        #[test]
        fn prop_final_state_is_newest_record(
            (records, shuffled) in prop::collection::vec((1u64..1_000, 0u8..3), 1..12)
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            let apply = |order: &[(u64, u8)]| {
                let mut student = SessionStateMachine::new("r1", "s1", Role::Student);
                for (ts, status) in order {
                    student.observe_remote_transition(&record(status_from(*status), *ts), "t1");
                }
                (student.session().updated_at, student.status())
            };

            let newest = records
                .iter()
                .map(|(ts, s)| (*ts, status_from(*s)))
                .max_by_key(|(ts, s)| (*ts, s.rank()))
                .unwrap();

            prop_assert_eq!(apply(&records), newest);
            prop_assert_eq!(apply(&shuffled), newest);
        }
    }
}
