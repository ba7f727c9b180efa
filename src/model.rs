//! Replicated data model shared by every classroom component.
//!
//! Three record families travel over a room's channel: the [`RoomSession`]
//! lifecycle record (single writer: the teacher), one [`Participant`] record
//! per client (single writer: its owner) and append-only [`Stroke`]s
//! (any writer).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type RoomId = String;
pub type ParticipantId = String;
pub type StrokeId = String;

/// Milliseconds since the Unix epoch, as produced by [`crate::clock::Clock`].
pub type Timestamp = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Teacher => write!(f, "teacher"),
            Role::Student => write!(f, "student"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "teacher" => Ok(Role::Teacher),
            "student" => Ok(Role::Student),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Started,
    Ended,
}

impl SessionStatus {
    /// Position along the only path `waiting -> started -> ended`.
    /// Used to break `updated_at` ties deterministically.
    pub fn rank(self) -> u8 {
        match self {
            SessionStatus::Waiting => 0,
            SessionStatus::Started => 1,
            SessionStatus::Ended => 2,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Waiting => write!(f, "waiting"),
            SessionStatus::Started => write!(f, "started"),
            SessionStatus::Ended => write!(f, "ended"),
        }
    }
}

/// Lifecycle record of one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSession {
    pub room_id: RoomId,
    /// `None` until the teacher's record has been observed.
    pub teacher_id: Option<ParticipantId>,
    pub status: SessionStatus,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl RoomSession {
    /// Placeholder replica held before any record has been seen.
    pub fn pending(room_id: impl Into<RoomId>) -> Self {
        Self {
            room_id: room_id.into(),
            teacher_id: None,
            status: SessionStatus::Waiting,
            started_at: None,
            ended_at: None,
            updated_at: 0,
        }
    }

    pub fn waiting(room_id: impl Into<RoomId>, teacher_id: impl Into<ParticipantId>, now: Timestamp) -> Self {
        Self {
            room_id: room_id.into(),
            teacher_id: Some(teacher_id.into()),
            status: SessionStatus::Waiting,
            started_at: None,
            ended_at: None,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.teacher_id.is_none()
    }

    /// Last-writer-wins ordering: newer `updated_at` first, status rank on ties.
    pub fn supersedes(&self, other: &RoomSession) -> bool {
        (self.updated_at, self.status.rank()) > (other.updated_at, other.status.rank())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Disconnected,
}

impl ConnectionQuality {
    /// Higher is worse.
    pub fn severity(self) -> u8 {
        match self {
            ConnectionQuality::Excellent => 0,
            ConnectionQuality::Good => 1,
            ConnectionQuality::Poor => 2,
            ConnectionQuality::Disconnected => 3,
        }
    }

    pub fn worst(self, other: ConnectionQuality) -> ConnectionQuality {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Presence record of one connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub role: Role,
    pub is_muted: bool,
    pub is_camera_off: bool,
    pub hand_raised: bool,
    #[serde(default)]
    pub is_recording: bool,
    pub connection_quality: ConnectionQuality,
    pub joined_at: Timestamp,
}

impl Participant {
    pub fn new(
        participant_id: impl Into<ParticipantId>,
        display_name: impl Into<String>,
        role: Role,
        joined_at: Timestamp,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            role,
            is_muted: false,
            is_camera_off: false,
            hand_raised: false,
            is_recording: false,
            connection_quality: ConnectionQuality::Excellent,
            joined_at,
        }
    }
}

/// Changed presence fields only; `None` means unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_camera_off: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand_raised: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_recording: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_quality: Option<ConnectionQuality>,
}

impl PresencePatch {
    pub fn is_empty(&self) -> bool {
        *self == PresencePatch::default()
    }

    pub fn apply_to(&self, participant: &mut Participant) {
        if let Some(v) = self.is_muted {
            participant.is_muted = v;
        }
        if let Some(v) = self.is_camera_off {
            participant.is_camera_off = v;
        }
        if let Some(v) = self.hand_raised {
            participant.hand_raised = v;
        }
        if let Some(v) = self.is_recording {
            participant.is_recording = v;
        }
        if let Some(v) = self.connection_quality {
            participant.connection_quality = v;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Pen,
    Highlighter,
    Eraser,
}

impl std::str::FromStr for Tool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pen" => Ok(Tool::Pen),
            "highlighter" => Ok(Tool::Highlighter),
            "eraser" => Ok(Tool::Eraser),
            other => Err(format!("unknown tool: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color { r: 0, g: 0, b: 0 };

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parses `#rrggbb` or `rrggbb`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.strip_prefix('#').unwrap_or(hex);
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        Some(Self::rgb(channel(0)?, channel(2)?, channel(4)?))
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Surface-relative point; both axes are in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// One committed drawing gesture. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub stroke_id: StrokeId,
    pub author_id: ParticipantId,
    pub points: Vec<Point>,
    pub tool: Tool,
    pub color: Color,
    /// Fraction of the surface width.
    pub width: f32,
    pub created_at: Timestamp,
}

impl Stroke {
    /// Deterministic replay order: `created_at`, then `stroke_id`.
    pub fn replay_order(&self, other: &Stroke) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.stroke_id.cmp(&other.stroke_id))
    }
}

/// Opaque reference to lesson material shown next to the surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRef(pub String);
