//! Live classroom synchronization core.
//!
//! Keeps a teacher and students in one shared session: a replicated
//! lifecycle record, a presence roster with per-participant media state, a
//! mesh of WebRTC media links and an append-only collaborative drawing log,
//! all carried over one pub/sub topic per room.

pub mod archive;
pub mod channel;
pub mod classroom;
pub mod clock;
pub mod config;
pub mod drawing;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod media;
pub mod model;
pub mod presence;
pub mod relay;
pub mod telemetry;

pub use classroom::{Classroom, ClassroomCommand, ClassroomDeps, ClassroomSetup, ClassroomView};
pub use error::{ClassroomError, Result};
