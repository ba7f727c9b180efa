use thiserror::Error;

/// Error taxonomy for the live classroom core
#[derive(Debug, Error)]
pub enum ClassroomError {
    /// Role-gated command attempted by the wrong role. Never sent over the wire.
    #[error("Participant {0} is not authorized for this operation")]
    Unauthorized(String),

    /// Lifecycle command issued from a state that has no such edge.
    #[error("Invalid transition from {from} on {command}")]
    InvalidTransition { from: String, command: String },

    /// Camera/microphone denied or absent.
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Recording unsupported: {0}")]
    RecordingUnsupported(String),

    /// Sustained transport failure; commands fail fast instead of buffering.
    #[error("Session channel for room {0} is disconnected")]
    ChannelDisconnected(String),

    /// Isolated to one remote participant.
    #[error("Peer connection to {peer_id} failed: {reason}")]
    PeerConnectionFailed { peer_id: String, reason: String },

    #[error("Peer {0} not found")]
    PeerNotFound(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebRTC API error: {0}")]
    WebRtc(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Archive hand-off failed: {0}")]
    Archive(String),

    #[error("Identity lookup failed: {0}")]
    Identity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using ClassroomError
pub type Result<T> = std::result::Result<T, ClassroomError>;

impl ClassroomError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ClassroomError::Internal(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        ClassroomError::Transport(msg.into())
    }

    pub fn peer_failed(peer_id: impl Into<String>, reason: impl ToString) -> Self {
        ClassroomError::PeerConnectionFailed {
            peer_id: peer_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the room keeps functioning after this error.
    ///
    /// Only configuration problems and internal faults are treated as fatal;
    /// media, channel and peer failures degrade the session instead.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ClassroomError::Configuration(_) | ClassroomError::Internal(_)
        )
    }
}

impl From<webrtc::Error> for ClassroomError {
    fn from(err: webrtc::Error) -> Self {
        ClassroomError::WebRtc(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClassroomError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClassroomError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for ClassroomError {
    fn from(err: reqwest::Error) -> Self {
        ClassroomError::Transport(err.to_string())
    }
}
