use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
    Stopping,
    Stopped,
    Error(String),
}

impl RecordingState {
    pub fn is_active(&self) -> bool {
        matches!(self, RecordingState::Recording)
    }
}
