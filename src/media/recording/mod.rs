mod recorder;
mod state;

pub use recorder::{Recorder, TrackTap};
pub use state::RecordingState;
