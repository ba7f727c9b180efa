use std::time::Duration;

use super::peer::{PeerState, PeerStats};
use crate::model::ConnectionQuality;

const EXCELLENT_RTT: Duration = Duration::from_millis(150);
const GOOD_RTT: Duration = Duration::from_millis(400);

/// Maps peer statistics to the four display levels. Display only; nothing
/// functional depends on the result.
pub fn estimate_quality(stats: &PeerStats) -> ConnectionQuality {
    match stats.state {
        PeerState::Failed | PeerState::Closed | PeerState::Disconnected => ConnectionQuality::Disconnected,
        PeerState::New | PeerState::Connecting => ConnectionQuality::Good,
        PeerState::Connected => match stats.round_trip_time {
            None => ConnectionQuality::Good,
            Some(rtt) if rtt < EXCELLENT_RTT => ConnectionQuality::Excellent,
            Some(rtt) if rtt < GOOD_RTT => ConnectionQuality::Good,
            Some(_) => ConnectionQuality::Poor,
        },
    }
}

/// Worst quality across peers; excellent when there are none.
pub fn aggregate<I>(qualities: I) -> ConnectionQuality
where
    I: IntoIterator<Item = ConnectionQuality>,
{
    qualities
        .into_iter()
        .fold(ConnectionQuality::Excellent, ConnectionQuality::worst)
}
