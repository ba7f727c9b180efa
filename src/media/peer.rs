use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::devices::LocalMedia;
use super::recording::TrackTap;
use crate::channel::IceCandidate;
use crate::error::Result;
use crate::model::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerStats {
    pub state: PeerState,
    /// Round trip time of the nominated candidate pair, once measured.
    pub round_trip_time: Option<Duration>,
}

/// Raised by a peer link's transport callbacks.
pub enum PeerEvent {
    LocalCandidate {
        peer_id: ParticipantId,
        candidate: IceCandidate,
    },
    StateChanged {
        peer_id: ParticipantId,
        state: PeerState,
    },
    TrackAdded {
        peer_id: ParticipantId,
        tap: Arc<TrackTap>,
    },
}

impl PeerEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            PeerEvent::LocalCandidate { peer_id, .. }
            | PeerEvent::StateChanged { peer_id, .. }
            | PeerEvent::TrackAdded { peer_id, .. } => peer_id,
        }
    }
}

/// A peer event stamped with the link that raised it.
pub struct LinkEvent {
    pub link_id: u64,
    pub event: PeerEvent,
}

/// Event sender handed to exactly one link, so events from a link that was
/// since replaced can be dropped.
#[derive(Clone)]
pub struct PeerEventSender {
    link_id: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl PeerEventSender {
    pub fn new(link_id: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { link_id, tx }
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Returns false once the media service is gone.
    pub fn send(&self, event: PeerEvent) -> bool {
        self.tx
            .send(LinkEvent {
                link_id: self.link_id,
                event,
            })
            .is_ok()
    }
}

/// Creates media connections to remote participants.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        peer_id: &str,
        local: &LocalMedia,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerLink>>;
}

/// One media connection to one remote participant.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn peer_id(&self) -> &str;

    async fn create_offer(&self) -> Result<String>;

    /// Applies a remote offer and returns the answer SDP.
    async fn accept_offer(&self, sdp: &str) -> Result<String>;

    async fn accept_answer(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn stats(&self) -> PeerStats;

    async fn close(&self);
}
