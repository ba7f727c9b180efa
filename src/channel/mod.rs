//! Per-room ordered publish/subscribe topic.
//!
//! Every client sees every message on its room, its own included. Delivery is
//! at-least-once and ordered per publisher only, so consumers must apply
//! messages idempotently.

mod link;
pub mod memory;
pub mod message;
pub mod retained;
pub mod websocket;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;

pub use memory::{MemoryChannel, MemoryHub};
pub use message::{
    ChannelMessage, Envelope, IceCandidate, PresenceUpdate, SignalMessage, SignalPayload, RELAY_SENDER,
};
pub use retained::RetainedSnapshot;
pub use websocket::{Backoff, WebSocketChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(Envelope),
    StateChanged(ChannelState),
}

#[async_trait]
pub trait SessionChannel: Send + Sync {
    fn room_id(&self) -> &str;

    fn participant_id(&self) -> &str;

    fn state(&self) -> ChannelState;

    /// Fire-and-forget send. Fails with `ChannelDisconnected` instead of
    /// buffering while the transport is down.
    fn publish(&self, message: ChannelMessage) -> Result<()>;

    /// Opens a new inbound queue. The first subscriber also receives
    /// whatever was delivered before it subscribed.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent>;

    async fn close(&self);
}
