use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::link::ChannelLink;
use super::message::{ChannelMessage, Envelope};
use super::{ChannelEvent, ChannelState, SessionChannel};
use crate::config::ChannelConfig;
use crate::error::{ClassroomError, Result};

/// Exponential reconnect delay with +/-20% jitter, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        base.mul_f64(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Session channel backed by the `classroom-relay` WebSocket endpoint.
pub struct WebSocketChannel {
    link: Arc<ChannelLink>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    transport: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn room_url(relay_url: &str, room_id: &str, participant_id: &str) -> String {
    format!(
        "{}/rooms/{}?participant={}",
        relay_url.trim_end_matches('/'),
        urlencoding::encode(room_id),
        urlencoding::encode(participant_id)
    )
}

impl WebSocketChannel {
    /// Spawns the transport task and returns immediately in `Connecting`.
    pub fn connect(config: &ChannelConfig, room_id: &str, participant_id: &str) -> Self {
        let link = Arc::new(ChannelLink::new(room_id, participant_id));
        let (tx, rx) = mpsc::unbounded_channel();
        let url = room_url(&config.relay_url, room_id, participant_id);

        let transport = tokio::spawn(run_transport(url, link.clone(), config.clone(), rx));

        Self {
            link,
            outbound: Mutex::new(Some(tx)),
            transport: Mutex::new(Some(transport)),
        }
    }
}

async fn run_transport(
    url: String,
    link: Arc<ChannelLink>,
    config: ChannelConfig,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    let mut backoff = Backoff::new(config.reconnect_initial, config.reconnect_max);
    let mut failures: u32 = 0;

    loop {
        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                failures = 0;
                backoff.reset();
                link.set_state(ChannelState::Connected);

                let (mut write, mut read) = ws_stream.split();
                let closed_locally = loop {
                    tokio::select! {
                        frame = read.next() => match frame {
                            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Envelope>(&text) {
                                Ok(envelope) => link.deliver(ChannelEvent::Message(envelope)),
                                Err(e) => tracing::warn!(error = %e, "Dropping malformed relay frame"),
                            },
                            Some(Ok(Message::Close(_))) | None => break false,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!(room_id = %link.room_id(), error = %e, "Relay connection error");
                                break false;
                            }
                        },
                        outgoing = outbound.recv() => match outgoing {
                            Some(envelope) => {
                                let text = match serde_json::to_string(&envelope) {
                                    Ok(text) => text,
                                    Err(e) => {
                                        tracing::error!(error = %e, "Failed to serialize envelope");
                                        continue;
                                    }
                                };
                                if let Err(e) = write.send(Message::Text(text)).await {
                                    tracing::warn!(room_id = %link.room_id(), error = %e, "Failed to send to relay");
                                    break false;
                                }
                            }
                            None => {
                                let _ = write.close().await;
                                break true;
                            }
                        },
                    }
                };

                if closed_locally {
                    return;
                }
                link.set_state(ChannelState::Disconnected);
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    url = %url,
                    attempt = failures,
                    error = %e,
                    "Relay connection attempt failed"
                );
                if failures >= config.failure_threshold {
                    link.set_state(ChannelState::Disconnected);
                }
            }
        }

        // Anything published in the gap was already too late; only watch for close.
        let delay = backoff.next_delay();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                outgoing = outbound.recv() => {
                    if outgoing.is_none() {
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl SessionChannel for WebSocketChannel {
    fn room_id(&self) -> &str {
        self.link.room_id()
    }

    fn participant_id(&self) -> &str {
        self.link.participant_id()
    }

    fn state(&self) -> ChannelState {
        self.link.state()
    }

    fn publish(&self, message: ChannelMessage) -> Result<()> {
        let disconnected = || ClassroomError::ChannelDisconnected(self.link.room_id().to_string());
        if !self.link.is_connected() {
            return Err(disconnected());
        }
        let envelope = self.link.next_envelope(message);
        let outbound = lock(&self.outbound);
        let sender = outbound.as_ref().ok_or_else(disconnected)?;
        sender.send(envelope).map_err(|_| disconnected())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.link.subscribe()
    }

    async fn close(&self) {
        lock(&self.outbound).take();
        let transport = lock(&self.transport).take();
        if let Some(handle) = transport {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                tracing::warn!(room_id = %self.link.room_id(), "Transport task did not stop in time");
            }
        }
        self.link.set_state(ChannelState::Disconnected);
    }
}
