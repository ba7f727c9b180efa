use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

use super::devices::{LocalMedia, MediaKind};
use super::peer::{PeerConnector, PeerEvent, PeerEventSender, PeerLink, PeerState, PeerStats};
use super::recording::TrackTap;
use crate::channel::IceCandidate;
use crate::config::WebRtcConfig;
use crate::error::{ClassroomError, Result};

fn feedback(typ: &str, parameter: &str) -> RTCPFeedback {
    RTCPFeedback {
        typ: typ.to_string(),
        parameter: parameter.to_string(),
    }
}

/// The two codecs every classroom client sends: VP8 for cameras, Opus for
/// microphones.
fn classroom_codecs() -> [(RTPCodecType, RTCRtpCodecParameters); 2] {
    let vp8 = RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90_000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            // Keyframe recovery after loss depends on fir/pli
            rtcp_feedback: vec![
                feedback("goog-remb", ""),
                feedback("ccm", "fir"),
                feedback("nack", ""),
                feedback("nack", "pli"),
            ],
        },
        payload_type: 96,
        ..Default::default()
    };
    let opus = RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48_000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: Vec::new(),
        },
        payload_type: 111,
        ..Default::default()
    };
    [(RTPCodecType::Video, vp8), (RTPCodecType::Audio, opus)]
}

pub fn create_webrtc_api() -> Result<Arc<API>> {
    let mut media_engine = MediaEngine::default();
    for (kind, codec) in classroom_codecs() {
        media_engine.register_codec(codec, kind)?;
    }
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    // IPv4 only; IPv6 binding fails on many classroom networks
    let mut settings = SettingEngine::default();
    settings.set_network_types(vec![NetworkType::Udp4, NetworkType::Tcp4]);
    settings.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);

    Ok(Arc::new(
        APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build(),
    ))
}

pub fn ice_servers(config: &WebRtcConfig) -> Vec<RTCIceServer> {
    let stun = config.stun_servers.iter().map(|url| RTCIceServer {
        urls: vec![url.clone()],
        ..Default::default()
    });
    let turn = config.turn_servers.iter().map(|server| RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        credential_type: RTCIceCredentialType::Password,
    });
    stun.chain(turn).collect()
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

/// Peer connector backed by the `webrtc` crate.
pub struct WebRtcConnector {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConnector {
    pub fn new(config: &WebRtcConfig) -> Result<Self> {
        Ok(Self {
            api: create_webrtc_api()?,
            ice_servers: ice_servers(config),
        })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        peer_id: &str,
        local: &LocalMedia,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerLink>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);

        for track in local.tracks() {
            let rtp_sender = peer_connection
                .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // Drain RTCP so the interceptors see receiver reports
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        if local.audio.is_none() {
            peer_connection.add_transceiver_from_kind(RTPCodecType::Audio, None).await?;
        }
        if local.video.is_none() {
            peer_connection.add_transceiver_from_kind(RTPCodecType::Video, None).await?;
        }

        {
            let peer_id = peer_id.to_string();
            let events = events.clone();
            peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let peer_id = peer_id.clone();
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(PeerEvent::LocalCandidate {
                                peer_id,
                                candidate: IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                },
                            });
                        }
                        Err(e) => {
                            tracing::warn!(peer_id = %peer_id, error = %e, "Failed to serialize ICE candidate");
                        }
                    }
                })
            }));
        }

        {
            let peer_id = peer_id.to_string();
            let events = events.clone();
            peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                tracing::info!(peer_id = %peer_id, state = %state, "Peer connection state changed");
                let _ = events.send(PeerEvent::StateChanged {
                    peer_id: peer_id.clone(),
                    state: peer_state(state),
                });
                Box::pin(async {})
            }));
        }

        {
            let peer_id = peer_id.to_string();
            peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
                let kind = match track.kind() {
                    RTPCodecType::Video => MediaKind::Video,
                    _ => MediaKind::Audio,
                };
                let tap = Arc::new(TrackTap::new(peer_id.clone(), kind));
                let _ = events.send(PeerEvent::TrackAdded {
                    peer_id: peer_id.clone(),
                    tap: tap.clone(),
                });

                let peer_id = peer_id.clone();
                Box::pin(async move {
                    tracing::info!(peer_id = %peer_id, kind = %kind, ssrc = track.ssrc(), "Remote track received");
                    tokio::spawn(async move {
                        loop {
                            match track.read_rtp().await {
                                Ok((packet, _)) => tap.forward(&packet),
                                Err(e) => {
                                    tracing::debug!(peer_id = %peer_id, kind = %kind, error = %e, "Remote track ended");
                                    break;
                                }
                            }
                        }
                    });
                })
            }));
        }

        Ok(Arc::new(WebRtcLink {
            peer_id: peer_id.to_string(),
            peer_connection,
        }))
    }
}

struct WebRtcLink {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| ClassroomError::InvalidSdp(e.to_string()))?;
        self.peer_connection.set_remote_description(offer).await?;
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| ClassroomError::InvalidSdp(e.to_string()))?;
        self.peer_connection.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let ice_candidate = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.peer_connection.add_ice_candidate(ice_candidate).await?;
        Ok(())
    }

    async fn stats(&self) -> PeerStats {
        let report = self.peer_connection.get_stats().await;
        let round_trip_time = report.reports.values().find_map(|stat| match stat {
            StatsReportType::CandidatePair(pair) if pair.nominated && pair.current_round_trip_time > 0.0 => {
                Some(Duration::from_secs_f64(pair.current_round_trip_time))
            }
            _ => None,
        });
        PeerStats {
            state: peer_state(self.peer_connection.connection_state()),
            round_trip_time,
        }
    }

    async fn close(&self) {
        tracing::info!(peer_id = %self.peer_id, "Closing peer connection");
        if let Err(e) = self.peer_connection.close().await {
            tracing::warn!(peer_id = %self.peer_id, error = %e, "Error while closing peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServer;

    #[test]
    fn test_ice_servers_include_turn_credentials() {
        let config = WebRtcConfig {
            stun_servers: vec!["stun:stun.local:3478".to_string()],
            turn_servers: vec![TurnServer {
                urls: vec!["turn:turn.local:3478".to_string()],
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
        };
        let servers = ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.local:3478".to_string()]);
        assert_eq!(servers[1].username, "user");
    }

    #[test]
    fn test_api_builds() {
        assert!(create_webrtc_api().is_ok());
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(peer_state(RTCPeerConnectionState::Connected), PeerState::Connected);
        assert_eq!(peer_state(RTCPeerConnectionState::Unspecified), PeerState::New);
        assert_eq!(peer_state(RTCPeerConnectionState::Failed), PeerState::Failed);
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_links() {
        let connector = WebRtcConnector::new(&WebRtcConfig {
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
        })
        .unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let local = LocalMedia::default();

        let offerer = connector.connect("b", &local, PeerEventSender::new(1, tx.clone())).await.unwrap();
        let answerer = connector.connect("a", &local, PeerEventSender::new(2, tx)).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        assert!(offer.starts_with("v=0"));
        let answer = answerer.accept_offer(&offer).await.unwrap();
        offerer.accept_answer(&answer).await.unwrap();

        assert!(matches!(
            answerer.accept_answer("not sdp").await,
            Err(ClassroomError::InvalidSdp(_)) | Err(ClassroomError::WebRtc(_))
        ));

        offerer.close().await;
        answerer.close().await;
    }
}
