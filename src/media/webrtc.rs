//! Production media session over `webrtc-rs`
//!
//! Wraps an `RTCPeerConnection` with default codecs and interceptors.
//! Candidate gathering is trickled: local candidates surface as events and
//! are forwarded over signaling rather than waiting for gathering to finish.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use super::session::{
    MediaSession, MediaSessionConfig, MediaSessionEvent, MediaSessionFactory, MediaSessionState,
};
use super::source::LocalMediaSource;
use crate::signaling::IceCandidatePayload;
use crate::{Error, Result};

/// Factory producing real peer connections
#[derive(Debug, Default)]
pub struct RtcMediaSessionFactory;

impl RtcMediaSessionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSessionFactory for RtcMediaSessionFactory {
    async fn create(
        &self,
        config: MediaSessionConfig,
        local: Option<&LocalMediaSource>,
        events: mpsc::UnboundedSender<MediaSessionEvent>,
    ) -> Result<Arc<dyn MediaSession>> {
        let session = RtcMediaSession::new(config, local, events).await?;
        Ok(Arc::new(session) as Arc<dyn MediaSession>)
    }
}

struct RtcMediaSession {
    pc: Arc<RTCPeerConnection>,
}

impl RtcMediaSession {
    async fn new(
        config: MediaSessionConfig,
        local: Option<&LocalMediaSource>,
        events: mpsc::UnboundedSender<MediaSessionEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::MediaSessionError(format!("codec registration failed: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::MediaSessionError(format!("interceptor setup failed: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|entry| RTCIceServer {
                    urls: entry.urls.clone(),
                    username: entry.username.clone(),
                    credential: entry.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::MediaSessionError(format!("peer connection failed: {}", e)))?,
        );

        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!("peer connection state: {}", state);
                let mapped = match state {
                    RTCPeerConnectionState::Connecting => Some(MediaSessionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(MediaSessionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(MediaSessionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(MediaSessionState::Failed),
                    RTCPeerConnectionState::Closed => Some(MediaSessionState::Closed),
                    _ => None,
                };
                if let Some(state) = mapped {
                    let _ = events.send(MediaSessionEvent::StateChanged(state));
                }
                Box::pin(async {})
            }));
        }

        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let events = events.clone();
                Box::pin(async move {
                    if let Some(candidate) = candidate {
                        match candidate.to_json() {
                            Ok(init) => {
                                let _ = events.send(MediaSessionEvent::LocalIceCandidate(
                                    IceCandidatePayload {
                                        candidate: init.candidate,
                                        sdp_mid: init.sdp_mid,
                                        sdp_mline_index: init.sdp_mline_index,
                                    },
                                ));
                            }
                            Err(e) => warn!("failed to serialize local candidate: {}", e),
                        }
                    }
                })
            }));
        }

        {
            let events = events.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                debug!(kind = %track.kind(), "remote track");
                let _ = events.send(MediaSessionEvent::RemoteTrack(track));
                Box::pin(async {})
            }));
        }

        // Sending tracks imply the matching transceivers; without them the
        // session still negotiates receive-only media in both kinds.
        match local {
            Some(source) if !source.is_empty() => {
                for track in source.tracks() {
                    pc.add_track(track).await.map_err(|e| {
                        Error::MediaTrackError(format!("failed to attach local track: {}", e))
                    })?;
                }
                if source.audio().is_none() {
                    Self::add_recv_only(&pc, RTPCodecType::Audio).await?;
                }
                if source.video().is_none() {
                    Self::add_recv_only(&pc, RTPCodecType::Video).await?;
                }
            }
            _ => {
                Self::add_recv_only(&pc, RTPCodecType::Audio).await?;
                Self::add_recv_only(&pc, RTPCodecType::Video).await?;
            }
        }

        Ok(Self { pc })
    }

    async fn add_recv_only(pc: &Arc<RTCPeerConnection>, kind: RTPCodecType) -> Result<()> {
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|e| Error::MediaSessionError(format!("failed to add {} transceiver: {}", kind, e)))?;
        Ok(())
    }
}

#[async_trait]
impl MediaSession for RtcMediaSession {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("failed to create offer: {}", e)))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("failed to set local offer: {}", e)))?;
        Ok(sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| Error::SdpError(format!("invalid remote offer: {}", e)))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("failed to set remote offer: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("failed to create answer: {}", e)))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("failed to set local answer: {}", e)))?;
        Ok(sdp)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| Error::SdpError(format!("invalid remote answer: {}", e)))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("failed to set remote answer: {}", e)))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidatePayload) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| Error::IceCandidateError(format!("failed to add candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| Error::MediaSessionError(format!("failed to close session: {}", e)))
    }
}
