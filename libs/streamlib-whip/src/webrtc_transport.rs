// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// webrtc-rs backed PeerTransport
//
// Send-only peer connection with H.264 video and Opus audio, the codec set
// WHIP ingest servers expect. Sample writing goes through the exposed tracks.

use crate::config::WhipConfig;
use crate::error::{Result, WhipError};
use crate::sdp::SessionDescription;
use crate::transport::{
    ConnectionState, GatheringState, LocalCandidate, MediaKind, PeerTransport, TransceiverInfo,
    TransportEvent,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>>;

fn publish_event(subscribers: &Subscribers, event: TransportEvent) {
    let mut subscribers = subscribers.lock().unwrap_or_else(|e| e.into_inner());
    subscribers.retain(|tx| tx.send(event.clone()).is_ok());
}

fn transport_err(context: &str, e: impl std::fmt::Display) -> WhipError {
    WhipError::Transport(format!("{}: {}", context, e))
}

/// Media section a gathered candidate belongs to.
///
/// webrtc-rs reports every candidate with an empty `sdpMid` and m-line 0. All
/// media share one bundled ICE transport, so the candidate belongs to the
/// first mid of the BUNDLE group, falling back to the transceiver at the
/// reported m-line index.
async fn resolve_candidate_mid(
    peer_connection: &RTCPeerConnection,
    init: &RTCIceCandidateInit,
) -> Option<String> {
    if let Some(mid) = init.sdp_mid.as_deref().filter(|mid| !mid.is_empty()) {
        return Some(mid.to_owned());
    }

    let bundle_mid = peer_connection
        .local_description()
        .await
        .and_then(|description| {
            let parsed = SessionDescription::parse(&description.sdp).ok()?;
            let group = parsed.attribute("group")?;
            let mut tags = group.split_whitespace();
            match tags.next() {
                Some("BUNDLE") => tags.next().map(str::to_owned),
                _ => None,
            }
        });
    if bundle_mid.is_some() {
        return bundle_mid;
    }

    let index = usize::from(init.sdp_mline_index?);
    peer_connection
        .get_transceivers()
        .await
        .get(index)
        .and_then(|transceiver| transceiver.mid())
        .map(|mid| mid.to_string())
}

pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
    subscribers: Subscribers,
}

impl WebRtcTransport {
    /// Builds a send-only peer connection (H.264 PT 102, Opus PT 111).
    pub async fn new_send_only(config: &WhipConfig) -> Result<Self> {
        tracing::debug!("[WebRtcTransport] Creating MediaEngine and registering codecs...");

        // Only the codecs we encode; default codecs would let the server pick VP8.
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_owned(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line:
                            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                                .to_owned(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 102,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| transport_err("Failed to register H.264 codec", e))?;
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| transport_err("Failed to register Opus codec", e))?;

        // NACK, RTCP reports
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| transport_err("Failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: if config.ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: config.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| transport_err("Failed to create PeerConnection", e))?,
        );

        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        Self::register_handlers(&peer_connection, &subscribers);

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "streamlib-video".to_owned(),
        ));
        peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| transport_err("Failed to add video track", e))?;

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "streamlib-audio".to_owned(),
        ));
        peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| transport_err("Failed to add audio track", e))?;

        // WHIP is ingest only.
        for transceiver in peer_connection.get_transceivers().await {
            transceiver
                .set_direction(RTCRtpTransceiverDirection::Sendonly)
                .await;
        }
        tracing::info!("[WebRtcTransport] Send-only peer connection ready (H.264 + Opus)");

        Ok(Self {
            peer_connection,
            video_track,
            audio_track,
            subscribers,
        })
    }

    fn register_handlers(peer_connection: &Arc<RTCPeerConnection>, subscribers: &Subscribers) {
        let candidate_subscribers = Arc::clone(subscribers);
        // Weak: the handler is owned by the peer connection.
        let candidate_peer: Weak<RTCPeerConnection> = Arc::downgrade(peer_connection);
        peer_connection.on_ice_candidate(Box::new(move |candidate_opt| {
            let subscribers = Arc::clone(&candidate_subscribers);
            let peer_connection = candidate_peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate_opt else {
                    // None marks the end of gathering
                    tracing::debug!("[WebRtcTransport] ICE candidate gathering complete");
                    publish_event(&subscribers, TransportEvent::EndOfCandidates);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let Some(peer_connection) = peer_connection.upgrade() else {
                            return;
                        };
                        let Some(mid) = resolve_candidate_mid(&peer_connection, &init).await
                        else {
                            tracing::warn!(
                                "[WebRtcTransport] No media section for ICE candidate: {}",
                                init.candidate
                            );
                            return;
                        };
                        tracing::debug!("[WebRtcTransport] ICE candidate discovered: {}", init.candidate);
                        publish_event(
                            &subscribers,
                            TransportEvent::Candidate(LocalCandidate::new(init.candidate, mid)),
                        );
                    }
                    Err(e) => {
                        tracing::warn!("[WebRtcTransport] Failed to serialize ICE candidate: {}", e)
                    }
                }
            })
        }));

        let state_subscribers = Arc::clone(subscribers);
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let subscribers = Arc::clone(&state_subscribers);
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };
                tracing::info!("[WebRtcTransport] Peer connection state: {:?}", state);
                publish_event(&subscribers, TransportEvent::ConnectionState(mapped));
            })
        }));

        let gathering_subscribers = Arc::clone(subscribers);
        peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
            let subscribers = Arc::clone(&gathering_subscribers);
            Box::pin(async move {
                let mapped = match state {
                    RTCIceGathererState::New => GatheringState::New,
                    RTCIceGathererState::Gathering => GatheringState::Gathering,
                    RTCIceGathererState::Complete => GatheringState::Complete,
                    _ => return,
                };
                tracing::debug!("[WebRtcTransport] ICE gathering state: {:?}", state);
                publish_event(&subscribers, TransportEvent::GatheringState(mapped));
            })
        }));
    }

    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.video_track)
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.audio_track)
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| transport_err("Failed to create offer", e))?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_owned())
            .map_err(|e| WhipError::MalformedSdp(format!("Invalid local offer: {}", e)))?;
        // Starts ICE gathering
        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| transport_err("Failed to set local description", e))
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_owned())
            .map_err(|e| WhipError::MalformedSdp(format!("Invalid SDP answer: {}", e)))?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| transport_err("Failed to set remote description", e))?;
        tracing::debug!("[WebRtcTransport] Remote SDP answer set");
        Ok(())
    }

    async fn transceivers(&self) -> Vec<TransceiverInfo> {
        self.peer_connection
            .get_transceivers()
            .await
            .iter()
            .filter_map(|transceiver| {
                let mid = transceiver.mid()?.to_string();
                let kind = match transceiver.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    _ => return None,
                };
                Some(TransceiverInfo { mid, kind })
            })
            .collect()
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| transport_err("Failed to close PeerConnection", e))?;
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}
