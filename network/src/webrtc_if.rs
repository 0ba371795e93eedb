use crate::media::LocalTrack;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{
    MediaTransport, SignalingState, TransportEvent, TransportEventSender, TransportProvider,
    TransportState,
};
use async_trait::async_trait;
use log::{debug, warn};
use session_core::{Error, MediaKind, SessionIdentity};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

/// Creates `webrtc` peer connections configured with the session's ICE servers
pub struct WebRtcProvider {
    /// WebRTC API instance
    api: API,
    /// Default RTCConfiguration used for all peer connections
    rtc_config: RTCConfiguration,
}

impl WebRtcProvider {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, Error> {
        let ice_servers = ice_servers
            .into_iter()
            .map(|url| RTCIceServer {
                urls: vec![url],
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Negotiation(format!("Failed to register codecs: {}", e)))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::Negotiation(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, rtc_config })
    }

    /// Number of configured ICE servers
    pub fn ice_server_count(&self) -> usize {
        self.rtc_config.ice_servers.len()
    }
}

#[async_trait]
impl TransportProvider for WebRtcProvider {
    async fn create(
        &self,
        remote: &SessionIdentity,
        events: TransportEventSender,
    ) -> Result<Arc<dyn MediaTransport>, Error> {
        debug!("Creating new peer connection for {}", remote);
        let pc = self
            .api
            .new_peer_connection(self.rtc_config.clone())
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create peer connection: {}", e)))?;

        let event_sender = events.clone();
        let peer = remote.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Peer connection state change for {}: {}", peer, state);
            let _ = event_sender.send((
                peer.clone(),
                TransportEvent::ConnectionState(map_connection_state(state)),
            ));
            Box::pin(async {})
        }));

        let event_sender = events.clone();
        let peer = remote.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = event_sender.send((
                            peer.clone(),
                            TransportEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }),
                        ));
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate for {}: {}", peer, e),
                }
            }
            Box::pin(async {})
        }));

        let event_sender = events.clone();
        let peer = remote.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let _ = event_sender.send((peer.clone(), TransportEvent::NegotiationNeeded));
            Box::pin(async {})
        }));

        let event_sender = events;
        let peer = remote.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(MediaKind::Audio),
                RTPCodecType::Video => Some(MediaKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                debug!("Track received for {}: id={}, kind={}", peer, track.id(), kind);
                let _ = event_sender.send((
                    peer.clone(),
                    TransportEvent::RemoteTrack {
                        track_id: track.id(),
                        kind,
                    },
                ));
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcTransport {
            pc: Arc::new(pc),
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => TransportState::New,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, Error> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| Error::MalformedPayload(format!("Failed to parse SDP: {}", e)))
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, Error> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp.clone())),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp.clone())),
        other => Err(Error::Negotiation(format!(
            "Unsupported description type {}",
            other
        ))),
    }
}

/// `MediaTransport` backed by an `RTCPeerConnection`
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    /// Senders by local track ID, for removal
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create offer: {}", e)))?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create answer: {}", e)))?;
        from_rtc(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), Error> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback(&self) -> Result<(), Error> {
        let mut pending = self
            .pc
            .pending_local_description()
            .await
            .ok_or_else(|| Error::InvalidState("No local offer to roll back".to_string()))?;
        pending.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(pending)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to roll back offer: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), Error> {
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        let sender = self
            .pc
            .add_track(rtc_track)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to add track: {}", e)))?;
        self.senders
            .lock()
            .await
            .insert(track.id().to_string(), sender);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), Error> {
        let sender = self
            .senders
            .lock()
            .await
            .remove(track_id)
            .ok_or_else(|| Error::NotFound(format!("No sender for track {}", track_id)))?;
        self.pc
            .remove_track(&sender)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to remove track: {}", e)))
    }

    async fn close(&self) -> Result<(), Error> {
        self.senders.lock().await.clear();
        self.pc
            .close()
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to close peer connection: {}", e)))
    }
}
