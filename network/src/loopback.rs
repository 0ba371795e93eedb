//! Deterministic in-process transport.
//!
//! Enforces the JSEP signaling-state rules a real peer connection applies and
//! reports a pair as connected once both ends hold local and remote
//! descriptions in `Stable`. Descriptions are plain text listing the offered
//! tracks, so remote tracks surface on `set_remote_description`.

use crate::media::LocalTrack;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{
    MediaTransport, SignalingState, TransportEvent, TransportEventSender, TransportProvider,
    TransportState,
};
use async_trait::async_trait;
use session_core::{Error, MediaKind, SessionIdentity};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

type PairKey = (SessionIdentity, SessionIdentity);

/// Registry shared by every client of a test
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    transports: Arc<Mutex<HashMap<PairKey, Arc<LoopbackTransport>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider used by the client named `local`
    pub fn provider(&self, local: impl Into<SessionIdentity>) -> LoopbackProvider {
        LoopbackProvider {
            local: local.into(),
            network: self.clone(),
        }
    }

    /// Most recent transport `local` created towards `remote`
    pub fn transport(&self, local: &str, remote: &str) -> Option<Arc<LoopbackTransport>> {
        let transports = self.transports.lock().ok()?;
        transports
            .get(&(SessionIdentity::new(local), SessionIdentity::new(remote)))
            .cloned()
    }

    /// Both ends of the pair exist, are open and report a connection
    pub fn is_connected(&self, a: &str, b: &str) -> bool {
        match (self.transport(a, b), self.transport(b, a)) {
            (Some(ab), Some(ba)) => ab.is_connected() && ba.is_connected(),
            _ => false,
        }
    }
}

/// `TransportProvider` for one client of a [`LoopbackNetwork`]
#[derive(Clone)]
pub struct LoopbackProvider {
    local: SessionIdentity,
    network: LoopbackNetwork,
}

#[async_trait]
impl TransportProvider for LoopbackProvider {
    async fn create(
        &self,
        remote: &SessionIdentity,
        events: TransportEventSender,
    ) -> Result<Arc<dyn MediaTransport>, Error> {
        let transport = Arc::new(LoopbackTransport {
            local: self.local.clone(),
            remote: remote.clone(),
            network: Arc::downgrade(&self.network.transports),
            events,
            inner: Mutex::new(Inner::default()),
        });
        let mut transports = self
            .network
            .transports
            .lock()
            .map_err(|_| Error::InvalidState("Loopback registry poisoned".to_string()))?;
        transports.insert((self.local.clone(), remote.clone()), transport.clone());
        Ok(transport)
    }
}

struct Inner {
    signaling: SignalingState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    tracks: Vec<(MediaKind, String)>,
    announced: HashSet<String>,
    applied_candidates: Vec<IceCandidate>,
    revision: u32,
    connected: bool,
    closed: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            local_description: None,
            remote_description: None,
            tracks: Vec::new(),
            announced: HashSet::new(),
            applied_candidates: Vec::new(),
            revision: 0,
            connected: false,
            closed: false,
        }
    }
}

/// In-process stand-in for a peer connection
pub struct LoopbackTransport {
    local: SessionIdentity,
    remote: SessionIdentity,
    network: Weak<Mutex<HashMap<PairKey, Arc<LoopbackTransport>>>>,
    events: TransportEventSender,
    inner: Mutex<Inner>,
}

impl LoopbackTransport {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, Error> {
        self.inner
            .lock()
            .map_err(|_| Error::InvalidState("Loopback transport poisoned".to_string()))
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send((self.remote.clone(), event));
    }

    pub fn is_connected(&self) -> bool {
        self.lock().map(|i| i.connected && !i.closed).unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|i| i.closed).unwrap_or(true)
    }

    /// Candidates accepted so far, in application order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.lock()
            .map(|i| {
                i.applied_candidates
                    .iter()
                    .map(|c| c.candidate.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.lock()
            .map(|i| i.tracks.iter().map(|(_, id)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Force a connectivity change, as ICE would
    pub fn set_connection_state(&self, state: TransportState) {
        if let Ok(mut inner) = self.lock() {
            inner.connected = state == TransportState::Connected;
        }
        self.emit(TransportEvent::ConnectionState(state));
    }

    fn describe(&self, kind: SdpKind, inner: &Inner) -> SessionDescription {
        let tracks: Vec<String> = inner
            .tracks
            .iter()
            .map(|(kind, id)| format!("{}:{}", kind, id))
            .collect();
        let sdp = format!(
            "loopback {} from={} rev={} tracks={}",
            match kind {
                SdpKind::Offer => "offer",
                SdpKind::Answer => "answer",
            },
            self.local,
            inner.revision,
            tracks.join(",")
        );
        SessionDescription { kind, sdp }
    }

    fn parse_tracks(sdp: &str) -> Vec<(MediaKind, String)> {
        let Some(list) = sdp.split_whitespace().find_map(|part| part.strip_prefix("tracks=")) else {
            return Vec::new();
        };
        list.split(',')
            .filter_map(|entry| {
                let (kind, id) = entry.split_once(':')?;
                let kind = match kind {
                    "audio" => MediaKind::Audio,
                    "video" => MediaKind::Video,
                    _ => return None,
                };
                Some((kind, id.to_string()))
            })
            .collect()
    }

    fn gather_candidate(&self, inner: &Inner) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{}-{}-{}", self.local, self.remote, inner.revision),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn ready(inner: &Inner) -> bool {
        !inner.closed
            && inner.signaling == SignalingState::Stable
            && inner.local_description.is_some()
            && inner.remote_description.is_some()
    }

    fn peer(&self) -> Option<Arc<LoopbackTransport>> {
        let registry = self.network.upgrade()?;
        let transports = registry.lock().ok()?;
        transports
            .get(&(self.remote.clone(), self.local.clone()))
            .cloned()
    }

    fn is_ready(&self) -> bool {
        self.lock().map(|i| Self::ready(&i)).unwrap_or(false)
    }

    /// Mark both ends connected once both are settled
    fn try_connect(&self) {
        let Some(peer) = self.peer() else {
            return;
        };
        if std::ptr::eq(Arc::as_ptr(&peer), self) {
            return;
        }
        if !self.is_ready() || !peer.is_ready() {
            return;
        }

        for end in [self, peer.as_ref()] {
            let newly = match end.lock() {
                Ok(mut inner) if !inner.connected => {
                    inner.connected = true;
                    true
                }
                _ => false,
            };
            if newly {
                end.emit(TransportEvent::ConnectionState(TransportState::Connected));
            }
        }
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::Negotiation("Transport closed".to_string()));
        }
        inner.revision += 1;
        Ok(self.describe(SdpKind::Offer, &inner))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let mut inner = self.lock()?;
        if inner.signaling != SignalingState::HaveRemoteOffer {
            return Err(Error::Negotiation(format!(
                "Cannot answer in {:?}",
                inner.signaling
            )));
        }
        inner.revision += 1;
        Ok(self.describe(SdpKind::Answer, &inner))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error> {
        let candidate = {
            let mut inner = self.lock()?;
            let next = match (description.kind, inner.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (kind, state) => {
                    return Err(Error::Negotiation(format!(
                        "Cannot set local {:?} in {:?}",
                        kind, state
                    )))
                }
            };
            inner.signaling = next;
            inner.local_description = Some(description);
            self.gather_candidate(&inner)
        };
        self.emit(TransportEvent::LocalCandidate(candidate));
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), Error> {
        let new_tracks = {
            let mut inner = self.lock()?;
            let next = match (description.kind, inner.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (kind, state) => {
                    return Err(Error::Negotiation(format!(
                        "Cannot set remote {:?} in {:?}",
                        kind, state
                    )))
                }
            };
            let tracks = Self::parse_tracks(&description.sdp);
            inner.signaling = next;
            inner.remote_description = Some(description);

            let mut new_tracks = Vec::new();
            for (kind, id) in tracks {
                if inner.announced.insert(id.clone()) {
                    new_tracks.push((kind, id));
                }
            }
            new_tracks
        };
        for (kind, track_id) in new_tracks {
            self.emit(TransportEvent::RemoteTrack { track_id, kind });
        }
        self.try_connect();
        Ok(())
    }

    async fn rollback(&self) -> Result<(), Error> {
        let mut inner = self.lock()?;
        if inner.signaling != SignalingState::HaveLocalOffer {
            return Err(Error::Negotiation(format!(
                "Cannot roll back in {:?}",
                inner.signaling
            )));
        }
        inner.signaling = SignalingState::Stable;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        let mut inner = self.lock()?;
        if inner.remote_description.is_none() {
            return Err(Error::Negotiation(
                "Candidate before remote description".to_string(),
            ));
        }
        inner.applied_candidates.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.lock()
            .map(|i| i.remote_description.is_some())
            .unwrap_or(false)
    }

    fn signaling_state(&self) -> SignalingState {
        self.lock()
            .map(|i| i.signaling)
            .unwrap_or(SignalingState::Closed)
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), Error> {
        let mut inner = self.lock()?;
        inner.tracks.push((track.kind(), track.id().to_string()));
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), Error> {
        let mut inner = self.lock()?;
        inner.tracks.retain(|(_, id)| id != track_id);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        {
            let mut inner = self.lock()?;
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.connected = false;
            inner.signaling = SignalingState::Closed;
        }
        if let Some(peer) = self.peer() {
            if !peer.is_closed() {
                peer.set_connection_state(TransportState::Disconnected);
            }
        }
        Ok(())
    }
}
