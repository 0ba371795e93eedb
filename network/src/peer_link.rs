//! Per-remote negotiation of a direct media connection.
//!
//! Roles are fixed per pair: the side with the lexicographically smaller
//! identity is polite. On an offer collision the impolite side ignores the
//! incoming offer and the polite side rolls back its own, so a pair always
//! settles on exactly one offer/answer exchange.

use crate::media::LocalTrack;
use crate::protocol::{IceCandidate, SessionDescription, SignalPayload};
use crate::transport::{MediaTransport, SignalingState, TransportEvent, TransportState};
use log::{debug, info, trace, warn};
use session_core::{Error, LinkState, MediaKind, SessionIdentity};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Inputs driving the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInput {
    /// An offer was sent or accepted
    BeginNegotiation,
    /// Signaling is stable and the transport is connected
    Established,
    /// Connectivity failed and must be renegotiated
    TransportLost,
    /// Teardown
    Close,
}

/// Transition table. `None` means the input is ignored in `state`.
pub fn transition(state: LinkState, input: LinkInput) -> Option<LinkState> {
    use LinkInput::*;
    use LinkState::*;

    match (state, input) {
        (Closed, _) => None,
        (_, Close) => Some(Closed),
        (New | Negotiating | Connected, BeginNegotiation) => Some(Negotiating),
        (Negotiating, Established) => Some(Connected),
        (Negotiating | Connected, TransportLost) => Some(Negotiating),
        _ => None,
    }
}

/// Whether `local` takes the polite role towards `remote`
pub fn is_polite(local: &SessionIdentity, remote: &SessionIdentity) -> bool {
    local < remote
}

/// Track received from the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub track_id: String,
    pub kind: MediaKind,
}

/// Notifications a link emits to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A payload that must be relayed to the remote identity
    Signal {
        to: SessionIdentity,
        payload: SignalPayload,
    },
    /// Lifecycle transition
    StateChanged {
        remote: SessionIdentity,
        state: LinkState,
    },
    /// Remote tracks available for rendering
    RemoteStream {
        remote: SessionIdentity,
        tracks: Vec<RemoteTrack>,
    },
    /// Negotiation gave up; the link is closed
    Failed {
        remote: SessionIdentity,
        reason: String,
    },
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// How long a link may go without settling and how often it is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_retries: 3,
        }
    }
}

/// Negotiation state for one remote identity
pub struct PeerLink {
    local: SessionIdentity,
    remote: SessionIdentity,
    polite: bool,
    transport: Arc<dyn MediaTransport>,
    state: LinkState,
    /// Shared with every other link; never stopped from here
    local_tracks: Vec<Arc<LocalTrack>>,
    remote_tracks: Vec<RemoteTrack>,
    /// Candidates that arrived before a remote description, in arrival order
    pending_candidates: Vec<IceCandidate>,
    making_offer: bool,
    ignore_offer: bool,
    renegotiate_pending: bool,
    transport_connected: bool,
    /// Set once the first exchange has settled
    established_once: bool,
    /// Running since the link opened, reset by every exchange
    negotiation_started: Option<Instant>,
    retries: u32,
    events: LinkEventSender,
}

impl PeerLink {
    /// Attach the shared local tracks to a fresh transport
    pub async fn open(
        local: SessionIdentity,
        remote: SessionIdentity,
        transport: Arc<dyn MediaTransport>,
        tracks: &[Arc<LocalTrack>],
        events: LinkEventSender,
    ) -> Result<Self, Error> {
        if local == remote {
            return Err(Error::InvalidState(format!(
                "Refusing to link {} to itself",
                local
            )));
        }

        for track in tracks {
            transport.add_track(track.clone()).await?;
        }

        let polite = is_polite(&local, &remote);
        debug!(
            "Opened link {} -> {} ({})",
            local,
            remote,
            if polite { "polite" } else { "impolite" }
        );

        Ok(Self {
            local,
            remote,
            polite,
            transport,
            state: LinkState::New,
            local_tracks: tracks.to_vec(),
            remote_tracks: Vec::new(),
            pending_candidates: Vec::new(),
            making_offer: false,
            ignore_offer: false,
            renegotiate_pending: false,
            transport_connected: false,
            established_once: false,
            negotiation_started: Some(Instant::now()),
            retries: 0,
            events,
        })
    }

    pub fn remote(&self) -> &SessionIdentity {
        &self.remote
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn transport(&self) -> Arc<dyn MediaTransport> {
        self.transport.clone()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn local_track_ids(&self) -> Vec<String> {
        self.local_tracks.iter().map(|t| t.id().to_string()).collect()
    }

    /// Remote stream; `None` until the link is connected
    pub fn remote_stream(&self) -> Option<&[RemoteTrack]> {
        (self.state == LinkState::Connected).then_some(self.remote_tracks.as_slice())
    }

    /// Kick off the initial exchange. Only the impolite side offers.
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.polite {
            debug!("Waiting for offer from {}", self.remote);
            return Ok(());
        }
        self.make_offer().await
    }

    /// Local tracks changed; offer now or as soon as signaling is stable
    pub async fn request_negotiation(&mut self) -> Result<(), Error> {
        if self.state == LinkState::Closed {
            return Ok(());
        }
        if self.making_offer || self.transport.signaling_state() != SignalingState::Stable {
            self.renegotiate_pending = true;
            return Ok(());
        }
        if self.polite && self.state == LinkState::New {
            // the initial offer belongs to the impolite side
            self.renegotiate_pending = true;
            return Ok(());
        }
        self.make_offer().await
    }

    pub async fn add_track(&mut self, track: Arc<LocalTrack>) -> Result<(), Error> {
        if self.local_tracks.iter().any(|t| t.id() == track.id()) {
            return Ok(());
        }
        self.transport.add_track(track.clone()).await?;
        self.local_tracks.push(track);
        Ok(())
    }

    pub async fn remove_track(&mut self, track_id: &str) -> Result<(), Error> {
        let Some(pos) = self.local_tracks.iter().position(|t| t.id() == track_id) else {
            return Ok(());
        };
        self.local_tracks.remove(pos);
        self.transport.remove_track(track_id).await
    }

    /// Apply a payload relayed from the remote identity
    pub async fn handle_signal(&mut self, payload: SignalPayload) -> Result<(), Error> {
        if self.state == LinkState::Closed {
            return Err(Error::StaleSignal(self.remote.clone()));
        }
        match payload {
            SignalPayload::Offer { sdp } => self.handle_offer(sdp).await,
            SignalPayload::Answer { sdp } => self.handle_answer(sdp).await,
            SignalPayload::IceCandidate { candidate } => self.handle_candidate(candidate).await,
        }
    }

    /// Apply a notification raised by the transport
    pub async fn on_transport_event(&mut self, event: TransportEvent) -> Result<(), Error> {
        if self.state == LinkState::Closed {
            trace!("Ignoring {:?} on closed link to {}", event, self.remote);
            return Ok(());
        }

        match event {
            TransportEvent::NegotiationNeeded if !self.established_once => {
                // raised by the tracks attached in open(); the first exchange carries them
                trace!("Ignoring negotiation-needed before first exchange with {}", self.remote);
                Ok(())
            }
            TransportEvent::NegotiationNeeded => self.request_negotiation().await,
            TransportEvent::LocalCandidate(candidate) => {
                self.emit_signal(SignalPayload::IceCandidate { candidate });
                Ok(())
            }
            TransportEvent::ConnectionState(state) => match state {
                TransportState::Connected => {
                    self.transport_connected = true;
                    self.maybe_established();
                    Ok(())
                }
                TransportState::Disconnected => {
                    debug!("Transport to {} disconnected", self.remote);
                    self.transport_connected = false;
                    Ok(())
                }
                TransportState::Failed => {
                    warn!("Transport to {} failed", self.remote);
                    self.transport_connected = false;
                    self.apply(LinkInput::TransportLost);
                    if self.polite {
                        Ok(())
                    } else {
                        self.request_negotiation().await
                    }
                }
                TransportState::Closed => {
                    self.close().await;
                    Ok(())
                }
                TransportState::New | TransportState::Connecting => Ok(()),
            },
            TransportEvent::RemoteTrack { track_id, kind } => {
                if !self.remote_tracks.iter().any(|t| t.track_id == track_id) {
                    self.remote_tracks.push(RemoteTrack { track_id, kind });
                    if self.state == LinkState::Connected {
                        self.emit_remote_stream();
                    }
                }
                Ok(())
            }
        }
    }

    /// Retry or give up on a negotiation that has not settled in time.
    ///
    /// A link still in `New` never saw an offer, which happens when the remote
    /// kept a stale link across our resubscription, so it offers itself
    /// whatever its role. Once negotiating, the impolite side re-offers and
    /// the polite side keeps waiting. After `policy.max_retries` consecutive
    /// timeouts the link closes for good.
    pub async fn check_timeout(&mut self, now: Instant, policy: RetryPolicy) -> Result<(), Error> {
        if !matches!(self.state, LinkState::New | LinkState::Negotiating) {
            return Ok(());
        }
        let Some(started) = self.negotiation_started else {
            return Ok(());
        };
        if now.saturating_duration_since(started) < policy.timeout {
            return Ok(());
        }

        self.retries += 1;
        if self.retries > policy.max_retries {
            let reason = format!(
                "Negotiation with {} did not complete after {} attempts",
                self.remote, self.retries
            );
            warn!("{}", reason);
            self.close().await;
            let _ = self.events.send(LinkEvent::Failed {
                remote: self.remote.clone(),
                reason,
            });
            return Ok(());
        }

        if self.state == LinkState::New {
            info!(
                "No offer from {} yet, offering (attempt {})",
                self.remote, self.retries
            );
            self.make_offer().await?;
        } else if !self.polite {
            info!(
                "Negotiation with {} timed out, re-offering (attempt {})",
                self.remote, self.retries
            );
            if self.transport.signaling_state() == SignalingState::HaveLocalOffer {
                self.transport.rollback().await?;
            }
            self.make_offer().await?;
        }
        self.negotiation_started = Some(now);
        Ok(())
    }

    /// Tear down the transport and drop everything queued. Idempotent.
    pub async fn close(&mut self) {
        if !self.apply(LinkInput::Close) {
            return;
        }
        self.pending_candidates.clear();
        self.local_tracks.clear();
        self.remote_tracks.clear();
        self.making_offer = false;
        self.renegotiate_pending = false;
        if let Err(e) = self.transport.close().await {
            warn!("Failed to close transport to {}: {}", self.remote, e);
        }
    }

    async fn make_offer(&mut self) -> Result<(), Error> {
        self.renegotiate_pending = false;
        self.making_offer = true;
        self.apply(LinkInput::BeginNegotiation);
        let result = self.compose_offer().await;
        self.making_offer = false;

        let offer = result?;
        debug!("Sending offer {} -> {}", self.local, self.remote);
        self.emit_signal(SignalPayload::Offer { sdp: offer.sdp });
        Ok(())
    }

    async fn compose_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn handle_offer(&mut self, sdp: String) -> Result<(), Error> {
        let collision =
            self.making_offer || self.transport.signaling_state() != SignalingState::Stable;
        self.ignore_offer = !self.polite && collision;
        if self.ignore_offer {
            debug!("Offer collision with {}: ignoring incoming offer", self.remote);
            return Ok(());
        }

        self.apply(LinkInput::BeginNegotiation);
        if collision {
            debug!("Offer collision with {}: rolling back local offer", self.remote);
            if self.transport.signaling_state() == SignalingState::HaveLocalOffer {
                self.transport.rollback().await?;
            }
            // our own changes still need an exchange once this one settles
            self.renegotiate_pending = true;
        }

        self.transport
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.flush_candidates().await;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        debug!("Sending answer {} -> {}", self.local, self.remote);
        self.emit_signal(SignalPayload::Answer { sdp: answer.sdp });

        self.settle().await
    }

    async fn handle_answer(&mut self, sdp: String) -> Result<(), Error> {
        if self.transport.signaling_state() != SignalingState::HaveLocalOffer {
            debug!("Dropping answer from {}: no offer outstanding", self.remote);
            return Ok(());
        }
        self.transport
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        self.flush_candidates().await;
        self.settle().await
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<(), Error> {
        if !self.transport.has_remote_description().await {
            trace!("Queueing candidate from {}", self.remote);
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        match self.transport.add_ice_candidate(candidate).await {
            Err(e) if self.ignore_offer => {
                trace!("Candidate for ignored offer from {}: {}", self.remote, e);
                Ok(())
            }
            other => other,
        }
    }

    async fn flush_candidates(&mut self) {
        let queued = std::mem::take(&mut self.pending_candidates);
        if !queued.is_empty() {
            debug!("Applying {} queued candidates from {}", queued.len(), self.remote);
        }
        for candidate in queued {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                debug!("Queued candidate from {} rejected: {}", self.remote, e);
            }
        }
    }

    /// Called whenever an exchange may have returned signaling to stable
    async fn settle(&mut self) -> Result<(), Error> {
        if self.transport.signaling_state() != SignalingState::Stable {
            return Ok(());
        }
        self.maybe_established();
        if self.renegotiate_pending {
            self.request_negotiation().await?;
        }
        Ok(())
    }

    fn maybe_established(&mut self) {
        if !self.transport_connected
            || self.making_offer
            || self.transport.signaling_state() != SignalingState::Stable
        {
            return;
        }
        if self.apply(LinkInput::Established) {
            self.established_once = true;
            self.retries = 0;
            self.negotiation_started = None;
            self.emit_remote_stream();
        }
    }

    /// Run one input through the transition table; true if the state changed
    fn apply(&mut self, input: LinkInput) -> bool {
        match transition(self.state, input) {
            Some(next) => {
                if input == LinkInput::BeginNegotiation || input == LinkInput::TransportLost {
                    self.negotiation_started = Some(Instant::now());
                }
                if next == self.state {
                    return false;
                }
                debug!("Link {} -> {}: {:?} -> {:?}", self.local, self.remote, self.state, next);
                self.state = next;
                let _ = self.events.send(LinkEvent::StateChanged {
                    remote: self.remote.clone(),
                    state: next,
                });
                true
            }
            None => {
                trace!("Link to {} ignored {:?} in {:?}", self.remote, input, self.state);
                false
            }
        }
    }

    fn emit_signal(&self, payload: SignalPayload) {
        if self
            .events
            .send(LinkEvent::Signal {
                to: self.remote.clone(),
                payload,
            })
            .is_err()
        {
            trace!("Link owner for {} is gone", self.remote);
        }
    }

    fn emit_remote_stream(&self) {
        if self.remote_tracks.is_empty() {
            return;
        }
        let _ = self.events.send(LinkEvent::RemoteStream {
            remote: self.remote.clone(),
            tracks: self.remote_tracks.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use LinkInput::*;
        use LinkState::*;

        assert_eq!(transition(New, BeginNegotiation), Some(Negotiating));
        assert_eq!(transition(New, Established), None);
        assert_eq!(transition(Negotiating, Established), Some(Connected));
        assert_eq!(transition(Connected, BeginNegotiation), Some(Negotiating));
        assert_eq!(transition(Connected, TransportLost), Some(Negotiating));
        assert_eq!(transition(Connected, Established), None);
        for state in [New, Negotiating, Connected] {
            assert_eq!(transition(state, Close), Some(Closed));
        }
        for input in [BeginNegotiation, Established, TransportLost, Close] {
            assert_eq!(transition(Closed, input), None);
        }
    }

    #[test]
    fn politeness_is_antisymmetric() {
        let pairs = [("t", "s1"), ("s1", "s2"), ("Zed", "abe"), ("a", "ab")];
        for (a, b) in pairs {
            let (a, b) = (SessionIdentity::new(a), SessionIdentity::new(b));
            assert_ne!(is_polite(&a, &b), is_polite(&b, &a));
        }
    }
}
