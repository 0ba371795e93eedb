//! Seam between the negotiation state machine and the peer-to-peer media
//! transport primitive.

use crate::media::LocalTrack;
use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use session_core::{Error, MediaKind, SessionIdentity};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Offer/answer state of a transport, as defined by JSEP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Connectivity of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications raised by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Local tracks changed and a new offer/answer round is needed
    NegotiationNeeded,
    /// A local ICE candidate was gathered and must be trickled to the remote
    LocalCandidate(IceCandidate),
    /// Connectivity changed
    ConnectionState(TransportState),
    /// The remote side started sending a track
    RemoteTrack { track_id: String, kind: MediaKind },
}

/// Sender half used by transports; events are tagged with the remote identity
pub type TransportEventSender = mpsc::UnboundedSender<(SessionIdentity, TransportEvent)>;

/// One direct media connection to a single remote identity
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, Error>;

    async fn create_answer(&self) -> Result<SessionDescription, Error>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error>;

    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), Error>;

    /// Discard the pending local offer and return to `Stable`
    async fn rollback(&self) -> Result<(), Error>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error>;

    async fn has_remote_description(&self) -> bool;

    fn signaling_state(&self) -> SignalingState;

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), Error>;

    async fn remove_track(&self, track_id: &str) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// Factory for transports, one per remote identity
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn create(
        &self,
        remote: &SessionIdentity,
        events: TransportEventSender,
    ) -> Result<Arc<dyn MediaTransport>, Error>;
}
