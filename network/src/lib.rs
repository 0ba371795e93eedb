//! Networking for a classroom session
//!
//! This crate covers everything between the session controller and the
//! wire: presence and signal relaying, the relay frame format, local media
//! tracks and the per-peer negotiation of direct media connections.

pub mod media;
pub mod peer_link;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod transport;
pub mod webrtc_if;

#[cfg(any(test, feature = "test_utils"))]
pub mod loopback;

pub use media::{LocalMedia, LocalTrack};
pub use peer_link::{LinkEvent, LinkEventSender, PeerLink, RemoteTrack, RetryPolicy};
pub use presence::{PresenceRegistry, RosterChange};
pub use protocol::{RelayFrame, SignalEnvelope, SignalPayload, StateBroadcast, StateEvent};
pub use relay::{Delivery, LocalRelay, PresenceUpdate, RelaySubscription, SignalRelay};
pub use transport::{MediaTransport, TransportEvent, TransportProvider, TransportState};
pub use webrtc_if::WebRtcProvider;

#[cfg(test)]
mod tests {
    mod negotiation_tests;
}
