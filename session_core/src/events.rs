use crate::{LinkState, MediaKind, Participant, SessionIdentity, SessionState};
use std::collections::BTreeMap;

/// State of the local media permission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaPermission {
    /// Waiting for the user to answer the permission prompt
    Pending,
    /// Capture is running
    Granted,
    /// The user or the platform refused capture
    Denied { reason: String },
}

/// Severity of a transient notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    /// Non-blocking, but rendered as a destructive toast
    Destructive,
}

/// Point-in-time view of the local client, answered on request
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Everyone currently present, including ourselves
    pub roster: Vec<Participant>,
    /// One entry per PeerLink
    pub links: BTreeMap<SessionIdentity, LinkState>,
    /// Local mirror of the replicated state
    pub state: SessionState,
    /// Whether the relay subscription is live
    pub online: bool,
}

/// Events the session core emits to the embedding UI
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Joining has started; show the connecting indicator
    Connecting,

    /// Local media permission changed
    Media(MediaPermission),

    /// Capture was refused. Blocking; the UI shows remediation and a reload action
    PermissionDenied {
        /// Human readable steps to re-enable capture
        remediation: String,
    },

    /// Subscribed to the session channels
    Joined,

    /// The relay became unreachable; the roster is considered empty
    Offline,

    /// The relay subscription was re-established
    Reconnected,

    /// A remote participant appeared in the roster
    PeerJoined(Participant),

    /// A remote participant left the roster
    PeerLeft(SessionIdentity),

    /// A PeerLink changed lifecycle state
    PeerLinkChanged {
        /// Remote identity of the link
        peer: SessionIdentity,
        /// New state
        state: LinkState,
    },

    /// A remote track is available for rendering
    RemoteTrack {
        /// Remote identity the track belongs to
        peer: SessionIdentity,
        /// Track ID
        track_id: String,
        /// Track kind
        kind: MediaKind,
    },

    /// The replicated state changed
    StateChanged(SessionState),

    /// A local command was refused at the write boundary
    CommandRejected {
        /// Why it was refused
        reason: String,
    },

    /// Transient notification
    Notice {
        /// Severity
        level: NoticeLevel,
        /// Text to show
        message: String,
    },

    /// Answer to a snapshot request
    Snapshot(SessionSnapshot),

    /// The session is over for this client
    Ended {
        /// Why the session ended
        reason: String,
    },
}
