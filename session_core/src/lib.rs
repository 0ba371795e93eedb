use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use uuid::Uuid;

/// Stable opaque name of a participant for the duration of a session.
///
/// Ordering is byte-wise on the underlying string; the negotiation role of a
/// pair of identities is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionIdentity(String);

impl SessionIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of a live session (the scope of a relay channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a random session ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role claim issued by the authentication provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

/// A present participant as announced through the presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub identity: SessionIdentity,
    pub display_name: String,
}

impl Participant {
    pub fn new(identity: impl Into<SessionIdentity>, display_name: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            display_name: display_name.into(),
        }
    }
}

/// Self-reported understanding signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComprehensionStatus {
    Understood,
    Unsure,
    Lost,
}

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Lifecycle of a PeerLink. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    New,
    Negotiating,
    Connected,
    Closed,
}

/// Countdown shared by every client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    pub remaining_seconds: u32,
    pub running: bool,
}

/// Replicated ephemeral record of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub spotlighted: SessionIdentity,
    pub whiteboard_controller: SessionIdentity,
    pub raised_hands: BTreeSet<SessionIdentity>,
    pub comprehension: BTreeMap<SessionIdentity, ComprehensionStatus>,
    pub timer: TimerState,
}

impl SessionState {
    /// Initial state: the teacher holds both the spotlight and the whiteboard.
    pub fn new(teacher: SessionIdentity) -> Self {
        Self {
            spotlighted: teacher.clone(),
            whiteboard_controller: teacher,
            raised_hands: BTreeSet::new(),
            comprehension: BTreeMap::new(),
            timer: TimerState::default(),
        }
    }
}

/// Unified error type for the workspace.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Stale signal from {0}")]
    StaleSignal(SessionIdentity),

    #[error("Unauthorized state write by {identity}: {action}")]
    UnauthorizedStateWrite {
        identity: SessionIdentity,
        action: String,
    },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Session {0} has ended")]
    SessionEnded(SessionId),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub mod events;

pub use events::{MediaPermission, NoticeLevel, SessionEvent, SessionSnapshot};
