use network::media::LocalTrack;
use session_core::{ComprehensionStatus, SessionIdentity};
use std::sync::Arc;

/// Commands from the embedding UI to the controller
#[derive(Debug, Clone)]
pub enum ControllerCommand {
    /// Teacher only
    SetSpotlight(SessionIdentity),
    /// Teacher only; `None` hands control back to the teacher
    SetWhiteboardController(Option<SessionIdentity>),
    SetHandRaised {
        identity: SessionIdentity,
        raised: bool,
    },
    SetComprehension {
        identity: SessionIdentity,
        status: ComprehensionStatus,
    },
    /// Teacher only; `None` resumes from the current remaining time
    StartTimer {
        seconds: Option<u32>,
    },
    /// Teacher only
    PauseTimer,
    /// Teacher only
    ResetTimer {
        seconds: u32,
    },
    /// Add a track to every link and renegotiate
    StartScreenShare(Arc<LocalTrack>),
    StopScreenShare,
    /// Teacher only; ends the session for everyone
    EndSession {
        reason: Option<String>,
    },
    /// Answered with `SessionEvent::Snapshot`
    RequestSnapshot,
    Leave,
}
