use session_core::{ComprehensionStatus, Error, SessionIdentity};
use serde::{Deserialize, Serialize};

/// Kind of an SDP blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Negotiation payloads carried by a signal envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// SDP offer
    Offer { sdp: String },
    /// SDP answer
    Answer { sdp: String },
    /// Trickled ICE candidate
    IceCandidate { candidate: IceCandidate },
}

impl SignalPayload {
    pub fn name(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Unicast negotiation message between two identities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: SessionIdentity,
    pub to: SessionIdentity,
    pub payload: SignalPayload,
}

/// Mutations of the replicated session state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StateEvent {
    SpotlightChanged {
        identity: SessionIdentity,
    },
    /// `None` hands the whiteboard back to the teacher
    WhiteboardControllerChanged {
        identity: Option<SessionIdentity>,
    },
    HandRaiseChanged {
        identity: SessionIdentity,
        raised: bool,
    },
    ComprehensionChanged {
        identity: SessionIdentity,
        status: ComprehensionStatus,
    },
    TimerStarted {
        remaining_seconds: u32,
    },
    TimerPaused {
        remaining_seconds: u32,
    },
    TimerReset {
        remaining_seconds: u32,
    },
    TimerTick {
        remaining_seconds: u32,
    },
    SessionEnded {
        reason: Option<String>,
    },
}

impl StateEvent {
    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            StateEvent::SpotlightChanged { .. } => "spotlight-changed",
            StateEvent::WhiteboardControllerChanged { .. } => "whiteboard-controller-changed",
            StateEvent::HandRaiseChanged { .. } => "hand-raise-changed",
            StateEvent::ComprehensionChanged { .. } => "comprehension-changed",
            StateEvent::TimerStarted { .. } => "timer-started",
            StateEvent::TimerPaused { .. } => "timer-paused",
            StateEvent::TimerReset { .. } => "timer-reset",
            StateEvent::TimerTick { .. } => "timer-tick",
            StateEvent::SessionEnded { .. } => "session-ended",
        }
    }

    /// Whether only the teacher may emit this event
    pub fn is_teacher_only(&self) -> bool {
        !matches!(
            self,
            StateEvent::HandRaiseChanged { .. } | StateEvent::ComprehensionChanged { .. }
        )
    }
}

/// A state event together with its author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBroadcast {
    pub from: SessionIdentity,
    pub event: StateEvent,
}

/// Everything that travels over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "body", rename_all = "kebab-case")]
pub enum RelayFrame {
    Signal(SignalEnvelope),
    State(StateBroadcast),
}

/// Encode a frame as JSON text
pub fn encode(frame: &RelayFrame) -> Result<String, Error> {
    serde_json::to_string(frame)
        .map_err(|e| Error::MalformedPayload(format!("Failed to encode frame: {}", e)))
}

/// Decode JSON text into a frame.
///
/// Unknown `type`/`channel` tags and missing fields are rejected rather than
/// coerced.
pub fn decode(text: &str) -> Result<RelayFrame, Error> {
    serde_json::from_str(text)
        .map_err(|e| Error::MalformedPayload(format!("Failed to decode frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_event_uses_kebab_case_names() {
        let frame = RelayFrame::State(StateBroadcast {
            from: "t".into(),
            event: StateEvent::WhiteboardControllerChanged { identity: None },
        });
        let text = encode(&frame).unwrap();
        assert!(text.contains("\"type\":\"whiteboard-controller-changed\""));
        assert!(text.contains("\"channel\":\"state\""));
        assert_eq!(decode(&text).unwrap(), frame);
    }

    #[test]
    fn wire_names_match_event_names() {
        let events = vec![
            StateEvent::SpotlightChanged { identity: "a".into() },
            StateEvent::HandRaiseChanged {
                identity: "a".into(),
                raised: true,
            },
            StateEvent::ComprehensionChanged {
                identity: "a".into(),
                status: ComprehensionStatus::Unsure,
            },
            StateEvent::TimerStarted { remaining_seconds: 1 },
            StateEvent::TimerPaused { remaining_seconds: 1 },
            StateEvent::TimerReset { remaining_seconds: 1 },
            StateEvent::TimerTick { remaining_seconds: 1 },
            StateEvent::SessionEnded { reason: None },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.name());
        }
    }

    #[test]
    fn signal_payload_is_tagged() {
        let text = r#"{"channel":"signal","body":{"from":"a","to":"b","payload":{"type":"ice-candidate","candidate":{"candidate":"candidate:1"}}}}"#;
        match decode(text).unwrap() {
            RelayFrame::Signal(envelope) => {
                assert_eq!(envelope.from.as_str(), "a");
                assert_eq!(
                    envelope.payload,
                    SignalPayload::IceCandidate {
                        candidate: IceCandidate {
                            candidate: "candidate:1".to_string(),
                            sdp_mid: None,
                            sdp_mline_index: None,
                        }
                    }
                );
            }
            other => panic!("Expected signal frame, got {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let text = r#"{"channel":"signal","body":{"from":"a","to":"b","payload":{"type":"renegotiate","sdp":"x"}}}"#;
        assert!(matches!(decode(text), Err(Error::MalformedPayload(_))));

        let text = r#"{"channel":"state","body":{"from":"a","event":{"type":"confetti"}}}"#;
        assert!(matches!(decode(text), Err(Error::MalformedPayload(_))));
    }

    #[test]
    fn missing_fields_are_rejected() {
        let text = r#"{"channel":"signal","body":{"from":"a","payload":{"type":"offer","sdp":"x"}}}"#;
        assert!(decode(text).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn teacher_only_classification() {
        assert!(StateEvent::TimerTick { remaining_seconds: 3 }.is_teacher_only());
        assert!(!StateEvent::HandRaiseChanged {
            identity: "a".into(),
            raised: false
        }
        .is_teacher_only());
    }
}
