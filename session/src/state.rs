//! Local mirror of the replicated session state.
//!
//! Writes are authorized here, before anything reaches the relay. Received
//! broadcasts go through the same gate, so a forged frame from a student can
//! not move a teacher-owned field either.

use log::{debug, trace, warn};
use network::protocol::StateEvent;
use session_core::{ComprehensionStatus, Error, SessionIdentity, SessionState};

pub struct SessionStateStore {
    local: SessionIdentity,
    teacher: SessionIdentity,
    state: SessionState,
}

impl SessionStateStore {
    pub fn new(local: SessionIdentity, teacher: SessionIdentity) -> Self {
        Self {
            state: SessionState::new(teacher.clone()),
            local,
            teacher,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn teacher(&self) -> &SessionIdentity {
        &self.teacher
    }

    pub fn is_teacher(&self) -> bool {
        self.local == self.teacher
    }

    /// Whether `from` may author `event`
    pub fn authorize(&self, from: &SessionIdentity, event: &StateEvent) -> Result<(), Error> {
        let permitted = if event.is_teacher_only() {
            *from == self.teacher
        } else {
            match event {
                StateEvent::HandRaiseChanged { identity, .. }
                | StateEvent::ComprehensionChanged { identity, .. } => identity == from,
                _ => false,
            }
        };
        if permitted {
            Ok(())
        } else {
            Err(Error::UnauthorizedStateWrite {
                identity: from.clone(),
                action: event.name().to_string(),
            })
        }
    }

    fn local_write(&self, event: StateEvent) -> Result<StateEvent, Error> {
        self.authorize(&self.local, &event)?;
        Ok(event)
    }

    pub fn set_spotlight(&self, identity: SessionIdentity) -> Result<StateEvent, Error> {
        self.local_write(StateEvent::SpotlightChanged { identity })
    }

    /// `None` hands control back to the teacher
    pub fn set_whiteboard_controller(
        &self,
        identity: Option<SessionIdentity>,
    ) -> Result<StateEvent, Error> {
        self.local_write(StateEvent::WhiteboardControllerChanged { identity })
    }

    pub fn set_hand_raised(
        &self,
        identity: SessionIdentity,
        raised: bool,
    ) -> Result<StateEvent, Error> {
        self.local_write(StateEvent::HandRaiseChanged { identity, raised })
    }

    pub fn set_comprehension(
        &self,
        identity: SessionIdentity,
        status: ComprehensionStatus,
    ) -> Result<StateEvent, Error> {
        self.local_write(StateEvent::ComprehensionChanged { identity, status })
    }

    /// Start counting down from `seconds`, or resume from the current value
    pub fn start_timer(&self, seconds: Option<u32>) -> Result<StateEvent, Error> {
        let remaining_seconds = seconds.unwrap_or(self.state.timer.remaining_seconds);
        let event = self.local_write(StateEvent::TimerStarted { remaining_seconds })?;
        if remaining_seconds == 0 {
            return Err(Error::InvalidState("Timer has nothing to count down".to_string()));
        }
        Ok(event)
    }

    pub fn pause_timer(&self) -> Result<StateEvent, Error> {
        self.local_write(StateEvent::TimerPaused {
            remaining_seconds: self.state.timer.remaining_seconds,
        })
    }

    pub fn reset_timer(&self, seconds: u32) -> Result<StateEvent, Error> {
        self.local_write(StateEvent::TimerReset {
            remaining_seconds: seconds,
        })
    }

    /// Authoritative tick, only while the local teacher's timer runs
    pub fn timer_sync(&self) -> Option<StateEvent> {
        if !self.state.timer.running {
            return None;
        }
        self.local_write(StateEvent::TimerTick {
            remaining_seconds: self.state.timer.remaining_seconds,
        })
        .ok()
    }

    pub fn end_session(&self, reason: Option<String>) -> Result<StateEvent, Error> {
        self.local_write(StateEvent::SessionEnded { reason })
    }

    /// Apply a broadcast authored by `from`. Returns whether the state changed.
    ///
    /// Every receiving client overwrites unconditionally; the last write to
    /// arrive wins.
    pub fn apply(&mut self, from: &SessionIdentity, event: &StateEvent) -> Result<bool, Error> {
        if let Err(e) = self.authorize(from, event) {
            warn!("Dropping {} from {}: not permitted", event.name(), from);
            return Err(e);
        }

        let before = self.state.clone();
        let state = &mut self.state;
        match event {
            StateEvent::SpotlightChanged { identity } => {
                state.spotlighted = identity.clone();
            }
            StateEvent::WhiteboardControllerChanged { identity } => {
                state.whiteboard_controller =
                    identity.clone().unwrap_or_else(|| self.teacher.clone());
            }
            StateEvent::HandRaiseChanged { identity, raised } => {
                if *raised {
                    state.raised_hands.insert(identity.clone());
                } else {
                    state.raised_hands.remove(identity);
                }
            }
            StateEvent::ComprehensionChanged { identity, status } => {
                state.comprehension.insert(identity.clone(), *status);
            }
            StateEvent::TimerStarted { remaining_seconds } => {
                state.timer.remaining_seconds = *remaining_seconds;
                state.timer.running = *remaining_seconds > 0;
            }
            StateEvent::TimerPaused { remaining_seconds }
            | StateEvent::TimerReset { remaining_seconds } => {
                state.timer.remaining_seconds = *remaining_seconds;
                state.timer.running = false;
            }
            StateEvent::TimerTick { remaining_seconds } => {
                state.timer.remaining_seconds = *remaining_seconds;
                state.timer.running = *remaining_seconds > 0;
            }
            StateEvent::SessionEnded { .. } => {
                debug!("Session ended by {}", from);
            }
        }

        let changed = *state != before;
        if changed {
            trace!("Applied {} from {}", event.name(), from);
        }
        Ok(changed)
    }

    /// One second of local countdown between sync points
    pub fn tick_local(&mut self) -> bool {
        let timer = &mut self.state.timer;
        if !timer.running {
            return false;
        }
        timer.remaining_seconds = timer.remaining_seconds.saturating_sub(1);
        if timer.remaining_seconds == 0 {
            timer.running = false;
        }
        true
    }

    /// Drop every reference to a departed identity
    pub fn on_departure(&mut self, identity: &SessionIdentity) -> bool {
        let mut changed = false;
        if self.state.spotlighted == *identity && *identity != self.teacher {
            self.state.spotlighted = self.teacher.clone();
            changed = true;
        }
        if self.state.whiteboard_controller == *identity && *identity != self.teacher {
            self.state.whiteboard_controller = self.teacher.clone();
            changed = true;
        }
        changed |= self.state.raised_hands.remove(identity);
        changed |= self.state.comprehension.remove(identity).is_some();
        if changed {
            debug!("Cleared session state of departed {}", identity);
        }
        changed
    }

    /// Events that bring a newly arrived client up to date with the fields
    /// the local identity owns
    pub fn owned_fields(&self) -> Vec<StateEvent> {
        let mut events = Vec::new();
        if self.is_teacher() {
            events.push(StateEvent::SpotlightChanged {
                identity: self.state.spotlighted.clone(),
            });
            events.push(StateEvent::WhiteboardControllerChanged {
                identity: Some(self.state.whiteboard_controller.clone()),
            });
            let remaining_seconds = self.state.timer.remaining_seconds;
            if self.state.timer.running {
                events.push(StateEvent::TimerStarted { remaining_seconds });
            } else if remaining_seconds > 0 {
                events.push(StateEvent::TimerPaused { remaining_seconds });
            }
        }
        if self.state.raised_hands.contains(&self.local) {
            events.push(StateEvent::HandRaiseChanged {
                identity: self.local.clone(),
                raised: true,
            });
        }
        if let Some(status) = self.state.comprehension.get(&self.local) {
            events.push(StateEvent::ComprehensionChanged {
                identity: self.local.clone(),
                status: *status,
            });
        }
        events
    }
}
