//! Session lifecycle state

use crate::error::{PipelineError, Result};
use crate::pipeline::types::Timestamp;

/// Session state machine
///
/// `Idle -> Initializing -> Running <-> Paused -> Stopping -> Stopped`.
/// Clock times are recorded on the presentation clock, not wall time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No topology installed yet, or installed but never started
    Idle,

    /// Clock start is being broadcast to the sinks
    Initializing,

    /// Sinks are pulling packets
    Running {
        /// Clock time the session (re)started at
        since: Timestamp,
    },

    /// Clock callbacks are suspended; topology and counters are kept
    Paused {
        /// Clock time the session paused at
        at: Timestamp,
    },

    /// Sinks are draining up to the stop time
    Stopping,

    /// Terminal
    Stopped,
}

impl SessionState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        use SessionState::*;

        match (self, target) {
            (Idle, Initializing) => true,
            (Idle, Stopping) => true,

            (Initializing, Running { .. }) => true,
            // a sink refused to start
            (Initializing, Idle) => true,
            (Initializing, Stopping) => true,

            (Running { .. }, Paused { .. }) => true,
            (Running { .. }, Stopping) => true,

            (Paused { .. }, Running { .. }) => true,
            (Paused { .. }, Stopping) => true,

            (Stopping, Stopped) => true,

            (Stopped, _) => false,

            _ => false,
        }
    }

    /// Move to `target` or fail with `InvalidState`
    pub fn transition(&mut self, target: SessionState) -> Result<SessionState> {
        if !self.can_transition_to(&target) {
            return Err(PipelineError::InvalidState {
                from: self.description().to_string(),
                to: target.description().to_string(),
            });
        }
        let previous = *self;
        *self = target;
        Ok(previous)
    }

    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Initializing => "Initializing",
            SessionState::Running { .. } => "Running",
            SessionState::Paused { .. } => "Paused",
            SessionState::Stopping => "Stopping",
            SessionState::Stopped => "Stopped",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, SessionState::Paused { .. })
    }

    /// Stopping or stopped
    pub fn is_stopped(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Stopping)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
