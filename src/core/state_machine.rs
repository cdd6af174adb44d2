//! Session State Machine
//!
//! Formal lifecycle of a session:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (Streaming <-> Idle) -> Disconnected
//! ```
//!
//! plus a terminal `Error` state reachable from every state except
//! `Disconnected`. Invalid transitions are rejected so every published
//! state change is one the table allows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not connected
    Disconnected,
    /// Port open in progress
    Connecting,
    /// Port open, read loop not yet running
    Connected,
    /// Read loop active and receiving
    Streaming,
    /// Read loop active, no data for a while
    Idle,
    /// Unrecoverable failure
    Error,
}

impl SessionState {
    /// Port is open (commands may be submitted)
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Streaming | Self::Idle)
    }

    /// Session has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    /// Get name of state
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Streaming => "streaming",
            Self::Idle => "idle",
            Self::Error => "error",
        }
    }

    /// Whether `self -> to` is allowed
    pub fn can_transition(&self, to: SessionState) -> bool {
        use SessionState::{Connected, Connecting, Disconnected, Error, Idle, Streaming};
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected | Error | Disconnected)
                | (Connected, Streaming | Idle | Error | Disconnected)
                | (Streaming, Idle | Error | Disconnected)
                | (Idle, Streaming | Error | Disconnected)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Rejected transition
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    /// Current state
    pub from: SessionState,
    /// Requested state
    pub to: SessionState,
}

/// State transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: SessionState,
    /// New state
    pub to: SessionState,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Reason for transition
    pub reason: Option<String>,
}

const MAX_HISTORY: usize = 32;

/// Session state machine with a bounded transition history
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    history: VecDeque<StateTransition>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// Create new state machine in `Disconnected`
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            history: VecDeque::new(),
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get state history, oldest first
    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    /// Move to a new state
    pub fn transition(
        &mut self,
        to: SessionState,
        reason: Option<&str>,
    ) -> Result<StateTransition, InvalidTransition> {
        if !self.state.can_transition(to) {
            return Err(InvalidTransition { from: self.state, to });
        }

        let transition = StateTransition {
            from: self.state,
            to,
            timestamp: Utc::now(),
            reason: reason.map(str::to_string),
        };

        self.history.push_back(transition.clone());
        if self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
        self.state = to;

        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_transitions() {
        let mut sm = SessionStateMachine::new();

        assert_eq!(sm.state(), SessionState::Disconnected);

        sm.transition(SessionState::Connecting, Some("User initiated")).unwrap();
        sm.transition(SessionState::Connected, None).unwrap();
        assert!(sm.state().is_connected());

        sm.transition(SessionState::Streaming, None).unwrap();
        sm.transition(SessionState::Idle, None).unwrap();
        sm.transition(SessionState::Streaming, None).unwrap();
        sm.transition(SessionState::Disconnected, Some("closed")).unwrap();
        assert!(sm.state().is_terminal());
        assert_eq!(sm.history().count(), 6);
    }

    #[test]
    fn test_invalid_transition() {
        let mut sm = SessionStateMachine::new();

        // Can't go directly from Disconnected to Streaming
        let err = sm.transition(SessionState::Streaming, None).unwrap_err();
        assert_eq!(err.from, SessionState::Disconnected);
        assert_eq!(sm.state(), SessionState::Disconnected);

        // Error is not reachable from Disconnected
        assert!(sm.transition(SessionState::Error, None).is_err());
    }

    #[test]
    fn test_error_is_terminal() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionState::Connecting, None).unwrap();
        sm.transition(SessionState::Error, Some("permission denied")).unwrap();

        for &to in &[
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Streaming,
        ] {
            assert!(sm.transition(to, None).is_err());
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionState::Connecting, None).unwrap();
        sm.transition(SessionState::Connected, None).unwrap();
        for _ in 0..50 {
            sm.transition(SessionState::Streaming, None).unwrap();
            sm.transition(SessionState::Idle, None).unwrap();
        }
        assert_eq!(sm.history().count(), MAX_HISTORY);
    }
}
