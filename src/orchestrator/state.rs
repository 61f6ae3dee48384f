//! Connection state machine and the single-slot failover guard

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Orchestrator connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "cause", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The live connection dropped; failover has not completed yet
    ConnectionLost(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connected or in the middle of an attempt
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Connecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::ConnectionLost(cause) => write!(f, "connection lost ({cause})"),
        }
    }
}

/// Inputs driving [`ConnectionState`] transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionTrigger {
    AttemptStarted,
    AttemptSucceeded,
    CandidatesExhausted,
    Lost(String),
    DisconnectRequested,
}

/// Pure transition function
///
/// A loss reported while no connection is held leaves the state unchanged.
pub fn next_state(current: &ConnectionState, trigger: ConnectionTrigger) -> ConnectionState {
    match trigger {
        ConnectionTrigger::AttemptStarted => ConnectionState::Connecting,
        ConnectionTrigger::AttemptSucceeded => ConnectionState::Connected,
        ConnectionTrigger::CandidatesExhausted | ConnectionTrigger::DisconnectRequested => {
            ConnectionState::Disconnected
        }
        ConnectionTrigger::Lost(cause) => match current {
            ConnectionState::Connected | ConnectionState::Connecting => {
                ConnectionState::ConnectionLost(cause)
            }
            other => other.clone(),
        },
    }
}

/// Admits one failover at a time; concurrent triggers are turned away
#[derive(Debug, Default)]
pub struct FailoverSlot {
    busy: AtomicBool,
}

impl FailoverSlot {
    pub fn try_acquire(&self) -> Option<FailoverGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FailoverGuard { slot: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the [`FailoverSlot`] on drop
#[derive(Debug)]
pub struct FailoverGuard<'a> {
    slot: &'a FailoverSlot,
}

impl Drop for FailoverGuard<'_> {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut state = ConnectionState::Disconnected;
        state = next_state(&state, ConnectionTrigger::AttemptStarted);
        assert_eq!(state, ConnectionState::Connecting);
        state = next_state(&state, ConnectionTrigger::AttemptSucceeded);
        assert!(state.is_connected());
        state = next_state(&state, ConnectionTrigger::Lost("io".into()));
        assert_eq!(state, ConnectionState::ConnectionLost("io".into()));
        state = next_state(&state, ConnectionTrigger::AttemptStarted);
        assert_eq!(state, ConnectionState::Connecting);
        state = next_state(&state, ConnectionTrigger::CandidatesExhausted);
        assert_eq!(state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_loss_while_disconnected_is_ignored() {
        let state = next_state(
            &ConnectionState::Disconnected,
            ConnectionTrigger::Lost("late".into()),
        );
        assert_eq!(state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_from_any_state() {
        for state in [
            ConnectionState::Connected,
            ConnectionState::Connecting,
            ConnectionState::ConnectionLost("x".into()),
        ] {
            assert_eq!(
                next_state(&state, ConnectionTrigger::DisconnectRequested),
                ConnectionState::Disconnected
            );
        }
    }

    #[test]
    fn test_state_predicates_and_display() {
        assert!(ConnectionState::Connecting.is_active());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::ConnectionLost("x".into()).is_active());
        assert_eq!(
            ConnectionState::ConnectionLost("timeout".into()).to_string(),
            "connection lost (timeout)"
        );
    }

    #[test]
    fn test_failover_slot_single_holder() {
        let slot = FailoverSlot::default();
        let guard = slot.try_acquire().unwrap();
        assert!(slot.is_busy());
        assert!(slot.try_acquire().is_none());

        drop(guard);
        assert!(!slot.is_busy());
        assert!(slot.try_acquire().is_some());
    }
}
