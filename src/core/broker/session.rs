//! Broker connection session state machine
//!
//! Tracks the status of the single broker connection, rejects transitions
//! that make no sense and keeps a bounded history for diagnostics.

use super::ConnectionStatus;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Rejected status change
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    /// Status before the attempted change
    pub from: ConnectionStatus,
    /// Requested status
    pub to: ConnectionStatus,
}

/// Status transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    /// Previous status
    pub from: ConnectionStatus,
    /// New status
    pub to: ConnectionStatus,
    /// Timestamp
    pub timestamp: DateTime<Local>,
    /// Reason for transition
    pub reason: Option<String>,
}

/// Transport-level reconnect policy handed to the broker client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Maximum server reconnect attempts
    pub max_reconnects: usize,
    /// Timeout of a single connection attempt
    pub connection_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_reconnects: 5,
            connection_timeout: Duration::from_secs(600),
        }
    }
}

/// Broker session state machine
#[derive(Debug, Clone)]
pub struct BrokerSession {
    status: ConnectionStatus,
    history: Vec<StatusTransition>,
    max_history: usize,
    last_error: Option<String>,
}

impl Default for BrokerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerSession {
    /// Create a disconnected session
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            history: Vec::new(),
            max_history: 100,
            last_error: None,
        }
    }

    /// Get current status
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Get transition history
    pub fn history(&self) -> &[StatusTransition] {
        &self.history
    }

    /// Error recorded by the last failing transition
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Transition to a new status
    pub fn transition(
        &mut self,
        to: ConnectionStatus,
        reason: Option<&str>,
    ) -> Result<(), InvalidTransition> {
        if !Self::is_valid_transition(self.status, to) {
            return Err(InvalidTransition { from: self.status, to });
        }

        self.history.push(StatusTransition {
            from: self.status,
            to,
            timestamp: Local::now(),
            reason: reason.map(String::from),
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        match to {
            ConnectionStatus::Failed => self.last_error = reason.map(String::from),
            ConnectionStatus::Connected => self.last_error = None,
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Force a status reported by the transport itself
    pub fn observe(&mut self, status: ConnectionStatus) {
        if status != self.status {
            // The transport is authoritative; keep the record even when the
            // jump would not be a valid request.
            self.history.push(StatusTransition {
                from: self.status,
                to: status,
                timestamp: Local::now(),
                reason: Some("reported by transport".to_string()),
            });
            if self.history.len() > self.max_history {
                self.history.remove(0);
            }
            self.status = status;
        }
    }

    fn is_valid_transition(from: ConnectionStatus, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        match (from, to) {
            (Disconnected, Connecting) => true,

            (Connecting, Connected) => true,
            (Connecting, Failed) => true,
            (Connecting, Disconnected) => true,

            (Connected, Disconnected) => true,
            (Connected, Failed) => true,

            (Failed, Connecting) => true,
            (Failed, Disconnected) => true,

            (a, b) if a == b => true,

            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_sequence() {
        let mut session = BrokerSession::new();
        assert_eq!(session.status(), ConnectionStatus::Disconnected);

        session.transition(ConnectionStatus::Connecting, Some("connect")).unwrap();
        session.transition(ConnectionStatus::Connected, None).unwrap();
        assert!(session.status().is_connected());
        assert_eq!(session.history().len(), 2);
    }

    #[test]
    fn test_invalid_transition() {
        let mut session = BrokerSession::new();
        let err = session.transition(ConnectionStatus::Connected, None).unwrap_err();
        assert_eq!(err.from, ConnectionStatus::Disconnected);
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_failure_records_error() {
        let mut session = BrokerSession::new();
        session.transition(ConnectionStatus::Connecting, None).unwrap();
        session.transition(ConnectionStatus::Failed, Some("auth")).unwrap();
        assert_eq!(session.last_error(), Some("auth"));

        session.transition(ConnectionStatus::Connecting, None).unwrap();
        session.transition(ConnectionStatus::Connected, None).unwrap();
        assert_eq!(session.last_error(), None);
    }

    #[test]
    fn test_observe_accepts_transport_status() {
        let mut session = BrokerSession::new();
        session.observe(ConnectionStatus::Connected);
        assert_eq!(session.status(), ConnectionStatus::Connected);
        session.observe(ConnectionStatus::Connected);
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_reconnects, 5);
        assert_eq!(policy.connection_timeout, Duration::from_secs(600));
    }
}
