//! Connection state machine.
//!
//! The connection kernel broadcasts its current state over a
//! `tokio::sync::watch` channel. Consumers can observe transitions without
//! polling and without being coupled to the kernel's internals.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected ──> Connecting ──> Connected <──> Reconnecting
//!                      │               │               │
//!                      └───────────────┴───────────────┴──> Closed
//! ```
//!
//! `Closed` is terminal: once entered, no further transitions occur.

use std::fmt;

/// Current state of the managed connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No connection is established. Carries the reason for the most
    /// recent loss (or "not yet connected" before the first attempt).
    Disconnected(String),

    /// The first connect cycle over the server pool is in progress.
    Connecting,

    /// A connection is established and the handshake has completed.
    Connected,

    /// The connection was lost and a reconnect attempt is pending or in
    /// flight. Carries the attempt number since the last success.
    Reconnecting(u32),

    /// The client was closed. Terminal.
    Closed,
}

impl ConnectionState {
    /// Short machine-friendly name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting(_) => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }

    /// Human-readable details for the state, if any.
    pub fn details(&self) -> Option<String> {
        match self {
            ConnectionState::Disconnected(reason) => Some(reason.clone()),
            ConnectionState::Reconnecting(attempt) => Some(format!("attempt {attempt}")),
            _ => None,
        }
    }

    /// Returns `true` when a live, handshake-complete connection exists.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Returns `true` once the client has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.details() {
            Some(details) => write!(f, "{} ({})", self.as_str(), details),
            None => write!(f, "{}", self.as_str()),
        }
    }
}
