//! Typed lifecycle event stream.
//!
//! Instead of registering bare callbacks for connection lifecycle changes,
//! consumers subscribe to a broadcast channel of `ClientEvent` values via
//! `Client::events()`. Slow consumers lag (per broadcast-channel semantics)
//! rather than blocking the connection kernel.

/// A connection lifecycle notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The first connection was established. Emitted at most once per
    /// client.
    Connected {
        /// `host:port` of the endpoint that accepted us.
        server: String,
    },

    /// A connection was re-established after a loss. Emitted once per
    /// successful reconnect.
    Reconnected {
        /// `host:port` of the endpoint that accepted us.
        server: String,
    },

    /// The connection was lost. Reconnection may follow unless it is
    /// disabled or the attempt budget is exhausted.
    Disconnected {
        /// Why the connection was lost.
        reason: String,
    },

    /// The server reported an error frame for a prior operation. The
    /// connection stays up.
    ServerError {
        /// The server's error text.
        reason: String,
    },

    /// The client was closed. Terminal; no further events follow.
    Closed,
}

impl ClientEvent {
    /// Short machine-friendly name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientEvent::Connected { .. } => "connected",
            ClientEvent::Reconnected { .. } => "reconnected",
            ClientEvent::Disconnected { .. } => "disconnected",
            ClientEvent::ServerError { .. } => "server_error",
            ClientEvent::Closed => "closed",
        }
    }
}
