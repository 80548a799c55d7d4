//! Error handling for the messaging client.
//!
//! This module defines `ClientError`, the unified error type for every
//! operation in the crate. It aggregates errors from multiple sources
//! (network, TLS, configuration, protocol) into a single tagged enum that
//! application code can pattern-match on.
//!
//! # Error Categories
//!
//! **Configuration errors** (caught at startup):
//! - `Config`: validation failures in settings
//! - `InvalidServerUrl`: malformed endpoint URL
//!
//! **Connection errors** (transient or fatal connectivity issues):
//! - `ConnectTimeout`: no endpoint accepted a connection within the deadline
//! - `Handshake`: the server accepted the connection but the handshake failed
//! - `Tls`: TLS upgrade failed
//! - `Io`: socket-level failures
//!
//! **Operation timeouts** (delivered to callbacks):
//! - `SubscriptionTimeout`: fewer messages than expected before the deadline
//! - `RequestTimeout`: fewer replies than expected before the deadline
//!
//! The two timeout variants are deliberately distinct so a callback shared
//! between plain subscriptions and requests can tell them apart.
//!
//! # Usage
//!
//! Most functions return `Result<T, ClientError>`. Handle errors based on
//! recoverability:
//!
//! ```ignore
//! match client.publish("events.alpha", payload).await {
//!     Ok(()) => {}
//!     Err(ClientError::Closed) => return, // client was shut down
//!     Err(ClientError::Protocol(msg)) => eprintln!("rejected: {msg}"),
//!     Err(e) => eprintln!("transient failure: {e}"),
//! }
//! ```

use thiserror::Error;

/// The unified error type for messaging client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No server accepted a connection within the connect deadline.
    ///
    /// Surfaced by `Client::connect` only after every endpoint in the pool
    /// has been tried. The wrapped source is the transport-level cause
    /// (typically the elapsed deadline).
    #[error("connection timed out")]
    ConnectTimeout(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A subscription deadline fired before the expected message count
    /// arrived. Delivered to the subscription callback exactly once.
    #[error("subscription timed out")]
    SubscriptionTimeout,

    /// A request deadline fired before the expected reply count arrived.
    /// Delivered to the request callback exactly once, after any partial
    /// replies.
    #[error("request timed out")]
    RequestTimeout,

    /// The server sent a frame the client could not understand, or an
    /// operation violated a server-advertised limit.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The TLS upgrade failed (certificate validation, handshake, or
    /// configuration loading).
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The server accepted the connection but the handshake did not
    /// complete: it reset the stream, rejected our connect options, or
    /// stalled past the handshake cap. Always retryable, never reported
    /// as a connect timeout.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A server URL in the configuration could not be parsed.
    #[error("invalid server URL: {0}")]
    InvalidServerUrl(String),

    /// Configuration validation failed.
    ///
    /// Usually caught during startup; fix the configuration and restart.
    #[error("configuration error: {0}")]
    Config(#[from] validator::ValidationErrors),

    /// Socket-level I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The client has been closed; no further operations are possible.
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// Returns `true` for the two operation-timeout variants.
    ///
    /// Connect timeouts are a connection-establishment concern and are
    /// intentionally excluded.
    pub fn is_operation_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::SubscriptionTimeout | ClientError::RequestTimeout
        )
    }

    /// Returns `true` when the connection attempt hit the connect deadline.
    pub fn is_connect_timeout(&self) -> bool {
        matches!(self, ClientError::ConnectTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_timeout_carries_source() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline elapsed");
        let err = ClientError::ConnectTimeout(Box::new(io));

        assert!(err.is_connect_timeout());
        let source = std::error::Error::source(&err).expect("source must be preserved");
        assert!(source.to_string().contains("deadline elapsed"));
    }

    #[test]
    fn test_timeout_variants_are_distinct() {
        assert!(ClientError::SubscriptionTimeout.is_operation_timeout());
        assert!(ClientError::RequestTimeout.is_operation_timeout());
        assert_ne!(
            ClientError::SubscriptionTimeout.to_string(),
            ClientError::RequestTimeout.to_string()
        );

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "x");
        assert!(!ClientError::ConnectTimeout(Box::new(io)).is_operation_timeout());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ClientError::Protocol("unknown control line".into());
        assert_eq!(err.to_string(), "protocol error: unknown control line");
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err: ClientError = io.into();
        assert!(err.to_string().contains("peer reset"));
    }

    #[test]
    fn test_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(ClientError::Closed);
        assert_eq!(err.to_string(), "client is closed");
    }
}
