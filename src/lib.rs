//! # beeline
//!
//! Resilient publish/subscribe messaging client with server failover and
//! automatic reconnection.
//!
//! The crate speaks a CRLF-framed text protocol over TCP (optionally
//! upgraded to TLS in place) and manages one logical connection against
//! an ordered pool of servers. Subscriptions, in-flight requests, and
//! flush barriers all survive reconnection transparently.
//!
//! ## Quick start
//!
//! ```ignore
//! use beeline::{Client, Config, SubscribeOptions};
//!
//! #[tokio::main]
//! async fn main() -> beeline::Result<()> {
//!     let config = Config {
//!         servers: vec![
//!             "nats://primary.internal:4222".into(),
//!             "nats://standby.internal:4222".into(),
//!         ],
//!         ..Config::default()
//!     };
//!
//!     let client = Client::connect(config).await?;
//!
//!     client
//!         .subscribe("orders.created", SubscribeOptions::default(), |msg| {
//!             if let Ok(msg) = msg {
//!                 println!("order: {:?}", msg.payload);
//!             }
//!         })
//!         .await?;
//!
//!     client.publish("orders.created", "hello".as_bytes().to_vec()).await?;
//!     client.flush().await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Request/reply
//!
//! ```ignore
//! use beeline::{ClientError, RequestOptions};
//!
//! let handle = client
//!     .request("inventory.check", b"sku-42".to_vec(), RequestOptions::default(), |reply| {
//!         match reply {
//!             Ok(msg) => println!("reply: {:?}", msg.payload),
//!             Err(ClientError::RequestTimeout) => eprintln!("no responder"),
//!             Err(e) => eprintln!("request failed: {e}"),
//!         }
//!     })
//!     .await?;
//!
//! // handle.cancel() guarantees no callback fires after it returns.
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  commands   ┌───────────────────┐   frames   ┌────────┐
//! │  Client  │────────────>│ Connection kernel │<──────────>│ Server │
//! │ (facade) │             │  (owns socket,    │            │  pool  │
//! └──────────┘             │   timers, flush,  │            └────────┘
//!      │                   │   reconnection)   │
//!      │  state / events   └───────────────────┘
//!      └────────< watch + broadcast channels
//! ```
//!
//! The kernel task is the single ordered work stream: every message
//! delivery and every deadline expiry is processed there, in order, which
//! is what makes the exactly-once timeout guarantees hold without
//! per-subscription locking.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Disconnected ──> Connecting ──> Connected <──> Reconnecting
//!                      │               │               │
//!                      └───────────────┴───────────────┴──> Closed
//! ```
//!
//! - The first connect cycle tries every pool endpoint once; only if all
//!   of them merely hit the connect deadline does `Client::connect`
//!   surface `ClientError::ConnectTimeout`.
//! - A server that accepts the connection but then misbehaves during the
//!   handshake is a retryable failure, never a timeout: the supervisor
//!   moves on to the next endpoint.
//! - After a loss, reconnect attempts pace at the configured delay until
//!   the attempt budget runs out.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod pool;
pub mod proto;
pub mod request;
pub mod state;
pub mod subscription;

mod connection;
mod retry;
mod transport;

// Core client surface
pub use client::Client;
pub use config::{AuthConfig, Config, TlsConfig};
pub use error::ClientError;

// Messaging types
pub use request::{RequestHandle, RequestOptions};
pub use subscription::{Message, SubscribeOptions, SubscriptionHandle};

// Lifecycle observation
pub use events::ClientEvent;
pub use state::ConnectionState;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
