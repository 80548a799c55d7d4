//! Client configuration with validation.
//!
//! `Config` is deserializable (TOML/JSON/env layers are the caller's
//! concern) and validated with the `validator` crate before a client is
//! built, so malformed settings fail fast at startup instead of surfacing
//! as strange runtime behavior.
//!
//! # Examples
//!
//! ```ignore
//! let config = Config {
//!     servers: vec!["nats://127.0.0.1:4222".into()],
//!     ..Config::default()
//! };
//! let client = Client::connect(config).await?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Default wire port applied when a server URL omits one.
pub const DEFAULT_PORT: u16 = 4222;

fn default_servers() -> Vec<String> {
    vec![format!("nats://127.0.0.1:{DEFAULT_PORT}")]
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_reconnect() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_command_channel_capacity() -> usize {
    128
}

/// Validates that a configured file path exists and is a regular file.
fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    let meta = std::path::Path::new(path);
    if !meta.exists() {
        return Err(ValidationError::new("file_not_found"));
    }
    if !meta.is_file() {
        return Err(ValidationError::new("not_a_file"));
    }
    Ok(())
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Server URLs in failover order: `scheme://[user:pass@]host[:port]`.
    /// The `tls` scheme forces a TLS upgrade for that endpoint.
    #[validate(length(min = 1, message = "at least one server URL is required"))]
    pub servers: Vec<String>,

    /// Optional client name advertised to the server during the handshake.
    /// A UUID-derived name is generated when absent.
    #[validate(length(min = 1, max = 128))]
    pub name: Option<String>,

    /// Deadline for establishing a connection to a single endpoint, in
    /// milliseconds. Covers the TCP connect and the wait for the server's
    /// metadata frame.
    #[validate(range(min = 50, max = 300_000))]
    pub connect_timeout_ms: u64,

    /// Whether to reconnect automatically after a stream loss.
    pub reconnect: bool,

    /// Delay between reconnect attempts, in milliseconds.
    #[validate(range(min = 10, max = 300_000))]
    pub reconnect_delay_ms: u64,

    /// Maximum reconnect attempts since the last successful connection.
    /// `0` means unlimited.
    pub max_reconnect_attempts: u32,

    /// Shuffle the server pool once at startup. The cycling order is
    /// stable afterwards.
    pub randomize_servers: bool,

    /// Request per-operation acknowledgements from the server.
    pub verbose: bool,

    /// Request strict subject checking from the server.
    pub pedantic: bool,

    /// Capacity of the internal command channel between the client facade
    /// and the connection kernel.
    #[validate(range(min = 1, max = 65_536))]
    pub command_channel_capacity: usize,

    /// TLS settings. TLS is also negotiated when an endpoint uses the
    /// `tls` scheme or the server requires it.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,

    /// Authentication credentials sent with the connect options.
    pub auth: Option<AuthConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            name: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect: default_reconnect(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            randomize_servers: false,
            verbose: false,
            pedantic: false,
            command_channel_capacity: default_command_channel_capacity(),
            tls: None,
            auth: None,
        }
    }
}

impl Config {
    /// Connect deadline as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Inter-attempt reconnect delay as a `Duration`.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Client name to advertise: the configured one, or a generated
    /// UUID-derived name.
    pub fn client_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("beeline-{}", uuid::Uuid::new_v4().simple()))
    }
}

/// TLS settings: certificate paths in PEM format.
///
/// When `ca_cert_path` is unset the system webpki roots are used for
/// server verification. Client authentication requires both the
/// certificate and the key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    /// CA certificate used to verify the server.
    #[validate(custom(function = "validate_file_path"))]
    pub ca_cert_path: Option<String>,

    /// Client certificate for mutual TLS.
    #[validate(custom(function = "validate_file_path"))]
    pub client_cert_path: Option<String>,

    /// Client private key for mutual TLS (unencrypted PEM).
    #[validate(custom(function = "validate_file_path"))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    /// Returns `true` when both client certificate and key are configured.
    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }
}

/// Authentication material for the connect options.
///
/// Either `user`/`pass` or `token` is sent; configuring both prefers the
/// user/pass pair. Endpoint-embedded credentials (`user:pass@host`) take
/// precedence over this section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub user: Option<String>,
    pub pass: Option<String>,
    pub token: Option<String>,
}
