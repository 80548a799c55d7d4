//! Request/reply coordination over inbox subjects.
//!
//! A request is a publish carrying a unique reply subject plus an inbox
//! subscription bounded by a reply count and a deadline. Replies are
//! delivered to the callback as they arrive; if the deadline fires with
//! fewer than the expected replies, the callback receives
//! `ClientError::RequestTimeout` exactly once, after any partial replies.

use std::time::Duration;

use crate::connection::Command;
use crate::subscription::SharedRegistry;

/// Prefix for generated reply subjects.
const INBOX_PREFIX: &str = "_INBOX";

/// Options for `Client::request`.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Deadline for collecting `max_replies` replies.
    pub timeout: Duration,

    /// Number of replies to collect before the request completes.
    pub max_replies: u64,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_replies: 1,
        }
    }
}

/// Generates a unique reply subject.
pub(crate) fn new_inbox() -> String {
    format!("{INBOX_PREFIX}.{}", uuid::Uuid::new_v4().simple())
}

/// Handle to an in-flight request.
///
/// Dropping the handle does NOT cancel the request; call `cancel()` for
/// that. The handle is cheap to clone.
#[derive(Clone)]
pub struct RequestHandle {
    pub(crate) sid: u64,
    pub(crate) inbox: String,
    pub(crate) registry: SharedRegistry,
    pub(crate) commands: tokio::sync::mpsc::Sender<Command>,
}

impl RequestHandle {
    /// The reply subject this request listens on.
    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    /// Cancels the request. Synchronous and idempotent: once this returns,
    /// neither a reply nor a timeout callback will fire. Wire cleanup is
    /// queued best-effort.
    pub fn cancel(&self) {
        if self.registry.close(self.sid) {
            let _ = self
                .commands
                .try_send(Command::Deregister { sid: self.sid });
        }
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("sid", &self.sid)
            .field("inbox", &self.inbox)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = RequestOptions::default();
        assert_eq!(opts.timeout, Duration::from_secs(2));
        assert_eq!(opts.max_replies, 1);
    }

    #[test]
    fn test_inbox_subjects_are_unique() {
        let a = new_inbox();
        let b = new_inbox();
        assert!(a.starts_with("_INBOX."));
        assert!(b.starts_with("_INBOX."));
        assert_ne!(a, b);
        // Subject tokens must not contain whitespace or dots beyond the
        // separator, or the wire framing would break.
        let token = a.strip_prefix("_INBOX.").unwrap();
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
