//! Subscription registry with timeout and expected-count supervision.
//!
//! Entries are keyed by a client-allocated numeric sid. The registry is
//! shared between the client facade (which registers and closes entries)
//! and the connection kernel (which delivers messages and fires deadline
//! expiries). The lock is a plain mutex held only for map surgery, never
//! across an `.await` or a user callback.
//!
//! Exactly-once semantics hinge on two rules:
//! - every terminal transition (Nth delivery, expiry, close) removes the
//!   entry from the map under the lock, atomically with the decision to
//!   invoke (or not invoke) the callback;
//! - only the kernel task invokes callbacks, so a message and a deadline
//!   racing resolve by the order they reach the kernel's work stream, and
//!   the loser finds the entry gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::time::Instant;

use crate::connection::Command;
use crate::error::ClientError;

/// A message delivered to a subscription or request callback.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub sid: u64,
    /// Subject to publish a reply to, when the sender expects one.
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

/// Callback invoked with each delivery, or once with a timeout error.
pub type MessageCallback = Box<dyn FnMut(Result<Message, ClientError>) + Send + 'static>;

/// Options for `Client::subscribe`.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Deadline for receiving `expected` messages (or any message when
    /// `expected` is unset). When it fires first, the callback receives
    /// `ClientError::SubscriptionTimeout` exactly once.
    pub timeout: Option<std::time::Duration>,

    /// Auto-unsubscribe after this many deliveries. When unset but a
    /// timeout is given, it defaults to 1.
    pub expected: Option<u64>,

    /// Queue group: the server delivers each message to one member of the
    /// group instead of every subscriber.
    pub queue_group: Option<String>,
}

/// Which error a deadline expiry delivers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TimeoutKind {
    Subscription,
    Request,
}

impl TimeoutKind {
    pub(crate) fn to_error(self) -> ClientError {
        match self {
            TimeoutKind::Subscription => ClientError::SubscriptionTimeout,
            TimeoutKind::Request => ClientError::RequestTimeout,
        }
    }
}

pub(crate) struct Entry {
    subject: String,
    queue_group: Option<String>,
    /// Taken out of the entry while the kernel runs the callback, so a
    /// re-entrant unsubscribe from inside the callback cannot deadlock.
    callback: Option<MessageCallback>,
    expected: Option<u64>,
    delivered: u64,
    deadline: Option<Instant>,
    kind: TimeoutKind,
}

/// Everything the kernel needs to register a new entry.
pub(crate) struct RegisterSpec {
    pub subject: String,
    pub queue_group: Option<String>,
    pub callback: MessageCallback,
    pub expected: Option<u64>,
    pub deadline: Option<Instant>,
    pub kind: TimeoutKind,
}

/// Wire-relevant view of an entry, used for SUB frames and replay.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FrameMeta {
    pub sid: u64,
    pub subject: String,
    pub queue_group: Option<String>,
    /// Deliveries still outstanding for a bounded entry; carried on the
    /// wire as `UNSUB <sid> <remaining>`.
    pub remaining: Option<u64>,
    pub deadline: Option<Instant>,
}

/// Outcome of `begin_delivery`.
pub(crate) struct Delivery {
    pub callback: MessageCallback,
    /// The entry reached its expected count and has been removed.
    pub terminal: bool,
}

struct RegistryInner {
    next_sid: u64,
    entries: HashMap<u64, Entry>,
}

/// Shared handle to the registry.
#[derive(Clone)]
pub(crate) struct SharedRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_sid: 1,
                entries: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocates a sid and stores the entry.
    pub fn register(&self, spec: RegisterSpec) -> u64 {
        let mut inner = self.lock();
        let sid = inner.next_sid;
        inner.next_sid += 1;
        inner.entries.insert(
            sid,
            Entry {
                subject: spec.subject,
                queue_group: spec.queue_group,
                callback: Some(spec.callback),
                expected: spec.expected,
                delivered: 0,
                deadline: spec.deadline,
                kind: spec.kind,
            },
        );
        sid
    }

    /// Counts a delivery and hands the callback out for invocation.
    ///
    /// When the delivery is terminal (expected count reached) the entry is
    /// removed here, atomically with the count. Returns `None` for unknown
    /// sids (already closed, expired, or never registered).
    pub fn begin_delivery(&self, sid: u64) -> Option<Delivery> {
        let mut inner = self.lock();
        let entry = inner.entries.get_mut(&sid)?;

        entry.delivered += 1;
        let terminal = entry.expected.is_some_and(|n| entry.delivered >= n);

        if terminal {
            let entry = inner.entries.remove(&sid)?;
            let callback = entry.callback?;
            Some(Delivery {
                callback,
                terminal: true,
            })
        } else {
            let callback = entry.callback.take()?;
            Some(Delivery {
                callback,
                terminal: false,
            })
        }
    }

    /// Returns the callback after a non-terminal invocation. Dropped
    /// silently when the entry was closed while the callback ran.
    pub fn finish_delivery(&self, sid: u64, callback: MessageCallback) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&sid) {
            entry.callback = Some(callback);
        }
    }

    /// Resolves a deadline expiry: removes the entry and hands out the
    /// callback plus the error kind to deliver. `None` when the entry is
    /// already gone (delivered out, unsubscribed, or torn down).
    pub fn expire(&self, sid: u64) -> Option<(MessageCallback, TimeoutKind)> {
        let mut inner = self.lock();
        let entry = inner.entries.remove(&sid)?;
        let kind = entry.kind;
        entry.callback.map(|cb| (cb, kind))
    }

    /// Synchronously closes an entry: after this returns, no callback
    /// (message or timeout) will be invoked for the sid. Idempotent;
    /// returns `false` when the entry was already gone.
    pub fn close(&self, sid: u64) -> bool {
        let mut inner = self.lock();
        inner.entries.remove(&sid).is_some()
    }

    /// Wire view of a single entry.
    pub fn frame_meta(&self, sid: u64) -> Option<FrameMeta> {
        let inner = self.lock();
        inner.entries.get(&sid).map(|e| FrameMeta {
            sid,
            subject: e.subject.clone(),
            queue_group: e.queue_group.clone(),
            remaining: e.expected.map(|n| n.saturating_sub(e.delivered)),
            deadline: e.deadline,
        })
    }

    /// Wire view of every live entry, for replay after a reconnect.
    pub fn snapshot(&self) -> Vec<FrameMeta> {
        let inner = self.lock();
        let mut metas: Vec<FrameMeta> = inner
            .entries
            .iter()
            .map(|(sid, e)| FrameMeta {
                sid: *sid,
                subject: e.subject.clone(),
                queue_group: e.queue_group.clone(),
                remaining: e.expected.map(|n| n.saturating_sub(e.delivered)),
                deadline: e.deadline,
            })
            .collect();
        metas.sort_by_key(|m| m.sid);
        metas
    }

    /// Silently discards every entry. Used by close(): no callbacks fire.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

/// Handle to a live subscription.
///
/// Dropping the handle does NOT unsubscribe; call `unsubscribe()` for
/// that. The handle is cheap to clone.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub(crate) sid: u64,
    pub(crate) registry: SharedRegistry,
    pub(crate) commands: tokio::sync::mpsc::Sender<Command>,
}

impl SubscriptionHandle {
    /// The client-allocated subscription id.
    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Removes the subscription. Synchronous and idempotent: once this
    /// returns, neither a message nor a timeout callback will fire. Wire
    /// cleanup (`UNSUB`) is queued best-effort.
    pub fn unsubscribe(&self) {
        if self.registry.close(self.sid) {
            let _ = self
                .commands
                .try_send(Command::Deregister { sid: self.sid });
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("sid", &self.sid)
            .finish_non_exhaustive()
    }
}
