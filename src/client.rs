//! Public client facade.
//!
//! `Client` is a cheap-to-clone handle over the connection kernel task.
//! All socket work happens on the kernel; the facade registers
//! subscriptions, queues commands, and exposes the state/event channels.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use validator::Validate;

use crate::config::Config;
use crate::connection::{Command, ConnectionKernel};
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::pool::ServerPool;
use crate::request::{new_inbox, RequestHandle, RequestOptions};
use crate::state::ConnectionState;
use crate::subscription::{
    Message, RegisterSpec, SharedRegistry, SubscribeOptions, SubscriptionHandle, TimeoutKind,
};
use crate::transport::Connector;

/// Handle to a managed connection.
///
/// Created with [`Client::connect`], which resolves once the first
/// connection is established (or the whole server pool has been tried and
/// failed). The handle can be cloned freely; all clones drive the same
/// connection. See the crate docs for a usage walkthrough.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::Sender<Command>,
    registry: SharedRegistry,
    state_rx: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
    max_payload: Arc<AtomicUsize>,
}

impl Client {
    /// Validates the configuration, spawns the connection kernel, and
    /// waits for the first connect cycle to finish.
    ///
    /// # Errors
    ///
    /// - `ClientError::Config` / `InvalidServerUrl` for bad settings.
    /// - `ClientError::ConnectTimeout` when no endpoint accepted a
    ///   connection within the deadline (only after the entire pool has
    ///   been tried).
    /// - The last attempt's failure otherwise.
    pub async fn connect(config: Config) -> Result<Self, ClientError> {
        config.validate()?;
        let pool = ServerPool::new(&config.servers, config.randomize_servers)?;
        let connector = Connector::from_config(&config)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Disconnected("not yet connected".into()));
        let (event_tx, _) = broadcast::channel(64);
        let registry = SharedRegistry::new();
        let cancel = CancellationToken::new();
        let max_payload = Arc::new(AtomicUsize::new(0));

        let kernel = ConnectionKernel::new(
            &config,
            pool,
            connector,
            registry.clone(),
            cmd_rx,
            state_tx,
            event_tx.clone(),
            cancel.clone(),
            max_payload.clone(),
        );

        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(kernel.run(first_tx));
        first_rx.await.map_err(|_| ClientError::Closed)??;

        Ok(Self {
            commands: cmd_tx,
            registry,
            state_rx,
            events: event_tx,
            cancel,
            max_payload,
        })
    }

    /// Publishes a payload to a subject.
    ///
    /// While disconnected (reconnecting), the publish is buffered and
    /// written after the next successful handshake.
    pub async fn publish(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        self.publish_with_reply(subject, None::<String>, payload).await
    }

    /// Publishes a payload carrying a reply subject.
    pub async fn publish_with_reply(
        &self,
        subject: impl Into<String>,
        reply_to: Option<impl Into<String>>,
        payload: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        let payload = payload.into();
        let limit = self.max_payload.load(Ordering::Relaxed);
        if limit > 0 && payload.len() > limit {
            return Err(ClientError::Protocol(format!(
                "payload of {} bytes exceeds server limit of {limit} bytes",
                payload.len()
            )));
        }
        self.commands
            .send(Command::Publish {
                subject: subject.into(),
                reply_to: reply_to.map(Into::into),
                payload,
            })
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Subscribes to a subject.
    ///
    /// The callback runs on the connection task for every delivery; with
    /// `options.timeout` set it additionally receives
    /// `ClientError::SubscriptionTimeout` exactly once if fewer than
    /// `options.expected` messages (defaulting to one when a timeout is
    /// set) arrive in time. The subscription survives reconnects.
    pub async fn subscribe(
        &self,
        subject: impl Into<String>,
        options: SubscribeOptions,
        callback: impl FnMut(Result<Message, ClientError>) + Send + 'static,
    ) -> Result<SubscriptionHandle, ClientError> {
        self.ensure_open()?;
        let deadline = options.timeout.map(|t| Instant::now() + t);
        // A timed subscription without an explicit count is satisfied by
        // a single delivery.
        let expected = options.expected.or(options.timeout.map(|_| 1));
        let sid = self.registry.register(RegisterSpec {
            subject: subject.into(),
            queue_group: options.queue_group,
            callback: Box::new(callback),
            expected,
            deadline,
            kind: TimeoutKind::Subscription,
        });
        debug!(sid, "subscription registered");

        if self.commands.send(Command::Subscribe { sid }).await.is_err() {
            self.registry.close(sid);
            return Err(ClientError::Closed);
        }
        Ok(SubscriptionHandle {
            sid,
            registry: self.registry.clone(),
            commands: self.commands.clone(),
        })
    }

    /// Publishes a request and collects replies on a unique inbox subject.
    ///
    /// Replies are delivered to the callback as they arrive, up to
    /// `options.max_replies`; if the deadline fires first the callback
    /// receives `ClientError::RequestTimeout` once, after any partial
    /// replies.
    pub async fn request(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        options: RequestOptions,
        callback: impl FnMut(Result<Message, ClientError>) + Send + 'static,
    ) -> Result<RequestHandle, ClientError> {
        self.ensure_open()?;
        let inbox = new_inbox();
        let deadline = Instant::now() + options.timeout;
        let sid = self.registry.register(RegisterSpec {
            subject: inbox.clone(),
            queue_group: None,
            callback: Box::new(callback),
            expected: Some(options.max_replies.max(1)),
            deadline: Some(deadline),
            kind: TimeoutKind::Request,
        });
        debug!(sid, inbox = %inbox, "request registered");

        if self.commands.send(Command::Subscribe { sid }).await.is_err() {
            self.registry.close(sid);
            return Err(ClientError::Closed);
        }
        if let Err(e) = self
            .publish_with_reply(subject, Some(inbox.clone()), payload)
            .await
        {
            self.registry.close(sid);
            let _ = self.commands.try_send(Command::Deregister { sid });
            return Err(e);
        }

        Ok(RequestHandle {
            sid,
            inbox,
            registry: self.registry.clone(),
            commands: self.commands.clone(),
        })
    }

    /// Round-trips a PING to the server, resolving once everything
    /// written before it has been processed.
    pub async fn flush(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Flush { done: done_tx })
            .await
            .map_err(|_| ClientError::Closed)?;
        done_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Closes the client: disables reconnection, best-effort flushes the
    /// socket, silently tears down every subscription and request (their
    /// callbacks fire no further), and enters the terminal closed state.
    /// Idempotent.
    pub async fn close(&self) -> Result<(), ClientError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Close { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
        self.cancel.cancel();
        Ok(())
    }

    /// Snapshot of the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch channel following connection state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribes to lifecycle events (connected, reconnected,
    /// disconnected, closed).
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Number of live subscriptions and pending requests.
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.state_rx.borrow().is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &*self.state_rx.borrow())
            .field("subscriptions", &self.registry.len())
            .finish_non_exhaustive()
    }
}
