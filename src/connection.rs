//! Connection kernel: the single ordered work stream behind a client.
//!
//! The kernel task owns the socket, the command channel from the client
//! facade, the deadline timers, and the flush waiter queue. Every callback
//! invocation happens here, so a message delivery and a deadline expiry
//! racing for the same subscription resolve by the order they reach this
//! task — the loser finds the registry entry gone and drops out silently.
//!
//! Reconnection is supervised here as well: on stream loss the kernel
//! cycles the server pool with the configured inter-attempt delay while
//! staying responsive to commands and timers, then replays subscription
//! state over the fresh connection.

use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::pool::ServerPool;
use crate::proto::{self, ServerOp};
use crate::retry::RetryPolicy;
use crate::state::ConnectionState;
use crate::subscription::{Message, SharedRegistry};
use crate::transport::{Connector, Established, Stream};

/// Instructions from the client facade to the kernel.
pub(crate) enum Command {
    Publish {
        subject: String,
        reply_to: Option<String>,
        payload: Bytes,
    },
    /// The entry is already in the registry; the kernel writes the SUB
    /// frame and arms the deadline timer.
    Subscribe { sid: u64 },
    /// The entry is already removed; the kernel performs wire cleanup.
    Deregister { sid: u64 },
    Flush {
        done: oneshot::Sender<Result<(), ClientError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Why a connected session ended.
enum Outcome {
    /// close() or client teardown; the kernel is done.
    Shutdown,
    /// The stream failed; reconnection may follow.
    StreamLost(ClientError),
}

/// Result of the reconnection loop.
enum Reconnect {
    Established(Established),
    Shutdown,
    GaveUp(String),
}

pub(crate) struct ConnectionKernel {
    pool: ServerPool,
    connector: Connector,
    registry: SharedRegistry,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    retry: RetryPolicy,
    reconnect_enabled: bool,
    /// Deadline timers for subscriptions and requests, keyed by sid.
    timers: DelayQueue<u64>,
    /// Keys of the armed timers, by sid. Kernel-owned: keys never leave
    /// this task, so a recycled slab key cannot cancel a stranger's timer.
    timer_keys: HashMap<u64, delay_queue::Key>,
    /// Outbound bytes accumulated while no connection is available.
    pending: BytesMut,
    /// Flush waiters in PING order; resolved FIFO as PONGs arrive.
    flush_waiters: VecDeque<oneshot::Sender<Result<(), ClientError>>>,
    cancel: CancellationToken,
    /// Server-advertised payload limit, shared with the client facade.
    max_payload: Arc<AtomicUsize>,
    ever_connected: bool,
}

impl ConnectionKernel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        pool: ServerPool,
        connector: Connector,
        registry: SharedRegistry,
        commands: mpsc::Receiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        events: broadcast::Sender<ClientEvent>,
        cancel: CancellationToken,
        max_payload: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            pool,
            connector,
            registry,
            commands,
            state_tx,
            events,
            retry: RetryPolicy::new(config.reconnect_delay(), config.max_reconnect_attempts),
            reconnect_enabled: config.reconnect,
            timers: DelayQueue::new(),
            timer_keys: HashMap::new(),
            pending: BytesMut::new(),
            flush_waiters: VecDeque::new(),
            cancel,
            max_payload,
            ever_connected: false,
        }
    }

    /// Runs the kernel to completion. `first` resolves when the initial
    /// connect cycle either lands a connection or exhausts the pool.
    pub async fn run(mut self, first: oneshot::Sender<Result<(), ClientError>>) {
        self.update_state(ConnectionState::Connecting);
        match self.initial_connect().await {
            Ok(est) => {
                self.drive(est, first).await;
            }
            Err(e) => {
                warn!(error = %e, "initial connect cycle exhausted the server pool");
                self.update_state(ConnectionState::Disconnected(e.to_string()));
                let _ = first.send(Err(e));
            }
        }
        debug!("connection kernel stopped");
    }

    /// One pass over the whole pool with no inter-attempt delay. The error
    /// surfaced to the caller is the last attempt's failure; when every
    /// endpoint merely hit the connect deadline that is a connect timeout.
    async fn initial_connect(&mut self) -> Result<Established, ClientError> {
        let mut last_err: Option<ClientError> = None;
        for _ in 0..self.pool.len() {
            let endpoint = self.pool.next().clone();
            debug!(server = %endpoint, "connecting");
            match self.connector.connect(&endpoint).await {
                Ok(est) => return Ok(est),
                Err(e) => {
                    warn!(server = %endpoint, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| ClientError::Handshake("no endpoints available".into())))
    }

    async fn drive(&mut self, est: Established, first: oneshot::Sender<Result<(), ClientError>>) {
        let mut first = Some(first);
        let mut next = Some(est);
        loop {
            let est = match next.take() {
                Some(e) => e,
                None => match self.run_reconnecting().await {
                    Reconnect::Established(e) => e,
                    Reconnect::Shutdown => return,
                    Reconnect::GaveUp(reason) => {
                        warn!(reason = %reason, "abandoning reconnection");
                        self.emit(ClientEvent::Disconnected {
                            reason: reason.clone(),
                        });
                        self.update_state(ConnectionState::Disconnected(reason));
                        return;
                    }
                },
            };

            match self.run_connected(est, &mut first).await {
                Outcome::Shutdown => return,
                Outcome::StreamLost(e) => {
                    let reason = e.to_string();
                    warn!(error = %reason, "connection lost");
                    self.emit(ClientEvent::Disconnected {
                        reason: reason.clone(),
                    });
                    if !self.reconnect_enabled {
                        self.update_state(ConnectionState::Disconnected(reason));
                        return;
                    }
                }
            }
        }
    }

    /// Installs an established connection and services it until it is
    /// lost or the client shuts down.
    async fn run_connected(
        &mut self,
        est: Established,
        first: &mut Option<oneshot::Sender<Result<(), ClientError>>>,
    ) -> Outcome {
        let Established {
            stream,
            info,
            mut decoder,
        } = est;
        self.max_payload.store(info.max_payload, Ordering::Relaxed);
        let server = self.pool.current().to_string();
        let (mut reader, mut writer) = tokio::io::split(stream);

        if self.ever_connected {
            info!(server = %server, "reconnected");
            self.emit(ClientEvent::Reconnected {
                server: server.clone(),
            });
        } else {
            info!(server = %server, "connected");
            self.emit(ClientEvent::Connected {
                server: server.clone(),
            });
            self.ever_connected = true;
        }
        self.update_state(ConnectionState::Connected);
        self.retry.reset();
        if let Some(tx) = first.take() {
            let _ = tx.send(Ok(()));
        }

        // Replay client state: live subscriptions first, then writes that
        // accumulated while disconnected, then one PING per flush waiter
        // still awaiting its PONG.
        let mut replay = BytesMut::new();
        for meta in self.registry.snapshot() {
            proto::write_sub(&mut replay, &meta.subject, meta.queue_group.as_deref(), meta.sid);
            if let Some(remaining) = meta.remaining {
                proto::write_unsub(&mut replay, meta.sid, Some(remaining));
            }
        }
        replay.extend_from_slice(&self.pending);
        self.pending.clear();
        for _ in 0..self.flush_waiters.len() {
            proto::write_ping(&mut replay);
        }
        if !replay.is_empty() {
            if let Err(e) = writer.write_all(&replay).await {
                return Outcome::StreamLost(ClientError::Io(e));
            }
        }

        loop {
            // Drain already-buffered frames before parking on the socket.
            loop {
                match decoder.decode() {
                    Ok(Some(op)) => {
                        if let Err(e) = self.handle_op(op, &mut writer).await {
                            return Outcome::StreamLost(e);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return Outcome::StreamLost(e),
                }
            }

            let timers_armed = !self.timers.is_empty();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return self.shutdown(Some(&mut writer), None).await;
                }
                maybe_cmd = self.commands.recv() => match maybe_cmd {
                    None => return self.shutdown(Some(&mut writer), None).await,
                    Some(Command::Close { done }) => {
                        return self.shutdown(Some(&mut writer), Some(done)).await;
                    }
                    Some(cmd) => {
                        if let Err(e) = self.handle_command_online(cmd, &mut writer).await {
                            return Outcome::StreamLost(e);
                        }
                    }
                },
                expired = poll_fn(|cx| self.timers.poll_expired(cx)), if timers_armed => {
                    if let Some(expired) = expired {
                        let sid = expired.into_inner();
                        if self.fire_timeout(sid) {
                            let mut out = BytesMut::new();
                            proto::write_unsub(&mut out, sid, None);
                            if let Err(e) = writer.write_all(&out).await {
                                return Outcome::StreamLost(ClientError::Io(e));
                            }
                        }
                    }
                }
                read = reader.read_buf(decoder.buffer_mut()) => match read {
                    Ok(0) => {
                        return Outcome::StreamLost(ClientError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "server closed the connection",
                        )));
                    }
                    Ok(_) => {}
                    Err(e) => return Outcome::StreamLost(ClientError::Io(e)),
                },
            }
        }
    }

    /// Cycles the pool with the configured delay until a connection lands,
    /// the budget runs out, or the client shuts down. Commands and timers
    /// stay serviced throughout, so deadlines fire on schedule.
    async fn run_reconnecting(&mut self) -> Reconnect {
        loop {
            let delay = match self.retry.next_delay() {
                Ok(d) => d,
                Err(e) => return Reconnect::GaveUp(e.to_string()),
            };
            self.update_state(ConnectionState::Reconnecting(self.retry.attempt()));
            if let Some(out) = self.wait_offline(delay).await {
                return out;
            }

            let endpoint = self.pool.next().clone();
            info!(server = %endpoint, attempt = self.retry.attempt(), "reconnecting");
            let connector = self.connector.clone();
            let mut attempt = tokio::spawn(async move { connector.connect(&endpoint).await });

            loop {
                let timers_armed = !self.timers.is_empty();
                tokio::select! {
                    joined = &mut attempt => {
                        match joined {
                            Ok(Ok(est)) => return Reconnect::Established(est),
                            Ok(Err(e)) => {
                                warn!(error = %e, "reconnect attempt failed");
                                break;
                            }
                            Err(e) => {
                                error!(error = %e, "reconnect attempt task failed");
                                break;
                            }
                        }
                    }
                    _ = self.cancel.cancelled() => {
                        attempt.abort();
                        self.shutdown(None, None).await;
                        return Reconnect::Shutdown;
                    }
                    maybe_cmd = self.commands.recv() => match maybe_cmd {
                        None => {
                            attempt.abort();
                            self.shutdown(None, None).await;
                            return Reconnect::Shutdown;
                        }
                        Some(Command::Close { done }) => {
                            attempt.abort();
                            self.shutdown(None, Some(done)).await;
                            return Reconnect::Shutdown;
                        }
                        Some(cmd) => self.handle_command_offline(cmd),
                    },
                    expired = poll_fn(|cx| self.timers.poll_expired(cx)), if timers_armed => {
                        if let Some(expired) = expired {
                            self.fire_timeout(expired.into_inner());
                        }
                    }
                }
            }
        }
    }

    /// Sleeps out the inter-attempt delay while staying responsive.
    /// Returns `Some` when the kernel should stop instead of retrying.
    async fn wait_offline(&mut self, delay: Duration) -> Option<Reconnect> {
        let deadline = Instant::now() + delay;
        loop {
            let timers_armed = !self.timers.is_empty();
            tokio::select! {
                _ = sleep_until(deadline) => return None,
                _ = self.cancel.cancelled() => {
                    self.shutdown(None, None).await;
                    return Some(Reconnect::Shutdown);
                }
                maybe_cmd = self.commands.recv() => match maybe_cmd {
                    None => {
                        self.shutdown(None, None).await;
                        return Some(Reconnect::Shutdown);
                    }
                    Some(Command::Close { done }) => {
                        self.shutdown(None, Some(done)).await;
                        return Some(Reconnect::Shutdown);
                    }
                    Some(cmd) => self.handle_command_offline(cmd),
                },
                expired = poll_fn(|cx| self.timers.poll_expired(cx)), if timers_armed => {
                    if let Some(expired) = expired {
                        self.fire_timeout(expired.into_inner());
                    }
                }
            }
        }
    }

    async fn handle_command_online(
        &mut self,
        cmd: Command,
        writer: &mut WriteHalf<Stream>,
    ) -> Result<(), ClientError> {
        let mut out = BytesMut::new();
        match cmd {
            Command::Publish {
                subject,
                reply_to,
                payload,
            } => {
                proto::write_pub(&mut out, &subject, reply_to.as_deref(), &payload);
            }
            Command::Subscribe { sid } => {
                if let Some(meta) = self.registry.frame_meta(sid) {
                    proto::write_sub(&mut out, &meta.subject, meta.queue_group.as_deref(), sid);
                    if let Some(remaining) = meta.remaining {
                        proto::write_unsub(&mut out, sid, Some(remaining));
                    }
                    self.arm_timer(sid, meta.deadline);
                }
            }
            Command::Deregister { sid } => {
                self.disarm_timer(sid);
                proto::write_unsub(&mut out, sid, None);
            }
            Command::Flush { done } => {
                proto::write_ping(&mut out);
                self.flush_waiters.push_back(done);
            }
            // Intercepted by the select arms.
            Command::Close { done } => {
                let _ = done.send(());
            }
        }
        if !out.is_empty() {
            writer.write_all(&out).await.map_err(ClientError::Io)?;
        }
        Ok(())
    }

    /// Command handling while no connection exists. Publishes are buffered
    /// for the next connection; SUB replay is derived from the registry at
    /// install time, so subscribes only arm their timer here.
    fn handle_command_offline(&mut self, cmd: Command) {
        match cmd {
            Command::Publish {
                subject,
                reply_to,
                payload,
            } => {
                proto::write_pub(&mut self.pending, &subject, reply_to.as_deref(), &payload);
            }
            Command::Subscribe { sid } => {
                if let Some(meta) = self.registry.frame_meta(sid) {
                    self.arm_timer(sid, meta.deadline);
                }
            }
            Command::Deregister { sid } => self.disarm_timer(sid),
            Command::Flush { done } => {
                self.flush_waiters.push_back(done);
            }
            // Intercepted by the select arms.
            Command::Close { done } => {
                let _ = done.send(());
            }
        }
    }

    async fn handle_op(
        &mut self,
        op: ServerOp,
        writer: &mut WriteHalf<Stream>,
    ) -> Result<(), ClientError> {
        match op {
            ServerOp::Msg {
                subject,
                sid,
                reply_to,
                payload,
            } => {
                self.dispatch(Message {
                    subject,
                    sid,
                    reply_to,
                    payload,
                });
            }
            ServerOp::Ping => {
                let mut out = BytesMut::new();
                proto::write_pong(&mut out);
                writer.write_all(&out).await.map_err(ClientError::Io)?;
            }
            ServerOp::Pong => match self.flush_waiters.pop_front() {
                Some(done) => {
                    let _ = done.send(Ok(()));
                }
                None => trace!("unsolicited PONG"),
            },
            ServerOp::Ok => trace!("server acknowledged operation"),
            ServerOp::Err(reason) => {
                warn!(reason = %reason, "server reported error");
                self.emit(ClientEvent::ServerError { reason });
            }
            ServerOp::Info(info) => {
                self.max_payload.store(info.max_payload, Ordering::Relaxed);
                if !info.connect_urls.is_empty() {
                    debug!(
                        count = info.connect_urls.len(),
                        "ignoring server-advertised endpoints"
                    );
                }
            }
        }
        Ok(())
    }

    /// Delivers a message to its subscription, honoring expected-count
    /// auto-removal.
    fn dispatch(&mut self, msg: Message) {
        let sid = msg.sid;
        match self.registry.begin_delivery(sid) {
            None => trace!(sid, "message for unknown subscription dropped"),
            Some(delivery) => {
                let mut callback = delivery.callback;
                callback(Ok(msg));
                if delivery.terminal {
                    self.disarm_timer(sid);
                    debug!(sid, "subscription reached its expected count");
                } else {
                    self.registry.finish_delivery(sid, callback);
                }
            }
        }
    }

    /// Fires a deadline expiry. Returns `true` when a callback was
    /// actually invoked (the entry was still live).
    fn fire_timeout(&mut self, sid: u64) -> bool {
        // The timer already left the queue; its key is dead.
        self.timer_keys.remove(&sid);
        match self.registry.expire(sid) {
            Some((mut callback, kind)) => {
                debug!(sid, kind = ?kind, "deadline fired");
                callback(Err(kind.to_error()));
                true
            }
            None => false,
        }
    }

    fn arm_timer(&mut self, sid: u64, deadline: Option<Instant>) {
        if let Some(deadline) = deadline {
            let key = self.timers.insert_at(sid, deadline);
            self.timer_keys.insert(sid, key);
        }
    }

    /// Cancels the armed deadline timer for a sid, if any.
    fn disarm_timer(&mut self, sid: u64) {
        if let Some(key) = self.timer_keys.remove(&sid) {
            self.timers.try_remove(&key);
        }
    }

    /// Terminal teardown: best-effort flush of the socket, silent removal
    /// of every subscription and request, `Closed` state and event.
    async fn shutdown(
        &mut self,
        writer: Option<&mut WriteHalf<Stream>>,
        done: Option<oneshot::Sender<()>>,
    ) -> Outcome {
        debug!("closing client");
        if let Some(writer) = writer {
            let _ = writer.flush().await;
            let _ = writer.shutdown().await;
        }
        self.registry.clear();
        self.timers.clear();
        self.timer_keys.clear();
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Closed));
        }
        self.pending.clear();
        self.emit(ClientEvent::Closed);
        self.update_state(ConnectionState::Closed);
        if let Some(done) = done {
            let _ = done.send(());
        }
        Outcome::Shutdown
    }

    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn update_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "connection state changed");
            *current = next;
            true
        });
    }
}
