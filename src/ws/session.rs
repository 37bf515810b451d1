#![expect(
    clippy::module_name_repetitions,
    reason = "Session types expose their domain in the name for clarity"
)]

//! Session management: one persistent connection shared by many concurrent requests.
//!
//! The [`SessionManager`] spawns a single actor task that owns the [`Connection`] and drives the
//! session state machine. Callers never touch the connection; they talk to the actor over a
//! command channel, observe its state through a watch channel, and wait on their own entry in the
//! shared [`PendingTable`].
//!
//! ```text
//! Idle ──open──▶ Connecting ──ok──▶ Ready ◀──ok── Reconnecting
//!                    │                │  ──lost──▶     │
//!                  fail               │             exhausted
//!                    ▼                ▼                ▼
//!                 Closed ◀────────── close ────────  Closed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep, timeout_at};
use tokio_util::sync::CancellationToken;

use super::config::Config;
use super::connection::{CloseReason, Connection};
use super::error::WsError;
use super::pending::{CorrelationKey, PendingTable, Registration};
use super::traits::{Correlation, Decoded, Handshake, MessageCodec};
use crate::Result;
use crate::error::Error;

/// Longest wait a single request can ask for. Larger timeouts are clamped to it.
const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Session state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing requested yet
    Idle,
    /// First connection attempt in progress
    Connecting,
    /// Connected and accepting requests
    Ready {
        /// When the current connection was established
        since: Instant,
    },
    /// Connection lost, trying to re-establish it
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
    /// Terminal
    Closed {
        /// Why the session ended
        cause: CloseCause,
    },
}

impl SessionState {
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Ready or closed: waiting any longer will not change the outcome of a request.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.is_ready() || self.is_closed()
    }
}

/// Why a session reached [`SessionState::Closed`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// [`SessionManager::close`] was called
    Requested,
    /// The initial connection attempt failed
    ConnectFailed(String),
    /// The connection was lost and every reconnect attempt failed
    ReconnectExhausted {
        /// Number of attempts made
        attempts: u32,
    },
}

impl CloseCause {
    /// The error reported to operations attempted on a session closed for this reason.
    #[must_use]
    pub fn to_error(&self) -> Error {
        match self {
            Self::Requested => Error::client_closed(),
            Self::ConnectFailed(reason) => Error::connect_failed(reason.as_str()),
            Self::ReconnectExhausted { attempts } => Error::connection_lost(format!(
                "gave up after {attempts} reconnect attempts"
            )),
        }
    }
}

enum Command {
    Open {
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Send {
        frame: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Reported by the receive loop of a connection when it stops.
struct ConnectionClosed {
    generation: u64,
    reason: CloseReason,
}

enum ServeExit {
    Shutdown,
    Lost(CloseReason),
}

enum ReconnectOutcome {
    Connected(Connection),
    Shutdown,
    Exhausted(u32),
}

/// Multiplexes concurrent requests over one persistent connection.
///
/// Cloning is cheap and every clone drives the same session. The background actor stops when
/// [`SessionManager::close`] is called or when the last clone is dropped.
///
/// # Type Parameters
///
/// - `C`: Codec that implements [`MessageCodec`]
///
/// # Example
///
/// ```ignore
/// let session = SessionManager::new(endpoint, Config::default(), KeepaCodec::default());
/// let history = session.fetch("B08N5WRWNW", Duration::from_secs(5)).await?;
/// session.close().await;
/// ```
pub struct SessionManager<C: MessageCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: MessageCodec> Clone for SessionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: MessageCodec> {
    config: Config,
    codec: Arc<C>,
    pending: Arc<PendingTable<C::Payload>>,
    /// Watch channel sender for state changes, shared with the actor
    state_tx: watch::Sender<SessionState>,
    /// Sender channel for actor commands
    command_tx: mpsc::UnboundedSender<Command>,
    /// Source of correlation sequence numbers
    sequence: AtomicU64,
    shutdown: CancellationToken,
}

impl<C: MessageCodec> Drop for Inner<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<C: MessageCodec> SessionManager<C> {
    /// Create a new session and start its actor task.
    ///
    /// No connection is made until the first [`fetch`](Self::fetch) or [`open`](Self::open).
    /// Must be called from within a tokio runtime.
    pub fn new<H: Handshake>(handshake: H, config: Config, codec: C) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let codec = Arc::new(codec);
        let pending = Arc::new(PendingTable::new());
        let shutdown = CancellationToken::new();

        let actor = SessionActor {
            handshake: Box::new(handshake),
            config: config.clone(),
            codec: Arc::clone(&codec),
            pending: Arc::clone(&pending),
            state_tx: state_tx.clone(),
            commands: command_rx,
            events_tx,
            events: events_rx,
            shutdown: shutdown.clone(),
            generation: 0,
            open_waiters: Vec::new(),
        };

        tokio::spawn(actor.run());

        Self {
            inner: Arc::new(Inner {
                config,
                codec,
                pending,
                state_tx,
                command_tx,
                sequence: AtomicU64::new(0),
                shutdown,
            }),
        }
    }

    /// Connect now instead of on the first request.
    ///
    /// Resolves once the session is ready, or with the connect error.
    pub async fn open(&self) -> Result<()> {
        let (reply, ack) = oneshot::channel();
        if self
            .inner
            .command_tx
            .send(Command::Open { reply: Some(reply) })
            .is_err()
        {
            return Err(self.closed_error());
        }

        ack.await.unwrap_or_else(|_dropped| Err(self.closed_error()))
    }

    /// Request `product_id` and wait for its response, at most `timeout`.
    ///
    /// Always resolves by the deadline: with the decoded payload, or with the specific error for
    /// this request. A timeout only abandons the local wait; the server is not told.
    pub async fn fetch(&self, product_id: &str, timeout: Duration) -> Result<C::Payload> {
        if product_id.trim().is_empty() {
            return Err(Error::validation("product id must not be empty"));
        }

        let deadline = deadline_after(timeout);
        self.wait_until_ready(product_id, timeout, deadline).await?;

        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let key = CorrelationKey::new(product_id, sequence);
        let frame = self.inner.codec.encode(&key)?;
        let mut registration = self.inner.pending.register(key, deadline)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(key = %registration.key(), "sending request");

        let (reply, ack) = oneshot::channel();
        if self
            .inner
            .command_tx
            .send(Command::Send { frame, reply })
            .is_err()
        {
            return Err(self.closed_error());
        }

        match timeout_at(deadline, ack).await {
            Ok(Ok(Ok(()))) => {}
            // Dropping the registration removes the entry before the error is returned.
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_dropped)) => return Err(self.closed_error()),
            Err(_elapsed) => {
                return expire(&mut registration, Error::timeout(product_id, timeout)).await;
            }
        }

        match timeout_at(deadline, registration.receiver()).await {
            Ok(outcome) => flatten(outcome),
            Err(_elapsed) => expire(&mut registration, Error::timeout(product_id, timeout)).await,
        }
    }

    async fn wait_until_ready(
        &self,
        product_id: &str,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<()> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let current = state_rx.borrow_and_update().clone();

        match current {
            SessionState::Ready { .. } => return Ok(()),
            SessionState::Closed { cause } => return Err(cause.to_error()),
            SessionState::Idle => {
                // The actor is gone only if the session is closed, which the wait below reports.
                _ = self.inner.command_tx.send(Command::Open { reply: None });
            }
            _ => {}
        }

        if !self.inner.config.wait_for_ready {
            return Err(Error::not_connected());
        }

        let settled = match timeout_at(deadline, state_rx.wait_for(SessionState::is_settled)).await
        {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_closed)) => return Err(Error::client_closed()),
            Err(_elapsed) => return Err(Error::timeout(product_id, timeout)),
        };

        match settled {
            SessionState::Closed { cause } => Err(cause.to_error()),
            _ => Ok(()),
        }
    }

    /// Close the session.
    ///
    /// Idempotent and safe from any state. Every pending request resolves with
    /// [`Kind::ClientClosed`](crate::error::Kind::ClientClosed), later requests fail with it, and
    /// the connection is released before this returns.
    pub async fn close(&self) {
        let drained = self.inner.pending.seal(|_| Error::client_closed());
        self.inner.shutdown.cancel();

        let mut state_rx = self.inner.state_tx.subscribe();
        _ = state_rx.wait_for(SessionState::is_closed).await;

        let closed = SessionState::Closed {
            cause: CloseCause::Requested,
        };
        self.inner.state_tx.send_if_modified(|state| {
            if *state == closed {
                false
            } else {
                *state = closed.clone();
                true
            }
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(drained, "session closed");
        #[cfg(not(feature = "tracing"))]
        let _ = drained;
    }

    /// Get the current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Subscribe to session state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of requests currently waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn closed_error(&self) -> Error {
        match &*self.inner.state_tx.borrow() {
            SessionState::Closed { cause } => cause.to_error(),
            _ => Error::client_closed(),
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(MAX_REQUEST_TIMEOUT)
}

/// Resolve from the caller's side and return whichever result won.
async fn expire<T>(registration: &mut Registration<T>, error: Error) -> Result<T> {
    registration.resolve(Err(error));
    flatten(registration.receiver().await)
}

fn flatten<T>(outcome: std::result::Result<Result<T>, oneshot::error::RecvError>) -> Result<T> {
    outcome.unwrap_or_else(|_dropped| Err(Error::connection_lost("request abandoned")))
}

/// Hand one inbound frame to the pending request it answers.
fn route_frame<C: MessageCodec>(codec: &C, pending: &PendingTable<C::Payload>, frame: &[u8]) {
    match codec.decode(frame) {
        Decoded::Response {
            correlation,
            payload,
        } => {
            if !resolve_correlated(pending, &correlation, Ok(payload)) {
                #[cfg(feature = "tracing")]
                tracing::debug!(?correlation, "response for a request that is no longer pending");
            }
        }
        Decoded::ProtocolError {
            correlation: Some(correlation),
            message,
        } => {
            #[cfg(feature = "tracing")]
            tracing::warn!(?correlation, %message, "failed to decode response");
            resolve_correlated(pending, &correlation, Err(Error::protocol(message)));
        }
        Decoded::ProtocolError {
            correlation: None,
            message,
        } => {
            #[cfg(feature = "tracing")]
            tracing::warn!(%message, "uncorrelated error frame");
            #[cfg(not(feature = "tracing"))]
            let _ = &message;
        }
        Decoded::Unrecognized => {
            #[cfg(feature = "tracing")]
            tracing::debug!(len = frame.len(), "discarding unrecognized frame");
        }
    }
}

fn resolve_correlated<T>(
    pending: &PendingTable<T>,
    correlation: &Correlation,
    result: Result<T>,
) -> bool {
    match correlation {
        Correlation::Exact(key) => pending.resolve_echoed(key, result),
        Correlation::Product(product_id) => pending.resolve_oldest(product_id, result),
        Correlation::Sequence(sequence) => pending.resolve_sequence(*sequence, result),
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Owns the connection and the state machine. All state transitions happen here.
struct SessionActor<C: MessageCodec> {
    handshake: Box<dyn Handshake>,
    config: Config,
    codec: Arc<C>,
    pending: Arc<PendingTable<C::Payload>>,
    state_tx: watch::Sender<SessionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<ConnectionClosed>,
    events: mpsc::UnboundedReceiver<ConnectionClosed>,
    shutdown: CancellationToken,
    /// Incremented per connection so close events from a replaced connection are ignored
    generation: u64,
    /// Explicit `open` calls waiting for the session to become ready
    open_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl<C: MessageCodec> SessionActor<C> {
    async fn run(mut self) {
        let cause = self.drive().await;

        #[cfg(feature = "tracing")]
        tracing::debug!(?cause, "session actor stopping");

        self.state_tx.send_replace(SessionState::Closed {
            cause: cause.clone(),
        });

        self.pending.drain_all(|_| cause.to_error());

        for waiter in self.open_waiters.drain(..) {
            _ = waiter.send(Err(cause.to_error()));
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            reject(command, || cause.to_error());
        }
    }

    async fn drive(&mut self) -> CloseCause {
        if !self.wait_for_open().await {
            return CloseCause::Requested;
        }

        self.state_tx.send_replace(SessionState::Connecting);

        let shutdown = self.shutdown.clone();
        let mut connection = tokio::select! {
            () = shutdown.cancelled() => return CloseCause::Requested,
            result = self.open_connection() => match result {
                Ok(connection) => connection,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "unable to connect");
                    return CloseCause::ConnectFailed(e.to_string());
                }
            },
        };

        loop {
            self.become_ready();

            match self.serve(&mut connection).await {
                ServeExit::Shutdown => {
                    connection.close().await;
                    return CloseCause::Requested;
                }
                ServeExit::Lost(reason) => {
                    connection.close().await;

                    let drained = self
                        .pending
                        .drain_all(|_| Error::connection_lost(reason.to_string()));

                    #[cfg(feature = "tracing")]
                    tracing::warn!(%reason, drained, "connection lost");
                    #[cfg(not(feature = "tracing"))]
                    let _ = drained;

                    match self.reconnect().await {
                        ReconnectOutcome::Connected(replacement) => connection = replacement,
                        ReconnectOutcome::Shutdown => return CloseCause::Requested,
                        ReconnectOutcome::Exhausted(attempts) => {
                            return CloseCause::ReconnectExhausted { attempts };
                        }
                    }
                }
            }
        }
    }

    /// Stay idle until the first open request. Returns `false` on shutdown.
    async fn wait_for_open(&mut self) -> bool {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return false,

                command = self.commands.recv() => match command {
                    None => return false,
                    Some(Command::Open { reply }) => {
                        self.open_waiters.extend(reply);
                        return true;
                    }
                    Some(command) => reject(command, Error::not_connected),
                },
            }
        }
    }

    fn become_ready(&mut self) {
        self.state_tx.send_replace(SessionState::Ready {
            since: Instant::now(),
        });

        for waiter in self.open_waiters.drain(..) {
            _ = waiter.send(Ok(()));
        }

        #[cfg(feature = "tracing")]
        tracing::info!(generation = self.generation, "session ready");
    }

    async fn open_connection(&mut self) -> Result<Connection> {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let request = self.handshake.request()?;

        let codec = Arc::clone(&self.codec);
        let pending = Arc::clone(&self.pending);
        let events_tx = self.events_tx.clone();

        Connection::open(
            request,
            &self.config,
            move |frame| route_frame(&*codec, &pending, &frame),
            move |reason| {
                _ = events_tx.send(ConnectionClosed { generation, reason });
            },
        )
        .await
    }

    /// Serve commands on a live connection until it is lost or the session shuts down.
    async fn serve(&mut self, connection: &mut Connection) -> ServeExit {
        let mut heartbeat = self.config.heartbeat().map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return ServeExit::Shutdown,

                command = self.commands.recv() => match command {
                    None => return ServeExit::Shutdown,
                    Some(Command::Open { reply }) => {
                        if let Some(reply) = reply {
                            _ = reply.send(Ok(()));
                        }
                    }
                    Some(Command::Send { frame, reply }) => {
                        if let Err(e) = connection.send(frame).await {
                            let reason = CloseReason::Error(e.to_string());
                            _ = reply.send(Err(e));
                            return ServeExit::Lost(reason);
                        }
                        _ = reply.send(Ok(()));
                    }
                },

                Some(event) = self.events.recv() => {
                    if event.generation == self.generation && !event.reason.is_requested() {
                        return ServeExit::Lost(event.reason);
                    }
                }

                () = tick(&mut heartbeat) => {
                    self.pending.expire_overdue(Instant::now());

                    let silence = connection.last_activity().elapsed();
                    if silence > self.config.heartbeat_timeout {
                        let error = WsError::HeartbeatTimeout(self.config.heartbeat_timeout);
                        return ServeExit::Lost(CloseReason::Error(error.to_string()));
                    }

                    if let Err(e) = connection.ping().await {
                        return ServeExit::Lost(CloseReason::Error(e.to_string()));
                    }
                }
            }
        }
    }

    async fn reconnect(&mut self) -> ReconnectOutcome {
        let mut backoff: ExponentialBackoff = self.config.reconnect.clone().into();
        let mut attempt = 0_u32;

        loop {
            if let Some(max) = self.config.reconnect.max_attempts
                && attempt >= max
            {
                return ReconnectOutcome::Exhausted(attempt);
            }

            attempt = attempt.saturating_add(1);
            self.state_tx
                .send_replace(SessionState::Reconnecting { attempt });

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.reconnect.max_backoff);

            #[cfg(feature = "tracing")]
            tracing::info!(attempt, ?delay, "reconnecting");

            if !self.pause(delay).await {
                return ReconnectOutcome::Shutdown;
            }

            let shutdown = self.shutdown.clone();
            tokio::select! {
                () = shutdown.cancelled() => return ReconnectOutcome::Shutdown,
                result = self.open_connection() => match result {
                    Ok(connection) => return ReconnectOutcome::Connected(connection),
                    Err(e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                    }
                },
            }
        }
    }

    /// Wait out a backoff delay while still answering commands. Returns `false` on shutdown.
    async fn pause(&mut self, delay: Duration) -> bool {
        let sleep = sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return false,
                () = &mut sleep => return true,

                command = self.commands.recv() => match command {
                    None => return false,
                    Some(Command::Open { reply }) => self.open_waiters.extend(reply),
                    Some(command) => reject(command, || WsError::ConnectionClosed.into_send()),
                },
            }
        }
    }
}

fn reject<F: Fn() -> Error>(command: Command, make_error: F) {
    match command {
        Command::Open { reply: Some(reply) } | Command::Send { reply, .. } => {
            _ = reply.send(Err(make_error()));
        }
        Command::Open { reply: None } => {}
    }
}
