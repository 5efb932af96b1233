//! Transport session state machine.
//!
//! One [`TransportSession`] wraps one client WebSocket to the control
//! server. A spawned event loop owns the socket; the handle talks to it over
//! a command channel and observes its state through a `watch` channel.
//!
//! # States
//!
//! ```text
//! connecting ─► awaiting-handshake ─► authenticating ─► ready ─► degraded
//!     │                 │                   │             │          │
//!     └─────────────────┴───────────────────┴─────────────┴──────────┴─► closed
//! ```
//!
//! - `welcome` is the only message acted upon while awaiting the handshake.
//! - `auth_error` closes the session for good; the pool may build a new one.
//! - An unparsable frame before `ready` fails establishment with a protocol
//!   error.
//! - Commands are forwarded only while `ready`.
//! - Every close, whatever the cause, lands in `closed` and emits
//!   [`SessionEvent::Closed`].
//!
//! Connection establishment (socket, handshake and authentication together)
//! is bounded by [`SessionConfig::connect_timeout`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{MissedTickBehavior, interval_at, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use crate::config::{AgentConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::identifiers::{RequestId, SessionId};
use crate::protocol::Message;

// ============================================================================
// Constants
// ============================================================================

/// How long `close()` waits for the event loop to reach `closed`.
const CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Agent build reported during authentication.
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

// ============================================================================
// SessionState
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket being opened.
    Connecting,
    /// Socket open, waiting for `welcome`.
    AwaitingHandshake,
    /// `auth` sent, waiting for the verdict.
    Authenticating,
    /// Authenticated; heartbeat running; commands accepted.
    Ready,
    /// Being closed and replaced; not eligible for work.
    Degraded,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Returns `true` if the session accepts commands and sends.
    #[inline]
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns `true` for the terminal state.
    #[inline]
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::AwaitingHandshake => "awaiting-handshake",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CloseReason
// ============================================================================

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Server closed the socket.
    Remote,
    /// Closed by the agent.
    Local,
    /// Socket error.
    TransportError,
    /// Establishment exceeded the connect timeout.
    ConnectTimeout,
    /// Liveness acknowledgment missing.
    LivenessTimeout,
    /// Server rejected the credentials.
    AuthRejected,
    /// Unparsable frame before `ready`.
    ProtocolViolation,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Remote => "remote_close",
            Self::Local => "local_close",
            Self::TransportError => "transport_error",
            Self::ConnectTimeout => "connect_timeout",
            Self::LivenessTimeout => "liveness_timeout",
            Self::AuthRejected => "auth_rejected",
            Self::ProtocolViolation => "protocol_violation",
        })
    }
}

// ============================================================================
// SessionEvent
// ============================================================================

/// Notifications from a session to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A `command` arrived while ready.
    Command {
        /// Receiving session.
        session_id: SessionId,
        /// Correlation id for the result.
        request_id: RequestId,
        /// Raw command text.
        command: String,
    },
    /// The session reached `closed`.
    Closed {
        /// Closed session.
        session_id: SessionId,
        /// Close cause.
        reason: CloseReason,
    },
}

// ============================================================================
// Endpoint
// ============================================================================

/// Where and as whom a session connects.
#[derive(Clone)]
pub struct Endpoint {
    /// Control server URL.
    pub url: String,
    /// Local agent identity.
    pub agent_id: String,
    /// Credential.
    pub token: String,
    /// Host name reported during authentication.
    pub hostname: Option<String>,
}

impl Endpoint {
    /// Builds the endpoint described by an agent configuration.
    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            url: config.server_url.clone(),
            agent_id: config.agent_id.clone(),
            token: config.token.clone(),
            hostname: std::env::var("HOSTNAME").ok(),
        }
    }

    /// Builds the `auth` message for this endpoint.
    fn auth_message(&self) -> Message {
        Message::Auth {
            token: self.token.clone(),
            agent_id: self.agent_id.clone(),
            hostname: self.hostname.clone(),
            version: AGENT_VERSION.to_string(),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Counters & Snapshot
// ============================================================================

/// Per-session traffic counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCounters {
    /// Messages written to the socket.
    pub messages_sent: u64,
    /// Text messages read from the socket.
    pub messages_received: u64,
    /// Write failures and unparsable inbound messages.
    pub errors: u64,
    /// Most recent probe sent.
    pub last_ping_sent: Option<Instant>,
    /// Most recent acknowledgment received.
    pub last_pong_received: Option<Instant>,
    /// First probe still waiting for an acknowledgment.
    pub unanswered_since: Option<Instant>,
}

/// Read-only view of a session, used for scoring and stats.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Session id.
    pub id: SessionId,
    /// State at snapshot time.
    pub state: SessionState,
    /// Time since creation.
    pub age: Duration,
    /// Time since the last successful send.
    pub idle: Duration,
    /// Connection attempts that preceded this session.
    pub retry_count: u32,
    /// Traffic counters.
    pub counters: SessionCounters,
    /// Identity assigned by the server, if any.
    pub server_session_id: Option<String>,
}

// ============================================================================
// SessionCommand
// ============================================================================

/// Internal commands for the event loop.
enum SessionCommand {
    /// Write a message; ack reports delivery to the socket.
    Send {
        message: Message,
        ack: oneshot::Sender<bool>,
    },
    /// Send a liveness probe.
    Ping { ack: oneshot::Sender<bool> },
    /// Close the socket.
    Shutdown(CloseReason),
}

/// Outcome of handling one inbound message.
enum Step {
    Continue,
    Reply(Message),
    Ready,
    Rejected(String),
    Violation(String),
}

/// Closes a session whose `connect` future was dropped before `ready`.
struct AbandonGuard<'a> {
    session: &'a TransportSession,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(session_id = %self.session.id(), "Establishment abandoned");
            self.session.request_close(CloseReason::Local);
        }
    }
}

// ============================================================================
// TransportSession
// ============================================================================

/// Shared state between the handle and the event loop.
struct SessionInner {
    id: SessionId,
    config: SessionConfig,
    created_at: Instant,
    retry_count: u32,
    state: watch::Sender<SessionState>,
    counters: Mutex<SessionCounters>,
    last_used: Mutex<Instant>,
    server_session_id: Mutex<Option<String>>,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
}

/// One physical, authenticated connection to the control server.
///
/// Cheap to clone; all clones drive the same socket.
#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TransportSession - Constructor
// ============================================================================

impl TransportSession {
    /// Opens a session and drives it to `ready`.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Server URL and credentials
    /// * `config` - Session timing
    /// * `retry_count` - Attempts that preceded this one, for stats
    /// * `events` - Receives inbound commands and the close notification
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if `ready` is not reached in time
    /// - [`Error::Authentication`] if the server rejects the credentials
    /// - [`Error::Protocol`] if the server sends a frame that cannot be
    ///   parsed before `ready`
    /// - [`Error::WebSocket`] / [`Error::Connection`] on socket failure
    ///
    /// Dropping the future before it resolves closes the half-open session.
    pub async fn connect(
        endpoint: Endpoint,
        config: SessionConfig,
        retry_count: u32,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let id = SessionId::next();
        let connect_timeout = config.connect_timeout;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Connecting);
        let now = Instant::now();

        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                config,
                created_at: now,
                retry_count,
                state,
                counters: Mutex::new(SessionCounters::default()),
                last_used: Mutex::new(now),
                server_session_id: Mutex::new(None),
                command_tx,
            }),
        };

        debug!(session_id = %id, url = %endpoint.url, "Opening session");

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(run_session(
            Arc::clone(&session.inner),
            endpoint,
            command_rx,
            events,
            ready_tx,
        ));

        let mut guard = AbandonGuard {
            session: &session,
            armed: true,
        };
        let outcome = timeout(connect_timeout, ready_rx).await;
        guard.armed = false;
        drop(guard);

        match outcome {
            Ok(Ok(Ok(()))) => {
                info!(session_id = %id, "Session ready");
                Ok(session)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                let timeout_ms = connect_timeout.as_millis() as u64;
                warn!(session_id = %id, timeout_ms, "Session establishment timed out");
                session.request_close(CloseReason::ConnectTimeout);
                Err(Error::connection_timeout(timeout_ms))
            }
        }
    }
}

// ============================================================================
// TransportSession - Public API
// ============================================================================

impl TransportSession {
    /// Returns the session id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Returns the server-assigned session identity, if any.
    #[must_use]
    pub fn server_session_id(&self) -> Option<String> {
        self.inner.server_session_id.lock().clone()
    }

    /// Returns `true` while the event loop still owns an open socket.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.inner.command_tx.is_closed() && !self.state().is_closed()
    }

    /// Returns `false` if a probe has gone unanswered past the liveness timeout.
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    /// Like [`is_alive`](Self::is_alive), but as an error carrying the window.
    ///
    /// # Errors
    ///
    /// [`Error::LivenessTimeout`] if a probe has gone unanswered too long.
    pub fn check_liveness(&self) -> Result<()> {
        if self.inner.is_alive() {
            return Ok(());
        }
        Err(Error::liveness_timeout(
            self.inner.id,
            self.inner.config.liveness_timeout.as_millis() as u64,
        ))
    }

    /// Returns `true` if the session is ready, open and alive.
    #[inline]
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state().is_ready() && self.is_open() && self.is_alive()
    }

    /// Sends a message.
    ///
    /// Returns `false` without sending when the session is not ready or the
    /// socket write fails. Callers must check the result.
    pub async fn send(&self, message: &Message) -> bool {
        if !self.state().is_ready() {
            return false;
        }

        let (ack, ack_rx) = oneshot::channel();
        let queued = self.inner.command_tx.send(SessionCommand::Send {
            message: message.clone(),
            ack,
        });
        if queued.is_err() {
            return false;
        }

        let delivered = ack_rx.await.unwrap_or(false);
        if delivered {
            *self.inner.last_used.lock() = Instant::now();
        }
        delivered
    }

    /// Sends a liveness probe. Returns `false` if the session is not ready.
    pub async fn ping(&self) -> bool {
        if !self.state().is_ready() {
            return false;
        }

        let (ack, ack_rx) = oneshot::channel();
        if self.inner.command_tx.send(SessionCommand::Ping { ack }).is_err() {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    /// Moves a ready session to `degraded` and starts closing it.
    pub fn mark_degraded(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_ready() {
                *state = SessionState::Degraded;
                true
            } else {
                false
            }
        });

        if changed {
            debug!(session_id = %self.inner.id, "Session degraded");
        }
        self.request_close(CloseReason::Local);
    }

    /// Closes the session and waits until it reaches `closed`.
    pub async fn close(&self) {
        self.request_close(CloseReason::Local);

        let mut state_rx = self.inner.state.subscribe();
        let timed_out = timeout(CLOSE_WAIT, state_rx.wait_for(|s| s.is_closed()))
            .await
            .is_err();
        if timed_out {
            warn!(session_id = %self.inner.id, "Session did not close in time");
        }
    }

    /// Returns a read-only snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let now = Instant::now();
        SessionSnapshot {
            id: self.inner.id,
            state: self.state(),
            age: now.saturating_duration_since(self.inner.created_at),
            idle: now.saturating_duration_since(*self.inner.last_used.lock()),
            retry_count: self.inner.retry_count,
            counters: *self.inner.counters.lock(),
            server_session_id: self.server_session_id(),
        }
    }

    /// Asks the event loop to close. Safe to call repeatedly.
    fn request_close(&self, reason: CloseReason) {
        if self
            .inner
            .command_tx
            .send(SessionCommand::Shutdown(reason))
            .is_err()
        {
            // Event loop already gone.
            self.inner.state.send_replace(SessionState::Closed);
        }
    }
}

// ============================================================================
// SessionInner
// ============================================================================

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(session_id = %self.id, from = %previous, to = %next, "Session state changed");
        }
    }

    fn is_alive(&self) -> bool {
        self.counters
            .lock()
            .unanswered_since
            .is_none_or(|since| since.elapsed() <= self.config.liveness_timeout)
    }

    /// Serializes and writes one message, updating counters.
    async fn write(&self, sink: &mut WsSink, message: &Message) -> bool {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Failed to serialize message");
                self.counters.lock().errors += 1;
                return false;
            }
        };

        match sink.send(WsMessage::Text(json.into())).await {
            Ok(()) => {
                self.counters.lock().messages_sent += 1;
                trace!(session_id = %self.id, kind = message.kind(), "Message sent");
                true
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Socket write failed");
                self.counters.lock().errors += 1;
                false
            }
        }
    }

    /// Writes a probe and records it for liveness tracking.
    async fn probe(&self, sink: &mut WsSink) -> bool {
        let sent = self.write(sink, &Message::ping()).await;
        if sent {
            let now = Instant::now();
            let mut counters = self.counters.lock();
            counters.last_ping_sent = Some(now);
            counters.unanswered_since.get_or_insert(now);
        }
        sent
    }

    /// Applies one inbound text frame to the state machine.
    fn on_text(
        &self,
        text: &str,
        endpoint: &Endpoint,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> Step {
        let message = match Message::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                self.counters.lock().errors += 1;
                warn!(session_id = %self.id, error = %e, "Failed to parse inbound message");
                // Fatal until ready
                if !self.state().is_ready() {
                    return Step::Violation(e.to_string());
                }
                return Step::Continue;
            }
        };

        let state = self.state();
        trace!(session_id = %self.id, %state, kind = message.kind(), "Message received");

        match (state, message) {
            (SessionState::AwaitingHandshake, Message::Welcome { session_id, .. }) => {
                if session_id.is_some() {
                    *self.server_session_id.lock() = session_id;
                }
                self.set_state(SessionState::Authenticating);
                Step::Reply(endpoint.auth_message())
            }

            (SessionState::Authenticating, Message::AuthSuccess { session_id }) => {
                if session_id.is_some() {
                    *self.server_session_id.lock() = session_id;
                }
                Step::Ready
            }

            (SessionState::Authenticating, Message::AuthError { message }) => {
                Step::Rejected(message)
            }

            (SessionState::Ready, Message::Pong { .. }) => {
                let mut counters = self.counters.lock();
                counters.last_pong_received = Some(Instant::now());
                counters.unanswered_since = None;
                Step::Continue
            }

            (SessionState::Ready, Message::Ping { timestamp }) => {
                Step::Reply(Message::Pong { timestamp })
            }

            (
                SessionState::Ready,
                Message::Command {
                    command,
                    request_id,
                },
            ) => {
                let _ = events.send(SessionEvent::Command {
                    session_id: self.id,
                    request_id,
                    command,
                });
                Step::Continue
            }

            (state, message) => {
                debug!(session_id = %self.id, %state, kind = message.kind(), "Ignoring message");
                Step::Continue
            }
        }
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Runs a session from socket open to `closed`.
async fn run_session(
    inner: Arc<SessionInner>,
    endpoint: Endpoint,
    mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let opened = tokio::select! {
        result = connect_async(endpoint.url.as_str()) => result.map(|(ws, _)| ws).map_err(Error::from),
        reason = wait_for_shutdown(&mut command_rx) => {
            let _ = ready_tx.send(Err(Error::ConnectionClosed));
            finish(&inner, &events, reason);
            return;
        }
    };

    let ws = match opened {
        Ok(ws) => ws,
        Err(e) => {
            debug!(session_id = %inner.id, error = %e, "Socket open failed");
            let _ = ready_tx.send(Err(e));
            finish(&inner, &events, CloseReason::TransportError);
            return;
        }
    };

    inner.set_state(SessionState::AwaitingHandshake);

    let reason = drive(&inner, ws, &endpoint, &mut command_rx, &events, ready_tx).await;
    finish(&inner, &events, reason);
}

/// Event loop for an open socket. Returns why it stopped.
async fn drive(
    inner: &SessionInner,
    ws: WsStream,
    endpoint: &Endpoint,
    command_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    ready_tx: oneshot::Sender<Result<()>>,
) -> CloseReason {
    let (mut sink, mut stream) = ws.split();
    let mut ready_tx = Some(ready_tx);

    let period = inner.config.heartbeat_interval;
    let mut heartbeat = interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            // Inbound frames, processed strictly in arrival order
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        inner.counters.lock().messages_received += 1;

                        match inner.on_text(&text, endpoint, events) {
                            Step::Continue => {}
                            Step::Reply(reply) => {
                                if !inner.write(&mut sink, &reply).await {
                                    break CloseReason::TransportError;
                                }
                            }
                            Step::Ready => {
                                // Liveness is measured from here
                                inner.counters.lock().last_pong_received = Some(Instant::now());
                                inner.set_state(SessionState::Ready);
                                if let Some(tx) = ready_tx.take()
                                    && tx.send(Ok(())).is_err()
                                {
                                    debug!(session_id = %inner.id, "Nobody waiting for ready");
                                    let _ = sink.close().await;
                                    break CloseReason::Local;
                                }
                            }
                            Step::Rejected(message) => {
                                warn!(session_id = %inner.id, reason = %message, "Authentication rejected");
                                if let Some(tx) = ready_tx.take() {
                                    let _ = tx.send(Err(Error::authentication(message)));
                                }
                                let _ = sink.close().await;
                                break CloseReason::AuthRejected;
                            }
                            Step::Violation(detail) => {
                                if let Some(tx) = ready_tx.take() {
                                    let _ = tx.send(Err(Error::protocol(format!(
                                        "malformed frame during handshake: {detail}"
                                    ))));
                                }
                                let _ = sink.close().await;
                                break CloseReason::ProtocolViolation;
                            }
                        }
                    }

                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!(session_id = %inner.id, "Socket closed by remote");
                        break CloseReason::Remote;
                    }

                    Some(Err(e)) => {
                        inner.counters.lock().errors += 1;
                        warn!(session_id = %inner.id, error = %e, "Socket error");
                        break CloseReason::TransportError;
                    }

                    // Binary and control frames
                    Some(Ok(_)) => {}
                }
            }

            command = command_rx.recv() => {
                match command {
                    Some(SessionCommand::Send { message, ack }) => {
                        let delivered = inner.state().is_ready() && inner.write(&mut sink, &message).await;
                        let _ = ack.send(delivered);
                    }

                    Some(SessionCommand::Ping { ack }) => {
                        let delivered = inner.state().is_ready() && inner.probe(&mut sink).await;
                        let _ = ack.send(delivered);
                    }

                    Some(SessionCommand::Shutdown(reason)) => {
                        let _ = sink.close().await;
                        break reason;
                    }

                    None => {
                        let _ = sink.close().await;
                        break CloseReason::Local;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if !inner.state().is_ready() {
                    continue;
                }

                if !inner.is_alive() {
                    inner.set_state(SessionState::Degraded);
                    warn!(
                        session_id = %inner.id,
                        timeout_ms = inner.config.liveness_timeout.as_millis() as u64,
                        "Liveness acknowledgment missing"
                    );
                    let _ = sink.close().await;
                    break CloseReason::LivenessTimeout;
                }

                if !inner.probe(&mut sink).await {
                    break CloseReason::TransportError;
                }
            }
        }
    };

    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Err(Error::connection(format!(
            "session closed before ready: {reason}"
        ))));
    }

    reason
}

/// Drains commands until a shutdown request arrives.
async fn wait_for_shutdown(command_rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> CloseReason {
    loop {
        match command_rx.recv().await {
            Some(SessionCommand::Send { ack, .. }) | Some(SessionCommand::Ping { ack }) => {
                let _ = ack.send(false);
            }
            Some(SessionCommand::Shutdown(reason)) => return reason,
            None => return CloseReason::Local,
        }
    }
}

/// Moves to `closed` and notifies the owner.
fn finish(inner: &SessionInner, events: &mpsc::UnboundedSender<SessionEvent>, reason: CloseReason) {
    inner.set_state(SessionState::Closed);
    let _ = events.send(SessionEvent::Closed {
        session_id: inner.id,
        reason,
    });
    debug!(session_id = %inner.id, %reason, "Session closed");
}

// ============================================================================
// Tests
// ============================================================================
