//! Connection pool with scored failover.
//!
//! Holds up to `max_connections` ready sessions to the same control server
//! and keeps exactly one of them active for sends.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │              ConnectionPool               │
//! │                                           │
//! │  active ──► SessionId=4                   │
//! │  ┌─────────────────────────────────────┐  │
//! │  │ SessionId=2 → TransportSession      │  │
//! │  │ SessionId=4 → TransportSession      │  │
//! │  └─────────────────────────────────────┘  │
//! │        ▲ SessionEvent        │ InboundCommand
//! │        │                     ▼            │
//! │   event task  ───────────►  agent         │
//! │   health task (ping, prune, reconnect)    │
//! └───────────────────────────────────────────┘
//! ```
//!
//! Only the active session carries traffic; the others are warm spares.
//!
//! # Selection
//!
//! `score = (age + idle + error) / 3`, each term in `0..=100`:
//!
//! | Term | Formula |
//! |------|---------|
//! | age | `100 × (1 − min(age / 60s, 1))` |
//! | idle | `100 × (1 − min(idle / 30s, 1))` |
//! | error | `100 − 100 × errors / max(1, received)` |
//!
//! Highest score wins; ties go to the session with fewer errors.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at, sleep};
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::identifiers::{RequestId, SessionId};
use crate::protocol::Message;

use super::session::{CloseReason, Endpoint, SessionEvent, SessionSnapshot, TransportSession};

// ============================================================================
// Constants
// ============================================================================

/// Age at which the age term reaches 0.
const AGE_HORIZON: Duration = Duration::from_secs(60);

/// Idle time at which the idle term reaches 0.
const IDLE_HORIZON: Duration = Duration::from_secs(30);

// ============================================================================
// InboundCommand
// ============================================================================

/// A command received on any pooled session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    /// Session that delivered it.
    pub session_id: SessionId,
    /// Correlation id for the result.
    pub request_id: RequestId,
    /// Raw command text.
    pub command: String,
}

// ============================================================================
// PoolStats
// ============================================================================

/// Read-only pool snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions held.
    pub total: usize,
    /// Sessions ready, open and alive.
    pub healthy: usize,
    /// Current active session.
    pub active: Option<SessionId>,
    /// Session creation attempts.
    pub attempts: u64,
    /// Successful creations.
    pub successes: u64,
    /// Failed creations.
    pub failures: u64,
    /// Successful creations after the first.
    pub reconnects: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Whether creation is currently refused.
    pub cooling_down: bool,
}

#[derive(Debug, Default)]
struct PoolCounters {
    attempts: u64,
    successes: u64,
    failures: u64,
    reconnects: u64,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Owns the sessions to the control server and picks the active one.
///
/// # Example
///
/// ```ignore
/// let (pool, mut inbound) = ConnectionPool::new(endpoint, session_config, pool_config);
///
/// pool.get_connection().await?;
/// while let Some(command) = inbound.recv().await {
///     // ...
///     pool.send_message(&Message::command_result(command.request_id, result)).await;
/// }
/// ```
pub struct ConnectionPool {
    endpoint: Endpoint,
    session_config: SessionConfig,
    config: PoolConfig,

    /// Ready sessions by id.
    sessions: RwLock<FxHashMap<SessionId, TransportSession>>,

    /// Current best session. Never owns it.
    active: Mutex<Option<SessionId>>,

    /// Serializes selection and creation.
    selection: tokio::sync::Mutex<()>,

    counters: Mutex<PoolCounters>,

    /// Cloned into every session.
    events_tx: mpsc::UnboundedSender<SessionEvent>,

    /// Event task, health task and reselection tasks.
    tasks: Mutex<Vec<JoinHandle<()>>>,

    shutdown: AtomicBool,
}

// ============================================================================
// ConnectionPool - Constructor
// ============================================================================

impl ConnectionPool {
    /// Creates an empty pool and starts its event and health tasks.
    ///
    /// No session is opened until the first [`get_connection`](Self::get_connection).
    /// The returned receiver yields every command received while a session
    /// is ready.
    #[must_use]
    pub fn new(
        endpoint: Endpoint,
        session_config: SessionConfig,
        config: PoolConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundCommand>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let health_period = config.health_check_interval;

        let pool = Arc::new(Self {
            endpoint,
            session_config,
            config,
            sessions: RwLock::new(FxHashMap::default()),
            active: Mutex::new(None),
            selection: tokio::sync::Mutex::new(()),
            counters: Mutex::new(PoolCounters::default()),
            events_tx,
            tasks: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let event_task = tokio::spawn(event_loop(Arc::downgrade(&pool), events_rx, inbound_tx));
        let health_task = tokio::spawn(health_loop(Arc::downgrade(&pool), health_period));
        pool.tasks.lock().extend([event_task, health_task]);

        debug!(url = %pool.endpoint.url, max = pool.config.max_connections, "ConnectionPool created");

        (pool, inbound_rx)
    }
}

// ============================================================================
// ConnectionPool - Public API
// ============================================================================

impl ConnectionPool {
    /// Returns a healthy session, selecting or creating one if needed.
    ///
    /// Concurrent callers share a single selection: whoever loses the race
    /// re-checks the active session before doing any work of its own.
    ///
    /// # Errors
    ///
    /// - [`Error::NoConnectionAvailable`] if nothing is usable and no session
    ///   could be created (transient, retry later)
    /// - [`Error::Authentication`] if the server rejected the credentials
    /// - [`Error::Shutdown`] after [`cleanup`](Self::cleanup)
    pub async fn get_connection(&self) -> Result<TransportSession> {
        self.ensure_running()?;

        if let Some(session) = self.healthy_active() {
            return Ok(session);
        }

        let _selection = self.selection.lock().await;
        self.ensure_running()?;

        if let Some(session) = self.healthy_active() {
            return Ok(session);
        }

        self.prune();

        if let Some(session) = self.select_best() {
            self.set_active(session.id());
            return Ok(session);
        }

        if self.sessions.read().len() >= self.config.max_connections {
            return Err(Error::NoConnectionAvailable);
        }

        let session = self.create_session().await?;
        self.set_active(session.id());
        Ok(session)
    }

    /// Sends a message on the active session.
    ///
    /// On failure the session is retired and the active reference cleared,
    /// so the next call reselects. Never retries inline.
    pub async fn send_message(&self, message: &Message) -> bool {
        let session = match self.get_connection().await {
            Ok(session) => session,
            Err(e) => {
                debug!(kind = message.kind(), error = %e, "No connection for send");
                return false;
            }
        };

        if session.send(message).await {
            return true;
        }

        warn!(session_id = %session.id(), kind = message.kind(), "Send failed, retiring session");
        self.retire(session.id());
        false
    }

    /// Runs one health-check cycle.
    ///
    /// Dead or closed sessions are removed, live ones are pinged, and a new
    /// active session is sought when there is none.
    pub async fn health_check(&self) {
        if self.is_shutdown() {
            return;
        }

        let sessions: Vec<TransportSession> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            if !session.is_open() {
                warn!(session_id = %session.id(), state = %session.state(), "Session failed health check");
                self.retire(session.id());
                continue;
            }

            if let Err(e) = session.check_liveness() {
                warn!(error = %e, "Session failed health check");
                self.retire(session.id());
                continue;
            }

            if session.state().is_ready() && !session.ping().await {
                warn!(session_id = %session.id(), "Probe failed");
                self.retire(session.id());
            }
        }

        if self.active_session_id().is_none() && !self.is_shutdown() {
            match self.get_connection().await {
                Ok(session) => info!(session_id = %session.id(), "Active session restored"),
                Err(e) => debug!(error = %e, "No session available after health check"),
            }
        }
    }

    /// Returns the active session id, if any.
    #[inline]
    #[must_use]
    pub fn active_session_id(&self) -> Option<SessionId> {
        *self.active.lock()
    }

    /// Returns the number of sessions held.
    #[inline]
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns a snapshot of every held session.
    #[must_use]
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .read()
            .values()
            .map(TransportSession::snapshot)
            .collect()
    }

    /// Returns a read-only snapshot of pool state.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (total, healthy) = {
            let sessions = self.sessions.read();
            let healthy = sessions.values().filter(|s| s.is_healthy()).count();
            (sessions.len(), healthy)
        };

        let counters = self.counters.lock();
        PoolStats {
            total,
            healthy,
            active: self.active_session_id(),
            attempts: counters.attempts,
            successes: counters.successes,
            failures: counters.failures,
            reconnects: counters.reconnects,
            consecutive_failures: counters.consecutive_failures,
            cooling_down: counters
                .cooldown_until
                .is_some_and(|until| Instant::now() < until),
        }
    }

    /// Returns the number of live background tasks.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }

    /// Returns `true` after [`cleanup`](Self::cleanup).
    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stops all tasks and closes every session concurrently.
    ///
    /// Idempotent; returns once every session has reached `closed`.
    pub async fn cleanup(&self) {
        let first = !self.shutdown.swap(true, Ordering::SeqCst);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        *self.active.lock() = None;

        let sessions: Vec<TransportSession> = {
            let mut map = self.sessions.write();
            map.drain().map(|(_, session)| session).collect()
        };

        let closed = sessions.len();
        join_all(sessions.iter().map(TransportSession::close)).await;

        if first {
            info!(closed, "ConnectionPool cleaned up");
        }
    }
}

// ============================================================================
// ConnectionPool - Selection
// ============================================================================

impl ConnectionPool {
    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::shutdown("connection pool"));
        }
        Ok(())
    }

    /// Returns the active session if still healthy, clearing it otherwise.
    fn healthy_active(&self) -> Option<TransportSession> {
        let mut active = self.active.lock();
        let id = (*active)?;

        let session = self.sessions.read().get(&id).cloned();
        match session {
            Some(session) if session.is_healthy() => Some(session),
            _ => {
                debug!(session_id = %id, "Active session no longer healthy");
                *active = None;
                None
            }
        }
    }

    fn set_active(&self, id: SessionId) {
        let previous = self.active.lock().replace(id);
        if previous != Some(id) {
            info!(session_id = %id, "Active session selected");
        }
    }

    /// Highest-scoring healthy session.
    fn select_best(&self) -> Option<TransportSession> {
        let sessions = self.sessions.read();
        sessions
            .values()
            .filter(|session| session.is_healthy())
            .map(|session| {
                let snapshot = session.snapshot();
                (score(&snapshot), snapshot.counters.errors, session)
            })
            .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
            .map(|(_, _, session)| session.clone())
    }

    /// Retires every held session that is no longer healthy.
    fn prune(&self) {
        let unhealthy: Vec<SessionId> = self
            .sessions
            .read()
            .values()
            .filter(|session| !session.is_healthy())
            .map(TransportSession::id)
            .collect();

        for id in unhealthy {
            self.retire(id);
        }
    }

    /// Removes a session, clears it as active and starts closing it.
    fn retire(&self, id: SessionId) {
        {
            let mut active = self.active.lock();
            if *active == Some(id) {
                *active = None;
            }
        }

        let removed = self.sessions.write().remove(&id);
        if let Some(session) = removed {
            session.mark_degraded();
            debug!(session_id = %id, "Session retired");
        }
    }
}

// ============================================================================
// ConnectionPool - Creation
// ============================================================================

impl ConnectionPool {
    /// Opens a new session with capped exponential backoff.
    ///
    /// Authentication failure stops immediately. Reaching
    /// `max_consecutive_failures` starts a cooldown during which creation is
    /// refused.
    async fn create_session(&self) -> Result<TransportSession> {
        if let Some(remaining) = self.cooldown_remaining() {
            debug!(remaining_ms = remaining.as_millis() as u64, "Session creation cooling down");
            return Err(Error::NoConnectionAvailable);
        }

        for attempt in 0..self.config.connect_retries {
            self.ensure_running()?;

            if attempt > 0 {
                let delay = backoff_delay(&self.config, attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before reconnect");
                sleep(delay).await;
                self.ensure_running()?;
            }

            self.counters.lock().attempts += 1;

            let connected = TransportSession::connect(
                self.endpoint.clone(),
                self.session_config.clone(),
                attempt,
                self.events_tx.clone(),
            )
            .await;

            match connected {
                Ok(session) => {
                    {
                        let mut counters = self.counters.lock();
                        if counters.successes > 0 {
                            counters.reconnects += 1;
                        }
                        counters.successes += 1;
                        counters.consecutive_failures = 0;
                        counters.cooldown_until = None;
                    }

                    if self.is_shutdown() {
                        session.close().await;
                        return Err(Error::shutdown("connection pool"));
                    }

                    self.sessions.write().insert(session.id(), session.clone());
                    info!(session_id = %session.id(), attempt, "Session added to pool");
                    return Ok(session);
                }

                Err(e) => {
                    let cooling = {
                        let mut counters = self.counters.lock();
                        counters.failures += 1;
                        counters.consecutive_failures += 1;
                        if counters.consecutive_failures >= self.config.max_consecutive_failures {
                            counters.cooldown_until = Some(Instant::now() + self.config.cooldown);
                            true
                        } else {
                            false
                        }
                    };

                    warn!(attempt, error = %e, "Session creation failed");

                    if e.is_authentication_error() {
                        return Err(e);
                    }

                    if cooling {
                        warn!(
                            cooldown_ms = self.config.cooldown.as_millis() as u64,
                            "Too many consecutive failures, cooling down"
                        );
                        return Err(Error::NoConnectionAvailable);
                    }
                }
            }
        }

        Err(Error::NoConnectionAvailable)
    }

    /// Time left in the cooldown. Clears an expired one.
    fn cooldown_remaining(&self) -> Option<Duration> {
        let mut counters = self.counters.lock();
        let until = counters.cooldown_until?;
        let now = Instant::now();

        if now < until {
            return Some(until - now);
        }

        counters.cooldown_until = None;
        counters.consecutive_failures = 0;
        None
    }
}

// ============================================================================
// ConnectionPool - Events
// ============================================================================

impl ConnectionPool {
    fn on_session_closed(self: &Arc<Self>, id: SessionId, reason: CloseReason) {
        let removed = self.sessions.write().remove(&id).is_some();
        let was_active = {
            let mut active = self.active.lock();
            if *active == Some(id) {
                *active = None;
                true
            } else {
                false
            }
        };

        if removed {
            info!(session_id = %id, %reason, "Session closed");
        }

        if was_active && !self.is_shutdown() {
            let pool = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                match pool.get_connection().await {
                    Ok(session) => info!(session_id = %session.id(), "Reselected after close"),
                    Err(e) => warn!(error = %e, "Reselection failed"),
                }
            });

            let mut tasks = self.tasks.lock();
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }
}

/// Routes session events: commands out, closes into pool bookkeeping.
async fn event_loop(
    pool: Weak<ConnectionPool>,
    mut events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundCommand>,
) {
    while let Some(event) = events_rx.recv().await {
        let Some(pool) = pool.upgrade() else {
            break;
        };

        match event {
            SessionEvent::Command {
                session_id,
                request_id,
                command,
            } => {
                let _ = inbound_tx.send(InboundCommand {
                    session_id,
                    request_id,
                    command,
                });
            }
            SessionEvent::Closed { session_id, reason } => {
                pool.on_session_closed(session_id, reason);
            }
        }
    }

    debug!("Pool event loop terminated");
}

/// Periodic health check.
async fn health_loop(pool: Weak<ConnectionPool>, period: Duration) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(pool) = pool.upgrade() else {
            break;
        };
        if pool.is_shutdown() {
            break;
        }
        pool.health_check().await;
    }
}

// ============================================================================
// Scoring & Backoff
// ============================================================================

/// `min(base × 2^n, max)`.
fn backoff_delay(config: &PoolConfig, n: u32) -> Duration {
    config
        .base_backoff
        .saturating_mul(1u32 << n.min(16))
        .min(config.max_backoff)
}

/// Selection score in `0.0..=100.0`.
#[must_use]
pub fn score(snapshot: &SessionSnapshot) -> f64 {
    let decay = |elapsed: Duration, horizon: Duration| {
        100.0 * (1.0 - (elapsed.as_secs_f64() / horizon.as_secs_f64()).min(1.0))
    };

    let age = decay(snapshot.age, AGE_HORIZON);
    let idle = decay(snapshot.idle, IDLE_HORIZON);

    let received = snapshot.counters.messages_received.max(1) as f64;
    let errors = snapshot.counters.errors as f64;
    let error = (100.0 - 100.0 * errors / received).max(0.0);

    (age + idle + error) / 3.0
}

// ============================================================================
// Tests
// ============================================================================
