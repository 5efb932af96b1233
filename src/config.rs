//! Agent configuration.
//!
//! Every tunable consumed by the pipeline lives here, grouped by the
//! component that reads it. Defaults are production values; tests shrink
//! the intervals.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use remote_agent::AgentConfig;
//!
//! let config = AgentConfig::new("ws://control.local:8080/agent", "agent-7", "secret")
//!     .with_max_connections(2)
//!     .with_heartbeat_interval(Duration::from_secs(15));
//!
//! config.validate()?;
//! ```
//!
//! # Environment
//!
//! [`AgentConfig::from_env`] reads `AGENT_*` variables. Unparsable values are
//! ignored with a warning and the default is kept.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default control server endpoint.
const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/agent";

/// Default agent identity.
const DEFAULT_AGENT_ID: &str = "remote-agent";

// ============================================================================
// SessionConfig
// ============================================================================

/// Per-session timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Upper bound for socket open + welcome + authentication.
    pub connect_timeout: Duration,
    /// Interval between liveness probes once ready.
    pub heartbeat_interval: Duration,
    /// Window after a probe within which a `pong` must arrive.
    pub liveness_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// PoolConfig
// ============================================================================

/// Connection pool sizing and reconnection policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum sessions held at once.
    pub max_connections: usize,
    /// Interval of the pool-wide health check.
    pub health_check_interval: Duration,
    /// Connection attempts per session creation.
    pub connect_retries: u32,
    /// First backoff delay; doubles per failed attempt.
    pub base_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Consecutive failures before the pool cools down.
    pub max_consecutive_failures: u32,
    /// How long session creation is refused after too many failures.
    pub cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 3,
            health_check_interval: Duration::from_secs(30),
            connect_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_consecutive_failures: 10,
            cooldown: Duration::from_secs(300),
        }
    }
}

// ============================================================================
// SchedulerConfig
// ============================================================================

/// Command queue, batching and retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Queue capacity; enqueue fails with `QueueFull` beyond it.
    pub max_queue_size: usize,
    /// Commands allowed in flight at once.
    pub max_concurrent: usize,
    /// Commands per batch.
    pub batch_size: usize,
    /// Scheduling tick.
    pub batch_interval: Duration,
    /// Wait after which a queued command is raised one priority level.
    pub priority_boost_threshold: Duration,
    /// Delay before a failed command is requeued.
    pub retry_delay: Duration,
    /// Attempts per command unless overridden at enqueue.
    pub default_max_attempts: u32,
    /// Execution timeout per command unless overridden at enqueue.
    pub default_timeout: Duration,
    /// How long finished batches stay inspectable.
    pub batch_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_concurrent: 5,
            batch_size: 5,
            batch_interval: Duration::from_millis(100),
            priority_boost_threshold: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            default_max_attempts: 3,
            default_timeout: Duration::from_secs(30),
            batch_retention: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// CacheConfig
// ============================================================================

/// Result cache caps and expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Resident byte cap (estimated).
    pub max_bytes: usize,
    /// Item count cap.
    pub max_items: usize,
    /// TTL for `set` without an explicit TTL.
    pub default_ttl: Duration,
    /// TTL for cached command results.
    pub command_result_ttl: Duration,
    /// Interval of the expiry sweep.
    pub sweep_interval: Duration,
    /// Byte utilization (0.0-1.0) that triggers emergency eviction.
    pub pressure_threshold: f64,
    /// Fraction of items dropped by an emergency eviction.
    pub emergency_evict_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            max_items: 1000,
            default_ttl: Duration::from_secs(300),
            command_result_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            pressure_threshold: 0.8,
            emergency_evict_ratio: 0.2,
        }
    }
}

// ============================================================================
// HealthConfig
// ============================================================================

/// Health coordinator intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Interval of the health score computation.
    pub check_interval: Duration,
    /// Interval of the advisory optimization pass.
    pub optimize_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            optimize_interval: Duration::from_secs(300),
        }
    }
}

// ============================================================================
// AgentConfig
// ============================================================================

/// Complete agent configuration.
#[derive(Clone, PartialEq)]
pub struct AgentConfig {
    /// Control server WebSocket URL (`ws://` or `wss://`).
    pub server_url: String,
    /// Local agent identity sent during authentication.
    pub agent_id: String,
    /// Credential sent during authentication. Never logged.
    pub token: String,
    /// Program names the process executor may run.
    pub allowed_commands: Vec<String>,
    /// Session timing.
    pub session: SessionConfig,
    /// Pool policy.
    pub pool: PoolConfig,
    /// Scheduler policy.
    pub scheduler: SchedulerConfig,
    /// Cache policy.
    pub cache: CacheConfig,
    /// Health coordinator intervals.
    pub health: HealthConfig,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("server_url", &self.server_url)
            .field("agent_id", &self.agent_id)
            .field("token", &"<redacted>")
            .field("allowed_commands", &self.allowed_commands)
            .field("session", &self.session)
            .field("pool", &self.pool)
            .field("scheduler", &self.scheduler)
            .field("cache", &self.cache)
            .field("health", &self.health)
            .finish()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            agent_id: DEFAULT_AGENT_ID.to_string(),
            token: String::new(),
            allowed_commands: Vec::new(),
            session: SessionConfig::default(),
            pool: PoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

// ============================================================================
// AgentConfig - Constructors
// ============================================================================

impl AgentConfig {
    /// Creates a configuration with defaults for everything but identity.
    #[must_use]
    pub fn new(
        server_url: impl Into<String>,
        agent_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            agent_id: agent_id.into(),
            token: token.into(),
            ..Default::default()
        }
    }

    /// Loads configuration from `AGENT_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    ///
    /// Missing keys keep their defaults.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("AGENT_SERVER_URL") {
            config.server_url = v;
        }
        if let Some(v) = lookup("AGENT_ID") {
            config.agent_id = v;
        }
        if let Some(v) = lookup("AGENT_TOKEN") {
            config.token = v;
        }
        if let Some(v) = lookup("AGENT_ALLOWED_COMMANDS") {
            config.allowed_commands = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        parse_into(&lookup, "AGENT_MAX_CONNECTIONS", &mut config.pool.max_connections);
        parse_millis(&lookup, "AGENT_CONNECT_TIMEOUT_MS", &mut config.session.connect_timeout);
        parse_millis(
            &lookup,
            "AGENT_HEARTBEAT_INTERVAL_MS",
            &mut config.session.heartbeat_interval,
        );
        parse_millis(
            &lookup,
            "AGENT_LIVENESS_TIMEOUT_MS",
            &mut config.session.liveness_timeout,
        );
        parse_into(&lookup, "AGENT_MAX_QUEUE_SIZE", &mut config.scheduler.max_queue_size);
        parse_into(&lookup, "AGENT_MAX_CONCURRENT", &mut config.scheduler.max_concurrent);
        parse_into(&lookup, "AGENT_BATCH_SIZE", &mut config.scheduler.batch_size);
        parse_millis(
            &lookup,
            "AGENT_BATCH_INTERVAL_MS",
            &mut config.scheduler.batch_interval,
        );
        parse_millis(
            &lookup,
            "AGENT_PRIORITY_BOOST_MS",
            &mut config.scheduler.priority_boost_threshold,
        );
        parse_into(&lookup, "AGENT_CACHE_MAX_BYTES", &mut config.cache.max_bytes);
        parse_into(&lookup, "AGENT_CACHE_MAX_ITEMS", &mut config.cache.max_items);
        parse_millis(&lookup, "AGENT_CACHE_TTL_MS", &mut config.cache.default_ttl);
        parse_millis(
            &lookup,
            "AGENT_RESULT_TTL_MS",
            &mut config.cache.command_result_ttl,
        );
        parse_millis(
            &lookup,
            "AGENT_HEALTH_INTERVAL_MS",
            &mut config.health.check_interval,
        );
        parse_millis(
            &lookup,
            "AGENT_OPTIMIZE_INTERVAL_MS",
            &mut config.health.optimize_interval,
        );

        config
    }
}

// ============================================================================
// AgentConfig - Builder Methods
// ============================================================================

impl AgentConfig {
    /// Sets the program allow-list for the process executor.
    #[inline]
    #[must_use]
    pub fn with_allowed_commands(
        mut self,
        commands: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.allowed_commands = commands.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the maximum number of pooled sessions.
    #[inline]
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.pool.max_connections = max;
        self
    }

    /// Sets the overall connection establishment timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.session.connect_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    #[inline]
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.session.heartbeat_interval = interval;
        self
    }

    /// Sets the liveness timeout.
    #[inline]
    #[must_use]
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.session.liveness_timeout = timeout;
        self
    }

    /// Replaces the pool policy.
    #[inline]
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Replaces the scheduler policy.
    #[inline]
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Replaces the cache policy.
    #[inline]
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Replaces the health intervals.
    #[inline]
    #[must_use]
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }
}

// ============================================================================
// AgentConfig - Validation
// ============================================================================

impl AgentConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.server_url)
            .map_err(|e| Error::config(format!("invalid server_url '{}': {e}", self.server_url)))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "server_url must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }

        if self.agent_id.trim().is_empty() {
            return Err(Error::config("agent_id must not be empty"));
        }

        if self.token.is_empty() {
            return Err(Error::config("token must not be empty. Set AGENT_TOKEN."));
        }

        if self.pool.max_connections == 0 {
            return Err(Error::config("pool.max_connections must be at least 1"));
        }

        if self.pool.connect_retries == 0 {
            return Err(Error::config("pool.connect_retries must be at least 1"));
        }

        let periods = [
            ("session.connect_timeout", self.session.connect_timeout),
            ("session.heartbeat_interval", self.session.heartbeat_interval),
            ("pool.health_check_interval", self.pool.health_check_interval),
            ("scheduler.batch_interval", self.scheduler.batch_interval),
            ("cache.sweep_interval", self.cache.sweep_interval),
            ("health.check_interval", self.health.check_interval),
            ("health.optimize_interval", self.health.optimize_interval),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, period)| period.is_zero()) {
            return Err(Error::config(format!("{name} must be greater than zero")));
        }

        if self.session.liveness_timeout <= self.session.heartbeat_interval {
            return Err(Error::config(
                "session.liveness_timeout must exceed session.heartbeat_interval",
            ));
        }

        let scheduler = &self.scheduler;
        if scheduler.max_queue_size == 0
            || scheduler.max_concurrent == 0
            || scheduler.batch_size == 0
            || scheduler.default_max_attempts == 0
        {
            return Err(Error::config(
                "scheduler queue size, concurrency, batch size and attempts must be at least 1",
            ));
        }

        if self.cache.max_bytes == 0 || self.cache.max_items == 0 {
            return Err(Error::config("cache caps must be at least 1"));
        }

        if !(0.0..=1.0).contains(&self.cache.pressure_threshold)
            || !(0.0..=1.0).contains(&self.cache.emergency_evict_ratio)
        {
            return Err(Error::config(
                "cache pressure_threshold and emergency_evict_ratio must be within 0.0..=1.0",
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Parses `key` into `target`, keeping the current value on failure.
fn parse_into<T, F>(lookup: &F, key: &str, target: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "Ignoring unparsable config value"),
        }
    }
}

/// Parses a millisecond count from `key` into `target`.
fn parse_millis<F>(lookup: &F, key: &str, target: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    let mut millis = target.as_millis() as u64;
    parse_into(lookup, key, &mut millis);
    *target = Duration::from_millis(millis);
}

// ============================================================================
// Tests
// ============================================================================
