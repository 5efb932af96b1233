//! Remote Agent - Resilient remote command execution.
//!
//! This library keeps a persistent WebSocket session to a control server,
//! runs the commands it receives under an allow-list and sends the results
//! back, surviving network instability indefinitely.
//!
//! # Architecture
//!
//! ```text
//! server ─► ConnectionPool ─► CommandScheduler ─► CommandExecutor
//!   ▲              │                                     │
//!   └── results ◄──┴──────── CommandResultCache ◄────────┘
//! ```
//!
//! - **Transport**: each session runs a handshake/auth/heartbeat state machine;
//!   the pool scores sessions, fails over and reconnects with backoff
//! - **Scheduler**: priority queue with aging, bounded batches, retries
//! - **Cache**: TTL + LRU store with a byte budget and emergency eviction
//! - **Health**: composite score over all of the above, advisory only
//!
//! [`Agent`] composes them. Nothing is global.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use remote_agent::{Agent, AgentConfig, ProcessExecutor, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = AgentConfig::new("ws://127.0.0.1:8080/agent", "agent-1", "token")
//!         .with_allowed_commands(["uptime", "df"]);
//!     let executor = Arc::new(ProcessExecutor::new(config.allowed_commands.clone()));
//!
//!     let agent = Agent::start(config, executor).await?;
//!     tokio::signal::ctrl_c().await?;
//!     agent.shutdown().await;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | Root composition: [`Agent`] |
//! | [`cache`] | Result cache |
//! | [`config`] | Configuration and environment loading |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`health`] | Health scoring and advisory optimization |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Wire message types |
//! | [`scheduler`] | Priority command scheduler |
//! | [`transport`] | Sessions and the connection pool |

// ============================================================================
// Modules
// ============================================================================

/// Root composition.
pub mod agent;

/// Bounded result caching.
pub mod cache;

/// Configuration surface.
///
/// Every tunable lives here with its default; [`AgentConfig::from_env`]
/// overlays `AGENT_*` environment variables.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Health scoring and advisory optimization.
pub mod health;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Wire protocol message types.
pub mod protocol;

/// Priority command scheduling.
pub mod scheduler;

/// WebSocket transport layer.
///
/// Session state machine and the connection pool above it.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Agent
pub use agent::Agent;

// Cache types
pub use cache::{CacheStats, CommandResultCache, ResultCache};

// Configuration types
pub use config::{
    AgentConfig, CacheConfig, HealthConfig, PoolConfig, SchedulerConfig, SessionConfig,
};

// Error types
pub use error::{Error, Result};

// Health types
pub use health::{HealthCoordinator, HealthReport, HealthStatus, OptimizationAction};

// Identifier types
pub use identifiers::{BatchId, CommandId, RequestId, SessionId};

// Protocol types
pub use protocol::{AgentStatus, ExecutionResult, Message};

// Scheduler types
pub use scheduler::{
    CommandExecutor, CommandHandle, CommandOptions, CommandScheduler, Priority, ProcessExecutor,
    SchedulerStats,
};

// Transport types
pub use transport::{ConnectionPool, PoolStats, SessionState};
