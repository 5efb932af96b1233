//! WebSocket transport layer.
//!
//! This module handles the persistent connection between the agent (client)
//! and the control server.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                              ┌─────────────────┐
//! │  Agent (Rust)    │                              │  Control server │
//! │                  │         WebSocket            │                 │
//! │  ConnectionPool  │─────────────────────────────►│                 │
//! │  → Session 1..N  │      ws:// or wss://         │                 │
//! └──────────────────┘                              └─────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `ConnectionPool::get_connection` - Select or create a session
//! 2. `TransportSession::connect` - Socket, `welcome`, `auth`, `auth_success`
//! 3. Heartbeat `ping`/`pong` while ready
//! 4. Any close lands in `closed`; the pool removes the session and reselects
//! 5. `ConnectionPool::cleanup` - Close everything on shutdown
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `session` | Session state machine and event loop |
//! | `pool` | Session selection, reconnection and health checks |

// ============================================================================
// Submodules
// ============================================================================

/// Session state machine and event loop.
pub mod session;

/// Session selection, reconnection and health checks.
pub mod pool;

#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Re-exports
// ============================================================================

pub use pool::{ConnectionPool, InboundCommand, PoolStats};
pub use session::{
    CloseReason, Endpoint, SessionCounters, SessionEvent, SessionSnapshot, SessionState,
    TransportSession,
};
