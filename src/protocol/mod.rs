//! WebSocket protocol message types.
//!
//! This module defines the JSON envelopes exchanged between the agent and
//! the control server over the persistent connection.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `welcome` | Server → Agent | Handshake, carries session identity |
//! | `auth` | Agent → Server | Credentials + local identity |
//! | `auth_success` / `auth_error` | Server → Agent | Authentication verdict |
//! | `ping` / `pong` | Both | Liveness probe and acknowledgment |
//! | `status` | Agent → Server | Agent availability |
//! | `command` | Server → Agent | Command request |
//! | `command_result` | Agent → Server | Command outcome |
//!
//! Every envelope is a JSON object tagged by `type`; payload fields are
//! camelCase except inside `result`, which keeps `exit_code`.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Envelope, result and status types |

// ============================================================================
// Submodules
// ============================================================================

/// Envelope, result and status types.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use message::{AgentStatus, ExecutionResult, Message, now_millis};
