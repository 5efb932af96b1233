//! Error types for the remote agent.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use remote_agent::{Error, Result};
//!
//! async fn example(scheduler: &CommandScheduler) -> Result<()> {
//!     let handle = scheduler.enqueue("uptime", CommandOptions::default())?;
//!     let result = handle.wait().await?;
//!     println!("{}", result.output);
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connectivity | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::LivenessTimeout`], [`Error::NoConnectionAvailable`] |
//! | Authentication | [`Error::Authentication`] |
//! | Protocol | [`Error::Protocol`] |
//! | Capacity | [`Error::QueueFull`] |
//! | Execution | [`Error::Execution`], [`Error::Timeout`], [`Error::MaxAttemptsReached`], [`Error::Cancelled`], [`Error::Shutdown`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |
//!
//! A cache insert that exceeds the size cap is not an error: `set` simply
//! returns `false`.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{CommandId, SessionId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when the agent configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection establishment exceeded its overall timeout.
    ///
    /// Covers the socket open, the welcome handshake and authentication.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No liveness acknowledgment arrived within the configured window.
    #[error("Session {session_id} missed liveness acknowledgment for {timeout_ms}ms")]
    LivenessTimeout {
        /// Session that went silent.
        session_id: SessionId,
        /// Liveness window in milliseconds.
        timeout_ms: u64,
    },

    /// The pool has no usable session and cannot create one right now.
    ///
    /// Transient: callers should retry later.
    #[error("No connection available")]
    NoConnectionAvailable,

    // ========================================================================
    // Authentication Errors
    // ========================================================================
    /// Server rejected the agent credentials.
    ///
    /// Terminal for the session that received it.
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Reason reported by the server.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected message.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Capacity Errors
    // ========================================================================
    /// Command queue is at capacity.
    #[error("Command queue full ({capacity} commands)")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// A single command execution failed.
    #[error("Execution failed: {message}")]
    Execution {
        /// Failure reported by the executor.
        message: String,
    },

    /// Operation timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Command failed on every allowed attempt.
    #[error("Command {command_id} failed after {attempts} attempts: {last_error}")]
    MaxAttemptsReached {
        /// The command that exhausted its attempts.
        command_id: CommandId,
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },

    /// Command was cancelled before it was dispatched.
    #[error("Command {command_id} cancelled")]
    Cancelled {
        /// The cancelled command.
        command_id: CommandId,
    },

    /// Component shut down before the operation could complete.
    #[error("Shutdown: {component} is no longer running")]
    Shutdown {
        /// Component that shut down.
        component: &'static str,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a liveness timeout error.
    #[inline]
    pub fn liveness_timeout(session_id: SessionId, timeout_ms: u64) -> Self {
        Self::LivenessTimeout {
            session_id,
            timeout_ms,
        }
    }

    /// Creates an authentication error.
    #[inline]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a queue full error.
    #[inline]
    pub fn queue_full(capacity: usize) -> Self {
        Self::QueueFull { capacity }
    }

    /// Creates an execution error.
    #[inline]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates a max attempts reached error.
    #[inline]
    pub fn max_attempts_reached(
        command_id: CommandId,
        attempts: u32,
        last_error: impl Into<String>,
    ) -> Self {
        Self::MaxAttemptsReached {
            command_id,
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Creates a cancellation error.
    #[inline]
    pub fn cancelled(command_id: CommandId) -> Self {
        Self::Cancelled { command_id }
    }

    /// Creates a shutdown error.
    #[inline]
    pub fn shutdown(component: &'static str) -> Self {
        Self::Shutdown { component }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Timeout { .. } | Self::LivenessTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::LivenessTimeout { .. }
                | Self::NoConnectionAvailable
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this is a capacity error.
    #[inline]
    #[must_use]
    pub fn is_capacity_error(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::NoConnectionAvailable)
    }

    /// Returns `true` if this is an authentication error.
    #[inline]
    #[must_use]
    pub fn is_authentication_error(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.is_connection_error()
            || self.is_capacity_error()
            || matches!(self, Self::Timeout { .. } | Self::Execution { .. })
    }

    /// Returns `true` if retrying can never succeed.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::Shutdown { .. } | Self::Config { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("refused");
        assert_eq!(err.to_string(), "Connection failed: refused");
    }

    #[test]
    fn test_queue_full_display() {
        let err = Error::queue_full(1000);
        assert_eq!(err.to_string(), "Command queue full (1000 commands)");
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::connection_timeout(5000);
        let liveness_err = Error::liveness_timeout(SessionId::next(), 60_000);
        let other_err = Error::connection("test");

        assert!(timeout_err.is_timeout());
        assert!(liveness_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection("test").is_connection_error());
        assert!(Error::connection_timeout(1000).is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::NoConnectionAvailable.is_connection_error());
        assert!(!Error::config("test").is_connection_error());
        assert!(!Error::authentication("bad token").is_connection_error());
    }

    #[test]
    fn test_capacity_errors_are_recoverable() {
        assert!(Error::queue_full(10).is_capacity_error());
        assert!(Error::queue_full(10).is_recoverable());
        assert!(Error::NoConnectionAvailable.is_recoverable());
    }

    #[test]
    fn test_terminal_errors() {
        assert!(Error::authentication("denied").is_terminal());
        assert!(Error::shutdown("scheduler").is_terminal());
        assert!(!Error::authentication("denied").is_recoverable());
        assert!(!Error::execution("exit 1").is_terminal());
    }

    #[test]
    fn test_max_attempts_display() {
        let id = CommandId::generate();
        let err = Error::max_attempts_reached(id, 3, "exit code 1");
        assert_eq!(
            err.to_string(),
            format!("Command {id} failed after 3 attempts: exit code 1")
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
