//! Envelope, result and status types.
//!
//! # Format
//!
//! ```json
//! { "type": "command", "command": "uptime", "requestId": "r-1" }
//! ```
//!
//! ```json
//! {
//!   "type": "command_result",
//!   "requestId": "r-1",
//!   "result": { "success": true, "output": "up 3 days", "exit_code": 0 },
//!   "timestamp": 1760000000000
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{from_str, to_string};

use crate::error::Result;
use crate::identifiers::RequestId;

// ============================================================================
// Message
// ============================================================================

/// A protocol envelope.
///
/// Unknown `type` values decode to [`Message::Unknown`] so a newer server
/// never breaks an older agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    /// Server greeting sent right after the socket opens.
    Welcome {
        /// Server-assigned session identity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Server build, informational.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_version: Option<String>,
    },

    /// Agent credentials.
    Auth {
        /// Agent token.
        token: String,
        /// Local agent identity.
        agent_id: String,
        /// Host the agent runs on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
        /// Agent build.
        version: String,
    },

    /// Credentials accepted.
    AuthSuccess {
        /// Server-assigned session identity, if not sent in `welcome`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Credentials rejected.
    AuthError {
        /// Rejection reason.
        #[serde(default)]
        message: String,
    },

    /// Liveness probe.
    Ping {
        /// Sender clock, milliseconds since the Unix epoch.
        #[serde(default)]
        timestamp: u64,
    },

    /// Liveness acknowledgment.
    Pong {
        /// Echo of the probe timestamp, or the responder's clock.
        #[serde(default)]
        timestamp: u64,
    },

    /// Agent availability.
    Status {
        /// Current status.
        status: AgentStatus,
    },

    /// Command request.
    Command {
        /// Raw command text.
        command: String,
        /// Correlation id echoed in the result.
        request_id: RequestId,
    },

    /// Command outcome.
    CommandResult {
        /// Correlation id from the request.
        request_id: RequestId,
        /// Execution outcome.
        result: ExecutionResult,
        /// Completion time, milliseconds since the Unix epoch.
        timestamp: u64,
    },

    /// Any unrecognized `type`.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Creates a `ping` stamped with the current time.
    #[inline]
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: now_millis(),
        }
    }

    /// Creates a `status` message.
    #[inline]
    #[must_use]
    pub fn status(status: AgentStatus) -> Self {
        Self::Status { status }
    }

    /// Creates a `command_result` stamped with the current time.
    #[inline]
    #[must_use]
    pub fn command_result(request_id: RequestId, result: ExecutionResult) -> Self {
        Self::CommandResult {
            request_id,
            result,
            timestamp: now_millis(),
        }
    }

    /// Returns the wire `type` tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Auth { .. } => "auth",
            Self::AuthSuccess { .. } => "auth_success",
            Self::AuthError { .. } => "auth_error",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Status { .. } => "status",
            Self::Command { .. } => "command",
            Self::CommandResult { .. } => "command_result",
            Self::Unknown => "unknown",
        }
    }

    /// Serializes to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(to_string(self)?)
    }

    /// Parses a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) for malformed input or a
    /// known `type` with missing required fields.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(from_str(text)?)
    }
}

// ============================================================================
// ExecutionResult
// ============================================================================

/// Outcome of one command execution.
///
/// Returned by the executor and carried verbatim as the wire `result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the command ran successfully.
    pub success: bool,
    /// Captured standard output.
    #[serde(default)]
    pub output: String,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Process exit code; `-1` when the process never ran.
    #[serde(default)]
    pub exit_code: i32,
}

impl ExecutionResult {
    /// Creates a successful result.
    #[inline]
    #[must_use]
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            exit_code: 0,
        }
    }

    /// Creates a failed result.
    #[inline]
    #[must_use]
    pub fn failure(error: impl Into<String>, exit_code: i32) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            exit_code,
        }
    }

    /// Returns `true` for a successful run with exit code 0.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Describes the failure for logs and retry bookkeeping.
    #[must_use]
    pub fn failure_reason(&self) -> String {
        match &self.error {
            Some(error) if !error.is_empty() => error.clone(),
            _ => format!("exit code {}", self.exit_code),
        }
    }
}

// ============================================================================
// AgentStatus
// ============================================================================

/// Availability reported through `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Session established.
    Connected,
    /// Agent going away.
    Disconnected,
    /// At execution capacity.
    Busy,
    /// Accepting commands.
    Ready,
}

// ============================================================================
// Helpers
// ============================================================================

/// Milliseconds since the Unix epoch.
#[inline]
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================
