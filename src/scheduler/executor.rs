//! Command execution seam.
//!
//! The scheduler only knows [`CommandExecutor`]. [`ProcessExecutor`] is the
//! production implementation: it runs a command through `sh -c` after
//! checking it against an allow-list of program names.

// ============================================================================
// Imports
// ============================================================================

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::Result;
use crate::identifiers::CommandId;
use crate::protocol::ExecutionResult;

// ============================================================================
// Constants
// ============================================================================

/// Exit code reported when the process never ran.
pub const NOT_RUN_EXIT_CODE: i32 = -1;

/// Characters that let one command line start another.
const SHELL_CONTROL: &[char] = &[';', '&', '|', '`', '$', '<', '>', '\n', '\r'];

// ============================================================================
// CommandExecutor
// ============================================================================

/// Runs one command.
///
/// Any `Err`, and any result that is not a success, counts as a retryable
/// failure for the scheduler.
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    /// Executes `command`.
    async fn execute(&self, id: CommandId, command: &str) -> Result<ExecutionResult>;
}

// ============================================================================
// ProcessExecutor
// ============================================================================

/// Runs allow-listed programs through the system shell.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    allowed: FxHashSet<String>,
}

impl ProcessExecutor {
    /// Creates an executor allowing only the given program names.
    ///
    /// An empty list rejects every command.
    #[must_use]
    pub fn new(allowed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the rejection reason, or `None` if `command` may run.
    #[must_use]
    pub fn check(&self, command: &str) -> Option<String> {
        let Some(first) = command.split_whitespace().next() else {
            return Some("empty command".to_string());
        };

        if command.contains(SHELL_CONTROL) {
            return Some("shell control characters are not allowed".to_string());
        }

        let program = Path::new(first)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(first);

        if self.allowed.contains(program) {
            None
        } else {
            Some(format!("command not allowed: {program}"))
        }
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, id: CommandId, command: &str) -> Result<ExecutionResult> {
        if let Some(reason) = self.check(command) {
            warn!(command_id = %id, %reason, "Command rejected");
            return Ok(ExecutionResult::failure(reason, NOT_RUN_EXIT_CODE));
        }

        debug!(command_id = %id, "Spawning command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let exit_code = output.status.code().unwrap_or(NOT_RUN_EXIT_CODE);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        Ok(ExecutionResult {
            success: output.status.success(),
            output: stdout,
            error: (!stderr.is_empty()).then_some(stderr),
            exit_code,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
