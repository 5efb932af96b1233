//! Queued commands, batches and completion handles.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::identifiers::{BatchId, CommandId};
use crate::protocol::ExecutionResult;

// ============================================================================
// Priority
// ============================================================================

/// Scheduling priority. Ordered `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Ahead of normal work.
    High,
    /// Highest; aging stops here.
    Critical,
}

impl Priority {
    /// All levels, lowest first.
    pub const ALL: [Self; 4] = [Self::Low, Self::Normal, Self::High, Self::Critical];

    /// Returns the next level up, saturating at `Critical`.
    #[inline]
    #[must_use]
    pub const fn boosted(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// Position in [`Priority::ALL`].
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns the level name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CommandOptions
// ============================================================================

/// Per-command scheduling options.
///
/// Unset fields fall back to the scheduler configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOptions {
    /// Initial priority.
    pub priority: Priority,
    /// Execution timeout per attempt.
    pub timeout: Option<Duration>,
    /// Attempts before giving up.
    pub max_attempts: Option<u32>,
    /// Caller data carried alongside the command, never interpreted.
    pub metadata: Value,
}

impl CommandOptions {
    /// Default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority.
    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the per-attempt timeout.
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the attempt limit.
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Attaches opaque metadata.
    #[inline]
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ============================================================================
// CommandProgress
// ============================================================================

/// Lifecycle notifications delivered through [`CommandHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandProgress {
    /// Accepted into the queue.
    Queued {
        /// Priority at acceptance.
        priority: Priority,
    },
    /// Moved into a batch for execution.
    Dispatched {
        /// Owning batch.
        batch_id: BatchId,
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// Failed; will be retried after a delay.
    Retrying {
        /// Attempts made so far.
        attempt: u32,
        /// Wait before re-queueing.
        delay: Duration,
        /// Failure that caused the retry.
        error: String,
    },
}

// ============================================================================
// Completion
// ============================================================================

/// Scheduler side of a [`CommandHandle`].
pub(crate) struct Completion {
    outcome: Option<oneshot::Sender<Result<ExecutionResult>>>,
    progress: mpsc::UnboundedSender<CommandProgress>,
}

impl Completion {
    /// Reports progress. Dropped handles are ignored.
    pub(crate) fn progress(&self, progress: CommandProgress) {
        let _ = self.progress.send(progress);
    }

    /// Resolves the handle. Returns `false` if already resolved.
    pub(crate) fn settle(&mut self, outcome: Result<ExecutionResult>) -> bool {
        match self.outcome.take() {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// QueuedCommand
// ============================================================================

/// A command owned by the scheduler.
pub struct QueuedCommand {
    /// Command id.
    pub id: CommandId,
    /// Raw command text.
    pub command: String,
    /// Current priority, raised by aging.
    pub priority: Priority,
    /// First acceptance time. Kept across retries.
    pub enqueued_at: Instant,
    /// Last aging boost.
    pub last_boosted_at: Option<Instant>,
    /// Attempts made so far.
    pub attempts: u32,
    /// Attempt limit.
    pub max_attempts: u32,
    /// Execution timeout per attempt.
    pub timeout: Duration,
    /// Opaque caller data.
    pub metadata: Value,
    pub(crate) completion: Completion,
}

impl QueuedCommand {
    /// Creates a command and the handle that observes it.
    #[must_use]
    pub fn new(
        command: impl Into<String>,
        options: CommandOptions,
        default_timeout: Duration,
        default_max_attempts: u32,
        now: Instant,
    ) -> (Self, CommandHandle) {
        let id = CommandId::generate();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let queued = Self {
            id,
            command: command.into(),
            priority: options.priority,
            enqueued_at: now,
            last_boosted_at: None,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(default_max_attempts).max(1),
            timeout: options.timeout.unwrap_or(default_timeout),
            metadata: options.metadata,
            completion: Completion {
                outcome: Some(outcome_tx),
                progress: progress_tx,
            },
        };

        let handle = CommandHandle {
            id,
            outcome: outcome_rx,
            progress: progress_rx,
        };

        (queued, handle)
    }

    /// Time since the last boost, or since acceptance if never boosted.
    #[inline]
    #[must_use]
    pub fn aged(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_boosted_at.unwrap_or(self.enqueued_at))
    }

    /// Returns `true` once the attempt limit is reached.
    #[inline]
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

impl fmt::Debug for QueuedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedCommand")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("priority", &self.priority)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// CommandHandle
// ============================================================================

/// Caller side of an enqueued command.
///
/// Resolves exactly once: with the result, or with the terminal error
/// ([`Error::MaxAttemptsReached`], [`Error::Cancelled`], [`Error::Shutdown`]).
#[derive(Debug)]
pub struct CommandHandle {
    id: CommandId,
    outcome: oneshot::Receiver<Result<ExecutionResult>>,
    progress: mpsc::UnboundedReceiver<CommandProgress>,
}

impl CommandHandle {
    /// Returns the command id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Waits for the next progress notification.
    ///
    /// Returns `None` once the command has settled and all notifications
    /// were read.
    pub async fn next_progress(&mut self) -> Option<CommandProgress> {
        self.progress.recv().await
    }

    /// Returns a progress notification if one is ready.
    pub fn try_progress(&mut self) -> Option<CommandProgress> {
        self.progress.try_recv().ok()
    }

    /// Waits for the command to settle.
    ///
    /// # Errors
    ///
    /// The terminal error the scheduler settled with, or
    /// [`Error::Shutdown`] if the scheduler went away.
    pub async fn wait(self) -> Result<ExecutionResult> {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(Error::shutdown("scheduler")))
    }
}

// ============================================================================
// CommandBatch
// ============================================================================

/// Batch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Formed, awaiting dispatch.
    Pending,
    /// Members executing.
    Processing,
    /// Every member succeeded.
    Completed,
    /// At least one member failed.
    Failed,
}

/// Inspectable record of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBatch {
    /// Batch id.
    pub id: BatchId,
    /// Members in dispatch order.
    pub command_ids: Vec<CommandId>,
    /// Highest member priority.
    pub priority: Priority,
    /// Formation time.
    pub created_at: Instant,
    /// Current status.
    pub status: BatchStatus,
    /// Set when every member has settled.
    pub finished_at: Option<Instant>,
}

impl CommandBatch {
    /// Builds a pending batch over `members`.
    #[must_use]
    pub fn pending(members: &[QueuedCommand], now: Instant) -> Self {
        Self {
            id: BatchId::generate(),
            command_ids: members.iter().map(|c| c.id).collect(),
            priority: members
                .iter()
                .map(|c| c.priority)
                .max()
                .unwrap_or_default(),
            created_at: now,
            status: BatchStatus::Pending,
            finished_at: None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(priority: Priority) -> (QueuedCommand, CommandHandle) {
        QueuedCommand::new(
            "true",
            CommandOptions::new().with_priority(priority),
            Duration::from_secs(1),
            3,
            Instant::now(),
        )
    }

    #[test]
    fn test_priority_order_and_boost() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::Low.boosted(), Priority::Normal);
        assert_eq!(Priority::Critical.boosted(), Priority::Critical);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_options_fall_back_to_defaults() {
        let (cmd, _handle) = queued(Priority::High);
        assert_eq!(cmd.max_attempts, 3);
        assert_eq!(cmd.timeout, Duration::from_secs(1));
        assert_eq!(cmd.attempts, 0);
        assert!(!cmd.exhausted());
    }

    #[test]
    fn test_zero_attempts_is_clamped() {
        let (cmd, _handle) = QueuedCommand::new(
            "true",
            CommandOptions::new().with_max_attempts(0),
            Duration::from_secs(1),
            3,
            Instant::now(),
        );
        assert_eq!(cmd.max_attempts, 1);
    }

    #[test]
    fn test_batch_priority_is_max() {
        let members: Vec<_> = [Priority::Low, Priority::High, Priority::Normal]
            .into_iter()
            .map(|p| queued(p).0)
            .collect();
        let batch = CommandBatch::pending(&members, Instant::now());
        assert_eq!(batch.priority, Priority::High);
        assert_eq!(batch.command_ids.len(), 3);
        assert_eq!(batch.status, BatchStatus::Pending);
    }

    #[tokio::test]
    async fn test_handle_settles_once() {
        let (mut cmd, handle) = queued(Priority::Normal);

        assert!(cmd.completion.settle(Ok(ExecutionResult::success("ok"))));
        assert!(!cmd.completion.settle(Err(Error::cancelled(cmd.id))));

        let result = handle.wait().await.unwrap();
        assert_eq!(result.output, "ok");
    }

    #[tokio::test]
    async fn test_dropped_command_reports_shutdown() {
        let (cmd, handle) = queued(Priority::Normal);
        drop(cmd);
        assert!(matches!(handle.wait().await, Err(Error::Shutdown { .. })));
    }
}
