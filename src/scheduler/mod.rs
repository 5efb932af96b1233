//! Priority command scheduling.
//!
//! Commands are queued by priority, aged so low-priority work cannot starve,
//! dispatched in bounded batches and retried from the queue front on failure.
//!
//! # Lifecycle
//!
//! ```text
//! enqueue ─► queue ─► pending batch ─► processing ─► settled
//!              ▲                            │
//!              └──── retry (front) ◄────────┘ failure, attempts left
//! ```
//!
//! Cancellation works until a command starts processing.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | Priorities, options, handles and batch records |
//! | `queue` | Priority queue with aging |
//! | `executor` | Execution seam and the process executor |
//! | `core` | The scheduler itself |

// ============================================================================
// Submodules
// ============================================================================

/// Priorities, options, handles and batch records.
pub mod command;

/// Scheduler core.
pub mod core;

/// Execution seam and the process executor.
pub mod executor;

/// Priority queue with aging.
pub mod queue;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::core::{CommandScheduler, SchedulerStats};
pub use command::{
    BatchStatus, CommandBatch, CommandHandle, CommandOptions, CommandProgress, Priority,
    QueuedCommand,
};
pub use executor::{CommandExecutor, ProcessExecutor};
pub use queue::CommandQueue;
