//! Command scheduler.
//!
//! Owns the priority queue, the single pending batch, delayed retries and
//! the batch records. A tick task drives it every `batch_interval`:
//!
//! 1. Boost commands that waited past the aging threshold
//! 2. Form a batch from the queue front, unless one is already pending
//! 3. Dispatch the pending batch if fewer than `max_concurrent` run
//!
//! Batch members execute concurrently and settle independently. A failed
//! member goes back to the queue front after `retry_delay` until its
//! attempts run out.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at, sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::identifiers::{BatchId, CommandId};
use crate::protocol::ExecutionResult;

use super::command::{
    BatchStatus, CommandBatch, CommandHandle, CommandOptions, CommandProgress, Priority,
    QueuedCommand,
};
use super::executor::CommandExecutor;
use super::queue::CommandQueue;

// ============================================================================
// SchedulerStats
// ============================================================================

/// Read-only scheduler snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    /// Commands in the live queue.
    pub queue_depth: usize,
    /// Commands in the pending batch.
    pub pending: usize,
    /// Commands waiting out a retry delay.
    pub delayed: usize,
    /// Commands executing.
    pub in_flight: usize,
    /// Live queue per priority, indexed by [`Priority::index`].
    pub by_priority: [usize; 4],
    /// Mean time from acceptance to first dispatch.
    pub avg_wait: Duration,
    /// Mean execution time per attempt.
    pub avg_execution: Duration,
    /// Successful commands per second since start.
    pub throughput: f64,
    /// Commands that succeeded.
    pub completed: u64,
    /// Commands that exhausted their attempts.
    pub failed: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Commands cancelled.
    pub cancelled: u64,
}

impl SchedulerStats {
    /// Queued count for one priority.
    #[inline]
    #[must_use]
    pub fn queued_at(&self, priority: Priority) -> usize {
        self.by_priority[priority.index()]
    }
}

// ============================================================================
// Internal State
// ============================================================================

struct PendingBatch {
    batch: CommandBatch,
    commands: Vec<QueuedCommand>,
}

struct DelayedRetry {
    command: QueuedCommand,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Metrics {
    completed: u64,
    failed: u64,
    retried: u64,
    cancelled: u64,
    total_wait: Duration,
    waits: u32,
    total_execution: Duration,
    executions: u32,
}

impl Metrics {
    fn average(total: Duration, count: u32) -> Duration {
        if count == 0 {
            Duration::ZERO
        } else {
            total / count
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: CommandQueue,
    pending: Option<PendingBatch>,
    delayed: FxHashMap<CommandId, DelayedRetry>,
    batches: FxHashMap<BatchId, CommandBatch>,
    in_flight: usize,
    metrics: Metrics,
}

// ============================================================================
// CommandScheduler
// ============================================================================

/// Priority command scheduler.
///
/// # Example
///
/// ```ignore
/// let scheduler = CommandScheduler::new(SchedulerConfig::default(), Arc::new(executor));
///
/// let handle = scheduler.enqueue("uptime", CommandOptions::new().with_priority(Priority::High))?;
/// let result = handle.wait().await?;
/// ```
pub struct CommandScheduler {
    config: SchedulerConfig,
    executor: Arc<dyn CommandExecutor>,
    state: Mutex<SchedulerState>,
    started_at: Instant,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

// ============================================================================
// CommandScheduler - Constructor
// ============================================================================

impl CommandScheduler {
    /// Creates a scheduler and starts its tick task.
    #[must_use]
    pub fn new(config: SchedulerConfig, executor: Arc<dyn CommandExecutor>) -> Arc<Self> {
        let period = config.batch_interval;

        let scheduler = Arc::new(Self {
            config,
            executor,
            state: Mutex::new(SchedulerState::default()),
            started_at: Instant::now(),
            tick_task: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });

        let task = tokio::spawn(tick_loop(Arc::downgrade(&scheduler), period));
        *scheduler.tick_task.lock() = Some(task);

        debug!(
            max_queue = scheduler.config.max_queue_size,
            max_concurrent = scheduler.config.max_concurrent,
            batch_size = scheduler.config.batch_size,
            "CommandScheduler started"
        );

        scheduler
    }
}

// ============================================================================
// CommandScheduler - Public API
// ============================================================================

impl CommandScheduler {
    /// Accepts a command.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] when the queue is at capacity
    /// - [`Error::Shutdown`] after [`cleanup`](Self::cleanup)
    pub fn enqueue(
        &self,
        command: impl Into<String>,
        options: CommandOptions,
    ) -> Result<CommandHandle> {
        if self.is_shutdown() {
            return Err(Error::shutdown("scheduler"));
        }

        let mut state = self.state.lock();
        // cleanup may have drained the queue since the check above
        if self.is_shutdown() {
            return Err(Error::shutdown("scheduler"));
        }
        if state.queue.len() >= self.config.max_queue_size {
            warn!(capacity = self.config.max_queue_size, "Command queue full");
            return Err(Error::queue_full(self.config.max_queue_size));
        }

        let (queued, handle) = QueuedCommand::new(
            command,
            options,
            self.config.default_timeout,
            self.config.default_max_attempts,
            Instant::now(),
        );

        queued.completion.progress(CommandProgress::Queued {
            priority: queued.priority,
        });
        debug!(command_id = %queued.id, priority = %queued.priority, "Command queued");

        state.queue.insert(queued);
        Ok(handle)
    }

    /// Cancels a command that has not started executing.
    ///
    /// Looks in the queue, the pending batch and the delayed retries.
    /// Returns `false` if the command is executing, settled or unknown.
    pub fn cancel(&self, id: CommandId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state
                .queue
                .remove(id)
                .or_else(|| take_from_pending(&mut state.pending, id))
                .or_else(|| {
                    state.delayed.remove(&id).map(|delayed| {
                        delayed.timer.abort();
                        delayed.command
                    })
                });
            if removed.is_some() {
                state.metrics.cancelled += 1;
            }
            removed
        };

        match removed {
            Some(mut command) => {
                command.completion.settle(Err(Error::cancelled(id)));
                debug!(command_id = %id, "Command cancelled");
                true
            }
            None => false,
        }
    }

    /// Returns a pending, processing or recently finished batch.
    #[must_use]
    pub fn batch(&self, id: BatchId) -> Option<CommandBatch> {
        let state = self.state.lock();
        match &state.pending {
            Some(pending) if pending.batch.id == id => Some(pending.batch.clone()),
            _ => state.batches.get(&id).cloned(),
        }
    }

    /// Returns a read-only snapshot.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        let metrics = &state.metrics;
        let uptime = self.started_at.elapsed().as_secs_f64();

        SchedulerStats {
            queue_depth: state.queue.len(),
            pending: state.pending.as_ref().map_or(0, |p| p.commands.len()),
            delayed: state.delayed.len(),
            in_flight: state.in_flight,
            by_priority: state.queue.distribution(),
            avg_wait: Metrics::average(metrics.total_wait, metrics.waits),
            avg_execution: Metrics::average(metrics.total_execution, metrics.executions),
            throughput: if uptime > 0.0 {
                metrics.completed as f64 / uptime
            } else {
                0.0
            },
            completed: metrics.completed,
            failed: metrics.failed,
            retried: metrics.retried,
            cancelled: metrics.cancelled,
        }
    }

    /// Returns the number of live timers: the tick task and retry delays.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        let tick = self
            .tick_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        let delayed = self
            .state
            .lock()
            .delayed
            .values()
            .filter(|d| !d.timer.is_finished())
            .count();
        usize::from(tick) + delayed
    }

    /// Returns `true` after [`cleanup`](Self::cleanup).
    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stops all timers and fails every waiting command with
    /// [`Error::Shutdown`].
    ///
    /// Executing commands finish on their own; failures among them are not
    /// retried. Idempotent.
    pub fn cleanup(&self) {
        let first = !self.shutdown.swap(true, Ordering::SeqCst);

        if let Some(task) = self.tick_task.lock().take() {
            task.abort();
        }

        let drained: Vec<QueuedCommand> = {
            let mut state = self.state.lock();
            let mut drained: Vec<_> = state.queue.drain().collect();
            if let Some(pending) = state.pending.take() {
                drained.extend(pending.commands);
            }
            for (_, delayed) in state.delayed.drain() {
                delayed.timer.abort();
                drained.push(delayed.command);
            }
            state.batches.clear();
            drained
        };

        let count = drained.len();
        for mut command in drained {
            command.completion.settle(Err(Error::shutdown("scheduler")));
        }

        if first {
            info!(drained = count, "CommandScheduler cleaned up");
        }
    }
}

// ============================================================================
// CommandScheduler - Scheduling
// ============================================================================

impl CommandScheduler {
    /// Runs one scheduling cycle.
    pub fn tick(self: &Arc<Self>) {
        if self.is_shutdown() {
            return;
        }

        let now = Instant::now();
        let dispatch = {
            let mut state = self.state.lock();

            let retention = self.config.batch_retention;
            state.batches.retain(|_, batch| {
                batch
                    .finished_at
                    .is_none_or(|at| now.saturating_duration_since(at) < retention)
            });

            let boosted = state
                .queue
                .boost_aged(now, self.config.priority_boost_threshold);
            if boosted > 0 {
                debug!(boosted, "Aged commands boosted");
            }

            if state.pending.is_none() && !state.queue.is_empty() {
                let commands = state.queue.take_batch(self.config.batch_size);
                let batch = CommandBatch::pending(&commands, now);
                debug!(batch_id = %batch.id, size = commands.len(), priority = %batch.priority, "Batch formed");
                state.pending = Some(PendingBatch { batch, commands });
            }

            if state.in_flight < self.config.max_concurrent {
                state.pending.take().map(|pending| start_batch(&mut state, pending, now))
            } else {
                None
            }
        };

        if let Some((batch_id, commands)) = dispatch {
            tokio::spawn(Arc::clone(self).process_batch(batch_id, commands));
        }
    }

    /// Executes every member concurrently and records the batch outcome.
    async fn process_batch(self: Arc<Self>, batch_id: BatchId, commands: Vec<QueuedCommand>) {
        let size = commands.len();
        let executions = commands.into_iter().map(|command| {
            let scheduler = Arc::clone(&self);
            async move {
                let started = Instant::now();
                let outcome = scheduler.run(&command).await;
                scheduler.settle(command, outcome, started.elapsed())
            }
        });

        let succeeded = join_all(executions).await.into_iter().filter(|ok| *ok).count();

        let mut state = self.state.lock();
        if let Some(batch) = state.batches.get_mut(&batch_id) {
            batch.status = if succeeded == size {
                BatchStatus::Completed
            } else {
                BatchStatus::Failed
            };
            batch.finished_at = Some(Instant::now());
        }

        debug!(%batch_id, size, succeeded, "Batch finished");
    }

    /// One attempt, bounded by the command timeout.
    async fn run(&self, command: &QueuedCommand) -> Result<ExecutionResult> {
        let timeout_ms = command.timeout.as_millis() as u64;

        match timeout(command.timeout, self.executor.execute(command.id, &command.command)).await {
            Ok(Ok(result)) if result.is_success() => Ok(result),
            Ok(Ok(result)) => Err(Error::execution(result.failure_reason())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::timeout(format!("command {}", command.id), timeout_ms)),
        }
    }

    /// Resolves or reschedules one attempt. Returns `true` on success.
    fn settle(
        self: &Arc<Self>,
        mut command: QueuedCommand,
        outcome: Result<ExecutionResult>,
        elapsed: Duration,
    ) -> bool {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.metrics.total_execution += elapsed;
        state.metrics.executions += 1;

        let error = match outcome {
            Ok(result) => {
                state.metrics.completed += 1;
                drop(state);
                debug!(command_id = %command.id, attempts = command.attempts, "Command completed");
                command.completion.settle(Ok(result));
                return true;
            }
            Err(e) => e,
        };

        if self.is_shutdown() {
            drop(state);
            command.completion.settle(Err(Error::shutdown("scheduler")));
            return false;
        }

        if command.exhausted() {
            state.metrics.failed += 1;
            drop(state);
            warn!(command_id = %command.id, attempts = command.attempts, error = %error, "Command failed permanently");
            let terminal = Error::max_attempts_reached(command.id, command.attempts, error.to_string());
            command.completion.settle(Err(terminal));
            return false;
        }

        let delay = self.config.retry_delay;
        state.metrics.retried += 1;
        command.completion.progress(CommandProgress::Retrying {
            attempt: command.attempts,
            delay,
            error: error.to_string(),
        });
        debug!(command_id = %command.id, attempt = command.attempts, error = %error, "Command will be retried");

        let id = command.id;
        let scheduler = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.requeue(id);
            }
        });
        state.delayed.insert(id, DelayedRetry { command, timer });

        false
    }

    /// Moves a delayed retry to the queue front.
    fn requeue(&self, id: CommandId) {
        let mut state = self.state.lock();
        if let Some(delayed) = state.delayed.remove(&id) {
            state.queue.push_front(delayed.command);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Marks a pending batch as processing and accounts for its members.
fn start_batch(
    state: &mut SchedulerState,
    mut pending: PendingBatch,
    now: Instant,
) -> (BatchId, Vec<QueuedCommand>) {
    pending.batch.status = BatchStatus::Processing;
    let batch_id = pending.batch.id;

    for command in &mut pending.commands {
        if command.attempts == 0 {
            state.metrics.total_wait += now.saturating_duration_since(command.enqueued_at);
            state.metrics.waits += 1;
        }
        command.attempts += 1;
        command.completion.progress(CommandProgress::Dispatched {
            batch_id,
            attempt: command.attempts,
        });
    }

    state.in_flight += pending.commands.len();
    state.batches.insert(batch_id, pending.batch);

    (batch_id, pending.commands)
}

/// Removes a command from a pending batch, dropping the batch if emptied.
fn take_from_pending(pending: &mut Option<PendingBatch>, id: CommandId) -> Option<QueuedCommand> {
    let batch = pending.as_mut()?;
    let position = batch.commands.iter().position(|c| c.id == id)?;
    let command = batch.commands.remove(position);
    batch.batch.command_ids.retain(|member| *member != id);

    if batch.commands.is_empty() {
        *pending = None;
    }
    Some(command)
}

/// Drives [`CommandScheduler::tick`] every `period`.
async fn tick_loop(scheduler: Weak<CommandScheduler>, period: Duration) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        if scheduler.is_shutdown() {
            break;
        }
        scheduler.tick();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Records calls; fails each command a configured number of times.
    #[derive(Default)]
    struct ScriptedExecutor {
        calls: Mutex<Vec<String>>,
        failures: Mutex<FxHashMap<String, u32>>,
        delay: Duration,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedExecutor {
        fn failing(command: &str, times: u32) -> Self {
            let executor = Self::default();
            executor.failures.lock().insert(command.to_string(), times);
            executor
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn execute(&self, _id: CommandId, command: &str) -> Result<ExecutionResult> {
            self.calls.lock().push(command.to_string());

            if let Some(gate) = &self.gate
                && command == "blocked"
            {
                gate.notified().await;
            }
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }

            let fail = {
                let mut failures = self.failures.lock();
                match failures.get_mut(command) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };

            if fail {
                Ok(ExecutionResult::failure("boom", 1))
            } else {
                Ok(ExecutionResult::success(command))
            }
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            max_queue_size: 10,
            max_concurrent: 5,
            batch_size: 5,
            batch_interval: Duration::from_millis(10),
            priority_boost_threshold: Duration::from_secs(30),
            retry_delay: Duration::from_millis(10),
            default_max_attempts: 3,
            default_timeout: Duration::from_secs(5),
            batch_retention: Duration::from_secs(60),
        }
    }

    /// Ticks only when the test says so.
    fn manual() -> SchedulerConfig {
        SchedulerConfig {
            batch_interval: Duration::from_secs(3600),
            ..config()
        }
    }

    async fn wait(handle: CommandHandle) -> Result<ExecutionResult> {
        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("settled in time")
    }

    #[tokio::test]
    async fn test_enqueue_and_complete() {
        let scheduler = CommandScheduler::new(config(), Arc::new(ScriptedExecutor::default()));

        let handle = scheduler.enqueue("uptime", CommandOptions::new()).unwrap();
        let result = wait(handle).await.unwrap();

        assert_eq!(result.output, "uptime");
        let stats = scheduler.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.in_flight, 0);
        scheduler.cleanup();
    }

    #[tokio::test]
    async fn test_queue_full_is_rejected() {
        let config = SchedulerConfig {
            max_queue_size: 2,
            ..manual()
        };
        let scheduler = CommandScheduler::new(config, Arc::new(ScriptedExecutor::default()));

        let _a = scheduler.enqueue("a", CommandOptions::new()).unwrap();
        let _b = scheduler.enqueue("b", CommandOptions::new()).unwrap();
        let err = scheduler.enqueue("c", CommandOptions::new()).unwrap_err();

        assert!(matches!(err, Error::QueueFull { capacity: 2 }));
        assert_eq!(scheduler.stats().queue_depth, 2);
        scheduler.cleanup();
    }

    #[tokio::test]
    async fn test_batch_dispatches_by_priority() {
        let executor = Arc::new(ScriptedExecutor::default());
        let config = SchedulerConfig {
            batch_size: 3,
            ..manual()
        };
        let scheduler = CommandScheduler::new(config, executor.clone());

        let handles = [
            ("low", Priority::Low),
            ("critical", Priority::Critical),
            ("normal", Priority::Normal),
        ]
        .map(|(cmd, priority)| {
            scheduler
                .enqueue(cmd, CommandOptions::new().with_priority(priority))
                .unwrap()
        });

        scheduler.tick();
        for handle in handles {
            wait(handle).await.unwrap();
        }

        assert_eq!(executor.calls(), vec!["critical", "normal", "low"]);
        scheduler.cleanup();
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let executor = Arc::new(ScriptedExecutor::failing("flaky", 2));
        let scheduler = CommandScheduler::new(config(), executor.clone());

        let mut handle = scheduler.enqueue("flaky", CommandOptions::new()).unwrap();
        assert_eq!(
            handle.next_progress().await,
            Some(CommandProgress::Queued {
                priority: Priority::Normal
            })
        );
        assert!(matches!(
            handle.next_progress().await,
            Some(CommandProgress::Dispatched { attempt: 1, .. })
        ));
        assert!(matches!(
            handle.next_progress().await,
            Some(CommandProgress::Retrying { attempt: 1, .. })
        ));

        let result = wait(handle).await.unwrap();
        assert_eq!(result.output, "flaky");
        assert_eq!(executor.calls().len(), 3);

        let stats = scheduler.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        scheduler.cleanup();
    }

    #[tokio::test]
    async fn test_max_attempts_reached_once() {
        let executor = Arc::new(ScriptedExecutor::failing("broken", u32::MAX));
        let scheduler = CommandScheduler::new(config(), executor.clone());

        let handle = scheduler
            .enqueue("broken", CommandOptions::new().with_max_attempts(2))
            .unwrap();
        let err = wait(handle).await.unwrap_err();

        match err {
            Error::MaxAttemptsReached {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("boom"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(executor.calls().len(), 2);

        let stats = scheduler.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queue_depth + stats.pending + stats.delayed, 0);
        scheduler.cleanup();
    }

    #[tokio::test]
    async fn test_execution_timeout_counts_as_failure() {
        let executor = Arc::new(ScriptedExecutor {
            delay: Duration::from_millis(500),
            ..ScriptedExecutor::default()
        });
        let scheduler = CommandScheduler::new(config(), executor);

        let handle = scheduler
            .enqueue(
                "slow",
                CommandOptions::new()
                    .with_timeout(Duration::from_millis(20))
                    .with_max_attempts(1),
            )
            .unwrap();
        let err = wait(handle).await.unwrap_err();

        assert!(err.to_string().contains("Timeout after 20ms"));
        scheduler.cleanup();
    }

    #[tokio::test]
    async fn test_cancel_queued_command() {
        let scheduler = CommandScheduler::new(manual(), Arc::new(ScriptedExecutor::default()));

        let handle = scheduler.enqueue("later", CommandOptions::new()).unwrap();
        let id = handle.id();

        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert!(matches!(wait(handle).await, Err(Error::Cancelled { .. })));
        assert_eq!(scheduler.stats().cancelled, 1);
        scheduler.cleanup();
    }

    #[tokio::test]
    async fn test_cancel_pending_but_not_processing() {
        let gate = Arc::new(Notify::new());
        let executor = Arc::new(ScriptedExecutor {
            gate: Some(Arc::clone(&gate)),
            ..ScriptedExecutor::default()
        });
        let config = SchedulerConfig {
            max_concurrent: 1,
            batch_size: 1,
            ..manual()
        };
        let scheduler = CommandScheduler::new(config, executor);

        let blocked = scheduler.enqueue("blocked", CommandOptions::new()).unwrap();
        scheduler.tick();
        let waiting = scheduler.enqueue("waiting", CommandOptions::new()).unwrap();
        scheduler.tick();

        let stats = scheduler.stats();
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.pending, 1);

        assert!(!scheduler.cancel(blocked.id()));
        assert!(scheduler.cancel(waiting.id()));
        assert_eq!(scheduler.stats().pending, 0);

        gate.notify_one();
        wait(blocked).await.unwrap();
        assert!(matches!(wait(waiting).await, Err(Error::Cancelled { .. })));
        scheduler.cleanup();
    }

    #[tokio::test]
    async fn test_batch_is_retained_then_collected() {
        let config = SchedulerConfig {
            batch_retention: Duration::ZERO,
            ..manual()
        };
        let scheduler = CommandScheduler::new(config, Arc::new(ScriptedExecutor::default()));

        let mut handle = scheduler.enqueue("id", CommandOptions::new()).unwrap();
        scheduler.tick();

        handle.next_progress().await; // queued
        let Some(CommandProgress::Dispatched { batch_id, .. }) = handle.next_progress().await else {
            panic!("expected dispatch");
        };
        wait(handle).await.unwrap();

        // Let process_batch record the outcome
        tokio::time::sleep(Duration::from_millis(20)).await;
        let batch = scheduler.batch(batch_id).expect("retained");
        assert_eq!(batch.status, BatchStatus::Completed);
        assert!(batch.finished_at.is_some());

        scheduler.tick();
        assert!(scheduler.batch(batch_id).is_none());
        scheduler.cleanup();
    }

    #[tokio::test]
    async fn test_cleanup_fails_waiting_commands() {
        let scheduler = CommandScheduler::new(manual(), Arc::new(ScriptedExecutor::default()));

        let handles: Vec<_> = (0..3)
            .map(|i| scheduler.enqueue(format!("cmd-{i}"), CommandOptions::new()).unwrap())
            .collect();

        assert_eq!(scheduler.timer_count(), 1);
        scheduler.cleanup();
        scheduler.cleanup();
        assert_eq!(scheduler.timer_count(), 0);

        for handle in handles {
            assert!(matches!(wait(handle).await, Err(Error::Shutdown { .. })));
        }
        assert!(matches!(
            scheduler.enqueue("late", CommandOptions::new()),
            Err(Error::Shutdown { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_enqueue_racing_cleanup_always_settles() {
        let config = SchedulerConfig {
            max_queue_size: 10_000,
            ..manual()
        };
        let scheduler = CommandScheduler::new(config, Arc::new(ScriptedExecutor::default()));

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let scheduler = Arc::clone(&scheduler);
                tokio::task::spawn_blocking(move || {
                    (0..500)
                        .filter_map(|i| {
                            scheduler
                                .enqueue(format!("cmd-{p}-{i}"), CommandOptions::new())
                                .ok()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        tokio::task::yield_now().await;
        scheduler.cleanup();

        for producer in producers {
            for handle in producer.await.unwrap() {
                assert!(matches!(wait(handle).await, Err(Error::Shutdown { .. })));
            }
        }
    }

    #[tokio::test]
    async fn test_stats_distribution() {
        let scheduler = CommandScheduler::new(manual(), Arc::new(ScriptedExecutor::default()));

        let _h: Vec<_> = [Priority::Low, Priority::High, Priority::High]
            .into_iter()
            .map(|p| {
                scheduler
                    .enqueue("x", CommandOptions::new().with_priority(p))
                    .unwrap()
            })
            .collect();

        let stats = scheduler.stats();
        assert_eq!(stats.queue_depth, 3);
        assert_eq!(stats.queued_at(Priority::High), 2);
        assert_eq!(stats.queued_at(Priority::Low), 1);
        assert_eq!(stats.queued_at(Priority::Critical), 0);
        scheduler.cleanup();
    }
}
