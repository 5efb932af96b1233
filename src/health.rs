//! Composite health scoring and advisory optimization.
//!
//! The coordinator reads snapshots from the pool, the scheduler and the
//! cache. It never sits on the request path and never fails it.
//!
//! # Score
//!
//! Starts at 100:
//!
//! | Signal | Deduction |
//! |--------|-----------|
//! | avg latency > 5s / > 2s | −30 / −15 |
//! | cache hit rate < 20% / < 50% | −20 / −10 |
//! | queue depth > 50 / > 20 | −25 / −10 |
//! | cache utilization > 90% / > 70% | −30 / −15 |
//!
//! The hit-rate deduction only applies once the cache has seen a lookup.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, CommandResultCache};
use crate::config::HealthConfig;
use crate::scheduler::{CommandScheduler, SchedulerStats};
use crate::transport::{ConnectionPool, PoolStats};

// ============================================================================
// Constants
// ============================================================================

/// Queue depth above which the optimizer warns.
const QUEUE_WARNING_DEPTH: usize = 20;

/// Cache utilization (percent) above which the optimizer sweeps.
const CACHE_SWEEP_UTILIZATION: f64 = 70.0;

// ============================================================================
// HealthStatus
// ============================================================================

/// Four-level health label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Score ≥ 85.
    Excellent,
    /// Score ≥ 70.
    Good,
    /// Score ≥ 50.
    Fair,
    /// Anything lower.
    Poor,
}

impl HealthStatus {
    /// Maps a score to its label.
    #[must_use]
    pub fn from_score(score: u8) -> Self {
        match score {
            85.. => Self::Excellent,
            70..=84 => Self::Good,
            50..=69 => Self::Fair,
            _ => Self::Poor,
        }
    }

    /// Lowercase name.
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// HealthInputs
// ============================================================================

/// Signals the score is computed from.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthInputs {
    /// Mean execution time per attempt.
    pub avg_latency: Duration,
    /// Cache hit rate, percent.
    pub hit_rate: f64,
    /// Cache lookups so far.
    pub lookups: u64,
    /// Commands in the live queue.
    pub queue_depth: usize,
    /// Cache byte utilization, percent.
    pub cache_utilization: f64,
    /// Healthy transport sessions.
    pub healthy_connections: usize,
}

impl HealthInputs {
    /// Collects inputs from component snapshots.
    #[must_use]
    pub fn gather(pool: &PoolStats, scheduler: &SchedulerStats, cache: &CacheStats) -> Self {
        Self {
            avg_latency: scheduler.avg_execution,
            hit_rate: cache.hit_rate,
            lookups: cache.lookups(),
            queue_depth: scheduler.queue_depth,
            cache_utilization: cache.utilization,
            healthy_connections: pool.healthy,
        }
    }
}

/// Computes the 0–100 health score.
#[must_use]
pub fn compute_score(inputs: &HealthInputs) -> u8 {
    let mut score: i32 = 100;

    if inputs.avg_latency > Duration::from_secs(5) {
        score -= 30;
    } else if inputs.avg_latency > Duration::from_secs(2) {
        score -= 15;
    }

    if inputs.lookups > 0 {
        if inputs.hit_rate < 20.0 {
            score -= 20;
        } else if inputs.hit_rate < 50.0 {
            score -= 10;
        }
    }

    if inputs.queue_depth > 50 {
        score -= 25;
    } else if inputs.queue_depth > 20 {
        score -= 10;
    }

    if inputs.cache_utilization > 90.0 {
        score -= 30;
    } else if inputs.cache_utilization > 70.0 {
        score -= 15;
    }

    score.clamp(0, 100) as u8
}

// ============================================================================
// HealthReport / OptimizationAction
// ============================================================================

/// One health evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    /// 0–100.
    pub score: u8,
    /// Label for `score`.
    pub status: HealthStatus,
    /// What the score was computed from.
    pub inputs: HealthInputs,
    /// When the report was produced.
    pub checked_at: Instant,
}

/// Something the advisory pass did or flagged.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizationAction {
    /// Ran a cache sweep under high utilization.
    CacheSweep {
        /// Expired entries removed.
        expired: usize,
        /// Entries removed by emergency eviction.
        evicted: usize,
    },
    /// The queue is backing up.
    QueueBacklog {
        /// Depth observed.
        depth: usize,
    },
    /// No healthy transport session exists.
    NoHealthyConnections,
}

// ============================================================================
// HealthCoordinator
// ============================================================================

/// Periodic health scoring over the pipeline components.
pub struct HealthCoordinator {
    config: HealthConfig,
    pool: Arc<ConnectionPool>,
    scheduler: Arc<CommandScheduler>,
    cache: Arc<CommandResultCache>,
    last_report: RwLock<Option<HealthReport>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl HealthCoordinator {
    /// Creates a coordinator and starts its check and optimize timers.
    #[must_use]
    pub fn new(
        config: HealthConfig,
        pool: Arc<ConnectionPool>,
        scheduler: Arc<CommandScheduler>,
        cache: Arc<CommandResultCache>,
    ) -> Arc<Self> {
        let check_period = config.check_interval;
        let optimize_period = config.optimize_interval;

        let coordinator = Arc::new(Self {
            config,
            pool,
            scheduler,
            cache,
            last_report: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let check = tokio::spawn(periodic(Arc::downgrade(&coordinator), check_period, |c| {
            c.check();
        }));
        let optimize = tokio::spawn(periodic(
            Arc::downgrade(&coordinator),
            optimize_period,
            |c| {
                c.optimize();
            },
        ));
        coordinator.tasks.lock().extend([check, optimize]);

        debug!(
            check_ms = coordinator.config.check_interval.as_millis() as u64,
            optimize_ms = coordinator.config.optimize_interval.as_millis() as u64,
            "HealthCoordinator started"
        );

        coordinator
    }

    /// Computes and retains a fresh report.
    pub fn check(&self) -> HealthReport {
        let inputs = HealthInputs::gather(
            &self.pool.stats(),
            &self.scheduler.stats(),
            &self.cache.stats(),
        );
        let score = compute_score(&inputs);
        let report = HealthReport {
            score,
            status: HealthStatus::from_score(score),
            inputs,
            checked_at: Instant::now(),
        };

        debug!(score, status = %report.status, queue_depth = inputs.queue_depth, "Health checked");
        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Runs the advisory pass.
    ///
    /// Sweeps the cache under high utilization and warns about a backed-up
    /// queue or missing connectivity. Never touches executing work.
    pub fn optimize(&self) -> Vec<OptimizationAction> {
        let mut actions = Vec::new();

        let cache = self.cache.stats();
        if cache.utilization > CACHE_SWEEP_UTILIZATION {
            let report = self.cache.sweep();
            info!(
                utilization = cache.utilization,
                expired = report.expired,
                evicted = report.evicted,
                "Cache swept under pressure"
            );
            actions.push(OptimizationAction::CacheSweep {
                expired: report.expired,
                evicted: report.evicted,
            });
        }

        let depth = self.scheduler.stats().queue_depth;
        if depth > QUEUE_WARNING_DEPTH {
            warn!(depth, "Command queue backing up; consider raising max_concurrent");
            actions.push(OptimizationAction::QueueBacklog { depth });
        }

        if self.pool.stats().healthy == 0 {
            warn!("No healthy connections; check server reachability");
            actions.push(OptimizationAction::NoHealthyConnections);
        }

        actions
    }

    /// Returns the latest report.
    #[must_use]
    pub fn last_report(&self) -> Option<HealthReport> {
        self.last_report.read().clone()
    }

    /// Returns the number of live timers.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }

    /// Returns `true` after [`cleanup`](Self::cleanup).
    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stops both timers. Idempotent.
    pub fn cleanup(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("HealthCoordinator cleaned up");
    }
}

/// Runs `action` every `period` while the coordinator lives.
async fn periodic(
    coordinator: Weak<HealthCoordinator>,
    period: Duration,
    action: fn(&HealthCoordinator),
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        if coordinator.is_shutdown() {
            break;
        }
        action(&coordinator);
    }
}

// ============================================================================
// Tests
// ============================================================================
