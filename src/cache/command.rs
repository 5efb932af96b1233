//! Command result cache.
//!
//! Keys are `cmd:` followed by the SHA-256 hex digest of the full command
//! text. Two commands with the same digest are treated as the same command.
//! Only successful results are stored.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::trace;

use crate::config::CacheConfig;
use crate::protocol::ExecutionResult;

use super::store::{CacheStats, ResultCache, SweepReport};

/// Key prefix for command results.
const KEY_PREFIX: &str = "cmd:";

/// Derives the cache key for a command.
#[must_use]
pub fn fingerprint(command: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.as_bytes());
    format!("{KEY_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Result cache specialized for command outcomes.
pub struct CommandResultCache {
    store: Arc<ResultCache<ExecutionResult>>,
    ttl: Duration,
}

impl CommandResultCache {
    /// Creates an empty cache using `command_result_ttl` for entries.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let ttl = config.command_result_ttl;
        Self {
            store: Arc::new(ResultCache::new(config)),
            ttl,
        }
    }

    /// Returns the cached result for `command`, if fresh.
    pub fn get(&self, command: &str) -> Option<ExecutionResult> {
        let hit = self.store.get(&fingerprint(command));
        trace!(hit = hit.is_some(), "Command cache lookup");
        hit
    }

    /// Stores a successful result. Failures are never cached.
    ///
    /// Returns `true` if the result was stored.
    pub fn store(&self, command: &str, result: &ExecutionResult) -> bool {
        if !result.is_success() {
            return false;
        }
        self.store
            .set(fingerprint(command), result.clone(), Some(self.ttl))
    }

    /// Drops the cached result for `command`.
    pub fn invalidate(&self, command: &str) -> bool {
        self.store.delete(&fingerprint(command))
    }

    /// See [`ResultCache::sweep`].
    pub fn sweep(&self) -> SweepReport {
        self.store.sweep()
    }

    /// See [`ResultCache::stats`].
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Starts the periodic sweep.
    pub fn spawn_sweeper(&self) {
        self.store.spawn_sweeper();
    }

    /// Returns the number of live timers.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.store.timer_count()
    }

    /// See [`ResultCache::cleanup`].
    pub fn cleanup(&self) {
        self.store.cleanup();
    }
}
