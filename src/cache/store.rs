//! Bounded TTL + LRU store.
//!
//! Recency is an ordered map from a monotonic access tick to the key, so the
//! least recently used entry is always the first one.
//!
//! # Invariants
//!
//! - An entry is never returned after `created_at + ttl`.
//! - Resident bytes never exceed `max_bytes`; entry count never exceeds
//!   `max_items`.
//! - The byte ledger equals the sum of resident entry sizes.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;

use super::size::estimate_size;

// ============================================================================
// CacheStats
// ============================================================================

/// Read-only cache snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Resident entries.
    pub items: usize,
    /// Resident bytes (estimated).
    pub bytes: usize,
    /// Byte cap.
    pub max_bytes: usize,
    /// Entry cap.
    pub max_items: usize,
    /// `bytes / max_bytes` as a percentage.
    pub utilization: f64,
    /// Mean entry size.
    pub avg_item_size: usize,
    /// Successful lookups.
    pub hits: u64,
    /// Failed lookups, expired ones included.
    pub misses: u64,
    /// Misses caused by expiry.
    pub expired: u64,
    /// Entries removed to make room or relieve pressure.
    pub evictions: u64,
    /// Inserts refused for size.
    pub rejected: u64,
    /// `hits / (hits + misses)` as a percentage; 0 without lookups.
    pub hit_rate: f64,
}

impl CacheStats {
    /// Total lookups.
    #[inline]
    #[must_use]
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries past their TTL.
    pub expired: usize,
    /// Entries removed by emergency eviction.
    pub evicted: usize,
}

// ============================================================================
// Internal State
// ============================================================================

struct CacheItem<V> {
    value: V,
    ttl: Duration,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    size: usize,
    tick: u64,
}

impl<V> CacheItem<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }

    /// Emergency-eviction rank; lower goes first.
    fn usefulness(&self, now: Instant) -> u64 {
        self.access_count + now.saturating_duration_since(self.last_accessed).as_secs()
    }
}

struct CacheState<V> {
    items: FxHashMap<String, CacheItem<V>>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    bytes: usize,
    hits: u64,
    misses: u64,
    expired: u64,
    evictions: u64,
    rejected: u64,
}

impl<V> Default for CacheState<V> {
    fn default() -> Self {
        Self {
            items: FxHashMap::default(),
            recency: BTreeMap::new(),
            next_tick: 0,
            bytes: 0,
            hits: 0,
            misses: 0,
            expired: 0,
            evictions: 0,
            rejected: 0,
        }
    }
}

impl<V> CacheState<V> {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Removes an entry and refunds its bytes.
    fn remove(&mut self, key: &str) -> Option<CacheItem<V>> {
        let item = self.items.remove(key)?;
        self.recency.remove(&item.tick);
        self.bytes -= item.size;
        Some(item)
    }

    /// Evicts the least recently used entry.
    fn evict_lru(&mut self) -> bool {
        let Some((_, key)) = self.recency.pop_first() else {
            return false;
        };
        if let Some(item) = self.items.remove(&key) {
            self.bytes -= item.size;
            self.evictions += 1;
        }
        true
    }

    fn utilization(&self, max_bytes: usize) -> f64 {
        if max_bytes == 0 {
            return 0.0;
        }
        self.bytes as f64 / max_bytes as f64
    }
}

// ============================================================================
// ResultCache
// ============================================================================

/// Bounded key/value store with per-entry TTL and LRU eviction.
///
/// # Example
///
/// ```ignore
/// let cache = Arc::new(ResultCache::new(CacheConfig::default()));
/// cache.spawn_sweeper();
///
/// cache.set("answer", 42_u64, None);
/// assert_eq!(cache.get("answer"), Some(42));
/// ```
pub struct ResultCache<V> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl<V> ResultCache<V>
where
    V: Clone + Serialize,
{
    /// Creates an empty cache. No sweeper runs until
    /// [`spawn_sweeper`](Self::spawn_sweeper).
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            sweeper: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Stores a value, evicting least recently used entries to make room.
    ///
    /// Returns `false` without touching the cache when the value alone is
    /// larger than `max_bytes`. A `None` TTL uses the configured default.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) -> bool {
        let key = key.into();
        let size = estimate_size(&value);
        let mut state = self.state.lock();

        if size > self.config.max_bytes {
            state.rejected += 1;
            debug!(key = %key, size, max = self.config.max_bytes, "Cache insert rejected");
            return false;
        }

        state.remove(&key);

        while !state.items.is_empty()
            && (state.bytes + size > self.config.max_bytes
                || state.items.len() >= self.config.max_items)
        {
            state.evict_lru();
        }

        let now = Instant::now();
        let tick = state.tick();
        state.recency.insert(tick, key.clone());
        state.bytes += size;
        state.items.insert(
            key,
            CacheItem {
                value,
                ttl: ttl.unwrap_or(self.config.default_ttl),
                created_at: now,
                last_accessed: now,
                access_count: 0,
                size,
                tick,
            },
        );
        true
    }

    /// Looks up a value, refreshing its recency.
    ///
    /// An expired entry is removed and counted as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = match state.items.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(item) => item.is_expired(now),
        };

        if expired {
            state.remove(key);
            state.misses += 1;
            state.expired += 1;
            return None;
        }

        let tick = state.tick();
        let state = &mut *state;
        let item = state.items.get_mut(key)?;
        state.recency.remove(&item.tick);
        state.recency.insert(tick, key.to_string());
        item.tick = tick;
        item.last_accessed = now;
        item.access_count += 1;
        let value = item.value.clone();
        state.hits += 1;
        Some(value)
    }

    /// Removes a key. Returns `true` if it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Removes every entry. Counters are kept.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.recency.clear();
        state.bytes = 0;
    }

    /// Number of resident entries, expired ones included until swept.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns `true` if nothing is resident.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired entries, then evicts by usefulness if byte
    /// utilization is above `pressure_threshold`.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired: Vec<String> = state
            .items
            .iter()
            .filter(|(_, item)| item.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }

        let evicted = if state.utilization(self.config.max_bytes) > self.config.pressure_threshold
        {
            self.emergency_evict(&mut state, now)
        } else {
            0
        };

        let report = SweepReport {
            expired: expired.len(),
            evicted,
        };
        if report != SweepReport::default() {
            debug!(expired = report.expired, evicted = report.evicted, "Cache swept");
        }
        report
    }

    /// Returns a read-only snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let items = state.items.len();
        let lookups = state.hits + state.misses;

        CacheStats {
            items,
            bytes: state.bytes,
            max_bytes: self.config.max_bytes,
            max_items: self.config.max_items,
            utilization: state.utilization(self.config.max_bytes) * 100.0,
            avg_item_size: if items == 0 { 0 } else { state.bytes / items },
            hits: state.hits,
            misses: state.misses,
            expired: state.expired,
            evictions: state.evictions,
            rejected: state.rejected,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64 * 100.0
            },
        }
    }

    /// Returns the number of live timers.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        usize::from(
            self.sweeper
                .lock()
                .as_ref()
                .is_some_and(|task| !task.is_finished()),
        )
    }

    /// Stops the sweeper and drops every entry. Idempotent.
    pub fn cleanup(&self) {
        let first = !self.shutdown.swap(true, Ordering::SeqCst);
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
        self.clear();
        if first {
            info!("ResultCache cleaned up");
        }
    }

    /// Removes the least useful `emergency_evict_ratio` of entries.
    fn emergency_evict(&self, state: &mut CacheState<V>, now: Instant) -> usize {
        let count = (state.items.len() as f64 * self.config.emergency_evict_ratio).ceil() as usize;
        if count == 0 {
            return 0;
        }

        let mut ranked: Vec<(u64, u64, String)> = state
            .items
            .iter()
            .map(|(key, item)| (item.usefulness(now), item.tick, key.clone()))
            .collect();
        ranked.sort_unstable();

        for (_, _, key) in ranked.into_iter().take(count) {
            state.remove(&key);
            state.evictions += 1;
        }

        warn!(
            evicted = count,
            utilization_pct = state.utilization(self.config.max_bytes) * 100.0,
            "Emergency cache eviction"
        );
        count
    }
}

impl<V> ResultCache<V>
where
    V: Clone + Serialize + Send + 'static,
{
    /// Starts the periodic sweep. Does nothing after cleanup or if one runs.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        *sweeper = Some(tokio::spawn(sweep_loop(
            Arc::downgrade(self),
            self.config.sweep_interval,
        )));
    }
}

/// Periodic sweep.
async fn sweep_loop<V>(cache: Weak<ResultCache<V>>, period: Duration)
where
    V: Clone + Serialize + Send + 'static,
{
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(cache) = cache.upgrade() else {
            break;
        };
        cache.sweep();
    }
}

// ============================================================================
// Tests
// ============================================================================
