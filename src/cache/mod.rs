//! Bounded result caching.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `size` | Approximate value sizes |
//! | `store` | Generic TTL + LRU store with emergency eviction |
//! | `command` | Command result cache keyed by content digest |

// ============================================================================
// Submodules
// ============================================================================

/// Command result cache keyed by content digest.
pub mod command;

/// Approximate value sizes.
pub mod size;

/// Generic TTL + LRU store.
pub mod store;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{CommandResultCache, fingerprint};
pub use size::estimate_size;
pub use store::{CacheStats, ResultCache, SweepReport};
