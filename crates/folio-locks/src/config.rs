//! Construction-time configuration.

use serde::{Deserialize, Serialize};

use crate::error::{LockError, Result};

/// Tuning and feature flags for a [`LockManager`](crate::LockManager).
///
/// Fixed at construction: the manager validates the config once and never
/// re-reads it, so flipping flags on a live system is unsupported by design.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Sizing hint for the registry maps: the stripe count, rounded up to
    /// the next power of two.
    pub concurrency_level: usize,

    /// Ancestor mode for collection writes. When set, ancestors take
    /// `INTENTION_WRITE` so writes to disjoint subtrees proceed
    /// concurrently; when clear, ancestors take `WRITE_LOCK` and a write
    /// serializes with every other write below the shared ancestor.
    pub multi_writer_collections: bool,

    /// Publish lock events to registered listeners. Off by default;
    /// publishing then costs a single branch.
    pub event_tracing: bool,

    /// Attach a rendered call stack to every published event. Expensive;
    /// meaningless without `event_tracing`.
    pub capture_backtraces: bool,

    /// Refuse a collection `WRITE_LOCK` request when the owner already
    /// holds `INTENTION_READ` or `READ_LOCK` on that node.
    pub upgrade_check: bool,

    /// `warn!` when a collection write is about to wait behind readers.
    pub warn_wait_on_read_for_write: bool,
}

impl LockConfig {
    pub const DEFAULT_CONCURRENCY_LEVEL: usize = 64;

    /// Upper bound on the stripe count; beyond this the arrays stop paying
    /// for themselves.
    pub const MAX_CONCURRENCY_LEVEL: usize = 1 << 16;

    /// Check the parameters without building anything.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_level == 0 {
            return Err(LockError::Configuration {
                reason: "concurrency_level must be at least 1".to_owned(),
            });
        }
        if self.concurrency_level > Self::MAX_CONCURRENCY_LEVEL {
            return Err(LockError::Configuration {
                reason: format!(
                    "concurrency_level {} exceeds the maximum of {}",
                    self.concurrency_level,
                    Self::MAX_CONCURRENCY_LEVEL
                ),
            });
        }
        Ok(())
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            concurrency_level: Self::DEFAULT_CONCURRENCY_LEVEL,
            multi_writer_collections: false,
            event_tracing: false,
            capture_backtraces: false,
            upgrade_check: false,
            warn_wait_on_read_for_write: false,
        }
    }
}
