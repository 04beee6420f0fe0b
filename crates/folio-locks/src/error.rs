//! Subsystem error type.

use std::time::Duration;

use thiserror::Error;

use folio_types::{LockMode, OwnerId};

/// Errors surfaced by the lock subsystem.
///
/// Acquisition failures propagate to the caller as-is; nothing here is
/// retried internally. A failed hierarchical acquisition has already rolled
/// back every lock the attempt took before the error is returned.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LockError {
    /// A bounded wait expired before the mode became grantable.
    #[error("timed out after {waited:?} waiting for {mode} on '{key}'")]
    AcquisitionTimeout {
        key: String,
        mode: LockMode,
        waited: Duration,
    },

    /// The waiting context was cancelled through its interrupt flag.
    #[error("interrupted while waiting for {mode} on '{key}'")]
    AcquisitionInterrupted { key: String, mode: LockMode },

    /// Release of a mode the owner does not currently hold. A programming
    /// error in the caller, never an expected runtime condition.
    #[error("invalid release of {mode} on '{key}': not held by {owner}")]
    InvalidRelease {
        key: String,
        mode: LockMode,
        owner: OwnerId,
    },

    /// A write request on a node where the same owner already holds a read
    /// mode, refused under `upgrade_check`: two owners upgrading the same
    /// node deadlock each other, so upgrades are refused wholesale.
    #[error("refusing read-to-write upgrade on '{key}' by {owner}")]
    UpgradeWouldDeadlock { key: String, owner: OwnerId },

    /// Construction parameters failed validation.
    #[error("invalid lock manager configuration: {reason}")]
    Configuration { reason: String },
}

impl LockError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Timeouts and interruptions are contention outcomes; the remaining
    /// kinds are caller bugs or bad configuration.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AcquisitionTimeout { .. } | Self::AcquisitionInterrupted { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
