//! Owner tokens for reentrant hold accounting.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_OWNER: Cell<Option<OwnerId>> = const { Cell::new(None) };
}

/// The logical identity a lock hold is charged to.
///
/// Owners are explicit tokens rather than OS thread identities: a guard
/// carries its owner, so it can be released from any thread, and the
/// primitive works unchanged under fiber- or task-style schedulers that
/// multiplex logical operations over threads. [`OwnerId::current`] gives the
/// conventional one-token-per-thread behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Mint a token no other owner shares.
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    /// The calling thread's token, assigned on first use.
    #[must_use]
    pub fn current() -> Self {
        THREAD_OWNER.with(|slot| match slot.get() {
            Some(owner) => owner,
            None => {
                let owner = Self::fresh();
                slot.set(Some(owner));
                owner
            }
        })
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}
