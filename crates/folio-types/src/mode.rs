//! Lock modes, lock namespaces, and the mode compatibility matrix.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// LockMode
// ---------------------------------------------------------------------------

/// Hierarchy-aware lock mode.
///
/// The intention modes are taken on ancestors of a target collection to
/// signal that a stronger lock is held somewhere below, so siblings can
/// proceed without inspecting the whole subtree. `Read`/`Write` are the
/// actual shared/exclusive modes on the target itself. `NoLock` is the
/// absence of a hold; it is never acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    NoLock,
    IntentionRead,
    IntentionWrite,
    Read,
    Write,
}

impl LockMode {
    /// Every mode, for exhaustive table-driven tests.
    pub const ALL: [LockMode; 5] = [
        LockMode::NoLock,
        LockMode::IntentionRead,
        LockMode::IntentionWrite,
        LockMode::Read,
        LockMode::Write,
    ];

    /// The four modes that can actually be held.
    pub const HOLDABLE: [LockMode; 4] = [
        LockMode::IntentionRead,
        LockMode::IntentionWrite,
        LockMode::Read,
        LockMode::Write,
    ];

    /// Whether a holder of `self` permits a *different* owner to be granted
    /// `requested` on the same resource.
    ///
    /// This is the multi-granularity compatibility matrix: intention modes
    /// agree with each other and with the reads/writes they announce, reads
    /// share with reads, and `Write` excludes everything. An owner's own
    /// holds are not consulted here; reentrancy is the grant rule's job, not
    /// the matrix's. `NoLock` is vacuously compatible in both positions
    /// since it is never held and never requested.
    #[must_use]
    pub const fn compatible_with(self, requested: LockMode) -> bool {
        match (self, requested) {
            (LockMode::NoLock, _) | (_, LockMode::NoLock) => true,
            (LockMode::IntentionRead, LockMode::Write) => false,
            (LockMode::IntentionRead, _) => true,
            (LockMode::IntentionWrite, LockMode::IntentionRead | LockMode::IntentionWrite) => true,
            (LockMode::IntentionWrite, _) => false,
            (LockMode::Read, LockMode::IntentionRead | LockMode::Read) => true,
            (LockMode::Read, _) => false,
            (LockMode::Write, _) => false,
        }
    }

    /// Whether this is one of the two intention modes.
    #[must_use]
    pub const fn is_intention(self) -> bool {
        matches!(self, LockMode::IntentionRead | LockMode::IntentionWrite)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::NoLock => "NO_LOCK",
            LockMode::IntentionRead => "INTENTION_READ",
            LockMode::IntentionWrite => "INTENTION_WRITE",
            LockMode::Read => "READ_LOCK",
            LockMode::Write => "WRITE_LOCK",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// LockKind
// ---------------------------------------------------------------------------

/// Which namespace a lock key belongs to.
///
/// The namespaces are disjoint: the same string key names a different lock
/// in each. Collections are hierarchical; documents and index files are
/// flat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    Collection,
    Document,
    Index,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockKind::Collection => "collection",
            LockKind::Document => "document",
            LockKind::Index => "index",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
