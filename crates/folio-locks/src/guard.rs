//! RAII guards for held locks.
//!
//! A guard owns every hold its operation booked and gives all of them back
//! exactly once, leaf first, when it is dropped or closed. Guards carry
//! their owner token and group id, so they may be moved to and dropped on
//! any thread and the release is still attributed to the context that
//! acquired.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::error;

use folio_types::{LockKind, LockMode, OwnerId, ResourcePath};

use crate::multi_lock::MultiLock;
use crate::table::LockTable;

type Holds = SmallVec<[HeldLock; 8]>;

pub(crate) struct HeldLock {
    lock: Arc<MultiLock>,
    mode: LockMode,
}

/// Release bookkeeping shared by the guard types: who acquired, under which
/// group, in which namespace, and where to report.
pub(crate) struct ReleaseCtx {
    owner: OwnerId,
    group_id: u64,
    lock_kind: LockKind,
    table: Arc<LockTable>,
}

impl ReleaseCtx {
    pub(crate) fn new(
        owner: OwnerId,
        group_id: u64,
        lock_kind: LockKind,
        table: Arc<LockTable>,
    ) -> Self {
        Self {
            owner,
            group_id,
            lock_kind,
            table,
        }
    }

    /// Give back every hold in reverse acquisition order.
    fn release_all(&self, holds: &mut Holds) {
        while let Some(held) = holds.pop() {
            match held.lock.release(self.owner, held.mode) {
                Ok(()) => self.table.released(
                    self.group_id,
                    held.lock.key(),
                    self.lock_kind,
                    held.mode,
                    self.owner,
                ),
                // Unreachable for guards built from successful acquires.
                Err(err) => error!(%err, "lock release failed"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ManagedCollectionLock
// ---------------------------------------------------------------------------

/// Holds on a collection chain: one mode per ancestor plus the target.
///
/// Dropping releases the chain bottom-up, so the target is freed before any
/// ancestor intention mode.
#[must_use = "holds are released when the guard is dropped"]
pub struct ManagedCollectionLock {
    path: ResourcePath,
    holds: Holds,
    ctx: ReleaseCtx,
}

impl ManagedCollectionLock {
    pub(crate) fn begin(path: ResourcePath, ctx: ReleaseCtx) -> Self {
        Self {
            path,
            holds: SmallVec::new(),
            ctx,
        }
    }

    pub(crate) fn push(&mut self, lock: Arc<MultiLock>, mode: LockMode) {
        self.holds.push(HeldLock { lock, mode });
    }

    /// The collection this guard was acquired for.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    #[inline]
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.ctx.owner
    }

    #[inline]
    #[must_use]
    pub fn group_id(&self) -> u64 {
        self.ctx.group_id
    }

    /// Number of nodes held, the target included.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.holds.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holds.is_empty()
    }

    /// Release now instead of at end of scope.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for ManagedCollectionLock {
    fn drop(&mut self) {
        self.ctx.release_all(&mut self.holds);
    }
}

impl fmt::Debug for ManagedCollectionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedCollectionLock")
            .field("path", &self.path)
            .field("owner", &self.ctx.owner)
            .field("group_id", &self.ctx.group_id)
            .field("nodes", &self.holds.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ManagedDocumentLock
// ---------------------------------------------------------------------------

/// A single hold on one document.
#[must_use = "the hold is released when the guard is dropped"]
pub struct ManagedDocumentLock {
    uri: ResourcePath,
    mode: LockMode,
    holds: Holds,
    ctx: ReleaseCtx,
}

impl ManagedDocumentLock {
    pub(crate) fn new(
        uri: ResourcePath,
        mode: LockMode,
        lock: Arc<MultiLock>,
        ctx: ReleaseCtx,
    ) -> Self {
        let mut holds = SmallVec::new();
        holds.push(HeldLock { lock, mode });
        Self {
            uri,
            mode,
            holds,
            ctx,
        }
    }

    #[inline]
    #[must_use]
    pub fn uri(&self) -> &ResourcePath {
        &self.uri
    }

    #[inline]
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    #[inline]
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.ctx.owner
    }

    #[inline]
    #[must_use]
    pub fn group_id(&self) -> u64 {
        self.ctx.group_id
    }

    /// Release now instead of at end of scope.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for ManagedDocumentLock {
    fn drop(&mut self) {
        self.ctx.release_all(&mut self.holds);
    }
}

impl fmt::Debug for ManagedDocumentLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedDocumentLock")
            .field("uri", &self.uri)
            .field("mode", &self.mode)
            .field("owner", &self.ctx.owner)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ManagedIndexLock
// ---------------------------------------------------------------------------

/// A single hold on one index file.
#[must_use = "the hold is released when the guard is dropped"]
pub struct ManagedIndexLock {
    name: String,
    mode: LockMode,
    holds: Holds,
    ctx: ReleaseCtx,
}

impl ManagedIndexLock {
    pub(crate) fn new(
        name: String,
        mode: LockMode,
        lock: Arc<MultiLock>,
        ctx: ReleaseCtx,
    ) -> Self {
        let mut holds = SmallVec::new();
        holds.push(HeldLock { lock, mode });
        Self {
            name,
            mode,
            holds,
            ctx,
        }
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    #[inline]
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.ctx.owner
    }

    /// Release now instead of at end of scope.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for ManagedIndexLock {
    fn drop(&mut self) {
        self.ctx.release_all(&mut self.holds);
    }
}

impl fmt::Debug for ManagedIndexLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedIndexLock")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("owner", &self.ctx.owner)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
