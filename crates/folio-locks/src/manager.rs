//! The lock manager facade.
//!
//! One [`LockManager`] owns three disjoint lock namespaces (collections,
//! documents, index files) and the event table they report to. Collection
//! locks follow the hierarchical protocol: a root-to-leaf walk that couples
//! intention modes on ancestors to the real mode on the target, which
//! totally orders acquirers on any shared prefix and rules out circular
//! wait. Document and index locks are flat single-node acquisitions.
//!
//! Every acquisition is attributed to an explicit [`OwnerId`] and produces
//! a guard that releases in reverse order when dropped.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use folio_types::{LockKind, LockMode, OwnerId, ResourcePath};

use crate::config::LockConfig;
use crate::error::{LockError, Result};
use crate::guard::{ManagedCollectionLock, ManagedDocumentLock, ManagedIndexLock, ReleaseCtx};
use crate::multi_lock::{MultiLock, WaitPolicy};
use crate::registry::LockStripes;
use crate::table::LockTable;

// ---------------------------------------------------------------------------
// Chain mode selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum ChainIntent {
    Read,
    Write { lock_parent: bool },
}

impl ChainIntent {
    /// Mode for node `index` of a chain of `len` nodes (target last).
    ///
    /// Reads take `INTENTION_READ` on ancestors and `READ_LOCK` on the
    /// target. Writes take `WRITE_LOCK` on the target; ancestors get
    /// `WRITE_LOCK` in single-writer mode and `INTENTION_WRITE` in
    /// multi-writer mode, except that `lock_parent` upgrades the immediate
    /// parent to `WRITE_LOCK` when that parent is not the root.
    fn node_mode(self, index: usize, len: usize, multi_writer: bool) -> LockMode {
        let target = index + 1 == len;
        match self {
            ChainIntent::Read => {
                if target {
                    LockMode::Read
                } else {
                    LockMode::IntentionRead
                }
            }
            ChainIntent::Write { lock_parent } => {
                if target || (lock_parent && index + 2 == len && index > 0) || !multi_writer {
                    LockMode::Write
                } else {
                    LockMode::IntentionWrite
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

pub struct LockManager {
    config: LockConfig,
    collections: LockStripes,
    documents: LockStripes,
    indexes: LockStripes,
    table: Arc<LockTable>,
}

impl LockManager {
    /// Build a manager from a validated configuration.
    pub fn new(config: LockConfig) -> Result<Self> {
        config.validate()?;
        debug!(
            concurrency = config.concurrency_level,
            multi_writer = config.multi_writer_collections,
            events = config.event_tracing,
            "lock manager ready"
        );
        Ok(Self {
            collections: LockStripes::new(config.concurrency_level),
            documents: LockStripes::new(config.concurrency_level),
            indexes: LockStripes::new(config.concurrency_level),
            table: Arc::new(LockTable::new(
                config.event_tracing,
                config.capture_backtraces,
            )),
            config,
        })
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// The event table, for listener registration and snapshots.
    #[inline]
    #[must_use]
    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.table
    }

    // -- collection locks ----------------------------------------------------

    /// Lock `path` for reading, blocking until granted.
    ///
    /// Acquires `INTENTION_READ` root-to-leaf on every ancestor and
    /// `READ_LOCK` on the target, holding each node while taking the next.
    pub fn acquire_collection_read_lock(
        &self,
        owner: OwnerId,
        path: &ResourcePath,
    ) -> Result<ManagedCollectionLock> {
        self.acquire_collection_read_lock_with(owner, path, &WaitPolicy::forever())
    }

    /// Like [`Self::acquire_collection_read_lock`] with an explicit wait
    /// policy. On timeout or interruption every node already locked is
    /// released again, leaf first, and the error is returned.
    pub fn acquire_collection_read_lock_with(
        &self,
        owner: OwnerId,
        path: &ResourcePath,
        wait: &WaitPolicy,
    ) -> Result<ManagedCollectionLock> {
        self.collection_chain(owner, path, ChainIntent::Read, wait)
    }

    /// Lock `path` for writing, blocking until granted.
    ///
    /// `lock_parent` additionally takes `WRITE_LOCK` on the immediate
    /// parent, for operations that change the parent's entry list (create,
    /// delete, rename). The root has no parent above it, so for a
    /// root-level target the flag only affects non-root parents.
    pub fn acquire_collection_write_lock(
        &self,
        owner: OwnerId,
        path: &ResourcePath,
        lock_parent: bool,
    ) -> Result<ManagedCollectionLock> {
        self.acquire_collection_write_lock_with(owner, path, lock_parent, &WaitPolicy::forever())
    }

    /// Like [`Self::acquire_collection_write_lock`] with an explicit wait
    /// policy.
    pub fn acquire_collection_write_lock_with(
        &self,
        owner: OwnerId,
        path: &ResourcePath,
        lock_parent: bool,
        wait: &WaitPolicy,
    ) -> Result<ManagedCollectionLock> {
        self.collection_chain(owner, path, ChainIntent::Write { lock_parent }, wait)
    }

    // -- document locks ------------------------------------------------------

    /// Lock the document at `uri` for shared reading.
    ///
    /// Document locks do not touch the collection hierarchy; callers that
    /// need hierarchy consistency lock the containing collection first.
    pub fn acquire_document_read_lock(
        &self,
        owner: OwnerId,
        uri: &ResourcePath,
    ) -> Result<ManagedDocumentLock> {
        self.acquire_document_read_lock_with(owner, uri, &WaitPolicy::forever())
    }

    pub fn acquire_document_read_lock_with(
        &self,
        owner: OwnerId,
        uri: &ResourcePath,
        wait: &WaitPolicy,
    ) -> Result<ManagedDocumentLock> {
        self.document_lock_in_mode(owner, uri, LockMode::Read, wait)
    }

    /// Lock the document at `uri` exclusively.
    pub fn acquire_document_write_lock(
        &self,
        owner: OwnerId,
        uri: &ResourcePath,
    ) -> Result<ManagedDocumentLock> {
        self.acquire_document_write_lock_with(owner, uri, &WaitPolicy::forever())
    }

    pub fn acquire_document_write_lock_with(
        &self,
        owner: OwnerId,
        uri: &ResourcePath,
        wait: &WaitPolicy,
    ) -> Result<ManagedDocumentLock> {
        self.document_lock_in_mode(owner, uri, LockMode::Write, wait)
    }

    // -- index locks ---------------------------------------------------------

    /// Lock the index file `name` for shared reading.
    pub fn acquire_index_read_lock(
        &self,
        owner: OwnerId,
        name: &str,
    ) -> Result<ManagedIndexLock> {
        self.acquire_index_read_lock_with(owner, name, &WaitPolicy::forever())
    }

    pub fn acquire_index_read_lock_with(
        &self,
        owner: OwnerId,
        name: &str,
        wait: &WaitPolicy,
    ) -> Result<ManagedIndexLock> {
        self.index_lock_in_mode(owner, name, LockMode::Read, wait)
    }

    /// Lock the index file `name` exclusively.
    pub fn acquire_index_write_lock(
        &self,
        owner: OwnerId,
        name: &str,
    ) -> Result<ManagedIndexLock> {
        self.acquire_index_write_lock_with(owner, name, &WaitPolicy::forever())
    }

    pub fn acquire_index_write_lock_with(
        &self,
        owner: OwnerId,
        name: &str,
        wait: &WaitPolicy,
    ) -> Result<ManagedIndexLock> {
        self.index_lock_in_mode(owner, name, LockMode::Write, wait)
    }

    // -- direct primitive access ---------------------------------------------

    /// The underlying collection lock for `path`, created on first
    /// reference. For diagnostic callers, e.g. `has_waiters()`.
    #[must_use]
    pub fn collection_lock(&self, path: &ResourcePath) -> Arc<MultiLock> {
        self.collections.get_or_create(path.as_str())
    }

    /// The underlying document lock for `uri`.
    #[must_use]
    pub fn document_lock(&self, uri: &ResourcePath) -> Arc<MultiLock> {
        self.documents.get_or_create(uri.as_str())
    }

    /// The underlying index lock for `name`.
    #[must_use]
    pub fn index_lock(&self, name: &str) -> Arc<MultiLock> {
        self.indexes.get_or_create(name)
    }

    // -- lock-state predicates -----------------------------------------------

    /// Whether any owner holds `READ_LOCK` on the collection itself.
    /// Never creates a registry entry.
    #[must_use]
    pub fn is_collection_locked_for_read(&self, path: &ResourcePath) -> bool {
        self.holds(&self.collections, path.as_str(), LockMode::Read)
    }

    /// Whether any owner holds `WRITE_LOCK` on the collection itself.
    #[must_use]
    pub fn is_collection_locked_for_write(&self, path: &ResourcePath) -> bool {
        self.holds(&self.collections, path.as_str(), LockMode::Write)
    }

    #[must_use]
    pub fn is_document_locked_for_read(&self, uri: &ResourcePath) -> bool {
        self.holds(&self.documents, uri.as_str(), LockMode::Read)
    }

    #[must_use]
    pub fn is_document_locked_for_write(&self, uri: &ResourcePath) -> bool {
        self.holds(&self.documents, uri.as_str(), LockMode::Write)
    }

    #[must_use]
    pub fn is_index_locked_for_read(&self, name: &str) -> bool {
        self.holds(&self.indexes, name, LockMode::Read)
    }

    #[must_use]
    pub fn is_index_locked_for_write(&self, name: &str) -> bool {
        self.holds(&self.indexes, name, LockMode::Write)
    }

    // -- internals -----------------------------------------------------------

    fn holds(&self, stripes: &LockStripes, key: &str, mode: LockMode) -> bool {
        stripes.peek(key).is_some_and(|lock| lock.total_holds(mode) > 0)
    }

    fn collection_chain(
        &self,
        owner: OwnerId,
        path: &ResourcePath,
        intent: ChainIntent,
        wait: &WaitPolicy,
    ) -> Result<ManagedCollectionLock> {
        let group_id = self.table.next_group_id();
        let ctx = ReleaseCtx::new(owner, group_id, LockKind::Collection, Arc::clone(&self.table));
        let mut guard = ManagedCollectionLock::begin(path.clone(), ctx);
        let len = path.depth();
        for (index, key) in path.chain().enumerate() {
            let mode = intent.node_mode(index, len, self.config.multi_writer_collections);
            let lock = self.collections.get_or_create(key);
            // On failure the partially built guard drops and gives back
            // every node already taken, leaf first.
            self.lock_collection_node(&lock, mode, owner, group_id, wait)?;
            guard.push(lock, mode);
        }
        Ok(guard)
    }

    fn lock_collection_node(
        &self,
        lock: &Arc<MultiLock>,
        mode: LockMode,
        owner: OwnerId,
        group_id: u64,
        wait: &WaitPolicy,
    ) -> Result<()> {
        if mode == LockMode::Write {
            self.check_collection_write(lock, owner)?;
        }
        self.acquire_flat(lock, LockKind::Collection, mode, owner, group_id, wait)
    }

    /// Pre-checks for a collection `WRITE_LOCK` request, both off by
    /// default. The upgrade check refuses the request outright when the
    /// owner already holds a read-side mode on the node: two owners
    /// upgrading read to write on the same node block each other forever,
    /// and refusing wholesale is cheaper than detecting the pair.
    fn check_collection_write(&self, lock: &Arc<MultiLock>, owner: OwnerId) -> Result<()> {
        if self.config.upgrade_check
            && (lock.owner_holds(owner, LockMode::Read) > 0
                || lock.owner_holds(owner, LockMode::IntentionRead) > 0)
        {
            return Err(LockError::UpgradeWouldDeadlock {
                key: lock.key().to_owned(),
                owner,
            });
        }
        if self.config.warn_wait_on_read_for_write {
            let readers =
                lock.total_holds(LockMode::Read) - lock.owner_holds(owner, LockMode::Read);
            if readers > 0 {
                warn!(
                    key = lock.key(),
                    %owner,
                    readers,
                    "write request will wait for active readers"
                );
            }
        }
        Ok(())
    }

    fn document_lock_in_mode(
        &self,
        owner: OwnerId,
        uri: &ResourcePath,
        mode: LockMode,
        wait: &WaitPolicy,
    ) -> Result<ManagedDocumentLock> {
        let group_id = self.table.next_group_id();
        let lock = self.documents.get_or_create(uri.as_str());
        self.acquire_flat(&lock, LockKind::Document, mode, owner, group_id, wait)?;
        let ctx = ReleaseCtx::new(owner, group_id, LockKind::Document, Arc::clone(&self.table));
        Ok(ManagedDocumentLock::new(uri.clone(), mode, lock, ctx))
    }

    fn index_lock_in_mode(
        &self,
        owner: OwnerId,
        name: &str,
        mode: LockMode,
        wait: &WaitPolicy,
    ) -> Result<ManagedIndexLock> {
        let group_id = self.table.next_group_id();
        let lock = self.indexes.get_or_create(name);
        self.acquire_flat(&lock, LockKind::Index, mode, owner, group_id, wait)?;
        let ctx = ReleaseCtx::new(owner, group_id, LockKind::Index, Arc::clone(&self.table));
        Ok(ManagedIndexLock::new(name.to_owned(), mode, lock, ctx))
    }

    fn acquire_flat(
        &self,
        lock: &Arc<MultiLock>,
        lock_kind: LockKind,
        mode: LockMode,
        owner: OwnerId,
        group_id: u64,
        wait: &WaitPolicy,
    ) -> Result<()> {
        self.table
            .attempt(group_id, lock.key(), lock_kind, mode, owner);
        match lock.acquire(owner, mode, wait) {
            Ok(()) => {
                self.table
                    .acquired(group_id, lock.key(), lock_kind, mode, owner);
                Ok(())
            }
            Err(err) => {
                self.table
                    .attempt_failed(group_id, lock.key(), lock_kind, mode, owner);
                Err(err)
            }
        }
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.config)
            .field("table", &self.table)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
