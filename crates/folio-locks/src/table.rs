//! Lock event table.
//!
//! Every attempt, grant, and release flows through one [`LockTable`] as a
//! [`LockEvent`], tagged with the group id of the operation that produced
//! it. Listeners receive events synchronously on the acting thread, so a
//! listener that returns has seen everything up to that point in that
//! thread's order. When tracing is disabled the table is inert and each
//! call costs a single branch.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{error, trace};

use folio_types::{LockKind, LockMode, OwnerId};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What happened to a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LockEventKind {
    /// An owner started waiting for a mode.
    Attempt,
    /// The wait ended without a grant (timeout, interrupt, refused upgrade).
    AttemptFailed,
    /// The mode was granted.
    Acquired,
    /// One hold was given back.
    Released,
}

impl fmt::Display for LockEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockEventKind::Attempt => "attempt",
            LockEventKind::AttemptFailed => "attempt failed",
            LockEventKind::Acquired => "acquired",
            LockEventKind::Released => "released",
        };
        f.write_str(name)
    }
}

/// One entry in the event stream.
///
/// `hold_count` is the owner's count for this key and mode in the table's
/// registry *after* the event: the attempting count for `Attempt` and
/// `AttemptFailed`, the acquired count for `Acquired` and `Released`. A
/// reentrant grant therefore shows `2`, and the final release shows `0`.
/// `timestamp_ns` counts from table creation.
#[derive(Debug, Clone, Serialize)]
pub struct LockEvent {
    pub group_id: u64,
    pub kind: LockEventKind,
    pub key: String,
    pub lock_kind: LockKind,
    pub mode: LockMode,
    pub owner: OwnerId,
    pub hold_count: u32,
    pub timestamp_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

/// Receives every event recorded while registered.
///
/// Listeners run on the thread that produced the event and must not block
/// for long or re-enter the lock manager.
pub trait LockEventListener: Send + Sync {
    fn on_event(&self, event: &LockEvent);
}

/// Listener that forwards events to the `tracing` subscriber at trace
/// level.
#[derive(Debug, Default)]
pub struct LockEventLogListener;

impl LockEventListener for LockEventLogListener {
    fn on_event(&self, event: &LockEvent) {
        trace!(
            group = event.group_id,
            kind = %event.kind,
            key = %event.key,
            lock_kind = %event.lock_kind,
            mode = %event.mode,
            owner = %event.owner,
            holds = event.hold_count,
            "lock event"
        );
    }
}

/// One row of a point-in-time view of the table's registry.
#[derive(Debug, Clone, Serialize)]
pub struct HoldSnapshot {
    pub key: String,
    pub lock_kind: LockKind,
    pub mode: LockMode,
    pub owner: OwnerId,
    pub count: u32,
}

// ---------------------------------------------------------------------------
// LockTable
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq, Hash)]
struct HoldKey {
    owner: OwnerId,
    key: Arc<str>,
    lock_kind: LockKind,
    mode: LockMode,
}

type HoldMap = Mutex<HashMap<HoldKey, u32>>;

/// Registry of who is attempting and who is holding what, plus the event
/// fan-out to listeners.
pub struct LockTable {
    enabled: bool,
    capture_backtraces: bool,
    created: Instant,
    groups: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn LockEventListener>>>,
    attempting: HoldMap,
    acquired: HoldMap,
}

impl LockTable {
    #[must_use]
    pub fn new(enabled: bool, capture_backtraces: bool) -> Self {
        Self {
            enabled,
            capture_backtraces,
            created: Instant::now(),
            groups: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            attempting: Mutex::new(HashMap::new()),
            acquired: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// A fresh group id. Ids are unique and monotonic per table, so the
    /// events of one multi-node operation can be correlated.
    #[must_use]
    pub fn next_group_id(&self) -> u64 {
        self.groups.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Attach a listener.
    ///
    /// Registration takes the listener list's write lock, so it completes
    /// only once no delivery is in flight; the listener then observes every
    /// subsequent event.
    pub fn register(&self, listener: Arc<dyn LockEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Detach a listener registered earlier.
    ///
    /// When this returns, no event delivery to the listener is in flight
    /// and none will start. Identity is the listener allocation, so any
    /// clone of the registered `Arc` works.
    pub fn deregister(&self, listener: &Arc<dyn LockEventListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.listeners
            .write()
            .retain(|l| Arc::as_ptr(l) as *const () != target);
    }

    // -- recording -----------------------------------------------------------

    pub fn attempt(
        &self,
        group_id: u64,
        key: &str,
        lock_kind: LockKind,
        mode: LockMode,
        owner: OwnerId,
    ) {
        if !self.enabled {
            return;
        }
        let count = bump(&self.attempting, self.hold_key(key, lock_kind, mode, owner));
        self.record(LockEventKind::Attempt, group_id, key, lock_kind, mode, owner, count);
    }

    pub fn attempt_failed(
        &self,
        group_id: u64,
        key: &str,
        lock_kind: LockKind,
        mode: LockMode,
        owner: OwnerId,
    ) {
        if !self.enabled {
            return;
        }
        let hold_key = self.hold_key(key, lock_kind, mode, owner);
        let count = drop_one(&self.attempting, &hold_key).unwrap_or_else(|| {
            error!(key, %mode, %owner, "attempt-failed without a matching attempt");
            0
        });
        self.record(
            LockEventKind::AttemptFailed,
            group_id,
            key,
            lock_kind,
            mode,
            owner,
            count,
        );
    }

    pub fn acquired(
        &self,
        group_id: u64,
        key: &str,
        lock_kind: LockKind,
        mode: LockMode,
        owner: OwnerId,
    ) {
        if !self.enabled {
            return;
        }
        let hold_key = self.hold_key(key, lock_kind, mode, owner);
        if drop_one(&self.attempting, &hold_key).is_none() {
            error!(key, %mode, %owner, "acquired without a matching attempt");
        }
        let count = bump(&self.acquired, hold_key);
        self.record(LockEventKind::Acquired, group_id, key, lock_kind, mode, owner, count);
    }

    pub fn released(
        &self,
        group_id: u64,
        key: &str,
        lock_kind: LockKind,
        mode: LockMode,
        owner: OwnerId,
    ) {
        if !self.enabled {
            return;
        }
        let hold_key = self.hold_key(key, lock_kind, mode, owner);
        let count = drop_one(&self.acquired, &hold_key).unwrap_or_else(|| {
            error!(key, %mode, %owner, "released a lock that was not acquired");
            0
        });
        self.record(LockEventKind::Released, group_id, key, lock_kind, mode, owner, count);
    }

    // -- snapshots -----------------------------------------------------------

    /// Owners currently waiting, as of the call.
    #[must_use]
    pub fn attempting_snapshot(&self) -> Vec<HoldSnapshot> {
        snapshot(&self.attempting)
    }

    /// Owners currently holding, as of the call.
    #[must_use]
    pub fn acquired_snapshot(&self) -> Vec<HoldSnapshot> {
        snapshot(&self.acquired)
    }

    // -- internals -----------------------------------------------------------

    fn hold_key(&self, key: &str, lock_kind: LockKind, mode: LockMode, owner: OwnerId) -> HoldKey {
        HoldKey {
            owner,
            key: Arc::from(key),
            lock_kind,
            mode,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        kind: LockEventKind,
        group_id: u64,
        key: &str,
        lock_kind: LockKind,
        mode: LockMode,
        owner: OwnerId,
        hold_count: u32,
    ) {
        let event = LockEvent {
            group_id,
            kind,
            key: key.to_owned(),
            lock_kind,
            mode,
            owner,
            hold_count,
            timestamp_ns: self.created.elapsed().as_nanos() as u64,
            backtrace: self
                .capture_backtraces
                .then(|| Backtrace::force_capture().to_string()),
        };
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            // A panicking listener must not poison the acquire path.
            if panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                error!(key = %event.key, "lock event listener panicked");
            }
        }
    }
}

impl fmt::Debug for LockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable")
            .field("enabled", &self.enabled)
            .field("attempting", &self.attempting.lock().len())
            .field("acquired", &self.acquired.lock().len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

fn bump(map: &HoldMap, key: HoldKey) -> u32 {
    let mut map = map.lock();
    let count = map.entry(key).or_insert(0);
    *count += 1;
    *count
}

fn drop_one(map: &HoldMap, key: &HoldKey) -> Option<u32> {
    let mut map = map.lock();
    let count = map.get_mut(key)?;
    *count -= 1;
    let remaining = *count;
    if remaining == 0 {
        map.remove(key);
    }
    Some(remaining)
}

fn snapshot(map: &HoldMap) -> Vec<HoldSnapshot> {
    let map = map.lock();
    let mut rows: Vec<_> = map
        .iter()
        .map(|(k, &count)| HoldSnapshot {
            key: k.key.to_string(),
            lock_kind: k.lock_kind,
            mode: k.mode,
            owner: k.owner,
            count,
        })
        .collect();
    rows.sort_by(|a, b| (a.key.as_str(), a.owner).cmp(&(b.key.as_str(), b.owner)));
    rows
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
