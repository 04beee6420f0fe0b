//! Five-mode reentrant lock primitive.
//!
//! One [`MultiLock`] guards one named resource. Grants follow the
//! multi-granularity compatibility matrix with per-owner accounting: an
//! owner's own holds never block its further requests, which is what lets a
//! coupling walk reacquire an ancestor and a writer reacquire its own
//! `WRITE_LOCK`. Fresh owners queue FIFO; an owner that already holds any
//! mode bypasses the queue entirely, because a holder queued behind a
//! stranger that is itself blocked on the holder's locks would deadlock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use folio_types::{LockMode, OwnerId};

use crate::error::{LockError, Result};

/// Interval at which a blocked waiter re-checks its interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// InterruptFlag / WaitPolicy
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag for blocked acquisitions.
///
/// Clones share one flag. Raising it makes every waiter whose
/// [`WaitPolicy`] carries the flag fail with
/// [`LockError::AcquisitionInterrupted`] within a bounded interval, leaving
/// the lock state untouched.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// How long an acquisition may block.
#[derive(Debug, Clone, Default)]
pub struct WaitPolicy {
    deadline: Option<Instant>,
    interrupt: Option<InterruptFlag>,
}

impl WaitPolicy {
    /// Block until granted.
    #[must_use]
    pub fn forever() -> Self {
        Self::default()
    }

    /// Give up `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            interrupt: None,
        }
    }

    /// Give up at `deadline`.
    #[must_use]
    pub fn until(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            interrupt: None,
        }
    }

    /// Also fail when `flag` is raised.
    #[must_use]
    pub fn interruptible_by(mut self, flag: &InterruptFlag) -> Self {
        self.interrupt = Some(flag.clone());
        self
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(InterruptFlag::is_interrupted)
    }
}

// ---------------------------------------------------------------------------
// Hold accounting
// ---------------------------------------------------------------------------

const MODE_SLOTS: usize = 4;

const SLOT_MODES: [LockMode; MODE_SLOTS] = [
    LockMode::IntentionRead,
    LockMode::IntentionWrite,
    LockMode::Read,
    LockMode::Write,
];

fn slot(mode: LockMode) -> usize {
    match mode {
        LockMode::IntentionRead => 0,
        LockMode::IntentionWrite => 1,
        LockMode::Read => 2,
        LockMode::Write => 3,
        LockMode::NoLock => unreachable!("NO_LOCK is never held"),
    }
}

struct Waiter {
    ticket: u64,
    owner: OwnerId,
    mode: LockMode,
}

#[derive(Default)]
struct LockState {
    totals: [u32; MODE_SLOTS],
    holds: HashMap<OwnerId, [u32; MODE_SLOTS]>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl LockState {
    fn owner_count(&self, owner: OwnerId, mode: LockMode) -> u32 {
        self.holds.get(&owner).map_or(0, |h| h[slot(mode)])
    }

    fn holds_any(&self, owner: OwnerId) -> bool {
        self.holds.contains_key(&owner)
    }

    /// Whether granting `mode` to `owner` is compatible with every mode
    /// currently held by a *different* owner.
    fn compatible_with_others(&self, owner: OwnerId, mode: LockMode) -> bool {
        let own = self.holds.get(&owner);
        for (i, held) in SLOT_MODES.iter().enumerate() {
            let by_others = self.totals[i] - own.map_or(0, |h| h[i]);
            if by_others > 0 && !held.compatible_with(mode) {
                return false;
            }
        }
        true
    }

    fn book(&mut self, owner: OwnerId, mode: LockMode) {
        self.totals[slot(mode)] += 1;
        self.holds.entry(owner).or_default()[slot(mode)] += 1;
    }

    fn unbook(&mut self, owner: OwnerId, mode: LockMode) -> bool {
        let Some(held) = self.holds.get_mut(&owner) else {
            return false;
        };
        if held[slot(mode)] == 0 {
            return false;
        }
        held[slot(mode)] -= 1;
        self.totals[slot(mode)] -= 1;
        if held.iter().all(|count| *count == 0) {
            self.holds.remove(&owner);
        }
        true
    }

    fn enqueue(&mut self, owner: OwnerId, mode: LockMode) -> u64 {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.queue.push_back(Waiter {
            ticket,
            owner,
            mode,
        });
        ticket
    }

    fn remove_waiter(&mut self, ticket: u64) {
        self.queue.retain(|w| w.ticket != ticket);
    }

    fn front_ticket(&self) -> Option<u64> {
        self.queue.front().map(|w| w.ticket)
    }
}

// ---------------------------------------------------------------------------
// MultiLock
// ---------------------------------------------------------------------------

/// A five-mode reentrant lock for one named resource.
///
/// Created by the registry on first reference and shared as
/// `Arc<MultiLock>` for the registry's lifetime. The primitive itself never
/// signals deadlock; it only blocks, or fails when the caller's
/// [`WaitPolicy`] expires or is interrupted, in which case its state is
/// exactly as if the call had not been made.
pub struct MultiLock {
    key: Arc<str>,
    state: Mutex<LockState>,
    grants: Condvar,
}

impl MultiLock {
    #[must_use]
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(LockState::default()),
            grants: Condvar::new(),
        }
    }

    /// The resource key this lock guards.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Block until `mode` is granted to `owner`, subject to `wait`.
    ///
    /// Each successful call increments the owner's hold count for `mode` and
    /// must be balanced by one [`MultiLock::release`].
    ///
    /// # Panics
    ///
    /// `mode` must not be `NO_LOCK`.
    pub fn acquire(&self, owner: OwnerId, mode: LockMode, wait: &WaitPolicy) -> Result<()> {
        assert!(
            mode != LockMode::NoLock,
            "NO_LOCK cannot be acquired on '{}'",
            self.key
        );

        let mut st = self.state.lock();
        // Fast path. Holders bypass the queue; fresh owners may only barge
        // when nobody is queued ahead of them.
        if st.compatible_with_others(owner, mode) && (st.holds_any(owner) || st.queue.is_empty()) {
            st.book(owner, mode);
            return Ok(());
        }

        let started = Instant::now();
        let ticket = st.enqueue(owner, mode);
        loop {
            self.wait_step(&mut st, wait);

            if wait.interrupted() {
                st.remove_waiter(ticket);
                self.grants.notify_all();
                return Err(LockError::AcquisitionInterrupted {
                    key: self.key.to_string(),
                    mode,
                });
            }

            let grantable = st.compatible_with_others(owner, mode)
                && (st.holds_any(owner) || st.front_ticket() == Some(ticket));
            if grantable {
                st.remove_waiter(ticket);
                st.book(owner, mode);
                // The next waiter may be compatible too (a run of readers).
                self.grants.notify_all();
                return Ok(());
            }

            if wait.deadline.is_some_and(|d| Instant::now() >= d) {
                st.remove_waiter(ticket);
                self.grants.notify_all();
                return Err(LockError::AcquisitionTimeout {
                    key: self.key.to_string(),
                    mode,
                    waited: started.elapsed(),
                });
            }
        }
    }

    fn wait_step(&self, st: &mut MutexGuard<'_, LockState>, wait: &WaitPolicy) {
        let poll = wait
            .interrupt
            .is_some()
            .then(|| Instant::now() + INTERRUPT_POLL);
        let until = match (wait.deadline, poll) {
            (Some(deadline), Some(poll)) => Some(deadline.min(poll)),
            (Some(deadline), None) => Some(deadline),
            (None, poll) => poll,
        };
        match until {
            Some(instant) => {
                let _ = self.grants.wait_until(st, instant);
            }
            None => self.grants.wait(st),
        }
    }

    /// Release one hold of `mode` by `owner`.
    ///
    /// When the owner's count for a mode reaches zero the mode stops
    /// contributing to the held set and waiters are woken to re-evaluate.
    pub fn release(&self, owner: OwnerId, mode: LockMode) -> Result<()> {
        assert!(
            mode != LockMode::NoLock,
            "NO_LOCK cannot be released on '{}'",
            self.key
        );

        let mut st = self.state.lock();
        if !st.unbook(owner, mode) {
            return Err(LockError::InvalidRelease {
                key: self.key.to_string(),
                mode,
                owner,
            });
        }
        drop(st);
        self.grants.notify_all();
        Ok(())
    }

    /// Total holds of `mode` across all owners.
    #[must_use]
    pub fn total_holds(&self, mode: LockMode) -> u32 {
        self.state.lock().totals[slot(mode)]
    }

    /// `owner`'s hold count for `mode`.
    #[must_use]
    pub fn owner_holds(&self, owner: OwnerId, mode: LockMode) -> u32 {
        self.state.lock().owner_count(owner, mode)
    }

    /// Whether any context is currently blocked waiting, for contention
    /// checks without timer polling.
    #[must_use]
    pub fn has_waiters(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }
}

impl fmt::Debug for MultiLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("MultiLock")
            .field("key", &self.key)
            .field("totals", &st.totals)
            .field("owners", &st.holds.len())
            .field("waiters", &st.queue.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
