//! Striped key-to-lock registry.
//!
//! Lookups are read-mostly, so each namespace shards its map across
//! `concurrency_level` stripes (rounded up to a power of two) and guards
//! each stripe with a [`RwLock`]. Locks are created on first reference and
//! live for the registry's lifetime; a dormant entry costs one map slot.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::multi_lock::MultiLock;

type Stripe = RwLock<HashMap<Arc<str>, Arc<MultiLock>>>;

pub(crate) struct LockStripes {
    stripes: Box<[Stripe]>,
    mask: usize,
    hasher: RandomState,
}

impl LockStripes {
    pub(crate) fn new(concurrency_level: usize) -> Self {
        let count = concurrency_level.max(1).next_power_of_two();
        let stripes = (0..count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            stripes,
            mask: count - 1,
            hasher: RandomState::new(),
        }
    }

    fn stripe(&self, key: &str) -> &Stripe {
        let index = self.hasher.hash_one(key) as usize & self.mask;
        &self.stripes[index]
    }

    /// The lock for `key`, created on first reference.
    pub(crate) fn get_or_create(&self, key: &str) -> Arc<MultiLock> {
        let stripe = self.stripe(key);
        if let Some(lock) = stripe.read().get(key) {
            return Arc::clone(lock);
        }
        let mut map = stripe.write();
        // Double-check: another context may have created it between the
        // read probe and the write lock.
        if let Some(lock) = map.get(key) {
            return Arc::clone(lock);
        }
        let key: Arc<str> = Arc::from(key);
        let lock = Arc::new(MultiLock::new(Arc::clone(&key)));
        map.insert(key, Arc::clone(&lock));
        lock
    }

    /// The lock for `key` if one has ever been referenced, without
    /// creating it. Predicates use this so that asking about a path does
    /// not populate the registry.
    pub(crate) fn peek(&self, key: &str) -> Option<Arc<MultiLock>> {
        self.stripe(key).read().get(key).map(Arc::clone)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.read().len()).sum()
    }
}

impl fmt::Debug for LockStripes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockStripes")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}
