//! Multi-granularity locking for a hierarchical document store.
//!
//! The [`LockManager`] keeps three disjoint lock namespaces: hierarchical
//! collection locks, flat document locks, and flat index-file locks. All
//! three are built on [`MultiLock`], a five-mode reentrant primitive
//! implementing the intention-lock compatibility matrix. Collection
//! acquisitions walk their path root-to-leaf and couple intention modes on
//! ancestors to the real mode on the target, which orders every acquirer
//! on shared prefixes and avoids deadlock by construction. Each
//! acquisition returns a guard that releases in reverse order on drop.
//!
//! An optional [`LockTable`] broadcasts every attempt, grant, and release
//! to registered listeners for tracing and deadlock forensics.
//!
//! ```ignore
//! use folio_locks::{LockConfig, LockManager, OwnerId};
//!
//! let manager = LockManager::new(LockConfig::default())?;
//! let owner = OwnerId::current();
//! let collection = "/db/app/data".parse()?;
//!
//! let guard = manager.acquire_collection_write_lock(owner, &collection, false)?;
//! // mutate the collection subtree
//! drop(guard);
//! ```

pub mod config;
pub mod error;
pub mod guard;
pub mod manager;
pub mod multi_lock;
pub mod table;

mod registry;

pub use config::LockConfig;
pub use error::{LockError, Result};
pub use guard::{ManagedCollectionLock, ManagedDocumentLock, ManagedIndexLock};
pub use manager::LockManager;
pub use multi_lock::{InterruptFlag, MultiLock, WaitPolicy};
pub use table::{
    HoldSnapshot, LockEvent, LockEventKind, LockEventListener, LockEventLogListener, LockTable,
};

pub use folio_types::{LockKind, LockMode, OwnerId, PathError, ResourcePath};
