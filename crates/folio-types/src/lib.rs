//! Shared vocabulary for the folio storage subsystems.
//!
//! This crate is intentionally small: it defines the lock modes and
//! namespaces, owner tokens, and normalized resource paths that the locking
//! layer and its callers exchange. Runtime machinery lives in `folio-locks`;
//! this crate builds no state of its own.

pub mod mode;
pub mod owner;
pub mod path;

pub use mode::{LockKind, LockMode};
pub use owner::OwnerId;
pub use path::{PathError, ResourcePath};
