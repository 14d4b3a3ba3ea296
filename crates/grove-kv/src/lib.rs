//! Ordered key-value seam for the grove block store.
//!
//! This crate defines the backend boundary the store is written against:
//! an ordered keyspace of path-style [`Key`]s with optimistic transactions.
//! Any badger-like embedded store can sit behind the [`Kv`] / [`Txn`] trait
//! pair; [`MemoryKv`] is the bundled in-memory implementation used by tests
//! and short-lived processes.
//!
//! # Contract
//!
//! - Direct reads observe committed state only; transactional reads observe
//!   the transaction's own staged writes first.
//! - Keys order lexicographically, and [`Query`] is a prefix range scan in
//!   that order.
//! - Commits are serializable: a commit fails with [`KvError::Conflict`]
//!   when a concurrent commit invalidated anything the transaction read,
//!   and the caller retries with a fresh transaction.
//!
//! The [`Cancel`] token rides alongside: long-running callers thread one
//! through their operations to get cooperative cancellation between
//! transactions.

pub mod cancel;
pub mod error;
pub mod key;
pub mod memory;
pub mod traits;

pub use cancel::Cancel;
pub use error::{KvError, KvResult};
pub use key::Key;
pub use memory::MemoryKv;
pub use traits::{Entries, Entry, Kv, Query, Txn};
