//! The [`Kv`] and [`Txn`] traits defining the backend seam.
//!
//! Any ordered key-value store with optimistic transactions (badger-like,
//! in-memory, embedded) implements these traits to back a grove store.

use crate::error::KvResult;
use crate::key::Key;

/// A prefix range query over the keyspace.
#[derive(Clone, Debug, Default)]
pub struct Query {
    /// Only keys starting with this prefix are returned. Empty matches all.
    pub prefix: String,
    /// When set, entries carry no values (cheaper for key scans).
    pub keys_only: bool,
}

impl Query {
    /// A keys-only query for the given prefix.
    pub fn keys_with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            keys_only: true,
        }
    }
}

/// One result of a [`Query`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    /// `None` for keys-only queries.
    pub value: Option<Vec<u8>>,
}

/// Lazy query results, ordered lexicographically by key.
pub type Entries<'a> = Box<dyn Iterator<Item = KvResult<Entry>> + 'a>;

/// An ordered key-value store that can open optimistic transactions.
///
/// Implementations must satisfy these invariants:
/// - Direct reads (`get`, `has`, `size`, `query`) observe only committed
///   state.
/// - Keys order lexicographically by their string form; `query` returns
///   entries in that order.
/// - Committed transactions are serializable: `commit` fails with
///   [`KvError::Conflict`] if anything the transaction read has since been
///   modified.
///
/// [`KvError::Conflict`]: crate::error::KvError::Conflict
pub trait Kv: Send + Sync {
    /// Read a value. Returns `Ok(None)` if the key is absent.
    fn get(&self, key: &Key) -> KvResult<Option<Vec<u8>>>;

    /// Check whether a key exists.
    fn has(&self, key: &Key) -> KvResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Size in bytes of the value under `key`, or `None` if absent.
    fn size(&self, key: &Key) -> KvResult<Option<usize>> {
        Ok(self.get(key)?.map(|v| v.len()))
    }

    /// Run a prefix query against committed state.
    fn query(&self, query: Query) -> KvResult<Entries<'_>>;

    /// Open a new transaction.
    fn transaction(&self, read_only: bool) -> KvResult<Box<dyn Txn + '_>>;
}

impl<T: Kv + ?Sized> Kv for std::sync::Arc<T> {
    fn get(&self, key: &Key) -> KvResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn has(&self, key: &Key) -> KvResult<bool> {
        (**self).has(key)
    }

    fn size(&self, key: &Key) -> KvResult<Option<usize>> {
        (**self).size(key)
    }

    fn query(&self, query: Query) -> KvResult<Entries<'_>> {
        (**self).query(query)
    }

    fn transaction(&self, read_only: bool) -> KvResult<Box<dyn Txn + '_>> {
        (**self).transaction(read_only)
    }
}

/// An open transaction: a consistent snapshot plus a private write set.
///
/// Reads observe the transaction's own writes. Dropping an uncommitted
/// transaction discards it; `discard` may also be called explicitly and is
/// idempotent.
pub trait Txn {
    /// Read a value through the transaction. `Ok(None)` if absent.
    fn get(&mut self, key: &Key) -> KvResult<Option<Vec<u8>>>;

    /// Check whether a key exists through the transaction.
    fn has(&mut self, key: &Key) -> KvResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Stage a write.
    fn put(&mut self, key: &Key, value: Vec<u8>) -> KvResult<()>;

    /// Stage a deletion.
    fn delete(&mut self, key: &Key) -> KvResult<()>;

    /// Run a prefix query through the transaction (staged writes included).
    fn query(&mut self, query: Query) -> KvResult<Vec<Entry>>;

    /// Atomically apply all staged writes.
    ///
    /// Fails with [`KvError::Conflict`] when a concurrent commit invalidated
    /// this transaction's reads; the staged writes are not applied.
    ///
    /// [`KvError::Conflict`]: crate::error::KvError::Conflict
    fn commit(&mut self) -> KvResult<()>;

    /// Drop all staged writes and close the transaction.
    fn discard(&mut self);
}
