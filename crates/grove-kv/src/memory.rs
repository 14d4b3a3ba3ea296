//! In-memory backend with optimistic transactions.
//!
//! [`MemoryKv`] keeps all entries in a `BTreeMap` behind a `RwLock` and
//! detects conflicts the way badger-style stores do: every transactional
//! read records the version of the key it observed (0 for absent keys), and
//! commit validates the whole read set against current versions under the
//! write lock. Prefix scans record the set of matching keys so that a key
//! appearing or disappearing inside a scanned range also conflicts.
//!
//! Conflicts are detected on reads; blind writes never conflict with each
//! other, matching the backend contract the store layer is written against.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use tracing::trace;

use crate::error::{KvError, KvResult};
use crate::key::Key;
use crate::traits::{Entries, Entry, Kv, Query, Txn};

/// An in-memory implementation of [`Kv`].
///
/// Intended for tests and embedding. Data is lost when the store is dropped.
#[derive(Default)]
pub struct MemoryKv {
    shared: RwLock<Shared>,
}

#[derive(Default)]
struct Shared {
    entries: BTreeMap<String, Vec<u8>>,
    /// Version of the last commit that touched each key. Deletions bump the
    /// version too: absence is observable.
    versions: HashMap<String, u64>,
    clock: u64,
}

impl Shared {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// Committed keys matching `prefix`, with the versions they were last
    /// written at.
    fn matches(&self, prefix: &str) -> Vec<(String, u64)> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| (k.clone(), self.version(k)))
            .collect()
    }
}

impl MemoryKv {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.shared.read().expect("lock poisoned").entries.len()
    }

    /// Returns `true` if no entries are committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKv")
            .field("entry_count", &self.len())
            .finish()
    }
}

impl Kv for MemoryKv {
    fn get(&self, key: &Key) -> KvResult<Option<Vec<u8>>> {
        let shared = self.shared.read().expect("lock poisoned");
        Ok(shared.entries.get(key.as_str()).cloned())
    }

    fn has(&self, key: &Key) -> KvResult<bool> {
        let shared = self.shared.read().expect("lock poisoned");
        Ok(shared.entries.contains_key(key.as_str()))
    }

    fn size(&self, key: &Key) -> KvResult<Option<usize>> {
        let shared = self.shared.read().expect("lock poisoned");
        Ok(shared.entries.get(key.as_str()).map(|v| v.len()))
    }

    fn query(&self, query: Query) -> KvResult<Entries<'_>> {
        let shared = self.shared.read().expect("lock poisoned");
        let entries: Vec<Entry> = shared
            .entries
            .range(query.prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&query.prefix))
            .map(|(k, v)| Entry {
                key: Key::raw(k.clone()),
                value: (!query.keys_only).then(|| v.clone()),
            })
            .collect();
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn transaction(&self, read_only: bool) -> KvResult<Box<dyn Txn + '_>> {
        Ok(Box::new(MemoryTxn {
            kv: self,
            read_only,
            state: TxnState::Open,
            reads: HashMap::new(),
            scans: Vec::new(),
            writes: BTreeMap::new(),
        }))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Open,
    Committed,
    Discarded,
}

/// A cached transactional read: the version observed and the value at that
/// version, so repeated reads inside one transaction are repeatable.
struct CachedRead {
    version: u64,
    value: Option<Vec<u8>>,
}

struct ScanRecord {
    prefix: String,
    seen: Vec<(String, u64)>,
}

/// A transaction over [`MemoryKv`].
pub struct MemoryTxn<'a> {
    kv: &'a MemoryKv,
    read_only: bool,
    state: TxnState,
    reads: HashMap<String, CachedRead>,
    scans: Vec<ScanRecord>,
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

impl MemoryTxn<'_> {
    fn ensure_open(&self) -> KvResult<()> {
        match self.state {
            TxnState::Open => Ok(()),
            _ => Err(KvError::TxnClosed),
        }
    }

    /// Read through overlay, then read cache, then committed state.
    fn read(&mut self, key: &str) -> Option<Vec<u8>> {
        if let Some(staged) = self.writes.get(key) {
            return staged.clone();
        }
        if let Some(cached) = self.reads.get(key) {
            return cached.value.clone();
        }
        let shared = self.kv.shared.read().expect("lock poisoned");
        let value = shared.entries.get(key).cloned();
        self.reads.insert(
            key.to_string(),
            CachedRead {
                version: shared.version(key),
                value: value.clone(),
            },
        );
        value
    }
}

impl Txn for MemoryTxn<'_> {
    fn get(&mut self, key: &Key) -> KvResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.read(key.as_str()))
    }

    fn has(&mut self, key: &Key) -> KvResult<bool> {
        self.ensure_open()?;
        Ok(self.read(key.as_str()).is_some())
    }

    fn put(&mut self, key: &Key, value: Vec<u8>) -> KvResult<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(KvError::ReadOnly);
        }
        self.writes.insert(key.as_str().to_string(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &Key) -> KvResult<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(KvError::ReadOnly);
        }
        self.writes.insert(key.as_str().to_string(), None);
        Ok(())
    }

    fn query(&mut self, query: Query) -> KvResult<Vec<Entry>> {
        self.ensure_open()?;
        let mut merged: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        {
            let shared = self.kv.shared.read().expect("lock poisoned");
            let seen = shared.matches(&query.prefix);
            for (k, _) in &seen {
                if let Some(v) = shared.entries.get(k) {
                    merged.insert(k.clone(), v.clone());
                }
            }
            self.scans.push(ScanRecord {
                prefix: query.prefix.clone(),
                seen,
            });
        }
        for (k, staged) in self.writes.range(query.prefix.clone()..) {
            if !k.starts_with(&query.prefix) {
                break;
            }
            match staged {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        Ok(merged
            .into_iter()
            .map(|(k, v)| Entry {
                key: Key::raw(k),
                value: (!query.keys_only).then_some(v),
            })
            .collect())
    }

    fn commit(&mut self) -> KvResult<()> {
        self.ensure_open()?;
        let mut shared = self.kv.shared.write().expect("lock poisoned");
        for (key, read) in &self.reads {
            if shared.version(key) != read.version {
                trace!(key = %key, "commit conflict on read");
                self.state = TxnState::Discarded;
                return Err(KvError::Conflict);
            }
        }
        for scan in &self.scans {
            if shared.matches(&scan.prefix) != scan.seen {
                trace!(prefix = %scan.prefix, "commit conflict on scan");
                self.state = TxnState::Discarded;
                return Err(KvError::Conflict);
            }
        }
        shared.clock += 1;
        let stamp = shared.clock;
        for (key, staged) in std::mem::take(&mut self.writes) {
            match staged {
                Some(v) => {
                    shared.entries.insert(key.clone(), v);
                }
                None => {
                    shared.entries.remove(&key);
                }
            }
            shared.versions.insert(key, stamp);
        }
        self.state = TxnState::Committed;
        Ok(())
    }

    fn discard(&mut self) {
        if self.state == TxnState::Open {
            self.state = TxnState::Discarded;
            self.reads.clear();
            self.scans.clear();
            self.writes.clear();
        }
    }
}

impl Drop for MemoryTxn<'_> {
    fn drop(&mut self) {
        self.discard();
    }
}
