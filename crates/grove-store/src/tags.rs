//! Named idempotent holders over the counted store.
//!
//! A tag is one counter unit with a name. Putting the same tag twice is a
//! no-op, removing it removes exactly the unit it added, so tag operations
//! are safe to replay over an undependable connection. Each tag is recorded
//! twice: under the CID (for per-block enumeration) and under the tag in a
//! reverse index (for per-tag enumeration and [`replace_tag`]).
//!
//! [`replace_tag`]: TagCounted::replace_tag

use std::collections::HashSet;

use cid::Cid;
use tracing::debug;

use grove_kv::{Cancel, Key, Kv, Query, Txn};

use crate::counted::{tx_decrement, tx_increment, CidKeys, Counted};
use crate::error::{StoreError, StoreResult};
use crate::keys::{tag_index_key, tag_index_key_to_cid, tag_index_prefix, tag_key, tag_prefix};
use crate::links::Options;
use crate::traits::{BlockSource, CounterStore, ReadStore, TagStore};
use crate::txn::run_txn;

/// A tag-counted block store: counters plus named idempotent holders,
/// sharing one keyspace. Backed by a [`Counted`] store by composition.
pub struct TagCounted<D> {
    pub(crate) counted: Counted<D>,
}

/// Tags name real holders; the empty path names nothing.
fn validate_tag(tag: &Key) -> StoreResult<()> {
    if tag.is_root() {
        return Err(StoreError::InvalidTag {
            reason: "tag must be a non-empty path".into(),
        });
    }
    Ok(())
}

/// Record `(id, tag)` unless it already exists. Returns `true` when a new
/// tag was added and its counter unit is still owed.
pub(crate) fn tx_put_tag(tx: &mut dyn Txn, id: &Cid, tag: &Key) -> StoreResult<bool> {
    let forward = tag_key(id, tag);
    if tx.has(&forward)? {
        return Ok(false);
    }
    tx.put(&forward, Vec::new())?;
    tx.put(&tag_index_key(tag, id), Vec::new())?;
    Ok(true)
}

/// Remove `(id, tag)` if present. Returns `true` when the tag existed and
/// its counter unit must be released.
pub(crate) fn tx_remove_tag(tx: &mut dyn Txn, id: &Cid, tag: &Key) -> StoreResult<bool> {
    let forward = tag_key(id, tag);
    if !tx.has(&forward)? {
        return Ok(false);
    }
    tx.delete(&forward)?;
    tx.delete(&tag_index_key(tag, id))?;
    Ok(true)
}

impl<D: Kv> TagCounted<D> {
    /// Create a tag-counted store over `kv`.
    pub fn new(kv: D, opts: Options) -> Self {
        Self {
            counted: Counted::new(kv, opts),
        }
    }

    /// Hold the DAG rooted at `id` under `tag`.
    ///
    /// Idempotent: if the tag is already present nothing changes.
    /// Otherwise the tag is recorded and the DAG is counted once, exactly
    /// as [`Counted::increment`] would.
    pub fn put_tag(
        &self,
        cancel: &Cancel,
        id: &Cid,
        tag: &Key,
        source: &dyn BlockSource,
    ) -> StoreResult<()> {
        validate_tag(tag)?;
        run_txn(&self.counted.kv, cancel, |tx| {
            if !tx_put_tag(tx, id, tag)? {
                return Ok(());
            }
            tx_increment(tx, cancel, id, source, &self.counted.opts.link_decoder)?;
            Ok(())
        })?;
        debug!(cid = %id, tag = %tag, "tag put");
        Ok(())
    }

    /// Whether `id` currently carries `tag`.
    pub fn has_tag(&self, cancel: &Cancel, id: &Cid, tag: &Key) -> StoreResult<bool> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        Ok(self.counted.kv.has(&tag_key(id, tag))?)
    }

    /// All tags on `id`, in backend (lexicographic) order.
    pub fn get_tags(&self, cancel: &Cancel, id: &Cid) -> StoreResult<Vec<Key>> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let prefix = tag_prefix(id);
        let entries = self
            .counted
            .kv
            .query(Query::keys_with_prefix(prefix.as_str()))?;
        let mut tags = Vec::new();
        for entry in entries {
            let entry = entry?;
            tags.push(Key::raw(&entry.key.as_str()[prefix.as_str().len()..]));
        }
        Ok(tags)
    }

    /// Release the hold of `tag` on `id`.
    ///
    /// Idempotent: removing an absent tag is a no-op. Otherwise the tag is
    /// deleted and the DAG decremented once.
    pub fn remove_tag(&self, cancel: &Cancel, id: &Cid, tag: &Key) -> StoreResult<()> {
        validate_tag(tag)?;
        run_txn(&self.counted.kv, cancel, |tx| {
            if !tx_remove_tag(tx, id, tag)? {
                return Ok(());
            }
            tx_decrement(tx, cancel, id, &self.counted.opts.link_decoder)?;
            Ok(())
        })?;
        debug!(cid = %id, tag = %tag, "tag removed");
        Ok(())
    }

    /// Atomically make `update` the exact membership of `tag`.
    ///
    /// In one transaction: the reverse index yields the current members;
    /// members missing from `update` are untagged, new ones tagged, common
    /// ones untouched. This keeps tag membership authoritative relative to
    /// a caller-supplied list.
    pub fn replace_tag(
        &self,
        cancel: &Cancel,
        update: &[Cid],
        tag: &Key,
        source: &dyn BlockSource,
    ) -> StoreResult<()> {
        validate_tag(tag)?;
        run_txn(&self.counted.kv, cancel, |tx| {
            let prefix = tag_index_prefix(tag);
            let entries = tx.query(Query::keys_with_prefix(prefix.as_str()))?;
            let mut before = HashSet::with_capacity(entries.len());
            for entry in &entries {
                before.insert(tag_index_key_to_cid(
                    prefix.as_str(),
                    entry.key.as_str(),
                )?);
            }
            for id in update {
                if cancel.is_cancelled() {
                    return Err(StoreError::Cancelled);
                }
                if before.remove(id) {
                    continue;
                }
                if tx_put_tag(tx, id, tag)? {
                    tx_increment(tx, cancel, id, source, &self.counted.opts.link_decoder)?;
                }
            }
            for id in &before {
                if tx_remove_tag(tx, id, tag)? {
                    tx_decrement(tx, cancel, id, &self.counted.opts.link_decoder)?;
                }
            }
            Ok(())
        })?;
        debug!(tag = %tag, members = update.len(), "tag replaced");
        Ok(())
    }

    // Counter surface, shared with the inner store.

    /// See [`Counted::increment`].
    pub fn increment(
        &self,
        cancel: &Cancel,
        id: &Cid,
        source: &dyn BlockSource,
    ) -> StoreResult<i64> {
        self.counted.increment(cancel, id, source)
    }

    /// See [`Counted::decrement`].
    pub fn decrement(&self, cancel: &Cancel, id: &Cid) -> StoreResult<i64> {
        self.counted.decrement(cancel, id)
    }

    /// See [`Counted::get_count`].
    pub fn get_count(&self, cancel: &Cancel, id: &Cid) -> StoreResult<i64> {
        self.counted.get_count(cancel, id)
    }

    /// See [`Counted::get_block`].
    pub fn get_block(&self, cancel: &Cancel, id: &Cid) -> StoreResult<Vec<u8>> {
        self.counted.get_block(cancel, id)
    }

    /// See [`Counted::get_block_size`].
    pub fn get_block_size(&self, cancel: &Cancel, id: &Cid) -> StoreResult<usize> {
        self.counted.get_block_size(cancel, id)
    }

    /// See [`Counted::keys`].
    pub fn keys(&self, prefix: &str) -> StoreResult<CidKeys<'_>> {
        self.counted.keys(prefix)
    }
}

impl<D> std::fmt::Debug for TagCounted<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagCounted").finish_non_exhaustive()
    }
}

impl<D: Kv> BlockSource for TagCounted<D> {
    fn get_block(&self, cancel: &Cancel, id: &Cid) -> StoreResult<Vec<u8>> {
        self.counted.get_block(cancel, id)
    }
}

impl<D: Kv> ReadStore for TagCounted<D> {
    fn get_block_size(&self, cancel: &Cancel, id: &Cid) -> StoreResult<usize> {
        self.counted.get_block_size(cancel, id)
    }

    fn cid_keys<'a>(
        &'a self,
        prefix: &str,
    ) -> StoreResult<Box<dyn Iterator<Item = StoreResult<Cid>> + 'a>> {
        Ok(Box::new(self.keys(prefix)?))
    }
}

impl<D: Kv> CounterStore for TagCounted<D> {
    fn increment(
        &self,
        cancel: &Cancel,
        id: &Cid,
        source: &dyn BlockSource,
    ) -> StoreResult<i64> {
        TagCounted::increment(self, cancel, id, source)
    }

    fn decrement(&self, cancel: &Cancel, id: &Cid) -> StoreResult<i64> {
        TagCounted::decrement(self, cancel, id)
    }

    fn get_count(&self, cancel: &Cancel, id: &Cid) -> StoreResult<i64> {
        TagCounted::get_count(self, cancel, id)
    }
}

impl<D: Kv> TagStore for TagCounted<D> {
    fn put_tag(
        &self,
        cancel: &Cancel,
        id: &Cid,
        tag: &Key,
        source: &dyn BlockSource,
    ) -> StoreResult<()> {
        TagCounted::put_tag(self, cancel, id, tag, source)
    }

    fn has_tag(&self, cancel: &Cancel, id: &Cid, tag: &Key) -> StoreResult<bool> {
        TagCounted::has_tag(self, cancel, id, tag)
    }

    fn get_tags(&self, cancel: &Cancel, id: &Cid) -> StoreResult<Vec<Key>> {
        TagCounted::get_tags(self, cancel, id)
    }

    fn remove_tag(&self, cancel: &Cancel, id: &Cid, tag: &Key) -> StoreResult<()> {
        TagCounted::remove_tag(self, cancel, id, tag)
    }

    fn replace_tag(
        &self,
        cancel: &Cancel,
        update: &[Cid],
        tag: &Key,
        source: &dyn BlockSource,
    ) -> StoreResult<()> {
        TagCounted::replace_tag(self, cancel, update, tag, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{check_counts, check_full_store, setup};
    use grove_kv::MemoryKv;
    use std::sync::Arc;

    fn store() -> TagCounted<MemoryKv> {
        TagCounted::new(MemoryKv::new(), Options::default())
    }

    #[test]
    fn tag_series_matches_shared_counting() {
        let dag = setup();
        let store = store();
        let cancel = Cancel::new();

        // (node, tag, expected tags on node, expected counts A..F)
        let cases: &[(usize, &str, &[&str], [i64; 6])] = &[
            (0, "A", &["A"], [1, 0, 0, 1, 0, 1]),
            (1, "A", &["A"], [1, 1, 0, 2, 1, 3]),
            (2, "B", &["B"], [1, 1, 1, 2, 2, 3]),
            (3, "C", &["C"], [1, 1, 1, 3, 2, 3]),
            (0, "A", &["A"], [1, 1, 1, 3, 2, 3]), // idempotent
            (0, "B", &["A", "B"], [2, 1, 1, 3, 2, 3]),
        ];

        for (node, tag, tags, counts) in cases {
            store
                .put_tag(&cancel, &dag.cid(*node), &Key::new(tag), &dag.source)
                .unwrap();
            check_counts(&store, &dag, counts);
            let got = store.get_tags(&cancel, &dag.cid(*node)).unwrap();
            let want: Vec<Key> = tags.iter().map(|t| Key::new(t)).collect();
            assert_eq!(got, want);
        }

        check_full_store(&store, &dag.cids());

        for (node, tag, _, _) in cases {
            store
                .remove_tag(&cancel, &dag.cid(*node), &Key::new(tag))
                .unwrap();
        }
        check_counts(&store, &dag, &[0; 6]);
        check_full_store(&store, &[]);
    }

    #[test]
    fn put_then_remove_restores_prior_state() {
        let dag = setup();
        let store = store();
        let cancel = Cancel::new();

        store
            .increment(&cancel, &dag.cid(1), &dag.source)
            .unwrap();
        let baseline: Vec<i64> = (0..6)
            .map(|i| store.get_count(&cancel, &dag.cid(i)).unwrap())
            .collect();

        let tag = Key::new("temp");
        store
            .put_tag(&cancel, &dag.cid(0), &tag, &dag.source)
            .unwrap();
        store.remove_tag(&cancel, &dag.cid(0), &tag).unwrap();

        let after: Vec<i64> = (0..6)
            .map(|i| store.get_count(&cancel, &dag.cid(i)).unwrap())
            .collect();
        assert_eq!(baseline, after);
        assert!(!store.has_tag(&cancel, &dag.cid(0), &tag).unwrap());
    }

    #[test]
    fn remove_of_absent_tag_is_a_noop() {
        let dag = setup();
        let store = store();
        let cancel = Cancel::new();
        store
            .remove_tag(&cancel, &dag.cid(0), &Key::new("ghost"))
            .unwrap();
        check_counts(&store, &dag, &[0; 6]);
    }

    #[test]
    fn forward_and_reverse_records_move_together() {
        let dag = setup();
        let store = store();
        let cancel = Cancel::new();
        let id = dag.cid(0);
        let tag = Key::new("x");

        store.put_tag(&cancel, &id, &tag, &dag.source).unwrap();
        assert!(store.counted.kv.has(&tag_key(&id, &tag)).unwrap());
        assert!(store.counted.kv.has(&tag_index_key(&tag, &id)).unwrap());

        store.remove_tag(&cancel, &id, &tag).unwrap();
        assert!(!store.counted.kv.has(&tag_key(&id, &tag)).unwrap());
        assert!(!store.counted.kv.has(&tag_index_key(&tag, &id)).unwrap());
    }

    #[test]
    fn empty_tag_is_rejected() {
        let dag = setup();
        let store = store();
        let cancel = Cancel::new();
        let err = store
            .put_tag(&cancel, &dag.cid(0), &Key::new(""), &dag.source)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTag { .. }));
    }

    #[test]
    fn replace_tag_sets_exact_membership() {
        let dag = setup();
        let store = store();
        let cancel = Cancel::new();
        let tag = Key::new("set");

        store
            .put_tag(&cancel, &dag.cid(0), &tag, &dag.source)
            .unwrap();

        // A drops out, B and C come in; B keeps its counts from A's overlap.
        store
            .replace_tag(
                &cancel,
                &[dag.cid(1), dag.cid(2)],
                &tag,
                &dag.source,
            )
            .unwrap();

        assert!(!store.has_tag(&cancel, &dag.cid(0), &tag).unwrap());
        assert!(store.has_tag(&cancel, &dag.cid(1), &tag).unwrap());
        assert!(store.has_tag(&cancel, &dag.cid(2), &tag).unwrap());
        check_counts(&store, &dag, &[0, 1, 1, 1, 2, 3]);

        // Replacing with the same set is a no-op.
        store
            .replace_tag(
                &cancel,
                &[dag.cid(1), dag.cid(2)],
                &tag,
                &dag.source,
            )
            .unwrap();
        check_counts(&store, &dag, &[0, 1, 1, 1, 2, 3]);

        // Replacing with the empty set clears everything.
        store.replace_tag(&cancel, &[], &tag, &dag.source).unwrap();
        check_counts(&store, &dag, &[0; 6]);
        check_full_store(&store, &[]);
    }

    #[test]
    fn tags_with_shared_name_prefixes_stay_separate() {
        let dag = setup();
        let store = store();
        let cancel = Cancel::new();

        store
            .put_tag(&cancel, &dag.cid(0), &Key::new("x"), &dag.source)
            .unwrap();
        store
            .put_tag(&cancel, &dag.cid(1), &Key::new("xy"), &dag.source)
            .unwrap();

        // Emptying "x" must not disturb "xy".
        store
            .replace_tag(&cancel, &[], &Key::new("x"), &dag.source)
            .unwrap();
        assert!(store
            .has_tag(&cancel, &dag.cid(1), &Key::new("xy"))
            .unwrap());
        assert_eq!(store.get_count(&cancel, &dag.cid(1)).unwrap(), 1);
    }

    #[test]
    fn concurrent_put_remove_converges_to_zero() {
        use std::thread;

        let dag = Arc::new(setup());
        let store = Arc::new(store());
        let cancel = Cancel::new();
        let tag = Key::new("contended");
        let id = dag.cid(1);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dag = Arc::clone(&dag);
                let store = Arc::clone(&store);
                let cancel = cancel.clone();
                let tag = tag.clone();
                thread::spawn(move || {
                    for _ in 0..8 {
                        store
                            .put_tag(&cancel, &id, &tag, &dag.source)
                            .unwrap();
                        store.remove_tag(&cancel, &id, &tag).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }

        check_counts(store.as_ref(), &dag, &[0; 6]);
        check_full_store(store.as_ref(), &[]);
    }
}
