//! Trait seams for consumers of the store.

use cid::Cid;

use grove_kv::{Cancel, Key};

use crate::error::StoreResult;

/// Produces the raw bytes a CID refers to.
///
/// Two parties implement this: every store (serving from its data records)
/// and callers supplying missing blocks during ingestion, where it acts as
/// a fetch-on-demand callback.
pub trait BlockSource: Send + Sync {
    /// Fetch the block for `id`. Errors are surfaced to the ingesting
    /// operation unchanged.
    fn get_block(&self, cancel: &Cancel, id: &Cid) -> StoreResult<Vec<u8>>;
}

/// Read-side operations shared by all stores.
pub trait ReadStore: BlockSource {
    /// Byte length of the stored block for `id`.
    fn get_block_size(&self, cancel: &Cancel, id: &Cid) -> StoreResult<usize>;

    /// Iterate the CIDs of all stored data records under `prefix`.
    fn cid_keys<'a>(
        &'a self,
        prefix: &str,
    ) -> StoreResult<Box<dyn Iterator<Item = StoreResult<Cid>> + 'a>>;
}

/// A recursively reference-counted block store.
///
/// Incrementing a root counts the whole DAG below it as one logical
/// reference; sharing is handled by the per-block counters, so the order of
/// increments over a set of roots does not matter. Decrement undoes exactly
/// one increment.
pub trait CounterStore: ReadStore {
    /// Count the DAG rooted at `id` once, fetching missing blocks from
    /// `source`. Returns `id`'s new count.
    fn increment(&self, cancel: &Cancel, id: &Cid, source: &dyn BlockSource)
        -> StoreResult<i64>;

    /// Remove one count from the DAG rooted at `id`, deleting blocks whose
    /// count reaches zero. Returns `id`'s new count, or -1 if `id` was
    /// already absent.
    fn decrement(&self, cancel: &Cancel, id: &Cid) -> StoreResult<i64>;

    /// `id`'s current count, or 0 while its subgraph is incomplete. The
    /// value is a point-in-time snapshot; it must not drive decisions under
    /// concurrency.
    fn get_count(&self, cancel: &Cancel, id: &Cid) -> StoreResult<i64>;
}

/// Named idempotent holders layered over the counters.
///
/// A tag is exactly one counter unit that can be applied repeatedly without
/// double-counting and removed exactly, which makes tag operations safe to
/// replay over an unreliable connection.
pub trait TagStore: ReadStore {
    /// Hold the DAG rooted at `id` under `tag`. Idempotent.
    fn put_tag(
        &self,
        cancel: &Cancel,
        id: &Cid,
        tag: &Key,
        source: &dyn BlockSource,
    ) -> StoreResult<()>;

    /// Whether `id` currently carries `tag`.
    fn has_tag(&self, cancel: &Cancel, id: &Cid, tag: &Key) -> StoreResult<bool>;

    /// All tags on `id`, in backend order.
    fn get_tags(&self, cancel: &Cancel, id: &Cid) -> StoreResult<Vec<Key>>;

    /// Release the hold of `tag` on `id`. Idempotent.
    fn remove_tag(&self, cancel: &Cancel, id: &Cid, tag: &Key) -> StoreResult<()>;

    /// Atomically make `update` the exact membership of `tag`: missing
    /// members are tagged, stale members untagged, existing ones untouched.
    fn replace_tag(
        &self,
        cancel: &Cancel,
        update: &[Cid],
        tag: &Key,
        source: &dyn BlockSource,
    ) -> StoreResult<()>;
}
