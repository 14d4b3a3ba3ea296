//! The recursively counted block store.
//!
//! [`Counted`] maintains the central invariant: a block's count equals the
//! number of external holders of it as a root plus one unit per incoming
//! link from a complete parent. Increment and decrement treat the whole DAG
//! under a root as a single atomic operation inside one backend
//! transaction; the transaction wrapper retries the walk on optimistic
//! commit conflicts.

use cid::Cid;
use tracing::debug;

use grove_kv::{Cancel, Kv, Query, Txn};

use crate::counter::{get_count_kv, get_count_txn, set_count, set_data, take_data, Meta};
use crate::error::{StoreError, StoreResult};
use crate::keys::{data_key, data_key_to_cid, DATA_SUFFIX};
use crate::links::{LinkDecoder, Options};
use crate::traits::{BlockSource, CounterStore, ReadStore};
use crate::txn::run_txn;

/// A reference-counted block store over a transactional backend.
pub struct Counted<D> {
    pub(crate) kv: D,
    pub(crate) opts: Options,
}

impl<D: Kv> Counted<D> {
    /// Create a counted store over `kv`.
    pub fn new(kv: D, opts: Options) -> Self {
        Self { kv, opts }
    }

    /// Count the DAG rooted at `id` once.
    ///
    /// If `id` is already complete only its own counter rises; otherwise
    /// the walk descends, fetching missing blocks from `source` and
    /// counting every discovered descendant once per incoming link. Returns
    /// `id`'s new count.
    pub fn increment(
        &self,
        cancel: &Cancel,
        id: &Cid,
        source: &dyn BlockSource,
    ) -> StoreResult<i64> {
        let mut count = 0;
        run_txn(&self.kv, cancel, |tx| {
            count = tx_increment(tx, cancel, id, source, &self.opts.link_decoder)?;
            Ok(())
        })?;
        debug!(cid = %id, count, "incremented");
        Ok(count)
    }

    /// Remove one count from the DAG rooted at `id`.
    ///
    /// Returns `id`'s new count; a block reaching zero is deleted and its
    /// links decremented in turn. Returns -1 without touching anything if
    /// `id` was already absent.
    pub fn decrement(&self, cancel: &Cancel, id: &Cid) -> StoreResult<i64> {
        let mut count = 0;
        run_txn(&self.kv, cancel, |tx| {
            count = tx_decrement(tx, cancel, id, &self.opts.link_decoder)?;
            Ok(())
        })?;
        debug!(cid = %id, count, "decremented");
        Ok(count)
    }

    /// `id`'s stored count, or 0 while its subgraph is incomplete.
    ///
    /// Partially ingested roots are invisible here so that callers which
    /// never opted into progressive ingestion only ever observe fully
    /// materialized state. The value is a snapshot; it must not drive
    /// decisions under concurrency.
    pub fn get_count(&self, cancel: &Cancel, id: &Cid) -> StoreResult<i64> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let (count, meta) = get_count_kv(&self.kv, id)?;
        Ok(if meta.complete { count } else { 0 })
    }

    /// The stored block bytes for `id`.
    pub fn get_block(&self, cancel: &Cancel, id: &Cid) -> StoreResult<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        self.kv
            .get(&data_key(id))?
            .ok_or(StoreError::NotFound { cid: *id })
    }

    /// Byte length of the stored block for `id`.
    pub fn get_block_size(&self, cancel: &Cancel, id: &Cid) -> StoreResult<usize> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        self.kv
            .size(&data_key(id))?
            .ok_or(StoreError::NotFound { cid: *id })
    }

    /// Iterate the CIDs of all stored data records under `prefix`.
    pub fn keys(&self, prefix: &str) -> StoreResult<CidKeys<'_>> {
        let entries = self.kv.query(Query::keys_with_prefix(prefix))?;
        Ok(CidKeys { entries })
    }
}

impl<D> std::fmt::Debug for Counted<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counted").finish_non_exhaustive()
    }
}

impl<D: Kv> BlockSource for Counted<D> {
    fn get_block(&self, cancel: &Cancel, id: &Cid) -> StoreResult<Vec<u8>> {
        Counted::get_block(self, cancel, id)
    }
}

impl<D: Kv> ReadStore for Counted<D> {
    fn get_block_size(&self, cancel: &Cancel, id: &Cid) -> StoreResult<usize> {
        Counted::get_block_size(self, cancel, id)
    }

    fn cid_keys<'a>(
        &'a self,
        prefix: &str,
    ) -> StoreResult<Box<dyn Iterator<Item = StoreResult<Cid>> + 'a>> {
        Ok(Box::new(self.keys(prefix)?))
    }
}

impl<D: Kv> CounterStore for Counted<D> {
    fn increment(
        &self,
        cancel: &Cancel,
        id: &Cid,
        source: &dyn BlockSource,
    ) -> StoreResult<i64> {
        Counted::increment(self, cancel, id, source)
    }

    fn decrement(&self, cancel: &Cancel, id: &Cid) -> StoreResult<i64> {
        Counted::decrement(self, cancel, id)
    }

    fn get_count(&self, cancel: &Cancel, id: &Cid) -> StoreResult<i64> {
        Counted::get_count(self, cancel, id)
    }
}

/// Iterator over the CIDs that have a data record.
///
/// Keys that do not end in the data suffix, or whose CID portion does not
/// decode, are skipped rather than surfaced: the keyspace legitimately
/// holds counter and tag records beside the data records.
pub struct CidKeys<'a> {
    entries: grove_kv::Entries<'a>,
}

impl Iterator for CidKeys<'_> {
    type Item = StoreResult<Cid>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            if !entry.key.as_str().ends_with(DATA_SUFFIX) {
                continue;
            }
            if let Ok(id) = data_key_to_cid(entry.key.as_str()) {
                return Some(Ok(id));
            }
        }
    }
}

/// One DFS frame: a node and its not-yet-visited links.
struct Frame {
    id: Cid,
    links: std::vec::IntoIter<Cid>,
}

/// Drive the increment walk from `root` using an explicit work stack.
///
/// The stack holds the DFS ancestor path, which doubles as the cycle
/// guard: CIDs form a DAG by construction, so a child that is its own
/// ancestor is corrupt input.
pub(crate) fn tx_increment(
    tx: &mut dyn Txn,
    cancel: &Cancel,
    root: &Cid,
    source: &dyn BlockSource,
    decoder: &LinkDecoder,
) -> StoreResult<i64> {
    let (root_count, links) = increment_step(tx, cancel, root, source, decoder)?;
    let mut stack = Vec::new();
    if let Some(links) = links {
        stack.push(Frame {
            id: *root,
            links: links.into_iter(),
        });
    }
    loop {
        let next = match stack.last_mut() {
            None => break,
            Some(frame) => frame.links.next(),
        };
        match next {
            None => {
                stack.pop();
            }
            Some(child) => {
                if stack.iter().any(|frame| frame.id == child) {
                    return Err(StoreError::Cycle { cid: child });
                }
                let (_, child_links) = increment_step(tx, cancel, &child, source, decoder)?;
                if let Some(links) = child_links {
                    stack.push(Frame {
                        id: child,
                        links: links.into_iter(),
                    });
                }
            }
        }
    }
    Ok(root_count)
}

/// Apply one increment to `id` inside the walk.
///
/// Returns the new count and, when the walk must descend, the node's links.
/// Completion is upgraded eagerly: by the time the enclosing transaction
/// commits the whole subtree has been counted.
fn increment_step(
    tx: &mut dyn Txn,
    cancel: &Cancel,
    id: &Cid,
    source: &dyn BlockSource,
    decoder: &LinkDecoder,
) -> StoreResult<(i64, Option<Vec<Cid>>)> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    let (prev, meta, key) = get_count_txn(tx, id)?;
    let count = prev + 1;
    set_count(tx, &key, count, Meta::COMPLETE)?;
    if count > 1 && meta.complete {
        // The subgraph was already fully counted by an earlier holder.
        return Ok((count, None));
    }
    let data = if meta.have_part {
        tx.get(&data_key(id))?
            .ok_or(StoreError::NotFound { cid: *id })?
    } else {
        let data = source.get_block(cancel, id)?;
        set_data(tx, id, &data)?;
        data
    };
    let decoded = decoder.as_ref()(id, &data)?;
    Ok((count, Some(decoded.links)))
}

/// Drive the decrement walk from `root` using an explicit work stack.
pub(crate) fn tx_decrement(
    tx: &mut dyn Txn,
    cancel: &Cancel,
    root: &Cid,
    decoder: &LinkDecoder,
) -> StoreResult<i64> {
    let (root_count, links) = decrement_step(tx, cancel, root, decoder)?;
    let mut stack = Vec::new();
    if let Some(links) = links {
        stack.push(Frame {
            id: *root,
            links: links.into_iter(),
        });
    }
    loop {
        let next = match stack.last_mut() {
            None => break,
            Some(frame) => frame.links.next(),
        };
        match next {
            None => {
                stack.pop();
            }
            Some(child) => {
                if stack.iter().any(|frame| frame.id == child) {
                    return Err(StoreError::Cycle { cid: child });
                }
                let (_, child_links) = decrement_step(tx, cancel, &child, decoder)?;
                if let Some(links) = child_links {
                    stack.push(Frame {
                        id: child,
                        links: links.into_iter(),
                    });
                }
            }
        }
    }
    Ok(root_count)
}

/// Apply one decrement to `id` inside the walk.
///
/// An absent counter yields -1 and mutates nothing, which also bounds the
/// recursion: children that were never counted (a placeholder parent never
/// counted them) cannot be driven negative. Placeholders carry no data and
/// never recurse. A block reaching zero is deleted, and the links decoded
/// from the just-deleted bytes are handed back for the walk to descend.
fn decrement_step(
    tx: &mut dyn Txn,
    cancel: &Cancel,
    id: &Cid,
    decoder: &LinkDecoder,
) -> StoreResult<(i64, Option<Vec<Cid>>)> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    let (prev, meta, key) = get_count_txn(tx, id)?;
    let count = prev - 1;
    if count < 0 {
        return Ok((count, None));
    }
    set_count(tx, &key, count, meta)?;
    if !meta.have_part || count > 0 {
        return Ok((count, None));
    }
    let data = take_data(tx, id)?;
    let decoded = decoder.as_ref()(id, &data)?;
    Ok((0, Some(decoded.links)))
}
