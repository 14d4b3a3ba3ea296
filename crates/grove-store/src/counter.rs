//! The counter record codec and its transactional helpers.
//!
//! A counter record is `varint(count)` followed by at most one metadata
//! byte:
//!
//! - varint only — the subgraph is complete and the block bytes are stored.
//! - varint + `0` — incomplete, block bytes not stored (placeholder).
//! - varint + `1` — incomplete, block bytes stored, children unresolved.
//!
//! `count` is always at least 1; a count of zero is represented by the
//! absence of the record. Any other shape is a corruption error.

use cid::Cid;

use grove_kv::{Key, Kv, Txn};

use crate::error::{StoreError, StoreResult};
use crate::keys::{counter_key, data_key};

/// Completion state carried alongside a counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    /// The full subgraph rooted at this CID is known present.
    pub complete: bool,
    /// This CID's block bytes are stored locally.
    pub have_part: bool,
}

impl Meta {
    /// Fully resolved: block present and subgraph verified.
    pub(crate) const COMPLETE: Meta = Meta {
        complete: true,
        have_part: true,
    };

    /// Block bytes stored, children still unresolved.
    pub(crate) const PARTIAL: Meta = Meta {
        complete: false,
        have_part: true,
    };

    /// Encode this metadata together with a count.
    pub(crate) fn encode_with_count(self, count: i64) -> Vec<u8> {
        let mut buf = unsigned_varint::encode::u64_buffer();
        let head = unsigned_varint::encode::u64(count as u64, &mut buf);
        let mut out = Vec::with_capacity(head.len() + 1);
        out.extend_from_slice(head);
        if !self.complete {
            out.push(u8::from(self.have_part));
        }
        out
    }
}

fn corrupt(bytes: &[u8], what: &str) -> StoreError {
    StoreError::CorruptCounter {
        detail: format!("{what}, from raw `{}`", hex::encode(bytes)),
    }
}

/// Decode a counter record into its count and metadata.
pub(crate) fn decode_counter(bytes: &[u8]) -> StoreResult<(i64, Meta)> {
    let (value, rest) =
        unsigned_varint::decode::u64(bytes).map_err(|_| corrupt(bytes, "invalid varint"))?;
    if value == 0 || value > i64::MAX as u64 {
        return Err(corrupt(bytes, "count less than 1"));
    }
    let count = value as i64;
    match rest {
        [] => Ok((count, Meta::COMPLETE)),
        [0] => Ok((
            count,
            Meta {
                complete: false,
                have_part: false,
            },
        )),
        [1] => Ok((count, Meta::PARTIAL)),
        [_] => Err(corrupt(bytes, "meta byte greater than 1")),
        _ => Err(corrupt(bytes, "trailing bytes after meta")),
    }
}

/// Read `id`'s counter through a transaction. An absent record reads as
/// count 0 with zero metadata.
pub(crate) fn get_count_txn(tx: &mut dyn Txn, id: &Cid) -> StoreResult<(i64, Meta, Key)> {
    let key = counter_key(id);
    match tx.get(&key)? {
        None => Ok((0, Meta::default(), key)),
        Some(bytes) => {
            let (count, meta) = decode_counter(&bytes)?;
            Ok((count, meta, key))
        }
    }
}

/// Read `id`'s counter from committed state.
pub(crate) fn get_count_kv<D: Kv + ?Sized>(kv: &D, id: &Cid) -> StoreResult<(i64, Meta)> {
    match kv.get(&counter_key(id))? {
        None => Ok((0, Meta::default())),
        Some(bytes) => decode_counter(&bytes),
    }
}

/// Write `id`'s counter. A count of zero deletes the record; a negative
/// count is an internal invariant violation.
pub(crate) fn set_count(tx: &mut dyn Txn, key: &Key, count: i64, meta: Meta) -> StoreResult<()> {
    if count == 0 {
        return Ok(tx.delete(key)?);
    }
    if count < 0 {
        return Err(StoreError::CorruptCounter {
            detail: format!("refusing to store count {count} for key {key}"),
        });
    }
    Ok(tx.put(key, meta.encode_with_count(count))?)
}

/// Store `id`'s block bytes.
pub(crate) fn set_data(tx: &mut dyn Txn, id: &Cid, data: &[u8]) -> StoreResult<()> {
    Ok(tx.put(&data_key(id), data.to_vec())?)
}

/// Delete `id`'s block bytes, returning them for link decoding.
pub(crate) fn take_data(tx: &mut dyn Txn, id: &Cid) -> StoreResult<Vec<u8>> {
    let key = data_key(id);
    let data = tx.get(&key)?.ok_or(StoreError::NotFound { cid: *id })?;
    tx.delete(&key)?;
    Ok(data)
}
