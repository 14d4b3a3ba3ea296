//! Byte-based progress reporting for progressive ingestion.

use cid::Cid;
use serde::{Deserialize, Serialize};

use grove_kv::{Cancel, Kv};

use crate::counted::Counted;
use crate::counter::get_count_kv;
use crate::error::{StoreError, StoreResult};
use crate::keys::data_key;

/// A snapshot of ingestion progress for one root.
///
/// `have_bytes / known_bytes` is an estimated completion fraction when
/// `known_bytes` is non-zero. During a live walk the figures are estimates:
/// `have_bytes` is pessimistic (subgraphs that were already present before
/// the walk are not re-counted) while `known_bytes` is the root's declared
/// cumulative size, which counts shared blocks once per link. The
/// authoritative figures come from a fresh
/// [`get_progress_report`](crate::ProgressiveCounted::get_progress_report).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Bytes of the root's subgraph known to be stored and complete.
    pub have_bytes: u64,
    /// Declared cumulative byte size of the root's subgraph.
    pub known_bytes: u64,
    initialized: bool,
}

impl ProgressReport {
    /// An empty, uninitialized report for a manager to fill.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any reporter has filled this report yet.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Estimated completion fraction, when anything is known.
    pub fn fraction(&self) -> Option<f64> {
        (self.known_bytes > 0).then(|| self.have_bytes as f64 / self.known_bytes as f64)
    }

    /// A zeroed report marked as initialized.
    pub(crate) fn fresh() -> Self {
        Self {
            initialized: true,
            ..Self::default()
        }
    }
}

/// Compute a fresh report for `id` by walking the local store.
///
/// An absent root reports zeros. Otherwise `known_bytes` is the root's
/// declared cumulative size and `have_bytes` sums the sizes of complete
/// subtrees: a complete node contributes its whole declared subtree, a
/// partial node contributes its own bytes plus whatever of its children is
/// present, and absent branches contribute nothing.
pub(crate) fn local_report<D: Kv>(
    counted: &Counted<D>,
    cancel: &Cancel,
    id: &Cid,
    report: &mut ProgressReport,
) -> StoreResult<()> {
    *report = ProgressReport::fresh();
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    let (count, meta) = get_count_kv(&counted.kv, id)?;
    if count == 0 || !meta.have_part {
        return Ok(());
    }
    let data = counted
        .kv
        .get(&data_key(id))?
        .ok_or(StoreError::NotFound { cid: *id })?;
    let decoded = counted.opts.link_decoder.as_ref()(id, &data)?;
    let known = decoded
        .total_size
        .ok_or(StoreError::SizeNotSupported { cid: *id })?;
    report.known_bytes = known;
    if meta.complete {
        report.have_bytes = known;
        return Ok(());
    }
    let mut have = data.len() as u64;
    let mut path = vec![*id];
    for link in &decoded.links {
        have += subtree_have(counted, cancel, link, &mut path)?;
    }
    report.have_bytes = have;
    Ok(())
}

/// Stored-and-complete bytes under `id`. `path` is the DFS ancestor chain,
/// guarding against corrupt input that claims a cycle.
fn subtree_have<D: Kv>(
    counted: &Counted<D>,
    cancel: &Cancel,
    id: &Cid,
    path: &mut Vec<Cid>,
) -> StoreResult<u64> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    if path.contains(id) {
        return Err(StoreError::Cycle { cid: *id });
    }
    let (count, meta) = get_count_kv(&counted.kv, id)?;
    if count == 0 || !meta.have_part {
        return Ok(0);
    }
    let data = counted
        .kv
        .get(&data_key(id))?
        .ok_or(StoreError::NotFound { cid: *id })?;
    let decoded = counted.opts.link_decoder.as_ref()(id, &data)?;
    if meta.complete {
        return decoded
            .total_size
            .ok_or(StoreError::SizeNotSupported { cid: *id });
    }
    let mut have = data.len() as u64;
    path.push(*id);
    for link in &decoded.links {
        have += subtree_have(counted, cancel, link, path)?;
    }
    path.pop();
    Ok(have)
}
