//! Progressive (resumable) ingestion of large DAGs.
//!
//! Where [`Counted::increment`] walks a whole DAG inside one transaction,
//! the progressive engine commits one small transaction per node, so every
//! step is durable forward progress: a crash or cancellation between steps
//! leaves a consistent partial store that a later
//! [`progressive_continue`](ProgressiveCounted::progressive_continue) picks
//! up where the walk stopped.
//!
//! Under progressive ingestion a node moves through four states: absent,
//! placeholder (counted, no bytes), partial (bytes stored, children
//! unresolved), and complete. The counters and records are exactly the ones
//! the non-progressive operations use, so both paths interleave freely.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use cid::Cid;
use tracing::debug;

use grove_kv::{Cancel, Kv};

use crate::counted::{CidKeys, Counted};
use crate::counter::{get_count_txn, set_count, set_data, Meta};
use crate::error::{StoreError, StoreResult};
use crate::keys::data_key;
use crate::links::Options;
use crate::report::{local_report, ProgressReport};
use crate::traits::{BlockSource, CounterStore, ReadStore};
use crate::txn::run_txn;

/// A counted store with progressive ingestion.
pub struct ProgressiveCounted<D> {
    pub(crate) counted: Counted<D>,
}

impl<D: Kv> ProgressiveCounted<D> {
    /// Create a progressive counted store over `kv`.
    pub fn new(kv: D, opts: Options) -> Self {
        Self {
            counted: Counted::new(kv, opts),
        }
    }

    /// Count `id` once and, if its subgraph is not yet complete, hand back
    /// the [`Progress`] that will ingest it.
    ///
    /// The increment commits before this returns, so the new count is
    /// durable even if [`Progress::run`] is never called; resume later with
    /// [`progressive_continue`](Self::progressive_continue).
    pub fn progressive_increment<'a>(
        &'a self,
        cancel: &Cancel,
        id: &Cid,
        source: &'a dyn BlockSource,
    ) -> StoreResult<(Option<Progress<'a, D>>, i64)> {
        progressive_increment_impl(&self.counted, cancel, id, source)
    }

    /// A [`Progress`] for `id` without the initial increment, for resuming
    /// an earlier walk after a crash or cancellation.
    pub fn progressive_continue<'a>(
        &'a self,
        id: &Cid,
        source: &'a dyn BlockSource,
    ) -> Progress<'a, D> {
        Progress::new(&self.counted, *id, source)
    }

    /// Compute a fresh [`ProgressReport`] for `id` from local state.
    pub fn get_progress_report(
        &self,
        cancel: &Cancel,
        id: &Cid,
        report: &mut ProgressReport,
    ) -> StoreResult<()> {
        local_report(&self.counted, cancel, id, report)
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

impl<D> std::fmt::Debug for ProgressiveCounted<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressiveCounted").finish_non_exhaustive()
    }
}

impl<D: Kv> BlockSource for ProgressiveCounted<D> {
    fn get_block(&self, cancel: &Cancel, id: &Cid) -> StoreResult<Vec<u8>> {
        self.counted.get_block(cancel, id)
    }
}

impl<D: Kv> ReadStore for ProgressiveCounted<D> {
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

impl<D: Kv> CounterStore for ProgressiveCounted<D> {
    fn increment(
        &self,
        cancel: &Cancel,
        id: &Cid,
        source: &dyn BlockSource,
    ) -> StoreResult<i64> {
        ProgressiveCounted::increment(self, cancel, id, source)
    }

    fn decrement(&self, cancel: &Cancel, id: &Cid) -> StoreResult<i64> {
        ProgressiveCounted::decrement(self, cancel, id)
    }

    fn get_count(&self, cancel: &Cancel, id: &Cid) -> StoreResult<i64> {
        ProgressiveCounted::get_count(self, cancel, id)
    }
}

/// Shared first transaction of progressive ingestion: bump the root's
/// counter, preserving its metadata, and decide whether a walk is needed.
pub(crate) fn progressive_increment_impl<'a, D: Kv>(
    counted: &'a Counted<D>,
    cancel: &Cancel,
    id: &Cid,
    source: &'a dyn BlockSource,
) -> StoreResult<(Option<Progress<'a, D>>, i64)> {
    let mut count = 0;
    let mut meta = Meta::default();
    run_txn(&counted.kv, cancel, |tx| {
        let (prev, m, key) = get_count_txn(tx, id)?;
        count = prev + 1;
        meta = m;
        set_count(tx, &key, count, m)
    })?;
    if meta.complete {
        return Ok((None, count));
    }
    Ok((Some(Progress::new(counted, *id, source)), count))
}

/// The outcome of one per-node transaction of the walk.
#[derive(Default)]
struct StepOutcome {
    /// Children that still need their own steps, in link order.
    pending: Vec<Cid>,
    /// Length of this node's block bytes.
    data_len: u64,
    /// Declared cumulative size of this node's subgraph, when known.
    total_size: Option<u64>,
    /// This step upgraded the node to complete.
    completed: bool,
}

/// A handle driving one progressive walk.
///
/// Obtained from a progressive store; [`run`](Self::run) performs the walk
/// and may be called at most once. [`copy_report`](Self::copy_report) may
/// be called from any thread at any time, including while `run` is live.
pub struct Progress<'a, D> {
    counted: &'a Counted<D>,
    root: Cid,
    source: &'a dyn BlockSource,
    report: RwLock<ProgressReport>,
    ran: AtomicBool,
}

/// One frame of the walk: a node and the children still owed a visit.
struct Frame {
    id: Cid,
    children: VecDeque<Cid>,
}

enum Action {
    Descend(Cid),
    Step(Cid),
}

impl<'a, D: Kv> Progress<'a, D> {
    pub(crate) fn new(counted: &'a Counted<D>, root: Cid, source: &'a dyn BlockSource) -> Self {
        Self {
            counted,
            root,
            source,
            report: RwLock::new(ProgressReport::fresh()),
            ran: AtomicBool::new(false),
        }
    }

    /// Drive the walk to completion, one transaction per node.
    ///
    /// A node is re-stepped after its pending children complete, which is
    /// what upgrades it to complete in turn. Fails with
    /// [`StoreError::RunOnce`] on a second call, and with
    /// [`StoreError::ProgressReverted`] if a concurrent decrement removed
    /// the walked root. Cancellation is observed between transactions and
    /// leaves all committed steps in place.
    pub fn run(&self, cancel: &Cancel) -> StoreResult<()> {
        if self.ran.swap(true, Ordering::SeqCst) {
            return Err(StoreError::RunOnce);
        }
        let mut first = true;
        let mut stack = vec![Frame {
            id: self.root,
            children: VecDeque::new(),
        }];
        loop {
            let action = match stack.last_mut() {
                None => break,
                Some(frame) => match frame.children.pop_front() {
                    Some(child) => Action::Descend(child),
                    None => Action::Step(frame.id),
                },
            };
            match action {
                Action::Descend(child) => {
                    if stack.iter().any(|frame| frame.id == child) {
                        return Err(StoreError::Cycle { cid: child });
                    }
                    stack.push(Frame {
                        id: child,
                        children: VecDeque::new(),
                    });
                }
                Action::Step(id) => {
                    let outcome = self.step(cancel, &id)?;
                    if first {
                        first = false;
                        if let Some(total) = outcome.total_size {
                            self.report.write().expect("lock poisoned").known_bytes = total;
                        }
                    }
                    if outcome.completed {
                        self.report.write().expect("lock poisoned").have_bytes +=
                            outcome.data_len;
                    }
                    if outcome.pending.is_empty() {
                        stack.pop();
                    } else if let Some(frame) = stack.last_mut() {
                        frame.children = outcome.pending.into_iter().collect();
                    }
                }
            }
        }
        debug!(cid = %self.root, "progressive walk finished");
        Ok(())
    }

    /// Snapshot the current report into caller-provided storage without
    /// allocating.
    pub fn copy_report(&self, out: &mut ProgressReport) {
        *out = *self.report.read().expect("lock poisoned");
    }

    /// One transaction: materialize `id` if needed, count its children on
    /// first touch, and collect the ones that still need exploring.
    fn step(&self, cancel: &Cancel, id: &Cid) -> StoreResult<StepOutcome> {
        let mut out = StepOutcome::default();
        run_txn(&self.counted.kv, cancel, |tx| {
            out = StepOutcome::default();
            let (count, meta, key) = get_count_txn(tx, id)?;
            if count == 0 {
                return Err(StoreError::ProgressReverted);
            }
            if meta.complete {
                // Nothing left to explore below this node.
                return Ok(());
            }
            let data = if meta.have_part {
                tx.get(&data_key(id))?
                    .ok_or(StoreError::NotFound { cid: *id })?
            } else {
                let data = self.source.get_block(cancel, id)?;
                set_data(tx, id, &data)?;
                data
            };
            let decoded = self.counted.opts.link_decoder.as_ref()(id, &data)?;
            out.data_len = data.len() as u64;
            out.total_size = decoded.total_size;
            // Only the transaction that first stores the bytes counts the
            // children; re-steps merely re-examine their completeness.
            let first_touch = !meta.have_part;
            for link in &decoded.links {
                if cancel.is_cancelled() {
                    return Err(StoreError::Cancelled);
                }
                let (child_count, child_meta, child_key) = get_count_txn(tx, link)?;
                if first_touch {
                    set_count(tx, &child_key, child_count + 1, child_meta)?;
                }
                if !child_meta.complete {
                    out.pending.push(*link);
                }
            }
            if out.pending.is_empty() {
                set_count(tx, &key, count, Meta::COMPLETE)?;
                out.completed = true;
            } else if first_touch {
                set_count(tx, &key, count, Meta::PARTIAL)?;
            }
            Ok(())
        })?;
        Ok(out)
    }
}

impl<D> std::fmt::Debug for Progress<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
