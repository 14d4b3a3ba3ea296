//! The commit-retry wrapper around backend transactions.

use tracing::trace;

use grove_kv::{Cancel, Kv, KvError, Txn};

use crate::error::{StoreError, StoreResult};

/// Run `f` inside a transaction, committing on success and retrying the
/// whole closure on optimistic commit conflicts.
///
/// Because `f` may run several times against fresh snapshots, it must
/// derive all of its state from reads made within the current attempt and
/// never rely on side effects of an earlier one. A closure error aborts the
/// operation: the transaction is discarded on drop, so no partial state is
/// persisted, and any commit failure from a previous attempt is preserved
/// alongside the closure error. Cancellation is re-checked before every
/// retry.
pub(crate) fn run_txn<D, F>(kv: &D, cancel: &Cancel, mut f: F) -> StoreResult<()>
where
    D: Kv + ?Sized,
    F: FnMut(&mut dyn Txn) -> StoreResult<()>,
{
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    let mut tx = kv.transaction(false)?;
    let mut commit_err: Option<KvError> = None;
    loop {
        if let Err(op) = f(tx.as_mut()) {
            return Err(merge(op, commit_err));
        }
        match tx.commit() {
            Ok(()) => return Ok(()),
            Err(KvError::Conflict) => {
                trace!("commit conflict, retrying transaction");
                if cancel.is_cancelled() {
                    return Err(merge(StoreError::Cancelled, Some(KvError::Conflict)));
                }
                commit_err = Some(KvError::Conflict);
                drop(tx);
                tx = kv.transaction(false)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn merge(op: StoreError, commit_err: Option<KvError>) -> StoreError {
    match commit_err {
        None => op,
        Some(commit) => StoreError::RetryAborted {
            op: Box::new(op),
            commit,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_kv::{Key, MemoryKv};

    #[test]
    fn commits_on_success() {
        let kv = MemoryKv::new();
        run_txn(&kv, &Cancel::new(), |tx| {
            tx.put(&Key::new("a"), vec![1])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(kv.get(&Key::new("a")).unwrap(), Some(vec![1]));
    }

    #[test]
    fn closure_error_discards_writes() {
        let kv = MemoryKv::new();
        let err = run_txn(&kv, &Cancel::new(), |tx| {
            tx.put(&Key::new("a"), vec![1])?;
            Err(StoreError::ProgressReverted)
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::ProgressReverted));
        assert!(kv.is_empty());
    }

    #[test]
    fn cancelled_before_start() {
        let kv = MemoryKv::new();
        let cancel = Cancel::new();
        cancel.cancel();
        let err = run_txn(&kv, &cancel, |_| Ok(())).unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[test]
    fn retries_on_conflict() {
        let kv = MemoryKv::new();
        let mut attempts = 0;
        run_txn(&kv, &Cancel::new(), |tx| {
            attempts += 1;
            // Read the key so the commit depends on its version.
            let current = tx.get(&Key::new("n"))?.map(|v| v[0]).unwrap_or(0);
            if attempts == 1 {
                // A competing commit lands between our read and our commit.
                let mut racer = kv.transaction(false)?;
                racer.put(&Key::new("n"), vec![7])?;
                racer.commit()?;
            }
            tx.put(&Key::new("n"), vec![current + 1])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(kv.get(&Key::new("n")).unwrap(), Some(vec![8]));
    }
}
