//! Per-resource lock table entry and the wait-queue request shape.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::handle::{TransactionHandle, TransactionId};
use crate::mode::LockMode;
use crate::resource::ResourceName;

/// A granted lock: `(resource, mode, transactionId)`. `mode` is never `NL`.
#[derive(Debug, Clone)]
pub(crate) struct Lock<N: ResourceName> {
    pub(crate) resource: N,
    pub(crate) mode: LockMode,
    pub(crate) txn: TransactionId,
}

/// A queued proposal: grant `target` to `txn`, then release every resource
/// in `release_names` on that same transaction's behalf (empty for a plain
/// `acquire`/`promote`).
pub(crate) struct LockRequest<N: ResourceName, H: TransactionHandle> {
    pub(crate) txn: TransactionId,
    pub(crate) handle: Arc<H>,
    pub(crate) target: Lock<N>,
    pub(crate) release_names: Vec<N>,
}

/// One resource's granted-lock set and FIFO wait queue.
///
/// Every pair of distinct locks in `granted` must have compatible modes,
/// and each transaction id must appear at most once in `granted`. Both are
/// maintained by construction: every mutator here checks compatibility or
/// identity before it writes, and both are re-asserted in debug builds
/// after each mutation.
pub(crate) struct ResourceEntry<N: ResourceName, H: TransactionHandle> {
    pub(crate) granted: Vec<Lock<N>>,
    pub(crate) wait_queue: VecDeque<LockRequest<N, H>>,
}

impl<N: ResourceName, H: TransactionHandle> ResourceEntry<N, H> {
    pub(crate) fn new() -> Self {
        Self { granted: Vec::new(), wait_queue: VecDeque::new() }
    }

    /// True iff `mode` is compatible with every lock in `granted` held by a
    /// transaction other than `excluding`.
    pub(crate) fn compatible_excluding(&self, mode: LockMode, excluding: TransactionId) -> bool {
        self.granted
            .iter()
            .filter(|l| l.txn != excluding)
            .all(|l| mode.compatible(l.mode))
    }

    /// The lock `txn` currently holds here, if any.
    pub(crate) fn held_by(&self, txn: TransactionId) -> Option<&Lock<N>> {
        self.granted.iter().find(|l| l.txn == txn)
    }

    pub(crate) fn position_of(&self, txn: TransactionId) -> Option<usize> {
        self.granted.iter().position(|l| l.txn == txn)
    }

    /// Grants a brand-new lock, appended at the back (acquisition order).
    pub(crate) fn append_grant(&mut self, resource: N, mode: LockMode, txn: TransactionId) {
        debug_assert!(self.held_by(txn).is_none(), "txn already holds a lock here");
        debug_assert!(
            self.compatible_excluding(mode, txn),
            "new grant incompatible with existing holders"
        );
        self.granted.push(Lock { resource, mode, txn });
    }

    /// Rewrites an existing lock's mode in place, preserving its position
    /// (and therefore its acquisition order).
    pub(crate) fn replace_mode_in_place(&mut self, txn: TransactionId, mode: LockMode) {
        let pos = self.position_of(txn).expect("promote target must already be granted");
        debug_assert!(
            self.granted
                .iter()
                .enumerate()
                .filter(|(i, l)| *i != pos && l.txn != txn)
                .all(|(_, l)| mode.compatible(l.mode)),
            "in-place replacement incompatible with existing holders"
        );
        self.granted[pos].mode = mode;
    }

    /// Removes `txn`'s lock here, if any. Returns whether one was removed.
    pub(crate) fn remove(&mut self, txn: TransactionId) -> bool {
        let before = self.granted.len();
        self.granted.retain(|l| l.txn != txn);
        before != self.granted.len()
    }

    pub(crate) fn is_empty_and_idle(&self) -> bool {
        self.granted.is_empty() && self.wait_queue.is_empty()
    }
}
