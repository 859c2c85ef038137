//! The flat lock manager: the single source of truth for conflict
//! detection, granting, blocking, and queue draining. Treats every resource
//! independently; multigranularity semantics live one layer up, in
//! `crate::context`.

mod drain;
mod entry;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LockError, LockResult, SIX_VIA_PROMOTE_REASON};
use crate::handle::{TransactionHandle, TransactionId};
use crate::mode::LockMode;
use crate::resource::ResourceName;

use entry::{Lock, LockRequest, ResourceEntry};

/// Everything the manager's single mutex guards: the per-resource lock
/// table and its denormalized reverse index (`transaction_locks`), grouped
/// under one state object so a single lock acquisition covers both.
struct ManagerState<N: ResourceName, H: TransactionHandle> {
    resources: HashMap<N, ResourceEntry<N, H>>,
    transaction_locks: HashMap<TransactionId, Vec<Lock<N>>>,
}

impl<N: ResourceName, H: TransactionHandle> ManagerState<N, H> {
    fn new() -> Self {
        Self { resources: HashMap::new(), transaction_locks: HashMap::new() }
    }

    fn entry_mut(&mut self, name: &N) -> &mut ResourceEntry<N, H> {
        self.resources.entry(name.clone()).or_insert_with(ResourceEntry::new)
    }

    fn txn_lock_on(&self, txn: TransactionId, name: &N) -> Option<LockMode> {
        self.transaction_locks
            .get(&txn)
            .and_then(|locks| locks.iter().find(|l| &l.resource == name))
            .map(|l| l.mode)
    }

    /// Appends a brand-new grant to both the resource entry and the
    /// transaction index.
    fn grant_append(&mut self, name: &N, mode: LockMode, txn: TransactionId) {
        self.entry_mut(name).append_grant(name.clone(), mode, txn);
        self.transaction_locks
            .entry(txn)
            .or_default()
            .push(Lock { resource: name.clone(), mode, txn });
    }

    /// Rewrites an existing grant's mode in both indices, preserving the
    /// transaction-index entry's position too (acquisition order, §3/§5).
    fn grant_replace(&mut self, name: &N, mode: LockMode, txn: TransactionId) {
        self.entry_mut(name).replace_mode_in_place(txn, mode);
        if let Some(locks) = self.transaction_locks.get_mut(&txn) {
            if let Some(l) = locks.iter_mut().find(|l| &l.resource == name) {
                l.mode = mode;
            }
        }
    }

    /// Removes `txn`'s lock on `name` from both indices. Returns whether a
    /// lock was actually removed (it may not be, e.g. when a
    /// `release_names` entry was already consumed by an in-place replace).
    fn release(&mut self, name: &N, txn: TransactionId) -> bool {
        let removed_from_entry =
            self.resources.get_mut(name).map(|e| e.remove(txn)).unwrap_or(false);
        let removed_from_index = if let Some(locks) = self.transaction_locks.get_mut(&txn) {
            let before = locks.len();
            locks.retain(|l| &l.resource != name);
            let removed = locks.len() != before;
            if locks.is_empty() {
                self.transaction_locks.remove(&txn);
            }
            removed
        } else {
            false
        };
        debug_assert_eq!(
            removed_from_entry, removed_from_index,
            "ResourceEntry and TransactionLocks disagree about {name}"
        );
        if let Some(e) = self.resources.get(name) {
            if e.is_empty_and_idle() {
                self.resources.remove(name);
            }
        }
        removed_from_entry || removed_from_index
    }
}

/// The flat, per-resource lock manager.
///
/// All table mutations happen under one process-wide mutex; a calling
/// transaction suspends only after that mutex has been released, via the
/// two-phase `prepare_to_block`/`block` protocol on its `TransactionHandle`.
pub struct LockManager<N: ResourceName, H: TransactionHandle> {
    state: Mutex<ManagerState<N, H>>,
}

impl<N: ResourceName, H: TransactionHandle> LockManager<N, H> {
    /// Creates an empty lock manager.
    pub fn new() -> Self {
        Self { state: Mutex::new(ManagerState::new()) }
    }

    /// Adds a new lock, granting immediately or queuing at the back of
    /// `name`'s wait queue.
    ///
    /// # Errors
    /// `DuplicateLockRequest` if `txn` already holds a lock on `name`.
    /// `InvalidLock` if `mode` is `NL`.
    pub fn acquire(&self, txn: &Arc<H>, name: N, mode: LockMode) -> LockResult<()> {
        if mode == LockMode::NL {
            tracing::warn!(txn = txn.id(), resource = %name, "acquire rejected: NL is not a grantable mode");
            return Err(LockError::invalid(txn.id(), &name, "acquire requires a non-NL mode"));
        }
        {
            let mut state = self.state.lock();
            if state.txn_lock_on(txn.id(), &name).is_some() {
                tracing::warn!(txn = txn.id(), resource = %name, "acquire rejected: txn already holds a lock here");
                return Err(LockError::duplicate(txn.id(), &name));
            }
            let grantable = {
                let entry = state.entry_mut(&name);
                entry.wait_queue.is_empty() && entry.compatible_excluding(mode, txn.id())
            };
            if grantable {
                state.grant_append(&name, mode, txn.id());
                tracing::trace!(txn = txn.id(), resource = %name, %mode, "lock granted immediately");
                return Ok(());
            }
            state.entry_mut(&name).wait_queue.push_back(LockRequest {
                txn: txn.id(),
                handle: Arc::clone(txn),
                target: Lock { resource: name.clone(), mode, txn: txn.id() },
                release_names: Vec::new(),
            });
            txn.prepare_to_block();
            tracing::trace!(txn = txn.id(), resource = %name, %mode, "lock request queued at back");
        }
        txn.block();
        Ok(())
    }

    /// Removes `txn`'s lock on `name`, then drains `name`'s wait queue.
    ///
    /// # Errors
    /// `NoLockHeld` if `txn` holds no lock on `name`.
    pub fn release(&self, txn: &Arc<H>, name: &N) -> LockResult<()> {
        let mut to_unblock = Vec::new();
        {
            let mut state = self.state.lock();
            if state.txn_lock_on(txn.id(), name).is_none() {
                tracing::warn!(txn = txn.id(), resource = %name, "release rejected: txn holds no lock here");
                return Err(LockError::no_lock_held(txn.id(), name));
            }
            state.release(name, txn.id());
            tracing::trace!(txn = txn.id(), resource = %name, "lock released");
            drain::drain_resource(&mut state, name, &mut to_unblock);
        }
        for handle in to_unblock {
            handle.unblock();
        }
        Ok(())
    }

    /// Replaces `txn`'s existing lock on `name` in place with `new_mode`,
    /// preserving acquisition order, or queues at the front if blocked.
    ///
    /// # Errors
    /// `NoLockHeld` if `txn` holds no lock on `name`. `DuplicateLockRequest`
    /// if `new_mode` equals the existing mode. `InvalidLock` if `new_mode`
    /// is `SIX` (use `acquire_and_release` instead) or does not substitute
    /// the existing mode.
    pub fn promote(&self, txn: &Arc<H>, name: &N, new_mode: LockMode) -> LockResult<()> {
        let mut blocked = false;
        {
            let mut state = self.state.lock();
            let current = state.txn_lock_on(txn.id(), name).ok_or_else(|| {
                tracing::warn!(txn = txn.id(), resource = %name, "promote rejected: txn holds no lock here");
                LockError::no_lock_held(txn.id(), name)
            })?;
            if current == new_mode {
                tracing::warn!(txn = txn.id(), resource = %name, mode = %new_mode, "promote rejected: already held");
                return Err(LockError::duplicate(txn.id(), name));
            }
            if new_mode == LockMode::SIX {
                tracing::warn!(txn = txn.id(), resource = %name, "promote rejected: SIX must go through acquire_and_release");
                return Err(LockError::invalid(txn.id(), name, SIX_VIA_PROMOTE_REASON));
            }
            if !new_mode.substitutes(current) {
                tracing::warn!(txn = txn.id(), resource = %name, from = %current, to = %new_mode, "promote rejected: not a valid substitution");
                return Err(LockError::invalid(
                    txn.id(),
                    name,
                    format!("{new_mode} does not substitute currently-held {current}"),
                ));
            }
            let compatible = state.entry_mut(name).compatible_excluding(new_mode, txn.id());
            if compatible {
                state.grant_replace(name, new_mode, txn.id());
                tracing::trace!(txn = txn.id(), resource = %name, from = %current, to = %new_mode, "promoted in place");
            } else {
                state.entry_mut(name).wait_queue.push_front(LockRequest {
                    txn: txn.id(),
                    handle: Arc::clone(txn),
                    target: Lock { resource: name.clone(), mode: new_mode, txn: txn.id() },
                    release_names: Vec::new(),
                });
                txn.prepare_to_block();
                blocked = true;
                tracing::trace!(txn = txn.id(), resource = %name, to = %new_mode, "promote queued at front");
            }
        }
        if blocked {
            txn.block();
        }
        Ok(())
    }

    /// Atomically grants (or in-place promotes) `mode` on `name`, then
    /// releases every resource in `release_names` (which may include
    /// `name` itself, denoting in-place replacement rather than a true
    /// release). No other transaction ever observes an intermediate state.
    ///
    /// # Errors
    /// `NoLockHeld` if `txn` does not hold a lock on every resource in
    /// `release_names`. `DuplicateLockRequest` if `txn` already holds
    /// `mode` on `name` and `name` is not in `release_names`.
    /// `InvalidLock` if `mode` is `NL`.
    pub fn acquire_and_release(
        &self,
        txn: &Arc<H>,
        name: N,
        mode: LockMode,
        release_names: Vec<N>,
    ) -> LockResult<()> {
        if mode == LockMode::NL {
            tracing::warn!(txn = txn.id(), resource = %name, "acquire_and_release rejected: NL is not a grantable mode");
            return Err(LockError::invalid(
                txn.id(),
                &name,
                "acquire_and_release requires a non-NL target mode",
            ));
        }
        let mut to_unblock = Vec::new();
        let mut blocked = false;
        {
            let mut state = self.state.lock();
            for r in &release_names {
                if state.txn_lock_on(txn.id(), r).is_none() {
                    tracing::warn!(txn = txn.id(), resource = %name, missing = %r, "acquire_and_release rejected: txn holds no lock on a release_names entry");
                    return Err(LockError::no_lock_held(txn.id(), r));
                }
            }
            let existing = state.txn_lock_on(txn.id(), &name);
            if let Some(current) = existing {
                if current == mode && !release_names.contains(&name) {
                    tracing::warn!(txn = txn.id(), resource = %name, mode = %mode, "acquire_and_release rejected: already held outside release_names");
                    return Err(LockError::duplicate(txn.id(), &name));
                }
            }
            let compatible = state.entry_mut(&name).compatible_excluding(mode, txn.id());
            if compatible {
                if existing.is_some() {
                    state.grant_replace(&name, mode, txn.id());
                } else {
                    state.grant_append(&name, mode, txn.id());
                }
                tracing::trace!(txn = txn.id(), resource = %name, %mode, "acquire_and_release granted immediately");
                let mut names = release_names;
                names.sort();
                for r in names {
                    if r == name {
                        continue;
                    }
                    if state.release(&r, txn.id()) {
                        drain::drain_resource(&mut state, &r, &mut to_unblock);
                    }
                }
            } else {
                state.entry_mut(&name).wait_queue.push_front(LockRequest {
                    txn: txn.id(),
                    handle: Arc::clone(txn),
                    target: Lock { resource: name.clone(), mode, txn: txn.id() },
                    release_names,
                });
                txn.prepare_to_block();
                blocked = true;
                tracing::trace!(txn = txn.id(), resource = %name, %mode, "acquire_and_release queued at front");
            }
        }
        for handle in to_unblock {
            handle.unblock();
        }
        if blocked {
            txn.block();
        }
        Ok(())
    }

    /// The mode `txn` holds on `name`, or `NL` if none.
    pub fn get_lock_type(&self, txn: TransactionId, name: &N) -> LockMode {
        self.state.lock().txn_lock_on(txn, name).unwrap_or(LockMode::NL)
    }

    /// A snapshot of every lock currently granted on `name`, in
    /// acquisition order.
    pub fn get_locks_on(&self, name: &N) -> Vec<(TransactionId, LockMode)> {
        self.state
            .lock()
            .resources
            .get(name)
            .map(|e| e.granted.iter().map(|l| (l.txn, l.mode)).collect())
            .unwrap_or_default()
    }

    /// A snapshot of every lock `txn` currently holds, in acquisition
    /// order.
    pub fn get_locks_of(&self, txn: TransactionId) -> Vec<(N, LockMode)> {
        self.state
            .lock()
            .transaction_locks
            .get(&txn)
            .map(|locks| locks.iter().map(|l| (l.resource.clone(), l.mode)).collect())
            .unwrap_or_default()
    }

    /// True iff any transaction holds a lock on `name`.
    pub fn is_locked(&self, name: &N) -> bool {
        self.state.lock().resources.get(name).map(|e| !e.granted.is_empty()).unwrap_or(false)
    }

    /// The number of resources with at least one granted lock or waiter.
    pub fn resource_count(&self) -> usize {
        self.state.lock().resources.len()
    }
}

impl<N: ResourceName, H: TransactionHandle> Default for LockManager<N, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: ResourceName, H: TransactionHandle> fmt::Debug for LockManager<N, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager").field("resource_count", &self.resource_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::testing::TestHandle;
    use crate::resource::PathName;
    use std::thread;
    use std::time::Duration;

    fn db() -> PathName {
        PathName::root("database")
    }

    fn txn(id: u64) -> Arc<TestHandle> {
        Arc::new(TestHandle::new(id))
    }

    #[test]
    fn acquire_then_release_is_a_round_trip() {
        let mgr: LockManager<PathName, TestHandle> = LockManager::new();
        let t1 = txn(1);
        let a = db().child("a");
        mgr.acquire(&t1, a.clone(), LockMode::S).unwrap();
        assert_eq!(mgr.get_lock_type(1, &a), LockMode::S);
        mgr.release(&t1, &a).unwrap();
        assert_eq!(mgr.get_lock_type(1, &a), LockMode::NL);
        assert_eq!(mgr.resource_count(), 0);
    }

    #[test]
    fn duplicate_acquire_rejected() {
        let mgr: LockManager<PathName, TestHandle> = LockManager::new();
        let t1 = txn(1);
        let a = db().child("a");
        mgr.acquire(&t1, a.clone(), LockMode::S).unwrap();
        let err = mgr.acquire(&t1, a.clone(), LockMode::S).unwrap_err();
        assert!(matches!(err, LockError::DuplicateLockRequest { .. }));
    }

    #[test]
    fn release_without_holding_rejected() {
        let mgr: LockManager<PathName, TestHandle> = LockManager::new();
        let t1 = txn(1);
        let a = db().child("a");
        let err = mgr.release(&t1, &a).unwrap_err();
        assert!(matches!(err, LockError::NoLockHeld { .. }));
    }

    #[test]
    fn compatible_shared_locks_both_granted() {
        let mgr: LockManager<PathName, TestHandle> = LockManager::new();
        let a = db().child("a");
        let (t1, t2) = (txn(1), txn(2));
        mgr.acquire(&t1, a.clone(), LockMode::S).unwrap();
        mgr.acquire(&t2, a.clone(), LockMode::S).unwrap();
        let mut holders = mgr.get_locks_on(&a);
        holders.sort();
        assert_eq!(holders, vec![(1, LockMode::S), (2, LockMode::S)]);
    }

    #[test]
    fn promote_preserves_acquisition_order() {
        let mgr: LockManager<PathName, TestHandle> = LockManager::new();
        let t1 = txn(1);
        let a = db().child("a");
        let b = db().child("b");
        mgr.acquire(&t1, a.clone(), LockMode::S).unwrap();
        mgr.acquire(&t1, b.clone(), LockMode::X).unwrap();
        mgr.promote(&t1, &a, LockMode::X).unwrap();
        assert_eq!(mgr.get_locks_of(1), vec![(a, LockMode::X), (b, LockMode::X)]);
    }

    #[test]
    fn promote_to_equal_mode_is_duplicate() {
        let mgr: LockManager<PathName, TestHandle> = LockManager::new();
        let t1 = txn(1);
        let a = db().child("a");
        mgr.acquire(&t1, a.clone(), LockMode::S).unwrap();
        let err = mgr.promote(&t1, &a, LockMode::S).unwrap_err();
        assert!(matches!(err, LockError::DuplicateLockRequest { .. }));
    }

    #[test]
    fn promote_to_six_rejected() {
        let mgr: LockManager<PathName, TestHandle> = LockManager::new();
        let t1 = txn(1);
        let a = db().child("a");
        mgr.acquire(&t1, a.clone(), LockMode::IX).unwrap();
        let err = mgr.promote(&t1, &a, LockMode::SIX).unwrap_err();
        assert!(matches!(err, LockError::InvalidLock { .. }));
    }

    #[test]
    fn promote_non_substitutable_rejected() {
        let mgr: LockManager<PathName, TestHandle> = LockManager::new();
        let t1 = txn(1);
        let a = db().child("a");
        mgr.acquire(&t1, a.clone(), LockMode::X).unwrap();
        let err = mgr.promote(&t1, &a, LockMode::S).unwrap_err();
        assert!(matches!(err, LockError::InvalidLock { .. }));
    }

    #[test]
    fn acquire_and_release_is_atomic_from_readers_view() {
        let mgr: LockManager<PathName, TestHandle> = LockManager::new();
        let t1 = txn(1);
        let dbc = db();
        let table = dbc.child("table");
        let p1 = table.child("p1");
        let p2 = table.child("p2");
        mgr.acquire(&t1, dbc.clone(), LockMode::IX).unwrap();
        mgr.acquire(&t1, table.clone(), LockMode::IX).unwrap();
        mgr.acquire(&t1, p1.clone(), LockMode::X).unwrap();
        mgr.acquire(&t1, p2.clone(), LockMode::X).unwrap();

        mgr.acquire_and_release(
            &t1,
            table.clone(),
            LockMode::X,
            vec![table.clone(), p1.clone(), p2.clone()],
        )
        .unwrap();

        assert_eq!(mgr.get_lock_type(1, &table), LockMode::X);
        assert_eq!(mgr.get_lock_type(1, &p1), LockMode::NL);
        assert_eq!(mgr.get_lock_type(1, &p2), LockMode::NL);
    }

    #[test]
    fn queue_head_x_blocks_compatible_tail() {
        // A queued X at the head of the wait queue must block even a
        // later request that would have been compatible with the
        // currently granted holder.
        crate::init_test_tracing();
        let mgr: Arc<LockManager<PathName, TestHandle>> = Arc::new(LockManager::new());
        let a = db().child("a");
        let t1 = txn(1);
        mgr.acquire(&t1, a.clone(), LockMode::S).unwrap();

        let mgr2 = Arc::clone(&mgr);
        let a2 = a.clone();
        let t2 = txn(2);
        let t2_clone = Arc::clone(&t2);
        let h2 = thread::spawn(move || {
            mgr2.acquire(&t2_clone, a2, LockMode::X).unwrap();
        });

        // Give T2 a chance to enqueue before T3 arrives.
        thread::sleep(Duration::from_millis(50));

        let mgr3 = Arc::clone(&mgr);
        let a3 = a.clone();
        let t3 = txn(3);
        let t3_clone = Arc::clone(&t3);
        let h3 = thread::spawn(move || {
            mgr3.acquire(&t3_clone, a3, LockMode::S).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        // Neither T2 nor T3 granted yet; T1 still holds S alone.
        assert_eq!(mgr.get_locks_on(&a), vec![(1, LockMode::S)]);

        mgr.release(&t1, &a).unwrap();
        h2.join().unwrap();
        // T2 granted X exclusively; T3 must still be queued behind it.
        assert_eq!(mgr.get_locks_on(&a), vec![(2, LockMode::X)]);

        mgr.release(&t2, &a).unwrap();
        h3.join().unwrap();
        assert_eq!(mgr.get_locks_on(&a), vec![(3, LockMode::S)]);
    }

    #[test]
    fn starvation_guard_both_waiters_granted_together() {
        // Two shared-mode waiters queued behind an exclusive holder must
        // both be granted once it releases, since draining continues past
        // the first grant as long as the new head stays compatible.
        crate::init_test_tracing();
        let mgr: Arc<LockManager<PathName, TestHandle>> = Arc::new(LockManager::new());
        let a = db().child("a");
        let t1 = txn(1);
        mgr.acquire(&t1, a.clone(), LockMode::X).unwrap();

        let t2 = txn(2);
        let (mgr2, a2, t2c) = (Arc::clone(&mgr), a.clone(), Arc::clone(&t2));
        let h2 = thread::spawn(move || mgr2.acquire(&t2c, a2, LockMode::S).unwrap());
        thread::sleep(Duration::from_millis(50));

        let t3 = txn(3);
        let (mgr3, a3, t3c) = (Arc::clone(&mgr), a.clone(), Arc::clone(&t3));
        let h3 = thread::spawn(move || mgr3.acquire(&t3c, a3, LockMode::S).unwrap());
        thread::sleep(Duration::from_millis(50));

        mgr.release(&t1, &a).unwrap();
        h2.join().unwrap();
        h3.join().unwrap();

        let mut holders = mgr.get_locks_on(&a);
        holders.sort();
        assert_eq!(holders, vec![(2, LockMode::S), (3, LockMode::S)]);
    }
}
