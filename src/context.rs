//! The multigranularity coordinator.
//!
//! One `LockContext` per resource, forming a tree that mirrors the
//! resource hierarchy. Every mutating operation enforces the
//! parent-intent invariant, the no-redundancy invariant, the readonly
//! flag, and maintains per-transaction child-lock counts before delegating
//! the actual table mutation to `LockManager`.
//!
//! The tree is owned by the manager; `parent` is a non-owning reference
//! (an `Arc` into a node the manager's tree already keeps alive, never a
//! back-pointer into the manager itself).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LockError, LockResult};
use crate::handle::{TransactionHandle, TransactionId};
use crate::manager::LockManager;
use crate::mode::LockMode;
use crate::resource::ResourceName;

/// One node of the multigranularity resource tree.
pub struct LockContext<N: ResourceName, H: TransactionHandle> {
    name: N,
    parent: Option<Arc<LockContext<N, H>>>,
    manager: Arc<LockManager<N, H>>,
    children: Mutex<HashMap<N, Arc<LockContext<N, H>>>>,
    num_child_locks: Mutex<HashMap<TransactionId, u32>>,
    readonly: AtomicBool,
}

impl<N: ResourceName, H: TransactionHandle> LockContext<N, H> {
    /// Creates the root context. `name` must have no parent.
    pub fn root(manager: Arc<LockManager<N, H>>, name: N) -> Arc<Self> {
        assert!(name.parent().is_none(), "root context's name must have no parent");
        Arc::new(Self {
            name,
            parent: None,
            manager,
            children: Mutex::new(HashMap::new()),
            num_child_locks: Mutex::new(HashMap::new()),
            readonly: AtomicBool::new(false),
        })
    }

    /// Looks up (lazily creating) the child context named `name`. `name`'s
    /// own `parent()` must equal this context's name.
    pub fn child(self: &Arc<Self>, name: N) -> Arc<Self> {
        debug_assert_eq!(
            name.parent().as_ref(),
            Some(&self.name),
            "child context's name must have this context as its parent"
        );
        let mut children = self.children.lock();
        children
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(Self {
                    name,
                    parent: Some(Arc::clone(self)),
                    manager: Arc::clone(&self.manager),
                    children: Mutex::new(HashMap::new()),
                    num_child_locks: Mutex::new(HashMap::new()),
                    readonly: AtomicBool::new(false),
                })
            })
            .clone()
    }

    /// This context's resource name.
    pub fn name(&self) -> &N {
        &self.name
    }

    /// This context's parent, or `None` at the root.
    pub fn parent(&self) -> Option<&Arc<LockContext<N, H>>> {
        self.parent.as_ref()
    }

    /// Sets or clears the readonly flag. While set, every mutating
    /// operation on this context fails with `UnsupportedOperation`.
    pub fn set_readonly(&self, readonly: bool) {
        self.readonly.store(readonly, Ordering::SeqCst);
    }

    /// Whether this context is currently readonly.
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::SeqCst)
    }

    /// The mode `txn` holds directly on this resource, or `NL`.
    pub fn get_explicit_lock_type(&self, txn: TransactionId) -> LockMode {
        self.manager.get_lock_type(txn, &self.name)
    }

    /// The mode `txn` effectively has here, considering ancestors: the
    /// most permissive of the explicit mode here and, for each ancestor,
    /// the descendant-projection of that ancestor's mode (S→S, X→X,
    /// SIX→S, IS/IX→NL).
    pub fn get_effective_lock_type(&self, txn: TransactionId) -> LockMode {
        let mut strongest = self.get_explicit_lock_type(txn);
        let mut current = self.parent.clone();
        while let Some(ctx) = current {
            let projected = project_for_descendant(ctx.get_explicit_lock_type(txn));
            strongest = more_permissive(strongest, projected);
            current = ctx.parent.clone();
        }
        strongest
    }

    /// Acquires `mode` for `txn` on this context, enforcing the
    /// parent-intent, no-redundancy, and readonly invariants, and updating
    /// ancestor child-lock counts.
    pub fn acquire(self: &Arc<Self>, txn: &Arc<H>, mode: LockMode) -> LockResult<()> {
        if self.is_readonly() {
            tracing::warn!(txn = txn.id(), resource = %self.name, "acquire rejected: context is readonly");
            return Err(LockError::unsupported(&self.name, "acquire"));
        }
        if matches!(mode, LockMode::S | LockMode::IS) && self.ancestor_grants_read(txn.id()) {
            tracing::warn!(txn = txn.id(), resource = %self.name, %mode, "acquire rejected: redundant under an ancestor holding S or SIX");
            return Err(LockError::invalid(
                txn.id(),
                &self.name,
                "redundant: an ancestor already holds S or SIX",
            ));
        }
        if let Some(parent) = &self.parent {
            let parent_mode = parent.get_explicit_lock_type(txn.id());
            if !parent_mode.can_be_parent_lock(mode) {
                tracing::warn!(
                    txn = txn.id(),
                    resource = %self.name,
                    parent = %parent.name,
                    parent_mode = %parent_mode,
                    %mode,
                    "acquire rejected: parent-intent invariant not satisfied"
                );
                return Err(LockError::invalid(
                    txn.id(),
                    &self.name,
                    format!("parent '{}' holds {parent_mode}, insufficient for child mode {mode}", parent.name),
                ));
            }
        }
        let had_lock_before = self.get_explicit_lock_type(txn.id()) != LockMode::NL;
        self.manager.acquire(txn, self.name.clone(), mode)?;
        if !had_lock_before {
            Self::bump_ancestor_child_counts(self, txn.id(), 1);
        }
        tracing::debug!(txn = txn.id(), resource = %self.name, %mode, "context acquire granted");
        Ok(())
    }

    /// Releases `txn`'s lock here. Refuses (children-first rule) if `txn`
    /// still holds any non-NL lock on a descendant of this context.
    pub fn release(self: &Arc<Self>, txn: &Arc<H>) -> LockResult<()> {
        if self.is_readonly() {
            tracing::warn!(txn = txn.id(), resource = %self.name, "release rejected: context is readonly");
            return Err(LockError::unsupported(&self.name, "release"));
        }
        if self.num_child_locks.lock().get(&txn.id()).copied().unwrap_or(0) > 0 {
            tracing::warn!(txn = txn.id(), resource = %self.name, "release rejected: descendant locks still held");
            return Err(LockError::invalid(
                txn.id(),
                &self.name,
                "descendant locks must be released first",
            ));
        }
        self.manager.release(txn, &self.name)?;
        Self::bump_ancestor_child_counts(self, txn.id(), -1);
        tracing::debug!(txn = txn.id(), resource = %self.name, "context release complete");
        Ok(())
    }

    /// Promotes `txn`'s lock here to `new_mode`. A target of `SIX` takes a
    /// dedicated atomic path that drops every S/IS lock `txn` holds in this
    /// subtree; any other target is a plain manager promote.
    pub fn promote(self: &Arc<Self>, txn: &Arc<H>, new_mode: LockMode) -> LockResult<()> {
        if self.is_readonly() {
            tracing::warn!(txn = txn.id(), resource = %self.name, "promote rejected: context is readonly");
            return Err(LockError::unsupported(&self.name, "promote"));
        }
        if new_mode != LockMode::SIX {
            return self.manager.promote(txn, &self.name, new_mode);
        }
        if self.ancestor_holds_six(txn.id()) {
            tracing::warn!(txn = txn.id(), resource = %self.name, "promote to SIX rejected: an ancestor already holds SIX");
            return Err(LockError::invalid(
                txn.id(),
                &self.name,
                "an ancestor already holds SIX; SIX here would be redundant",
            ));
        }
        self.atomic_replace(txn, LockMode::SIX, |m| matches!(m, LockMode::S | LockMode::IS))
    }

    /// Coarsens every lock `txn` holds in this subtree into a single S or
    /// X on this context.
    pub fn escalate(self: &Arc<Self>, txn: &Arc<H>) -> LockResult<()> {
        let explicit = self.get_explicit_lock_type(txn.id());
        if explicit == LockMode::NL {
            tracing::warn!(txn = txn.id(), resource = %self.name, "escalate rejected: txn holds no explicit lock here");
            return Err(LockError::no_lock_held(txn.id(), &self.name));
        }
        if self.is_readonly() {
            tracing::warn!(txn = txn.id(), resource = %self.name, "escalate rejected: context is readonly");
            return Err(LockError::unsupported(&self.name, "escalate"));
        }
        let mut descendants = Vec::new();
        self.collect_descendants(txn.id(), &|m| m != LockMode::NL, &mut descendants);
        if descendants.is_empty() && matches!(explicit, LockMode::S | LockMode::X) {
            tracing::debug!(txn = txn.id(), resource = %self.name, "escalate is a no-op: already coarse with no descendant locks");
            return Ok(());
        }
        let needs_x = matches!(explicit, LockMode::IX | LockMode::SIX | LockMode::X)
            || descendants
                .iter()
                .any(|d| matches!(d.get_explicit_lock_type(txn.id()), LockMode::IX | LockMode::SIX | LockMode::X));
        let target = if needs_x { LockMode::X } else { LockMode::S };
        tracing::debug!(txn = txn.id(), resource = %self.name, %target, descendants = descendants.len(), "escalating subtree");
        self.atomic_replace(txn, target, |m| m != LockMode::NL)
    }

    /// Forces a coarsening to exactly `target`, used by `LockUtil` when it
    /// already knows the necessary target mode (e.g. upgrading an intent
    /// lock straight into `X`) rather than letting `escalate` derive one.
    pub(crate) fn coarsen_to(self: &Arc<Self>, txn: &Arc<H>, target: LockMode) -> LockResult<()> {
        self.atomic_replace(txn, target, |m| m != LockMode::NL)
    }

    fn atomic_replace<F: Fn(LockMode) -> bool>(
        self: &Arc<Self>,
        txn: &Arc<H>,
        target: LockMode,
        pred: F,
    ) -> LockResult<()> {
        if self.is_readonly() {
            return Err(LockError::unsupported(&self.name, "promote"));
        }
        let mut descendants = Vec::new();
        self.collect_descendants(txn.id(), &pred, &mut descendants);
        let mut release_names: Vec<N> = descendants.iter().map(|d| d.name.clone()).collect();
        release_names.push(self.name.clone());
        self.manager.acquire_and_release(txn, self.name.clone(), target, release_names)?;
        for d in &descendants {
            Self::bump_ancestor_child_counts(d, txn.id(), -1);
        }
        tracing::trace!(
            txn = txn.id(),
            resource = %self.name,
            %target,
            dropped = descendants.len(),
            "coarsened subtree"
        );
        Ok(())
    }

    /// Collects every materialized descendant context (at any depth) for
    /// which `txn`'s explicit lock satisfies `pred`. Only materialized
    /// contexts can hold a lock at all, so this is exhaustive.
    fn collect_descendants<F: Fn(LockMode) -> bool>(
        self: &Arc<Self>,
        txn: TransactionId,
        pred: &F,
        out: &mut Vec<Arc<Self>>,
    ) {
        let snapshot: Vec<Arc<Self>> = self.children.lock().values().cloned().collect();
        for child in snapshot {
            if pred(child.get_explicit_lock_type(txn)) {
                out.push(Arc::clone(&child));
            }
            child.collect_descendants(txn, pred, out);
        }
    }

    /// True iff some ancestor of `self` holds S or SIX for `txn` (the
    /// no-redundancy invariant for S/IS acquisition).
    fn ancestor_grants_read(&self, txn: TransactionId) -> bool {
        let mut current = self.parent.clone();
        while let Some(ctx) = current {
            if matches!(ctx.get_explicit_lock_type(txn), LockMode::S | LockMode::SIX) {
                return true;
            }
            current = ctx.parent.clone();
        }
        false
    }

    /// True iff some ancestor of `self` holds SIX for `txn` (the
    /// no-redundancy invariant's carve-out for SIX promotion).
    fn ancestor_holds_six(&self, txn: TransactionId) -> bool {
        let mut current = self.parent.clone();
        while let Some(ctx) = current {
            if ctx.get_explicit_lock_type(txn) == LockMode::SIX {
                return true;
            }
            current = ctx.parent.clone();
        }
        false
    }

    /// Walks `node`'s ancestor chain, bumping each ancestor's
    /// `num_child_locks[txn]` by `delta`. Called with `node = self`
    /// when `self`'s own explicit lock transitions to/from `NL`, and with
    /// `node` = a released descendant when a coarsening operation drops
    /// its lock out from under it.
    fn bump_ancestor_child_counts(node: &Arc<Self>, txn: TransactionId, delta: i32) {
        let mut current = node.parent.clone();
        while let Some(ctx) = current {
            let mut counts = ctx.num_child_locks.lock();
            let count = counts.entry(txn).or_insert(0);
            if delta >= 0 {
                *count += delta as u32;
            } else {
                *count = count.saturating_sub((-delta) as u32);
                if *count == 0 {
                    counts.remove(&txn);
                }
            }
            drop(counts);
            current = ctx.parent.clone();
        }
    }
}

impl<N: ResourceName, H: TransactionHandle> fmt::Debug for LockContext<N, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockContext")
            .field("name", &self.name.to_string())
            .field("readonly", &self.is_readonly())
            .finish()
    }
}

fn project_for_descendant(ancestor_mode: LockMode) -> LockMode {
    match ancestor_mode {
        LockMode::S => LockMode::S,
        LockMode::X => LockMode::X,
        LockMode::SIX => LockMode::S,
        LockMode::IS | LockMode::IX | LockMode::NL => LockMode::NL,
    }
}

/// Combines two effective-lock candidates into whichever is more
/// permissive. Prefers the substitutability relation; falls back to a
/// total rank ordering for pairs substitutability leaves incomparable,
/// which a tree respecting the parent-intent and no-redundancy invariants
/// should never actually produce.
fn more_permissive(a: LockMode, b: LockMode) -> LockMode {
    if a.substitutes(b) {
        a
    } else if b.substitutes(a) {
        b
    } else if a.rank() >= b.rank() {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::testing::TestHandle;
    use crate::resource::PathName;

    type Ctx = LockContext<PathName, TestHandle>;

    fn setup() -> (Arc<LockManager<PathName, TestHandle>>, Arc<Ctx>) {
        let mgr = Arc::new(LockManager::new());
        let root = LockContext::root(Arc::clone(&mgr), PathName::root("database"));
        (mgr, root)
    }

    fn txn(id: u64) -> Arc<TestHandle> {
        Arc::new(TestHandle::new(id))
    }

    #[test]
    fn acquire_on_root_then_release_round_trips() {
        let (_mgr, root) = setup();
        let t1 = txn(1);
        root.acquire(&t1, LockMode::S).unwrap();
        assert_eq!(root.get_explicit_lock_type(1), LockMode::S);
        root.release(&t1).unwrap();
        assert_eq!(root.get_explicit_lock_type(1), LockMode::NL);
    }

    #[test]
    fn child_acquire_requires_parent_intent() {
        let (_mgr, root) = setup();
        let table = root.child(root.name().child("accounts"));
        let t1 = txn(1);
        let err = table.acquire(&t1, LockMode::X).unwrap_err();
        assert!(matches!(err, LockError::InvalidLock { .. }));

        root.acquire(&t1, LockMode::IX).unwrap();
        table.acquire(&t1, LockMode::X).unwrap();
        assert_eq!(table.get_explicit_lock_type(1), LockMode::X);
    }

    #[test]
    fn release_blocked_by_descendant_lock() {
        let (_mgr, root) = setup();
        let table = root.child(root.name().child("accounts"));
        let t1 = txn(1);
        root.acquire(&t1, LockMode::IX).unwrap();
        table.acquire(&t1, LockMode::X).unwrap();

        let err = root.release(&t1).unwrap_err();
        assert!(matches!(err, LockError::InvalidLock { .. }));

        table.release(&t1).unwrap();
        root.release(&t1).unwrap();
    }

    #[test]
    fn escalation_collapses_subtree_into_single_x() {
        let (_mgr, root) = setup();
        let table = root.child(root.name().child("table"));
        let p1 = table.child(table.name().child("p1"));
        let p2 = table.child(table.name().child("p2"));
        let p3 = table.child(table.name().child("p3"));
        let t1 = txn(1);

        root.acquire(&t1, LockMode::IX).unwrap();
        table.acquire(&t1, LockMode::IX).unwrap();
        p1.acquire(&t1, LockMode::X).unwrap();
        p2.acquire(&t1, LockMode::X).unwrap();
        p3.acquire(&t1, LockMode::S).unwrap();

        table.escalate(&t1).unwrap();

        assert_eq!(table.get_explicit_lock_type(1), LockMode::X);
        assert_eq!(p1.get_explicit_lock_type(1), LockMode::NL);
        assert_eq!(p2.get_explicit_lock_type(1), LockMode::NL);
        assert_eq!(p3.get_explicit_lock_type(1), LockMode::NL);
    }

    #[test]
    fn redundant_s_below_six_ancestor_rejected() {
        let (_mgr, root) = setup();
        let table = root.child(root.name().child("table"));
        let row = table.child(table.name().child("row1"));
        let t1 = txn(1);

        root.acquire(&t1, LockMode::IX).unwrap();
        table.acquire(&t1, LockMode::IX).unwrap();
        table.promote(&t1, LockMode::SIX).unwrap();

        let err = row.acquire(&t1, LockMode::S).unwrap_err();
        assert!(matches!(err, LockError::InvalidLock { .. }));
    }

    #[test]
    fn effective_lock_type_projects_through_ancestors() {
        let (_mgr, root) = setup();
        let table = root.child(root.name().child("table"));
        let row = table.child(table.name().child("row1"));
        let t1 = txn(1);

        root.acquire(&t1, LockMode::IS).unwrap();
        table.acquire(&t1, LockMode::S).unwrap();
        assert_eq!(row.get_effective_lock_type(1), LockMode::S);
        assert_eq!(row.get_explicit_lock_type(1), LockMode::NL);
    }

    #[test]
    fn promote_on_readonly_context_rejected_even_for_non_six_target() {
        let (_mgr, root) = setup();
        let t1 = txn(1);
        root.acquire(&t1, LockMode::S).unwrap();

        root.set_readonly(true);
        let err = root.promote(&t1, LockMode::X).unwrap_err();
        assert!(matches!(err, LockError::UnsupportedOperation { .. }));

        root.set_readonly(false);
        root.promote(&t1, LockMode::X).unwrap();
        assert_eq!(root.get_explicit_lock_type(1), LockMode::X);
    }
}
