//! A declarative facade: given a context and a request type, perform
//! whatever acquire/promote/escalate sequence across ancestors and locally
//! is necessary and sufficient, choosing the least permissive legal outcome
//! at each step.

use std::sync::Arc;

use crate::context::LockContext;
use crate::error::LockResult;
use crate::handle::TransactionHandle;
use crate::mode::LockMode;
use crate::resource::ResourceName;

/// Ensures `txn` holds at least `request_type` on `ctx`, acquiring,
/// promoting, or escalating ancestors and `ctx` itself as needed.
/// Idempotent: a second call with the same `request_type` is a no-op.
///
/// `request_type` must be `S` or `X` (or `NL`, for which this is always a
/// no-op). An intent mode is never requested directly: intent is implied
/// along the ancestor chain automatically.
pub fn ensure_sufficient_lock_held<N, H>(
    ctx: &Arc<LockContext<N, H>>,
    txn: &Arc<H>,
    request_type: LockMode,
) -> LockResult<()>
where
    N: ResourceName,
    H: TransactionHandle,
{
    if request_type == LockMode::NL {
        return Ok(());
    }
    if already_sufficient(ctx, txn, request_type) {
        return Ok(());
    }
    if let Some(parent) = ctx.parent() {
        ensure_ancestor(parent, txn, request_type.parent_mode())?;
    }
    local_action(ctx, txn, request_type)
}

/// The ancestor-pass counterpart of `ensure_sufficient_lock_held`: ensures
/// `ctx` itself holds at least `needed`, which is always `IS`, `IX`, or `NL`
/// since `parent_mode` never produces anything else.
fn ensure_ancestor<N, H>(ctx: &Arc<LockContext<N, H>>, txn: &Arc<H>, needed: LockMode) -> LockResult<()>
where
    N: ResourceName,
    H: TransactionHandle,
{
    if needed == LockMode::NL || already_sufficient(ctx, txn, needed) {
        return Ok(());
    }
    if let Some(parent) = ctx.parent() {
        ensure_ancestor(parent, txn, needed.parent_mode())?;
    }
    local_action(ctx, txn, needed)
}

fn already_sufficient<N, H>(ctx: &Arc<LockContext<N, H>>, txn: &Arc<H>, needed: LockMode) -> bool
where
    N: ResourceName,
    H: TransactionHandle,
{
    ctx.get_effective_lock_type(txn.id()).substitutes(needed)
        || ctx.get_explicit_lock_type(txn.id()).substitutes(needed)
}

/// The local-action decision tree, shared between the top-level call
/// (acting on `ctx` with `needed = request_type`) and `ensure_ancestor`
/// (acting on an ancestor with `needed` derived via `parent_mode`).
fn local_action<N, H>(ctx: &Arc<LockContext<N, H>>, txn: &Arc<H>, needed: LockMode) -> LockResult<()>
where
    N: ResourceName,
    H: TransactionHandle,
{
    let explicit = ctx.get_explicit_lock_type(txn.id());
    if explicit == LockMode::IX && needed == LockMode::S {
        return ctx.promote(txn, LockMode::SIX);
    }
    if explicit.is_intent() {
        return if needed == LockMode::X {
            // Upgrading an intent lock straight into X is a forced
            // coarsening, not a manager-level promote: X does not
            // substitute any of IS/IX/SIX under this crate's
            // substitutability relation, so the only atomic path is the
            // same one `escalate` uses, with the target fixed at X.
            ctx.coarsen_to(txn, LockMode::X)
        } else {
            ctx.escalate(txn)
        };
    }
    if explicit == LockMode::NL {
        return ctx.acquire(txn, needed);
    }
    if explicit == LockMode::S && needed == LockMode::IX {
        // Reachable from the ancestor pass: a transaction already holding
        // plain S on this context (e.g. a prior read) later needs an
        // intent-exclusive presence here to write a descendant. IX does
        // not substitute S (nor vice versa), so a plain promote would be
        // rejected; SIX is the only mode that covers both rights at once.
        return ctx.promote(txn, LockMode::SIX);
    }
    // explicit is S or X and didn't already substitute `needed` (checked by
    // the caller); the only reachable case left is S held, X needed.
    ctx.promote(txn, needed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::testing::TestHandle;
    use crate::manager::LockManager;
    use crate::resource::PathName;

    type Ctx = LockContext<PathName, TestHandle>;

    fn setup() -> Arc<Ctx> {
        let mgr = Arc::new(LockManager::new());
        LockContext::root(mgr, PathName::root("database"))
    }

    fn txn(id: u64) -> Arc<TestHandle> {
        Arc::new(TestHandle::new(id))
    }

    #[test]
    fn acquires_from_scratch_through_ancestors() {
        let root = setup();
        let table = root.child(root.name().child("accounts"));
        let row = table.child(table.name().child("row1"));
        let t1 = txn(1);

        ensure_sufficient_lock_held(&row, &t1, LockMode::X).unwrap();

        assert_eq!(root.get_explicit_lock_type(1), LockMode::IX);
        assert_eq!(table.get_explicit_lock_type(1), LockMode::IX);
        assert_eq!(row.get_explicit_lock_type(1), LockMode::X);
    }

    #[test]
    fn second_call_is_a_no_op() {
        let root = setup();
        let table = root.child(root.name().child("accounts"));
        let t1 = txn(1);

        ensure_sufficient_lock_held(&table, &t1, LockMode::S).unwrap();
        let before = table.get_explicit_lock_type(1);
        ensure_sufficient_lock_held(&table, &t1, LockMode::S).unwrap();
        assert_eq!(table.get_explicit_lock_type(1), before);
    }

    #[test]
    fn ix_then_s_upgrades_to_six_leaving_ancestors_untouched() {
        let root = setup();
        let table = root.child(root.name().child("accounts"));
        let t1 = txn(1);

        root.acquire(&t1, LockMode::IX).unwrap();
        table.acquire(&t1, LockMode::IX).unwrap();

        ensure_sufficient_lock_held(&table, &t1, LockMode::S).unwrap();

        assert_eq!(root.get_explicit_lock_type(1), LockMode::IX);
        assert_eq!(table.get_explicit_lock_type(1), LockMode::SIX);
    }

    #[test]
    fn s_then_x_promotes_in_place() {
        let root = setup();
        let t1 = txn(1);
        ensure_sufficient_lock_held(&root, &t1, LockMode::S).unwrap();
        ensure_sufficient_lock_held(&root, &t1, LockMode::X).unwrap();
        assert_eq!(root.get_explicit_lock_type(1), LockMode::X);
    }

    #[test]
    fn ancestor_already_holding_s_upgrades_to_six_for_descendant_write() {
        let root = setup();
        let table = root.child(root.name().child("accounts"));
        let row = table.child(table.name().child("row1"));
        let t1 = txn(1);

        ensure_sufficient_lock_held(&table, &t1, LockMode::S).unwrap();
        ensure_sufficient_lock_held(&row, &t1, LockMode::X).unwrap();

        assert_eq!(table.get_explicit_lock_type(1), LockMode::SIX);
        assert_eq!(row.get_explicit_lock_type(1), LockMode::X);
    }
}
