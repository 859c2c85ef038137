//! A multigranularity lock manager for a transactional storage engine.
//!
//! Two layers, stacked:
//!
//! | Layer | Type | Responsibility |
//! |---|---|---|
//! | Flat manager | [`LockManager`] | Conflict detection, granting, FIFO blocking, queue draining; one resource at a time, no notion of a tree. |
//! | Multigranularity coordinator | [`LockContext`] | Parent-intent and no-redundancy invariants, escalation, SIX promotion, organized as a tree of contexts mirroring the resource hierarchy. |
//! | Declarative facade | [`ensure_sufficient_lock_held`] | Given a context and a request mode, perform whatever acquire/promote/escalate sequence is necessary and sufficient. |
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ ensure_sufficient_lock_held(ctx, txn, mode)                 │
//! │   walks ctx's ancestors, then ctx itself                    │
//! └───────────────────────────┬──────────────────────────────--─┘
//!                              │ acquire / promote / escalate
//! ┌───────────────────────────▼──────────────────────────────--─┐
//! │ LockContext tree (one node per resource)                     │
//! │   parent-intent, no-redundancy, readonly,                    │
//! │   per-transaction child-lock counts                          │
//! └───────────────────────────┬──────────────────────────────--─┘
//!                              │ acquire / release / promote /
//!                              │ acquire_and_release
//! ┌───────────────────────────▼──────────────────────────────--─┐
//! │ LockManager (single mutex, one entry per resource)            │
//! │   granted-lock set + FIFO wait queue per resource              │
//! └───────────────────────────────────────────────────────────-─┘
//! ```
//!
//! The core has no opinion on what a resource or a transaction *is*: both
//! are supplied by the host via the [`ResourceName`] and [`TransactionHandle`]
//! traits. There is no deadlock detection, timeout, or fairness policy beyond
//! FIFO; those remain host concerns.

pub mod context;
pub mod error;
pub mod handle;
pub mod manager;
pub mod mode;
pub mod resource;
pub mod util;

pub use context::LockContext;
pub use error::{LockError, LockResult};
pub use handle::{TransactionHandle, TransactionId};
pub use manager::LockManager;
pub use mode::LockMode;
pub use resource::{PathName, ResourceName};
pub use util::ensure_sufficient_lock_held;

#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}
