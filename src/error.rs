//! Error types surfaced by the lock manager and multigranularity coordinator.
//!
//! Every variant here is a caller-contract violation, raised synchronously
//! and before any table mutation. Internal invariant breaks (duplicate
//! holders on a resource, a context's parent-intent invariant failing under
//! normal use, etc.) are defects, not caller errors, and are reported via
//! `assert!`/`debug_assert!` at the point of detection instead of a variant
//! here.

use thiserror::Error;

use crate::handle::TransactionId;

/// Result type alias for lock-manager and multigranularity operations.
pub type LockResult<T> = std::result::Result<T, LockError>;

/// The four caller-contract-violation kinds the core can surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// A transaction requested a lock on a resource it already holds a
    /// lock on, via `acquire`, or requested `acquire_and_release` with a
    /// redundant target mode it already holds outside `release_names`.
    #[error("transaction {txn} already holds a lock on '{resource}'")]
    DuplicateLockRequest { txn: TransactionId, resource: String },

    /// A transaction tried to release, promote, or otherwise reference a
    /// lock on a resource it does not currently hold.
    #[error("transaction {txn} holds no lock on '{resource}'")]
    NoLockHeld { txn: TransactionId, resource: String },

    /// A requested mode change is not a legal promotion, or would break a
    /// multigranularity invariant the caller must satisfy first.
    #[error("invalid lock on '{resource}' for transaction {txn}: {reason}")]
    InvalidLock {
        txn: TransactionId,
        resource: String,
        reason: String,
    },

    /// A mutating operation was attempted on a context marked read-only.
    #[error("unsupported operation '{operation}' on read-only resource '{resource}'")]
    UnsupportedOperation { resource: String, operation: &'static str },
}

impl LockError {
    pub(crate) fn duplicate(txn: TransactionId, resource: impl ToString) -> Self {
        Self::DuplicateLockRequest { txn, resource: resource.to_string() }
    }

    pub(crate) fn no_lock_held(txn: TransactionId, resource: impl ToString) -> Self {
        Self::NoLockHeld { txn, resource: resource.to_string() }
    }

    pub(crate) fn invalid(txn: TransactionId, resource: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidLock { txn, resource: resource.to_string(), reason: reason.into() }
    }

    pub(crate) fn unsupported(resource: impl ToString, operation: &'static str) -> Self {
        Self::UnsupportedOperation { resource: resource.to_string(), operation }
    }
}

/// `promote` rejecting `SIX` carries a fixed reason; kept as a constant so
/// the message stays identical at both call sites (`LockManager::promote`
/// and `LockContext::promote`'s guard before delegating).
pub(crate) const SIX_VIA_PROMOTE_REASON: &str =
    "SIX cannot be granted via promote; use acquire_and_release so redundant descendant locks drop atomically";
