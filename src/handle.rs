//! The `TransactionHandle` external collaborator.
//!
//! The core never creates, schedules, or tears down transactions; it only
//! consumes a handle the host supplies for each caller. `LockManager` and
//! `LockContext` are generic over `H: TransactionHandle` so a host can plug
//! in whatever suspension primitive its scheduler already uses.

/// Numeric transaction identity, stable for the lifetime of a transaction.
pub type TransactionId = u64;

/// A host-supplied handle identifying one transaction and offering the
/// cooperative suspension primitives the lock manager needs when a request
/// cannot be granted immediately.
///
/// Implementations must obey the two-phase "prepare to block, then block"
/// discipline: `block` must observe an `unblock` that raced in between
/// `prepare_to_block` and `block` itself, rather than sleeping forever.
/// `unblock` must be idempotent once `prepare_to_block` has been called:
/// the manager may call it before the blocked thread has actually reached
/// `block`.
pub trait TransactionHandle: Send + Sync + 'static {
    /// This transaction's stable numeric identity.
    fn id(&self) -> TransactionId;

    /// Mark this transaction as about to block, while the caller still
    /// holds the lock table's mutex. Must not itself block.
    fn prepare_to_block(&self);

    /// Suspend the calling thread until `unblock` is called. Called only
    /// after the lock table's mutex has been released.
    fn block(&self);

    /// Wake a transaction suspended in (or about to enter) `block`.
    /// Idempotent: may be called once per grant, even if the target
    /// thread has not reached `block` yet.
    fn unblock(&self);
}

#[cfg(test)]
pub(crate) mod testing {
    //! A minimal `TransactionHandle` built on `parking_lot::{Mutex, Condvar}`,
    //! for use by this crate's own tests.
    use super::{TransactionHandle, TransactionId};
    use parking_lot::{Condvar, Mutex};

    pub struct TestHandle {
        id: TransactionId,
        state: Mutex<bool>,
        condvar: Condvar,
    }

    impl TestHandle {
        pub fn new(id: TransactionId) -> Self {
            Self { id, state: Mutex::new(false), condvar: Condvar::new() }
        }
    }

    impl TransactionHandle for TestHandle {
        fn id(&self) -> TransactionId {
            self.id
        }

        fn prepare_to_block(&self) {
            *self.state.lock() = false;
        }

        fn block(&self) {
            let mut woken = self.state.lock();
            while !*woken {
                self.condvar.wait(&mut woken);
            }
        }

        fn unblock(&self) {
            let mut woken = self.state.lock();
            *woken = true;
            self.condvar.notify_all();
        }
    }
}
