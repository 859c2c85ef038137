//! Queue draining.
//!
//! Invoked after any state change that might have freed capacity on a
//! resource. Grants the first satisfiable request at the head of the
//! queue, repeating until the head is empty or unsatisfiable, cascading
//! into other resources' queues when a granted request's `release_names`
//! frees them up.

use std::sync::Arc;

use crate::handle::TransactionHandle;
use crate::resource::ResourceName;

use super::ManagerState;

pub(super) fn drain_resource<N: ResourceName, H: TransactionHandle>(
    state: &mut ManagerState<N, H>,
    name: &N,
    to_unblock: &mut Vec<Arc<H>>,
) {
    loop {
        let head_grantable = match state.resources.get(name) {
            Some(entry) => match entry.wait_queue.front() {
                Some(head) => entry.compatible_excluding(head.target.mode, head.txn),
                None => return,
            },
            None => return,
        };
        if !head_grantable {
            return;
        }

        let head = state
            .resources
            .get_mut(name)
            .and_then(|entry| entry.wait_queue.pop_front())
            .expect("head was just confirmed present");

        let already_held = state
            .resources
            .get(name)
            .map(|entry| entry.held_by(head.txn).is_some())
            .unwrap_or(false);

        if already_held {
            state.grant_replace(name, head.target.mode, head.txn);
        } else {
            state.grant_append(name, head.target.mode, head.txn);
        }
        tracing::trace!(
            txn = head.txn,
            resource = %name,
            mode = %head.target.mode,
            "drained queue entry granted"
        );

        let mut release_names = head.release_names;
        release_names.sort();
        for r in release_names {
            if r == *name {
                // This entry denotes the lock just replaced, not a
                // separate resource to un-grant.
                continue;
            }
            if state.release(&r, head.txn) {
                drain_resource(state, &r, to_unblock);
            }
        }

        to_unblock.push(head.handle);
    }
}
