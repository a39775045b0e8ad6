//! The batch controller: logical transactions that defer reaction execution
//! and unobservation checks to the outermost close.
//!
//! Every mutation path runs inside a batch (opening one on demand), so all
//! writes within an outermost batch are observed atomically: a reaction runs
//! once, after the last write, and never sees an intermediate state.

use crate::arena::on_become_unobserved;
use crate::globals::{
    batch_depth_decrement, batch_depth_increment, clear_pending_unobservations, in_batch,
    pending_unobservation_at,
};
use crate::reaction::run_pending_reactions;

/// Open a logical transaction. Must be balanced with [`end_batch`]; prefer
/// [`Transaction::run`], which balances on every exit path.
pub fn start_batch() {
    batch_depth_increment();
}

/// Close a logical transaction.
///
/// Closing the outermost batch first drains the pending reactions (FIFO),
/// then runs the became-unobserved checks for every observable whose last
/// observer left during the batch.
///
/// Panics when called without a matching [`start_batch`].
pub fn end_batch() {
    if batch_depth_decrement() == 0 {
        run_pending_reactions();
        drain_pending_unobservations();
    }
}

/// Whether a batch is currently open on this thread.
pub fn is_batching() -> bool {
    in_batch() > 0
}

/// RAII batch: opens on construction, closes on drop. While unwinding only
/// the depth is restored; no user code (reactions, hooks) runs on a
/// panicking thread.
pub(crate) struct BatchGuard {
    _priv: (),
}

impl BatchGuard {
    pub(crate) fn new() -> Self {
        start_batch();
        Self { _priv: () }
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            batch_depth_decrement();
        } else {
            end_batch();
        }
    }
}

/// A scope whose writes are observed atomically.
///
/// Reactions triggered by writes inside the scope run once, when the
/// outermost transaction closes. Transactions nest; only the outermost close
/// drains.
///
/// # Example
/// ```ignore
/// Transaction::run(|| {
///     first.set(1);
///     second.set(2);
/// }); // dependents of both run once, here
/// ```
pub struct Transaction {
    _priv: (),
}

impl Transaction {
    /// Run `f` inside a transaction, returning its result. The transaction
    /// closes on every exit path, panics included.
    pub fn run<R>(f: impl FnOnce() -> R) -> R {
        let _guard = BatchGuard::new();
        f()
    }
}

/// Walk the pending-unobservation queue by index: a became-unobserved hook
/// may queue further entries (a suspending computed unobserves its own
/// dependencies) and those must be processed in the same drain.
pub(crate) fn drain_pending_unobservations() {
    let mut i = 0;
    while let Some(obs) = pending_unobservation_at(i) {
        i += 1;
        obs.clear_pending_unobservation();
        if !obs.has_observers() {
            on_become_unobserved(obs);
        }
    }
    clear_pending_unobservations();
}
