// Ambient runtime context for one reactive runtime.
//
// The contract of transparent tracking is "reading an observable while a
// derivation is tracking establishes a dependency", which forces the tracking
// slot, the batch depth and the work queues to be ambient state. One runtime
// lives per OS thread; only the run-id counter is process-wide so that run
// ids stay globally unique even when handles migrate between threads.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::{DerivationId, ObservableId};

thread_local! {
    // Top of the tracking stack: the derivation currently recording reads.
    static TRACKING_DERIVATION: Cell<Option<DerivationId>> = const { Cell::new(None) };

    // Logical transaction depth. Reactions and unobservations drain only on
    // the 1 -> 0 transition.
    static IN_BATCH: Cell<u32> = const { Cell::new(0) };

    // Number of computed evaluations on the stack. Observed state must not be
    // mutated while this is non-zero.
    static COMPUTATION_DEPTH: Cell<u32> = const { Cell::new(0) };

    static ALLOW_STATE_CHANGES: Cell<bool> = const { Cell::new(true) };
    static STRICT_MODE: Cell<bool> = const { Cell::new(false) };

    // Reentrancy guard for the reaction drain loop.
    static IS_RUNNING_REACTIONS: Cell<bool> = const { Cell::new(false) };

    // Reactions waiting to run, FIFO in order of first scheduling.
    static PENDING_REACTIONS: RefCell<Vec<DerivationId>> = const { RefCell::new(Vec::new()) };

    // Observables whose last observer may have left; checked at batch close.
    static PENDING_UNOBSERVATIONS: RefCell<Vec<ObservableId>> = const { RefCell::new(Vec::new()) };
}

// Process-wide so a run id never repeats, whichever thread tracks.
static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh run id. Run ids start at 1; 0 means "never accessed".
pub(crate) fn next_run_id() -> u64 {
    NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// The derivation currently recording its reads, if any.
pub(crate) fn current_derivation() -> Option<DerivationId> {
    TRACKING_DERIVATION.with(Cell::get)
}

/// Replace the tracking slot, returning the previous occupant.
pub(crate) fn set_current_derivation(d: Option<DerivationId>) -> Option<DerivationId> {
    TRACKING_DERIVATION.with(|slot| slot.replace(d))
}

/// RAII guard that restores the tracking slot when dropped, panics included.
///
/// `TrackingGuard::new(None)` opens an untracked scope.
pub(crate) struct TrackingGuard {
    previous: Option<DerivationId>,
}

impl TrackingGuard {
    pub(crate) fn new(d: Option<DerivationId>) -> Self {
        Self {
            previous: set_current_derivation(d),
        }
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        set_current_derivation(self.previous);
    }
}

/// Run a closure without recording any dependencies.
///
/// Reads inside the closure do not subscribe the currently tracking
/// derivation. Use this for one-off reads inside reactions and for callbacks
/// that must not widen a dependency set.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _guard = TrackingGuard::new(None);
    f()
}

pub(crate) fn in_batch() -> u32 {
    IN_BATCH.with(Cell::get)
}

/// Bump the batch depth without any drain semantics.
pub(crate) fn batch_depth_increment() {
    IN_BATCH.with(|d| d.set(d.get() + 1));
}

/// Drop the batch depth without any drain semantics. Returns the new depth.
pub(crate) fn batch_depth_decrement() -> u32 {
    IN_BATCH.with(|d| {
        let depth = d.get();
        assert!(depth > 0, "end_batch called without a matching start_batch");
        d.set(depth - 1);
        depth - 1
    })
}

pub(crate) fn computation_depth() -> u32 {
    COMPUTATION_DEPTH.with(Cell::get)
}

/// Holds the computation depth raised by one for the guard's lifetime.
pub(crate) struct ComputationDepthGuard;

impl ComputationDepthGuard {
    pub(crate) fn new() -> Self {
        COMPUTATION_DEPTH.with(|d| d.set(d.get() + 1));
        Self
    }
}

impl Drop for ComputationDepthGuard {
    fn drop(&mut self) {
        COMPUTATION_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Run a closure with the allow-state-changes flag forced to `allowed`.
///
/// Action wrappers use this to re-enable mutation inside strict mode, and
/// test harnesses to lock mutation out of a scope entirely.
pub fn allow_state_changes<R>(allowed: bool, f: impl FnOnce() -> R) -> R {
    struct Restore(bool);
    impl Drop for Restore {
        fn drop(&mut self) {
            ALLOW_STATE_CHANGES.with(|s| s.set(self.0));
        }
    }
    let _restore = Restore(ALLOW_STATE_CHANGES.with(|s| s.replace(allowed)));
    f()
}

pub(crate) fn state_changes_allowed() -> bool {
    ALLOW_STATE_CHANGES.with(Cell::get)
}

/// Toggle strict mode for this thread's runtime.
///
/// In strict mode every mutation of observable state must happen inside an
/// [`allow_state_changes`] scope (the contract action wrappers rely on).
/// Turning strict mode on also lowers the ambient allow-state-changes flag;
/// turning it off restores it.
pub fn set_strict_mode(strict: bool) {
    STRICT_MODE.with(|s| s.set(strict));
    ALLOW_STATE_CHANGES.with(|s| s.set(!strict));
}

pub(crate) fn strict_mode() -> bool {
    STRICT_MODE.with(Cell::get)
}

pub(crate) fn is_running_reactions() -> bool {
    IS_RUNNING_REACTIONS.with(Cell::get)
}

/// Marks the reaction drain loop as active for the guard's lifetime.
pub(crate) struct RunningReactionsGuard;

impl RunningReactionsGuard {
    pub(crate) fn new() -> Self {
        IS_RUNNING_REACTIONS.with(|f| f.set(true));
        Self
    }
}

impl Drop for RunningReactionsGuard {
    fn drop(&mut self) {
        IS_RUNNING_REACTIONS.with(|f| f.set(false));
    }
}

pub(crate) fn enqueue_pending_reaction(d: DerivationId) {
    PENDING_REACTIONS.with(|q| q.borrow_mut().push(d));
}

pub(crate) fn take_pending_reactions() -> Vec<DerivationId> {
    PENDING_REACTIONS.with(|q| std::mem::take(&mut *q.borrow_mut()))
}

pub(crate) fn clear_pending_reactions() {
    PENDING_REACTIONS.with(|q| q.borrow_mut().clear());
}

pub(crate) fn remove_pending_reaction(d: DerivationId) {
    PENDING_REACTIONS.with(|q| q.borrow_mut().retain(|r| *r != d));
}

pub(crate) fn enqueue_pending_unobservation(obs: ObservableId) {
    PENDING_UNOBSERVATIONS.with(|q| q.borrow_mut().push(obs));
}

/// Indexed access so the drain loop picks up entries appended mid-drain.
pub(crate) fn pending_unobservation_at(i: usize) -> Option<ObservableId> {
    PENDING_UNOBSERVATIONS.with(|q| q.borrow().get(i).copied())
}

pub(crate) fn clear_pending_unobservations() {
    PENDING_UNOBSERVATIONS.with(|q| q.borrow_mut().clear());
}

pub(crate) fn remove_pending_unobservation(obs: ObservableId) {
    PENDING_UNOBSERVATIONS.with(|q| q.borrow_mut().retain(|o| *o != obs));
}

/// Guard rail for writes: mutating observed state from inside a computed
/// evaluation is a bug in the caller, as is mutating outside an action scope
/// once the flag or strict mode demands one. Violations are detected before
/// any mutation happens, so the graph stays consistent.
pub(crate) fn check_state_modifications_allowed(obs: ObservableId) {
    let has_observers = obs.has_observers();
    if computation_depth() > 0 && has_observers {
        panic!(
            "computed values are not allowed to change observed state: \
             attempted to modify {} during a computation",
            obs.debug_name()
        );
    }
    if !state_changes_allowed() && (has_observers || strict_mode()) {
        panic!(
            "not allowed to change {} outside an action scope while strict \
             checks are active",
            obs.debug_name()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_guard_restores_on_panic() {
        let a = DerivationId::new(901);
        let b = DerivationId::new(902);

        set_current_derivation(Some(a));
        let result = std::panic::catch_unwind(|| {
            let _guard = TrackingGuard::new(Some(b));
            assert_eq!(current_derivation(), Some(b));
            panic!("test panic");
        });
        assert!(result.is_err());
        assert_eq!(current_derivation(), Some(a));

        set_current_derivation(None);
    }

    #[test]
    fn untracked_clears_and_restores_slot() {
        let d = DerivationId::new(903);
        set_current_derivation(Some(d));

        untracked(|| {
            assert_eq!(current_derivation(), None);
        });

        assert_eq!(current_derivation(), Some(d));
        set_current_derivation(None);
    }

    #[test]
    fn run_ids_are_strictly_increasing() {
        let a = next_run_id();
        let b = next_run_id();
        assert!(b > a);
    }

    #[test]
    #[should_panic(expected = "without a matching start_batch")]
    fn batch_depth_underflow_is_fatal() {
        batch_depth_decrement();
    }

    #[test]
    fn strict_mode_lowers_allow_state_changes() {
        assert!(state_changes_allowed());
        set_strict_mode(true);
        assert!(strict_mode());
        assert!(!state_changes_allowed());
        allow_state_changes(true, || assert!(state_changes_allowed()));
        assert!(!state_changes_allowed());
        set_strict_mode(false);
        assert!(state_changes_allowed());
    }
}
