//! Dependency tracking: recording reads, rebinding edges between runs, and
//! deciding when a derivation must recompute.
//!
//! The tracking primitive is [`track_derived_function`]: it runs a user
//! closure with the derivation installed in the tracking slot so every
//! observable read lands in the scratch list, then diffs that list against
//! the previous run's dependencies. Edges are only added and removed here;
//! [`report_observed`](crate::arena::report_observed) merely proposes them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::arena::{
    add_observer, on_become_stale, remove_observer, DependenciesState, DerivationId, ObservableId,
    ObservableKind,
};
use crate::globals::{
    batch_depth_decrement, batch_depth_increment, next_run_id, set_current_derivation,
    TrackingGuard,
};

/// A panic captured from a user getter or effect.
///
/// The panic is caught so graph bookkeeping can complete; a computed value
/// stores the capture in place of its value and re-raises it on every read
/// until a recomputation succeeds, a reaction routes it to its error handler.
/// The panic message is preserved (`&str` and `String` payloads; other
/// payload types are replaced with a placeholder).
#[derive(Clone, Debug)]
pub struct CaughtPanic {
    message: Arc<str>,
}

impl CaughtPanic {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message: Arc<str> = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).into()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str().into()
        } else {
            "panic payload of unknown type".into()
        };
        Self { message }
    }

    /// The captured panic message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Re-raise the captured panic.
    pub(crate) fn rethrow(&self) -> ! {
        panic!("{}", self.message)
    }
}

/// Run `f` with `d` tracking its reads, then rebind dependencies.
///
/// A panic from `f` is captured into [`CaughtPanic`] and does not escape;
/// the tracking slot is restored and the dependency diff runs regardless.
/// The batch depth is held one higher across the call so reactions scheduled
/// mid-run stay queued until the run's bookkeeping is complete.
pub(crate) fn track_derived_function<T>(
    d: DerivationId,
    f: impl FnOnce() -> T,
) -> Result<T, CaughtPanic> {
    // Enter the run with a tight staleness floor on everything observed.
    mark_dependencies_up_to_date(d);
    d.begin_new_observing(d.observing_len() + 100);
    d.set_run_id(next_run_id());

    let previous = set_current_derivation(Some(d));
    batch_depth_increment();
    let result = catch_unwind(AssertUnwindSafe(f)).map_err(CaughtPanic::from_payload);
    batch_depth_decrement();
    set_current_derivation(previous);

    bind_dependencies(d);
    result
}

/// Diff the scratch reads of the run that just ended against the previous
/// observing set, using each observable's `diff_value` as the mark bit.
///
/// Pass A dedups the scratch in place, preserving first-read order (the
/// confirmation walk relies on it). Pass B walks the old set back-to-front
/// and unlinks everything not re-read. Pass C walks the new set back-to-front
/// and links everything freshly read. All marks are back to 0 on exit.
fn bind_dependencies(d: DerivationId) {
    let mut new_observing = d.take_new_observing();

    // Pass A: first occurrence wins; also notice dependencies that went
    // stale during this very run and thus had no chance to notify us.
    let mut lowest_new_state = DependenciesState::UpToDate;
    let mut write = 0;
    for read in 0..new_observing.len() {
        let obs = new_observing[read];
        if obs.diff_value() == 0 {
            obs.set_diff_value(1);
            if write != read {
                new_observing[write] = obs;
            }
            write += 1;
        }
        if let Some(ObservableKind::Computed(dep)) = obs.kind() {
            if dep.dependencies_state() == DependenciesState::Stale {
                lowest_new_state = DependenciesState::Stale;
            }
        }
    }
    new_observing.truncate(write);

    let new_snapshot: SmallVec<[ObservableId; 8]> = SmallVec::from_slice(&new_observing);
    let previous_observing = d.replace_observing(new_observing);

    // Pass B: mark 0 means "not re-read this run".
    for &obs in previous_observing.iter().rev() {
        if obs.diff_value() == 0 {
            remove_observer(obs, d);
        }
        obs.set_diff_value(0);
    }

    // Pass C: mark still 1 means "read for the first time this run".
    for &obs in new_snapshot.iter().rev() {
        if obs.diff_value() == 1 {
            obs.set_diff_value(0);
            add_observer(obs, d);
        }
    }

    if new_snapshot.is_empty() {
        log::trace!(
            "{} finished a run without reading any observable state",
            d.debug_name()
        );
    }

    if lowest_new_state != DependenciesState::UpToDate {
        cov_mark::hit!(dependency_went_stale_mid_run);
        d.set_dependencies_state(lowest_new_state);
        on_become_stale(d);
    }
}

/// Decide whether `d` must recompute before its output can be trusted.
///
/// `UpToDate` never recomputes; `NotTracking` and `Stale` always do. For
/// `PossiblyStale` the dependencies are confirmed in first-read order: each
/// computed dependency re-derives itself, and the walk stops at the first one
/// whose confirmed change flips this derivation to `Stale`. If every
/// dependency confirms unchanged the derivation settles back to `UpToDate`
/// without recomputing.
pub(crate) fn should_compute(d: DerivationId) -> bool {
    match d.dependencies_state() {
        DependenciesState::UpToDate => false,
        DependenciesState::NotTracking | DependenciesState::Stale => true,
        DependenciesState::PossiblyStale => {
            let _untracked = TrackingGuard::new(None);
            for obs in d.observing_snapshot() {
                if let Some(ObservableKind::Computed(dep)) = obs.kind() {
                    crate::computed::recompute_and_confirm(dep);
                    if d.dependencies_state() == DependenciesState::Stale {
                        cov_mark::hit!(possibly_stale_confirmed_changed);
                        return true;
                    }
                }
            }
            cov_mark::hit!(possibly_stale_confirmed_clean);
            mark_dependencies_up_to_date(d);
            false
        }
    }
}

/// Force `d` and the staleness floors of everything it observes back to
/// `UpToDate`.
pub(crate) fn mark_dependencies_up_to_date(d: DerivationId) {
    if d.dependencies_state() == DependenciesState::UpToDate {
        return;
    }
    d.set_dependencies_state(DependenciesState::UpToDate);
    for obs in d.observing_snapshot().iter().rev() {
        obs.set_lowest_observer_state(DependenciesState::UpToDate);
    }
}

/// Unlink `d` from everything it observes and drop it to `NotTracking`.
pub(crate) fn clear_observing(d: DerivationId) {
    let observing = d.replace_observing(Vec::new());
    for &obs in observing.iter().rev() {
        remove_observer(obs, d);
    }
    d.set_dependencies_state(DependenciesState::NotTracking);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{
        derivation_arena_insert, derivation_arena_remove, observable_arena_insert,
        observable_arena_remove, report_observed, DerivationKind, DerivationMeta, ObservableMeta,
        ReactionSeat,
    };

    fn scratch_reaction() -> DerivationId {
        derivation_arena_insert(DerivationMeta::new(
            String::new(),
            DerivationKind::Reaction(ReactionSeat::new(Box::new(|| {}))),
        ))
    }

    fn scratch_atom() -> ObservableId {
        observable_arena_insert(ObservableMeta::new(String::new(), ObservableKind::Atom))
    }

    #[test]
    fn tracking_records_unique_deps_in_first_read_order() {
        let d = scratch_reaction();
        let a = scratch_atom();
        let b = scratch_atom();

        let result = track_derived_function(d, || {
            report_observed(b);
            report_observed(a);
            report_observed(b);
            report_observed(a);
            report_observed(b);
        });
        assert!(result.is_ok());

        let observing = d.observing_snapshot();
        assert_eq!(observing.as_slice(), &[b, a]);
        assert_eq!(a.observer_count(), 1);
        assert_eq!(b.observer_count(), 1);
        assert_eq!(a.diff_value(), 0);
        assert_eq!(b.diff_value(), 0);

        clear_observing(d);
        derivation_arena_remove(d);
        observable_arena_remove(a);
        observable_arena_remove(b);
    }

    #[test]
    fn rebinding_drops_edges_not_reread() {
        let d = scratch_reaction();
        let a = scratch_atom();
        let b = scratch_atom();

        track_derived_function(d, || {
            report_observed(a);
            report_observed(b);
        })
        .unwrap();
        assert_eq!(d.observing_snapshot().as_slice(), &[a, b]);

        track_derived_function(d, || {
            report_observed(b);
        })
        .unwrap();
        assert_eq!(d.observing_snapshot().as_slice(), &[b]);
        assert_eq!(a.observer_count(), 0);
        assert_eq!(b.observer_count(), 1);

        clear_observing(d);
        derivation_arena_remove(d);
        observable_arena_remove(a);
        observable_arena_remove(b);
    }

    #[test]
    fn panic_in_tracked_function_still_binds_dependencies() {
        let d = scratch_reaction();
        let a = scratch_atom();

        let result = track_derived_function(d, || {
            report_observed(a);
            panic!("boom in derivation");
        });

        let caught = result.unwrap_err();
        assert_eq!(caught.message(), "boom in derivation");
        assert_eq!(d.observing_snapshot().as_slice(), &[a]);
        assert_eq!(a.observer_count(), 1);
        assert_eq!(crate::globals::in_batch(), 0);

        clear_observing(d);
        derivation_arena_remove(d);
        observable_arena_remove(a);
    }

    #[test]
    fn clear_observing_resets_to_not_tracking() {
        let d = scratch_reaction();
        let a = scratch_atom();

        track_derived_function(d, || report_observed(a)).unwrap();
        assert_eq!(d.dependencies_state(), DependenciesState::UpToDate);

        clear_observing(d);
        assert_eq!(d.dependencies_state(), DependenciesState::NotTracking);
        assert!(d.observing_snapshot().is_empty());
        assert_eq!(a.observer_count(), 0);

        derivation_arena_remove(d);
        observable_arena_remove(a);
    }

    #[test]
    fn bidirectional_consistency_after_rebinds() {
        let d1 = scratch_reaction();
        let d2 = scratch_reaction();
        let a = scratch_atom();
        let b = scratch_atom();

        track_derived_function(d1, || {
            report_observed(a);
            report_observed(b);
        })
        .unwrap();
        track_derived_function(d2, || {
            report_observed(b);
        })
        .unwrap();

        // Every edge present from both sides.
        for (d, deps) in [(d1, vec![a, b]), (d2, vec![b])] {
            for obs in deps {
                assert!(d.observing_snapshot().contains(&obs));
                assert!(obs.observers_snapshot().contains(&d));
            }
        }
        assert_eq!(b.observer_count(), 2);

        clear_observing(d1);
        clear_observing(d2);
        derivation_arena_remove(d1);
        derivation_arena_remove(d2);
        observable_arena_remove(a);
        observable_arena_remove(b);
    }
}
