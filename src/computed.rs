use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::arena::derivation_arena::ComputedLink;
use crate::arena::{
    derivation_arena_insert, derivation_arena_remove, detach_observable, observable_arena_insert,
    propagate_change_confirmed, report_observed, DerivationId, DerivationKind, DerivationMeta,
    DeriveSlot, ObservableId, ObservableKind, ObservableMeta,
};
use crate::batch::BatchGuard;
use crate::derivation::{clear_observing, should_compute, track_derived_function, CaughtPanic};
use crate::globals::{in_batch, ComputationDepthGuard, TrackingGuard};

type Equals<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;
type Getter<T> = Arc<Mutex<Box<dyn FnMut() -> T + Send>>>;
type Cell<T> = Arc<RwLock<Option<Result<T, CaughtPanic>>>>;

/// Memoized, lazily recomputed derivation that is itself observable.
///
/// A computed value caches the result of its getter and recomputes only when
/// a read finds the cache stale. While it has observers it participates in
/// staleness propagation: a change in a dependency marks it possibly stale,
/// and the next read confirms dependencies in the order they were originally
/// read, recomputing only past the first real change. When its last observer
/// leaves it suspends: the dependency set is released, the cache dropped,
/// and the next read starts from scratch.
///
/// Reads outside any tracking scope, while unobserved, compute untracked and
/// do not subscribe to anything.
///
/// Change detection uses `PartialEq` unless a comparator is supplied via
/// [`ComputedValue::with_equals`]. When a recomputation produces an equal
/// value the old value is kept, so downstream observers never see the
/// non-change.
///
/// A panic in the getter is cached in place of the value and re-raised on
/// every read until a later recomputation succeeds.
///
/// # Example
/// ```ignore
/// let price = ObservableValue::new(10.0);
/// let total = ComputedValue::new({
///     let price = price.clone();
///     move || price.get() * 1.2
/// });
/// assert_eq!(total.get(), 12.0);
/// ```
pub struct ComputedValue<T> {
    observable: ObservableId,
    derivation: DerivationId,
    cell: Cell<T>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ComputedValue<T> {
    /// Create an anonymous computed value around `getter`.
    ///
    /// Nothing is computed until the first read.
    pub fn new<F>(getter: F) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self::build(String::new(), getter, Arc::new(|a: &T, b: &T| a == b))
    }

    /// Create a named computed value; the name shows up in diagnostics.
    pub fn named<F>(name: impl Into<String>, getter: F) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self::build(name.into(), getter, Arc::new(|a: &T, b: &T| a == b))
    }

    /// Create a computed value with a custom change comparator. `equals`
    /// returning true means "no change": the cached value is kept and
    /// observers are not notified.
    pub fn with_equals<F, E>(name: impl Into<String>, getter: F, equals: E) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self::build(name.into(), getter, Arc::new(equals))
    }

    fn build<F>(name: String, getter: F, equals: Equals<T>) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
    {
        let cell: Cell<T> = Arc::new(RwLock::new(None));
        let getter: Getter<T> = Arc::new(Mutex::new(Box::new(getter)));

        // The arena-side recompute step: run the getter (panics captured),
        // compare against the cache, store only on change. Type-erased so
        // the confirmation walk can drive it from a bare id.
        let derive: Box<dyn FnMut() -> bool + Send> = Box::new({
            let cell = cell.clone();
            let getter = getter.clone();
            let equals = equals.clone();
            move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    let mut f = getter.lock();
                    (*f)()
                }))
                .map_err(CaughtPanic::from_payload);
                let mut slot = cell.write();
                let changed = match (&*slot, &outcome) {
                    (Some(Ok(old)), Ok(new)) => !equals(old, new),
                    _ => true,
                };
                if changed {
                    *slot = Some(outcome);
                }
                changed
            }
        });

        let discard: Box<dyn FnMut() + Send> = Box::new({
            let cell = cell.clone();
            move || {
                *cell.write() = None;
            }
        });

        let derivation = derivation_arena_insert(DerivationMeta::new(
            name.clone(),
            DerivationKind::Computed(ComputedLink::new(derive, discard)),
        ));
        let observable = observable_arena_insert(ObservableMeta::new(
            name,
            ObservableKind::Computed(derivation),
        ));
        derivation.with(|m| {
            if let DerivationKind::Computed(link) = &m.kind {
                link.link_observable(observable);
            }
        });

        Arc::new(Self {
            observable,
            derivation,
            cell,
        })
    }

    /// Read the computed value, recomputing if the cache cannot be trusted.
    ///
    /// Inside a tracking scope this also records the dependency. A cached
    /// getter panic is re-raised here.
    pub fn get(&self) -> T {
        if self.derivation.is_computing() {
            panic!(
                "cycle detected: {} reads itself during its own computation",
                self.derivation.debug_name()
            );
        }

        if in_batch() == 0 && !self.observable.has_observers() {
            // Nobody can be notified, so don't subscribe to anything either:
            // compute untracked and stay suspended.
            if should_compute(self.derivation) {
                let _batch = BatchGuard::new();
                compute_value_untracked(self.derivation);
            }
        } else {
            report_observed(self.observable);
            if should_compute(self.derivation) && track_and_compute(self.derivation) {
                propagate_change_confirmed(self.observable);
            }
        }

        let slot = self.cell.read();
        match &*slot {
            Some(Ok(value)) => value.clone(),
            Some(Err(caught)) => {
                let caught = caught.clone();
                drop(slot);
                caught.rethrow()
            }
            None => {
                let name = self.derivation.debug_name();
                drop(slot);
                panic!("{name} has no value after recomputation (torn down mid-read?)")
            }
        }
    }

    /// The value's diagnostic name.
    pub fn name(&self) -> String {
        self.derivation.debug_name()
    }

    #[cfg(test)]
    pub(crate) fn observable_id(&self) -> ObservableId {
        self.observable
    }

    #[cfg(test)]
    pub(crate) fn derivation_id(&self) -> DerivationId {
        self.derivation
    }
}

impl<T> Drop for ComputedValue<T> {
    fn drop(&mut self) {
        // Unobserve dependencies inside a batch so their became-unobserved
        // checks run once, at the close.
        let _batch = BatchGuard::new();
        clear_observing(self.derivation);
        detach_observable(self.observable);
        derivation_arena_remove(self.derivation);
    }
}

/// Recompute `d` inside a tracking scope. Returns true when the cached value
/// changed (a captured panic always counts as a change).
pub(crate) fn track_and_compute(d: DerivationId) -> bool {
    if d.set_computing(true) {
        panic!(
            "cycle detected: {} is already computing",
            d.debug_name()
        );
    }
    let _depth = ComputationDepthGuard::new();
    let mut slot = DeriveSlot::take(d);
    let changed = track_derived_function(d, || slot.run());
    d.set_computing(false);
    // The derive step captures getter panics itself; an Err here means the
    // bookkeeping saw something unexpected, which we treat as a change.
    changed.unwrap_or(true)
}

/// Recompute `d` without tracking: no dependency is recorded and nothing is
/// notified. Used for reads of an unobserved computed outside any batch.
pub(crate) fn compute_value_untracked(d: DerivationId) {
    if d.set_computing(true) {
        panic!(
            "cycle detected: {} is already computing",
            d.debug_name()
        );
    }
    let _depth = ComputationDepthGuard::new();
    let _untracked = TrackingGuard::new(None);
    let mut slot = DeriveSlot::take(d);
    slot.run();
    d.set_computing(false);
}

/// Confirmation step of the possibly-stale walk: make `d`'s output
/// trustworthy, propagating a confirmed change to its observers.
pub(crate) fn recompute_and_confirm(d: DerivationId) {
    if !should_compute(d) {
        return;
    }
    let observable = d.with(|m| match &m.kind {
        DerivationKind::Computed(link) => Some(link.observable()),
        DerivationKind::Reaction(_) => None,
    });
    let Some(Some(observable)) = observable else {
        return;
    };
    if track_and_compute(d) {
        propagate_change_confirmed(observable);
    }
}

/// The last observer left: release the dependency set, drop the cache, and
/// fall back to `NotTracking` so the next read retracks from scratch.
pub(crate) fn suspend(d: DerivationId) {
    cov_mark::hit!(computed_suspended);
    clear_observing(d);
    d.with(|m| {
        if let DerivationKind::Computed(link) = &m.kind {
            let mut discard = link.discard.lock();
            (*discard)();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn unobserved_get_computes_untracked_and_stays_suspended() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let c = ComputedValue::new(move || {
            runs_in.fetch_add(1, Ordering::Relaxed);
            21 * 2
        });

        assert_eq!(runs.load(Ordering::Relaxed), 0);
        assert_eq!(c.get(), 42);
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // Unobserved and not tracking: still NotTracking, so the next read
        // computes again rather than trusting a cache nobody invalidates.
        assert_eq!(
            c.derivation_id().dependencies_state(),
            crate::arena::DependenciesState::NotTracking
        );
        assert_eq!(c.get(), 42);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn equal_recomputation_keeps_old_value() {
        let c = ComputedValue::new(|| vec![1, 2, 3]);
        let first = c.get();
        let second = c.get();
        assert_eq!(first, second);
    }

    #[test]
    fn custom_comparator_suppresses_change() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        // Compare only the integer part, so 1.1 -> 1.9 counts as unchanged.
        let c = ComputedValue::with_equals(
            "rounded",
            move || {
                let n = runs_in.fetch_add(1, Ordering::Relaxed);
                1.0 + (n as f64) / 10.0
            },
            |a: &f64, b: &f64| a.trunc() == b.trunc(),
        );
        let first = c.get();
        let second = c.get();
        // Each unobserved read recomputes, but the comparator keeps the
        // first value alive.
        assert_eq!(first, second);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn cycle_through_self_is_reported() {
        use parking_lot::Mutex as PMutex;

        let slot: Arc<PMutex<Option<Arc<ComputedValue<i32>>>>> = Arc::new(PMutex::new(None));
        let slot_in = slot.clone();
        let c = ComputedValue::named("ouroboros", move || {
            let this = slot_in.lock().clone();
            match this {
                Some(this) => this.get() + 1,
                None => 0,
            }
        });
        *slot.lock() = Some(c.clone());

        // The self-read panics inside the getter; the capture is re-raised.
        let result = catch_unwind(AssertUnwindSafe(|| c.get()));
        assert!(result.is_err());

        *slot.lock() = None;
    }
}
