// Observable arena - storage for observable node metadata.
//
// Every observable (atom, observable value, or a computed value viewed from
// its output side) owns one slot here. The metadata carries the dependency
// graph's downstream half:
// - observers: derivations currently depending on this node, in a gap-free
//   vector, with a side index so removal is O(1) via swap-with-last
// - lowest_observer_state: a staleness floor over all observers, used to cut
//   off redundant propagation
// - last_accessed_by: run-id dedup so one derivation run records each
//   observable once no matter how often it reads it
// - diff_value: scratch owned by whichever derivation is mid-rebinding
//
// The arena is a global slab behind a RwLock; ObservableId is a u32 newtype
// into it. Stale ids (slot freed) return None from every accessor.

use parking_lot::{Mutex, RwLock};
use papaya::HashMap as PapayaHashMap;
use slab::Slab;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU64, AtomicU8, Ordering};
use std::sync::LazyLock;

use super::derivation_arena::{on_become_stale, DependenciesState, DerivationId};
use crate::globals::{
    current_derivation, enqueue_pending_unobservation, in_batch, remove_pending_unobservation,
    TrackingGuard,
};
use crate::hash::GraphHashBuilder;

/// Global observable arena.
static OBSERVABLE_ARENA: RwLock<Slab<ObservableMeta>> = RwLock::new(Slab::new());

type Hook = Box<dyn FnMut() + Send>;

/// Became-observed / became-unobserved hooks, kept out of the hot metadata so
/// the common hook-less observable pays nothing for them.
struct ObservabilityHooks {
    on_become_observed: Mutex<Option<Hook>>,
    on_become_unobserved: Mutex<Option<Hook>>,
}

static OBSERVABILITY_HOOKS: LazyLock<PapayaHashMap<ObservableId, ObservabilityHooks>> =
    LazyLock::new(PapayaHashMap::new);

/// What sits behind an observable: a plain atom, or the output side of a
/// computed value. The distinction is consulted in exactly one place, the
/// possibly-stale confirmation walk.
#[derive(Clone, Copy)]
pub(crate) enum ObservableKind {
    Atom,
    Computed(DerivationId),
}

/// Metadata for one observable node.
pub(crate) struct ObservableMeta {
    pub(crate) name: String,
    pub(crate) kind: ObservableKind,

    /// Observers in a gap-free vector. Order is not meaningful.
    pub(crate) observers: RwLock<Vec<DerivationId>>,

    /// Maps an observer to its slot in `observers`. Slot 0 is implicit and
    /// never stored.
    pub(crate) observers_index: RwLock<HashMap<DerivationId, u32, GraphHashBuilder>>,

    /// Staleness floor: at most the minimum `dependencies_state` over all
    /// observers. Lets propagation return early when everyone downstream
    /// already knows.
    pub(crate) lowest_observer_state: AtomicI8,

    /// Run id of the derivation that last recorded a read of this node.
    pub(crate) last_accessed_by: AtomicU64,

    /// Rebinding scratch; 0 whenever no derivation is mid-rebinding here.
    pub(crate) diff_value: AtomicU8,

    /// True while queued on the pending-unobservation list (at most once per
    /// batch).
    pub(crate) is_pending_unobservation: AtomicBool,

    /// True between the first tracked read and the became-unobserved drain.
    pub(crate) is_being_observed: AtomicBool,
}

impl ObservableMeta {
    pub(crate) fn new(name: String, kind: ObservableKind) -> Self {
        Self {
            name,
            kind,
            observers: RwLock::new(Vec::new()),
            observers_index: RwLock::new(HashMap::with_hasher(GraphHashBuilder)),
            lowest_observer_state: AtomicI8::new(DependenciesState::NotTracking as i8),
            last_accessed_by: AtomicU64::new(0),
            diff_value: AtomicU8::new(0),
            is_pending_unobservation: AtomicBool::new(false),
            is_being_observed: AtomicBool::new(false),
        }
    }
}

/// Unique identifier of an observable node in the arena.
///
/// A zero-cost wrapper around a slab index. When the owning handle is
/// dropped the slot is freed and the id goes stale; accessors on a stale id
/// return `None` (or a harmless default).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ObservableId(u32);

impl ObservableId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the metadata with a closure. `None` for stale ids.
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&ObservableMeta) -> R,
    {
        let arena = OBSERVABLE_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Human-readable name for diagnostics.
    pub(crate) fn debug_name(self) -> String {
        self.with(|m| {
            if m.name.is_empty() {
                match m.kind {
                    ObservableKind::Atom => format!("Atom@{}", self.0),
                    ObservableKind::Computed(_) => format!("Computed@{}", self.0),
                }
            } else {
                m.name.clone()
            }
        })
        .unwrap_or_else(|| format!("<freed observable {}>", self.0))
    }

    pub(crate) fn kind(self) -> Option<ObservableKind> {
        self.with(|m| m.kind)
    }

    pub(crate) fn has_observers(self) -> bool {
        self.with(|m| !m.observers.read().is_empty()).unwrap_or(false)
    }

    pub(crate) fn observer_count(self) -> usize {
        self.with(|m| m.observers.read().len()).unwrap_or(0)
    }

    /// Copy of the observer list, so propagation never holds a lock while it
    /// walks into other nodes.
    pub(crate) fn observers_snapshot(self) -> SmallVec<[DerivationId; 8]> {
        self.with(|m| m.observers.read().iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn lowest_observer_state(self) -> DependenciesState {
        self.with(|m| DependenciesState::from_i8(m.lowest_observer_state.load(Ordering::Relaxed)))
            .unwrap_or(DependenciesState::Stale)
    }

    pub(crate) fn set_lowest_observer_state(self, state: DependenciesState) {
        self.with(|m| m.lowest_observer_state.store(state as i8, Ordering::Relaxed));
    }

    pub(crate) fn last_accessed_by(self) -> u64 {
        self.with(|m| m.last_accessed_by.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub(crate) fn set_last_accessed_by(self, run_id: u64) {
        self.with(|m| m.last_accessed_by.store(run_id, Ordering::Relaxed));
    }

    pub(crate) fn diff_value(self) -> u8 {
        self.with(|m| m.diff_value.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub(crate) fn set_diff_value(self, v: u8) {
        self.with(|m| m.diff_value.store(v, Ordering::Relaxed));
    }

    pub(crate) fn is_being_observed(self) -> bool {
        self.with(|m| m.is_being_observed.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub(crate) fn set_being_observed(self, v: bool) {
        self.with(|m| m.is_being_observed.store(v, Ordering::Relaxed));
    }

    /// Clear the pending-unobservation flag, returning whether it was set.
    pub(crate) fn clear_pending_unobservation(self) -> bool {
        self.with(|m| m.is_pending_unobservation.swap(false, Ordering::Relaxed))
            .unwrap_or(false)
    }
}

/// Record a read of `obs`.
///
/// This is the only place a dependency edge is ever proposed. If a derivation
/// is tracking and has not read this node during its current run, the node is
/// appended to the derivation's scratch list; the edge itself materializes in
/// the rebinding pass after the run. Outside any tracking, a read of an
/// orphaned node inside a batch queues it for the became-unobserved check.
pub(crate) fn report_observed(obs: ObservableId) {
    if let Some(d) = current_derivation() {
        let run_id = d.run_id();
        if run_id != obs.last_accessed_by() {
            obs.set_last_accessed_by(run_id);
            d.record_new_observing(obs);
            if !obs.is_being_observed() {
                obs.set_being_observed(true);
                fire_on_become_observed(obs);
            }
        }
    } else if !obs.has_observers() && in_batch() > 0 {
        queue_for_unobservation(obs);
    }
}

/// Report that `obs` changed for sure. Opens a batch if none is active so
/// the resulting reactions run exactly once, at the outermost close.
pub(crate) fn report_changed(obs: ObservableId) {
    let _batch = crate::batch::BatchGuard::new();
    propagate_changed(obs);
}

/// Queue `obs` for the end-of-batch unobservation check, at most once per
/// batch.
pub(crate) fn queue_for_unobservation(obs: ObservableId) {
    let newly_queued = obs
        .with(|m| !m.is_pending_unobservation.swap(true, Ordering::Relaxed))
        .unwrap_or(false);
    if newly_queued {
        enqueue_pending_unobservation(obs);
    }
}

/// Link `d` as an observer of `obs`. Called from dependency rebinding only.
pub(crate) fn add_observer(obs: ObservableId, d: DerivationId) {
    let d_state = d.dependencies_state();
    obs.with(|m| {
        let mut observers = m.observers.write();
        let slot = observers.len() as u32;
        if slot != 0 {
            m.observers_index.write().insert(d, slot);
        }
        observers.push(d);
        // Keep the floor at or below the newcomer.
        if m.lowest_observer_state.load(Ordering::Relaxed) > d_state as i8 {
            m.lowest_observer_state.store(d_state as i8, Ordering::Relaxed);
        }
    });
}

/// Unlink `d` from `obs`, keeping the observer vector gap-free by moving the
/// tail entry into the vacated slot. Queues `obs` for unobservation when the
/// last observer leaves.
pub(crate) fn remove_observer(obs: ObservableId, d: DerivationId) {
    let emptied = obs
        .with(|m| {
            let mut observers = m.observers.write();
            let mut index = m.observers_index.write();
            let slot = index.get(&d).map(|i| *i as usize).unwrap_or(0);
            if observers.get(slot).copied() != Some(d) {
                // Not currently an observer (torn down twice); nothing to do.
                return observers.is_empty();
            }
            index.remove(&d);
            let tail = observers.pop().expect("observer list cannot be empty here");
            if tail != d {
                if slot != 0 {
                    index.insert(tail, slot as u32);
                } else {
                    index.remove(&tail);
                }
                observers[slot] = tail;
            }
            observers.is_empty()
        })
        .unwrap_or(false);
    if emptied {
        queue_for_unobservation(obs);
    }
}

/// An atom changed: every observer is now stale.
pub(crate) fn propagate_changed(obs: ObservableId) {
    if obs.lowest_observer_state() == DependenciesState::Stale {
        cov_mark::hit!(propagate_changed_short_circuit);
        return;
    }
    obs.set_lowest_observer_state(DependenciesState::Stale);
    for d in obs.observers_snapshot() {
        if d.dependencies_state() == DependenciesState::UpToDate {
            on_become_stale(d);
        }
        d.set_dependencies_state(DependenciesState::Stale);
    }
}

/// A computed value confirmed that it really changed: upgrade possibly-stale
/// observers to stale. An observer still up-to-date here is tracking at this
/// very moment and will read the fresh value, so the floor is raised back
/// rather than left pinned at stale.
pub(crate) fn propagate_change_confirmed(obs: ObservableId) {
    if obs.lowest_observer_state() == DependenciesState::Stale {
        return;
    }
    obs.set_lowest_observer_state(DependenciesState::Stale);
    for d in obs.observers_snapshot() {
        match d.dependencies_state() {
            DependenciesState::PossiblyStale => {
                d.set_dependencies_state(DependenciesState::Stale);
            }
            DependenciesState::UpToDate => {
                cov_mark::hit!(confirmed_seen_by_tracking_observer);
                obs.set_lowest_observer_state(DependenciesState::UpToDate);
            }
            _ => {}
        }
    }
}

/// A computed value may have changed: downgrade up-to-date observers to
/// possibly-stale and let their own staleness hooks ride downstream. No
/// recomputation happens here; the walk is O(depth).
pub(crate) fn propagate_maybe_changed(obs: ObservableId) {
    if obs.lowest_observer_state() != DependenciesState::UpToDate {
        cov_mark::hit!(maybe_changed_short_circuit);
        return;
    }
    obs.set_lowest_observer_state(DependenciesState::PossiblyStale);
    for d in obs.observers_snapshot() {
        if d.dependencies_state() == DependenciesState::UpToDate {
            d.set_dependencies_state(DependenciesState::PossiblyStale);
            on_become_stale(d);
        }
    }
}

/// End-of-batch notification that the last observer left `obs`. Fires the
/// user hook and suspends a computed's tracking side.
pub(crate) fn on_become_unobserved(obs: ObservableId) {
    if obs.is_being_observed() {
        obs.set_being_observed(false);
        fire_on_become_unobserved(obs);
    }
    if let Some(ObservableKind::Computed(d)) = obs.kind() {
        crate::computed::suspend(d);
    }
}

pub(crate) fn set_on_become_observed(obs: ObservableId, hook: Hook) {
    let hooks = OBSERVABILITY_HOOKS.pin();
    *hooks
        .get_or_insert_with(obs, || ObservabilityHooks {
            on_become_observed: Mutex::new(None),
            on_become_unobserved: Mutex::new(None),
        })
        .on_become_observed
        .lock() = Some(hook);
}

pub(crate) fn set_on_become_unobserved(obs: ObservableId, hook: Hook) {
    let hooks = OBSERVABILITY_HOOKS.pin();
    *hooks
        .get_or_insert_with(obs, || ObservabilityHooks {
            on_become_observed: Mutex::new(None),
            on_become_unobserved: Mutex::new(None),
        })
        .on_become_unobserved
        .lock() = Some(hook);
}

// Hooks run with nothing locked: they are taken out for the call and put
// back afterwards (unless the hook replaced itself meanwhile).
fn fire_on_become_observed(obs: ObservableId) {
    let hook = {
        let hooks = OBSERVABILITY_HOOKS.pin();
        hooks
            .get(&obs)
            .and_then(|pair| pair.on_become_observed.lock().take())
    };
    if let Some(mut hook) = hook {
        {
            let _untracked = TrackingGuard::new(None);
            hook();
        }
        let hooks = OBSERVABILITY_HOOKS.pin();
        if let Some(pair) = hooks.get(&obs) {
            let mut slot = pair.on_become_observed.lock();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }
}

fn fire_on_become_unobserved(obs: ObservableId) {
    let hook = {
        let hooks = OBSERVABILITY_HOOKS.pin();
        hooks
            .get(&obs)
            .and_then(|pair| pair.on_become_unobserved.lock().take())
    };
    if let Some(mut hook) = hook {
        {
            let _untracked = TrackingGuard::new(None);
            hook();
        }
        let hooks = OBSERVABILITY_HOOKS.pin();
        if let Some(pair) = hooks.get(&obs) {
            let mut slot = pair.on_become_unobserved.lock();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }
}

/// Insert a fresh observable node, returning its id.
pub(crate) fn observable_arena_insert(meta: ObservableMeta) -> ObservableId {
    let mut arena = OBSERVABLE_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(meta);
    ObservableId::new(key as u32)
}

/// Remove an observable node from the arena, dropping its hooks.
pub(crate) fn observable_arena_remove(id: ObservableId) -> Option<ObservableMeta> {
    {
        let hooks = OBSERVABILITY_HOOKS.pin();
        hooks.remove(&id);
    }
    let mut arena = OBSERVABLE_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}

/// Full teardown for a dropped handle: unlink from every remaining observer,
/// drop any queued unobservation, free the slot.
pub(crate) fn detach_observable(obs: ObservableId) {
    for d in obs.observers_snapshot() {
        d.forget_observable(obs);
    }
    remove_pending_unobservation(obs);
    observable_arena_remove(obs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_access_returns_none() {
        let id = observable_arena_insert(ObservableMeta::new(String::new(), ObservableKind::Atom));
        observable_arena_remove(id);

        assert!(id.with(|_| ()).is_none());
        assert!(!id.has_observers());
        assert_eq!(id.last_accessed_by(), 0);
    }

    #[test]
    fn observer_index_skips_slot_zero() {
        let obs = observable_arena_insert(ObservableMeta::new(String::new(), ObservableKind::Atom));
        let d0 = DerivationId::new(9000);
        let d1 = DerivationId::new(9001);
        let d2 = DerivationId::new(9002);

        add_observer(obs, d0);
        add_observer(obs, d1);
        add_observer(obs, d2);

        obs.with(|m| {
            let index = m.observers_index.read();
            assert!(!index.contains_key(&d0));
            assert_eq!(index.get(&d1), Some(&1));
            assert_eq!(index.get(&d2), Some(&2));
        });

        // Removing the head swaps the tail into slot 0 and drops its entry.
        remove_observer(obs, d0);
        obs.with(|m| {
            assert_eq!(*m.observers.read(), vec![d2, d1]);
            let index = m.observers_index.read();
            assert!(!index.contains_key(&d2));
            assert_eq!(index.get(&d1), Some(&1));
        });

        remove_observer(obs, d1);
        remove_observer(obs, d2);
        assert!(!obs.has_observers());
        observable_arena_remove(obs);
    }

    #[test]
    fn remove_observer_twice_is_harmless() {
        let obs = observable_arena_insert(ObservableMeta::new(String::new(), ObservableKind::Atom));
        let d0 = DerivationId::new(9100);
        let d1 = DerivationId::new(9101);

        add_observer(obs, d0);
        add_observer(obs, d1);
        remove_observer(obs, d1);
        remove_observer(obs, d1);

        obs.with(|m| assert_eq!(*m.observers.read(), vec![d0]));
        observable_arena_remove(obs);
    }
}
