// Derivation arena - storage for derivation node metadata.
//
// A derivation is anything that depends on observables: a computed value or
// a reaction. The metadata carries the upstream half of the graph:
// - observing: the unique observables read during the most recent run, in
//   first-read order (the confirmation walk depends on that order)
// - new_observing: scratch filled while a run is tracking, duplicates allowed
// - dependencies_state: the four-valued staleness belief, strictly ordered
// - run_id: fresh per tracking invocation, process-wide unique
//
// Kind-specific payloads (a computed's recompute/discard closures, a
// reaction's effect and error handler) live in the arena too, type-erased,
// so graph algorithms can drive them from a bare id. Closures are taken out
// of the arena while they run and restored by a drop guard, panics included.

use parking_lot::{Mutex, RwLock};
use slab::Slab;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicI8, AtomicU32, AtomicU64, AtomicU8, Ordering};

use super::observable_arena::{propagate_maybe_changed, ObservableId};
use crate::derivation::CaughtPanic;

/// Global derivation arena.
static DERIVATION_ARENA: RwLock<Slab<DerivationMeta>> = RwLock::new(Slab::new());

/// A derivation's belief about whether its cached output is current.
/// Lower is fresher; the ordering is load-bearing for the staleness floor.
#[repr(i8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum DependenciesState {
    /// No meaningful observing set: never run, suspended, or torn down.
    NotTracking = -1,
    /// Every observed dependency is current.
    UpToDate = 0,
    /// A transitive computed dependency may have changed; confirm before use.
    PossiblyStale = 1,
    /// A direct dependency changed; recompute on next use.
    Stale = 2,
}

impl DependenciesState {
    pub(crate) fn from_i8(v: i8) -> Self {
        match v {
            -1 => DependenciesState::NotTracking,
            0 => DependenciesState::UpToDate,
            1 => DependenciesState::PossiblyStale,
            _ => DependenciesState::Stale,
        }
    }
}

/// The computed side of a derivation: its output observable plus the
/// type-erased cell operations graph code drives by id.
pub(crate) struct ComputedLink {
    /// Raw index of the output observable; set right after both arena slots
    /// exist (the two nodes reference each other).
    observable: AtomicU32,

    /// Recompute the cached cell inside the current tracking scope. Returns
    /// true when the stored value changed.
    pub(crate) derive: Mutex<Option<Box<dyn FnMut() -> bool + Send>>>,

    /// Drop the cached cell so the next read starts from scratch.
    pub(crate) discard: Mutex<Box<dyn FnMut() + Send>>,
}

impl ComputedLink {
    pub(crate) fn new(
        derive: Box<dyn FnMut() -> bool + Send>,
        discard: Box<dyn FnMut() + Send>,
    ) -> Self {
        Self {
            observable: AtomicU32::new(u32::MAX),
            derive: Mutex::new(Some(derive)),
            discard: Mutex::new(discard),
        }
    }

    pub(crate) fn observable(&self) -> ObservableId {
        ObservableId::new(self.observable.load(Ordering::Relaxed))
    }

    pub(crate) fn link_observable(&self, obs: ObservableId) {
        self.observable.store(obs.index() as u32, Ordering::Relaxed);
    }
}

/// The reaction side of a derivation: the user effect and an optional error
/// handler for panics the effect raises.
pub(crate) struct ReactionSeat {
    pub(crate) effect: Mutex<Option<Box<dyn FnMut() + Send>>>,
    pub(crate) on_error: Mutex<Option<Box<dyn FnMut(&CaughtPanic) + Send>>>,
}

impl ReactionSeat {
    pub(crate) fn new(effect: Box<dyn FnMut() + Send>) -> Self {
        Self {
            effect: Mutex::new(Some(effect)),
            on_error: Mutex::new(None),
        }
    }
}

pub(crate) enum DerivationKind {
    Computed(ComputedLink),
    Reaction(ReactionSeat),
}

// Flag bits.
const FLAG_SCHEDULED: u8 = 1 << 0;
const FLAG_DISPOSED: u8 = 1 << 1;
const FLAG_RUNNING: u8 = 1 << 2;
const FLAG_COMPUTING: u8 = 1 << 3;

/// Metadata for one derivation node.
pub(crate) struct DerivationMeta {
    pub(crate) name: String,
    pub(crate) kind: DerivationKind,

    /// Unique observables read during the most recent run, first-read order.
    pub(crate) observing: RwLock<Vec<ObservableId>>,

    /// Scratch list filled while this derivation is tracking; may contain
    /// duplicates. `None` outside a run.
    pub(crate) new_observing: Mutex<Option<Vec<ObservableId>>>,

    pub(crate) dependencies_state: AtomicI8,
    pub(crate) run_id: AtomicU64,
    pub(crate) flags: AtomicU8,
}

impl DerivationMeta {
    pub(crate) fn new(name: String, kind: DerivationKind) -> Self {
        Self {
            name,
            kind,
            observing: RwLock::new(Vec::new()),
            new_observing: Mutex::new(None),
            dependencies_state: AtomicI8::new(DependenciesState::NotTracking as i8),
            run_id: AtomicU64::new(0),
            flags: AtomicU8::new(0),
        }
    }

    fn flag(&self, bit: u8) -> bool {
        self.flags.load(Ordering::Relaxed) & bit != 0
    }

    /// Set or clear a flag bit, returning its previous value.
    fn swap_flag(&self, bit: u8, value: bool) -> bool {
        let prev = if value {
            self.flags.fetch_or(bit, Ordering::Relaxed)
        } else {
            self.flags.fetch_and(!bit, Ordering::Relaxed)
        };
        prev & bit != 0
    }
}

/// Unique identifier of a derivation node in the arena.
///
/// Same stale-id contract as [`ObservableId`]: accessors on a freed slot
/// return `None` or a harmless default.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct DerivationId(u32);

impl DerivationId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the metadata with a closure. `None` for stale ids.
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&DerivationMeta) -> R,
    {
        let arena = DERIVATION_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Human-readable name for diagnostics.
    pub(crate) fn debug_name(self) -> String {
        self.with(|m| {
            if m.name.is_empty() {
                match m.kind {
                    DerivationKind::Computed(_) => format!("Computed@{}", self.0),
                    DerivationKind::Reaction(_) => format!("Reaction@{}", self.0),
                }
            } else {
                m.name.clone()
            }
        })
        .unwrap_or_else(|| format!("<freed derivation {}>", self.0))
    }

    pub(crate) fn dependencies_state(self) -> DependenciesState {
        self.with(|m| DependenciesState::from_i8(m.dependencies_state.load(Ordering::Relaxed)))
            .unwrap_or(DependenciesState::NotTracking)
    }

    pub(crate) fn set_dependencies_state(self, state: DependenciesState) {
        self.with(|m| m.dependencies_state.store(state as i8, Ordering::Relaxed));
    }

    pub(crate) fn run_id(self) -> u64 {
        self.with(|m| m.run_id.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub(crate) fn set_run_id(self, run_id: u64) {
        self.with(|m| m.run_id.store(run_id, Ordering::Relaxed));
    }

    pub(crate) fn observing_len(self) -> usize {
        self.with(|m| m.observing.read().len()).unwrap_or(0)
    }

    /// Copy of the observing list in first-read order.
    pub(crate) fn observing_snapshot(self) -> SmallVec<[ObservableId; 8]> {
        self.with(|m| m.observing.read().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Swap in a new observing list, returning the previous one.
    pub(crate) fn replace_observing(self, observing: Vec<ObservableId>) -> Vec<ObservableId> {
        self.with(|m| std::mem::replace(&mut *m.observing.write(), observing))
            .unwrap_or_default()
    }

    /// Install a fresh scratch list for the run about to start.
    pub(crate) fn begin_new_observing(self, capacity: usize) {
        self.with(|m| *m.new_observing.lock() = Some(Vec::with_capacity(capacity)));
    }

    /// Append a read to the scratch list. No-op outside a run.
    pub(crate) fn record_new_observing(self, obs: ObservableId) {
        self.with(|m| {
            if let Some(scratch) = m.new_observing.lock().as_mut() {
                scratch.push(obs);
            }
        });
    }

    /// Take the scratch list at the end of a run.
    pub(crate) fn take_new_observing(self) -> Vec<ObservableId> {
        self.with(|m| m.new_observing.lock().take())
            .flatten()
            .unwrap_or_default()
    }

    /// Drop `obs` from the observing list without touching `obs` itself.
    /// Used when an observable is torn down while still depended upon.
    pub(crate) fn forget_observable(self, obs: ObservableId) {
        self.with(|m| m.observing.write().retain(|o| *o != obs));
    }

    pub(crate) fn is_scheduled(self) -> bool {
        self.with(|m| m.flag(FLAG_SCHEDULED)).unwrap_or(false)
    }

    /// Set the scheduled flag, returning its previous value (idempotent
    /// enqueue hinges on this).
    pub(crate) fn set_scheduled(self, v: bool) -> bool {
        self.with(|m| m.swap_flag(FLAG_SCHEDULED, v)).unwrap_or(true)
    }

    pub(crate) fn is_disposed(self) -> bool {
        self.with(|m| m.flag(FLAG_DISPOSED)).unwrap_or(true)
    }

    pub(crate) fn set_disposed(self) -> bool {
        self.with(|m| m.swap_flag(FLAG_DISPOSED, true)).unwrap_or(true)
    }

    pub(crate) fn is_running(self) -> bool {
        self.with(|m| m.flag(FLAG_RUNNING)).unwrap_or(false)
    }

    pub(crate) fn set_running(self, v: bool) {
        self.with(|m| m.swap_flag(FLAG_RUNNING, v));
    }

    pub(crate) fn is_computing(self) -> bool {
        self.with(|m| m.flag(FLAG_COMPUTING)).unwrap_or(false)
    }

    /// Set or clear the computing flag, returning its previous value (the
    /// reentrancy guard for computed cycles).
    pub(crate) fn set_computing(self, v: bool) -> bool {
        self.with(|m| m.swap_flag(FLAG_COMPUTING, v)).unwrap_or(false)
    }
}

/// A derivation left the up-to-date state: computeds let possible staleness
/// ride downstream, reactions put themselves on the pending queue. Reactions
/// never propagate further; they are leaf observers.
pub(crate) fn on_become_stale(d: DerivationId) {
    enum Target {
        Computed(ObservableId),
        Reaction,
    }
    let target = d.with(|m| match &m.kind {
        DerivationKind::Computed(link) => Target::Computed(link.observable()),
        DerivationKind::Reaction(_) => Target::Reaction,
    });
    match target {
        Some(Target::Computed(obs)) => propagate_maybe_changed(obs),
        Some(Target::Reaction) => crate::reaction::schedule(d),
        None => {}
    }
}

/// The recompute closure of a computed, taken out of the arena while it runs
/// so the run can freely re-enter arena code. Restored on drop, panics
/// included.
pub(crate) struct DeriveSlot {
    d: DerivationId,
    closure: Option<Box<dyn FnMut() -> bool + Send>>,
}

impl DeriveSlot {
    pub(crate) fn take(d: DerivationId) -> Self {
        let closure = d
            .with(|m| match &m.kind {
                DerivationKind::Computed(link) => link.derive.lock().take(),
                DerivationKind::Reaction(_) => None,
            })
            .flatten();
        Self { d, closure }
    }

    /// Run the recompute step; false when the closure is gone (torn down).
    pub(crate) fn run(&mut self) -> bool {
        match self.closure.as_mut() {
            Some(f) => f(),
            None => false,
        }
    }
}

impl Drop for DeriveSlot {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            self.d.with(|m| {
                if let DerivationKind::Computed(link) = &m.kind {
                    *link.derive.lock() = Some(closure);
                }
            });
        }
    }
}

/// A reaction's effect closure, same take/restore discipline as
/// [`DeriveSlot`].
pub(crate) struct EffectSlot {
    d: DerivationId,
    closure: Option<Box<dyn FnMut() + Send>>,
}

impl EffectSlot {
    pub(crate) fn take(d: DerivationId) -> Self {
        let closure = d
            .with(|m| match &m.kind {
                DerivationKind::Reaction(seat) => seat.effect.lock().take(),
                DerivationKind::Computed(_) => None,
            })
            .flatten();
        Self { d, closure }
    }

    pub(crate) fn run(&mut self) {
        if let Some(f) = self.closure.as_mut() {
            f();
        }
    }
}

impl Drop for EffectSlot {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            self.d.with(|m| {
                if let DerivationKind::Reaction(seat) = &m.kind {
                    *seat.effect.lock() = Some(closure);
                }
            });
        }
    }
}

/// Insert a fresh derivation node, returning its id.
pub(crate) fn derivation_arena_insert(meta: DerivationMeta) -> DerivationId {
    let mut arena = DERIVATION_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(meta);
    DerivationId::new(key as u32)
}

/// Remove a derivation node from the arena.
pub(crate) fn derivation_arena_remove(id: DerivationId) -> Option<DerivationMeta> {
    let mut arena = DERIVATION_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_access_returns_defaults() {
        let meta = DerivationMeta::new(
            String::new(),
            DerivationKind::Reaction(ReactionSeat::new(Box::new(|| {}))),
        );
        let id = derivation_arena_insert(meta);
        derivation_arena_remove(id);

        assert!(id.with(|_| ()).is_none());
        assert_eq!(id.dependencies_state(), DependenciesState::NotTracking);
        assert!(id.is_disposed());
        assert!(id.take_new_observing().is_empty());
    }

    #[test]
    fn dependencies_state_ordering_is_strict() {
        assert!(DependenciesState::NotTracking < DependenciesState::UpToDate);
        assert!(DependenciesState::UpToDate < DependenciesState::PossiblyStale);
        assert!(DependenciesState::PossiblyStale < DependenciesState::Stale);
    }

    #[test]
    fn effect_slot_restores_closure_on_drop() {
        let meta = DerivationMeta::new(
            String::new(),
            DerivationKind::Reaction(ReactionSeat::new(Box::new(|| {}))),
        );
        let id = derivation_arena_insert(meta);

        {
            let mut slot = EffectSlot::take(id);
            // The closure is out of the arena while the slot holds it.
            let empty = id
                .with(|m| match &m.kind {
                    DerivationKind::Reaction(seat) => seat.effect.lock().is_none(),
                    _ => false,
                })
                .unwrap();
            assert!(empty);
            slot.run();
        }

        let restored = id
            .with(|m| match &m.kind {
                DerivationKind::Reaction(seat) => seat.effect.lock().is_some(),
                _ => false,
            })
            .unwrap();
        assert!(restored);

        derivation_arena_remove(id);
    }

    #[test]
    fn scheduled_flag_swaps() {
        let meta = DerivationMeta::new(
            String::new(),
            DerivationKind::Reaction(ReactionSeat::new(Box::new(|| {}))),
        );
        let id = derivation_arena_insert(meta);

        assert!(!id.set_scheduled(true));
        assert!(id.set_scheduled(true));
        assert!(id.set_scheduled(false));
        assert!(!id.is_scheduled());

        derivation_arena_remove(id);
    }
}
