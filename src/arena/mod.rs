// Arena-based storage for the dependency graph's nodes.
//
// Two slabs, one per side of the bipartite graph:
// - observable arena: atoms, observable values, computed outputs
// - derivation arena: computed values, reactions
//
// Both use global static storage behind RwLocks. ObservableId and
// DerivationId are lightweight newtypes indexing into the slabs; the graph
// algorithms work entirely in terms of ids so nodes can reference each other
// across the two arenas without ownership cycles.

// observable_arena depends on DerivationId, so derivation_arena comes first.
pub mod derivation_arena;
pub mod observable_arena;

pub(crate) use derivation_arena::{
    derivation_arena_insert, derivation_arena_remove, on_become_stale, DependenciesState,
    DerivationId, DerivationKind, DerivationMeta, DeriveSlot, EffectSlot, ReactionSeat,
};

pub(crate) use observable_arena::{
    add_observer, detach_observable, observable_arena_insert, observable_arena_remove,
    on_become_unobserved, propagate_change_confirmed, propagate_changed, propagate_maybe_changed,
    queue_for_unobservation, remove_observer, report_changed, report_observed,
    set_on_become_observed, set_on_become_unobserved, ObservableId, ObservableKind,
    ObservableMeta,
};
