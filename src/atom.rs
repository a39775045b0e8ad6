use crate::arena::{
    detach_observable, observable_arena_insert, report_changed, report_observed,
    set_on_become_observed, set_on_become_unobserved, ObservableId, ObservableKind,
    ObservableMeta,
};

/// The smallest observable: a leaf node in the dependency graph that owns no
/// data of its own.
///
/// Containers keep their values wherever they like and call
/// [`report_observed`](Atom::report_observed) on every read and
/// [`report_changed`](Atom::report_changed) on every mutation; the graph does
/// the rest. This is the building block observable collections are made of.
///
/// # Example
/// ```ignore
/// struct Clock {
///     now: std::cell::Cell<u64>,
///     atom: Atom,
/// }
///
/// impl Clock {
///     fn now(&self) -> u64 {
///         self.atom.report_observed();
///         self.now.get()
///     }
///
///     fn tick(&self) {
///         self.now.set(self.now.get() + 1);
///         self.atom.report_changed();
///     }
/// }
/// ```
pub struct Atom {
    id: ObservableId,
}

// An Atom owns its arena slot; cloning would double-free it on drop. Share
// the handle behind an Arc if several owners need it.

impl Atom {
    /// Create an anonymous atom.
    pub fn new() -> Self {
        Self::named(String::new())
    }

    /// Create a named atom; the name shows up in diagnostics.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: observable_arena_insert(ObservableMeta::new(name.into(), ObservableKind::Atom)),
        }
    }

    /// Record a read of the state behind this atom. When a derivation is
    /// tracking, this proposes a dependency edge.
    pub fn report_observed(&self) {
        report_observed(self.id);
    }

    /// Report that the state behind this atom changed. Opens a batch if none
    /// is active, so dependent reactions run once at the outermost close.
    pub fn report_changed(&self) {
        report_changed(self.id);
    }

    /// Install a hook fired when the atom gains its first observer. Fired
    /// under an untracked scope.
    pub fn on_become_observed(&self, hook: impl FnMut() + Send + 'static) {
        set_on_become_observed(self.id, Box::new(hook));
    }

    /// Install a hook fired when the atom's last observer leaves, at the
    /// close of the batch that removed it. Fired under an untracked scope.
    pub fn on_become_unobserved(&self, hook: impl FnMut() + Send + 'static) {
        set_on_become_unobserved(self.id, Box::new(hook));
    }

    /// The atom's diagnostic name.
    pub fn name(&self) -> String {
        self.id.debug_name()
    }

    #[cfg(test)]
    pub(crate) fn id(&self) -> ObservableId {
        self.id
    }
}

impl Default for Atom {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Atom {
    fn drop(&mut self) {
        detach_observable(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaction::autorun;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn report_changed_outside_observation_is_quiet() {
        let atom = Atom::named("lonely");
        atom.report_changed();
        atom.report_observed();
    }

    #[test]
    fn observed_hook_fires_on_first_tracked_read() {
        let atom = Arc::new(Atom::new());
        let observed = Arc::new(AtomicUsize::new(0));
        let observed_in = observed.clone();
        atom.on_become_observed(move || {
            observed_in.fetch_add(1, Ordering::Relaxed);
        });

        let atom_in = atom.clone();
        let reaction = autorun(move || {
            atom_in.report_observed();
        });
        assert_eq!(observed.load(Ordering::Relaxed), 1);

        // Re-running the same reaction is not a fresh observation.
        atom.report_changed();
        assert_eq!(observed.load(Ordering::Relaxed), 1);

        drop(reaction);
    }

    #[test]
    fn dropped_atom_detaches_from_observers() {
        let atom = Arc::new(Atom::new());
        let weak = Arc::downgrade(&atom);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let reaction = autorun(move || {
            if let Some(atom) = weak.upgrade() {
                atom.report_observed();
            }
            runs_in.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(reaction.id().observing_snapshot().len(), 1);

        drop(atom);
        // The reaction survives with the dead edge unlinked from its side.
        assert!(reaction.id().observing_snapshot().is_empty());
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }
}
