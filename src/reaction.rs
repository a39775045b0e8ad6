use crate::arena::{
    derivation_arena_insert, derivation_arena_remove, DerivationId, DerivationKind,
    DerivationMeta, EffectSlot, ReactionSeat,
};
use crate::batch::BatchGuard;
use crate::derivation::{clear_observing, should_compute, track_derived_function, CaughtPanic};
use crate::globals::{
    clear_pending_reactions, enqueue_pending_reaction, in_batch, is_running_reactions,
    remove_pending_reaction, take_pending_reactions, RunningReactionsGuard, TrackingGuard,
};

/// Outer drain passes before the queue is declared cyclic.
const MAX_REACTION_ITERATIONS: usize = 100;

/// An eager, side-effecting derivation: the leaf consumer of the graph.
///
/// When any tracked dependency leaves the up-to-date state the reaction
/// enqueues itself; queued reactions run in FIFO order when the outermost
/// batch closes (immediately, when no batch is open). A reaction whose
/// possibly-stale check confirms that nothing actually changed does not
/// re-run its effect.
///
/// The handle disposes the reaction on drop; [`Reaction::dispose`] does the
/// same explicitly and is idempotent.
///
/// # Example
/// ```ignore
/// let count = ObservableValue::new(0);
/// let reaction = autorun({
///     let count = count.clone();
///     move || println!("count is {}", count.get())
/// });
/// count.set(1); // prints
/// drop(reaction);
/// count.set(2); // nothing runs
/// ```
pub struct Reaction {
    id: DerivationId,
}

impl Reaction {
    /// Create a reaction around `effect` without scheduling it. Call
    /// [`Reaction::schedule`] (or use [`autorun`]) to start it.
    pub fn new(effect: impl FnMut() + Send + 'static) -> Self {
        Self::named(String::new(), effect)
    }

    /// Create a named reaction; the name shows up in diagnostics.
    pub fn named(name: impl Into<String>, effect: impl FnMut() + Send + 'static) -> Self {
        let meta = DerivationMeta::new(
            name.into(),
            DerivationKind::Reaction(ReactionSeat::new(Box::new(effect))),
        );
        Self {
            id: derivation_arena_insert(meta),
        }
    }

    /// Install a handler for panics raised by the effect. Without one, such
    /// panics are logged and swallowed.
    pub fn on_error(&self, handler: impl FnMut(&CaughtPanic) + Send + 'static) {
        self.id.with(|m| {
            if let DerivationKind::Reaction(seat) = &m.kind {
                *seat.on_error.lock() = Some(Box::new(handler));
            }
        });
    }

    /// Enqueue this reaction; it runs when the outermost batch closes, or
    /// immediately when no batch is open. Idempotent while already queued.
    pub fn schedule(&self) {
        schedule(self.id);
    }

    /// Tear the reaction down: unlink it from everything it observes and
    /// make any queued run a no-op. Idempotent.
    pub fn dispose(&self) {
        dispose(self.id);
    }

    /// The reaction's diagnostic name.
    pub fn name(&self) -> String {
        self.id.debug_name()
    }

    #[cfg(test)]
    pub(crate) fn id(&self) -> DerivationId {
        self.id
    }
}

impl Drop for Reaction {
    fn drop(&mut self) {
        dispose(self.id);
        remove_pending_reaction(self.id);
        // A handle dropped from inside its own effect leaves the slot to the
        // in-flight run; the entry stays disposed and inert.
        if !self.id.is_running() {
            derivation_arena_remove(self.id);
        }
    }
}

/// Create a reaction around `effect` and run it immediately (scheduled, so
/// inside a batch the first run waits for the outermost close).
pub fn autorun(effect: impl FnMut() + Send + 'static) -> Reaction {
    let reaction = Reaction::new(effect);
    reaction.schedule();
    reaction
}

/// [`autorun`] with a diagnostic name.
pub fn autorun_named(name: impl Into<String>, effect: impl FnMut() + Send + 'static) -> Reaction {
    let reaction = Reaction::named(name, effect);
    reaction.schedule();
    reaction
}

/// Enqueue `d`, idempotently, and drain if no batch is open.
pub(crate) fn schedule(d: DerivationId) {
    if d.is_disposed() {
        return;
    }
    if !d.set_scheduled(true) {
        enqueue_pending_reaction(d);
        run_pending_reactions();
    }
}

/// Drain the pending queue, FIFO in order of first scheduling.
///
/// Reactions scheduled during the drain join the same pass: the queue is
/// re-taken until it stays empty. A graph that keeps re-triggering itself
/// past the iteration limit is a bug in the caller and fatal.
pub(crate) fn run_pending_reactions() {
    if in_batch() > 0 || is_running_reactions() {
        return;
    }
    let _guard = RunningReactionsGuard::new();

    let mut iterations = 0;
    loop {
        let batch = take_pending_reactions();
        if batch.is_empty() {
            break;
        }
        iterations += 1;
        if iterations > MAX_REACTION_ITERATIONS {
            let name = batch[0].debug_name();
            log::error!(
                "reactions did not settle after {MAX_REACTION_ITERATIONS} passes; \
                 {name} is still being re-triggered"
            );
            clear_pending_reactions();
            panic!("cyclic reactions: {name} keeps re-triggering itself");
        }
        for d in batch {
            run_reaction(d);
        }
    }
}

fn run_reaction(d: DerivationId) {
    if d.is_disposed() {
        return;
    }
    let _batch = BatchGuard::new();
    d.set_scheduled(false);
    if should_compute(d) {
        d.set_running(true);
        let mut slot = EffectSlot::take(d);
        let result = track_derived_function(d, || slot.run());
        drop(slot);
        d.set_running(false);
        if d.is_disposed() {
            // Disposed mid-run: the teardown deferred the unlinking to us.
            clear_observing(d);
        }
        if let Err(caught) = result {
            report_reaction_panic(d, &caught);
        }
    }
}

fn report_reaction_panic(d: DerivationId, caught: &CaughtPanic) {
    // The handler runs with no arena lock held (it may build new nodes).
    let handler = d
        .with(|m| match &m.kind {
            DerivationKind::Reaction(seat) => seat.on_error.lock().take(),
            DerivationKind::Computed(_) => None,
        })
        .flatten();
    match handler {
        Some(mut handler) => {
            {
                let _untracked = TrackingGuard::new(None);
                handler(caught);
            }
            d.with(|m| {
                if let DerivationKind::Reaction(seat) = &m.kind {
                    let mut slot = seat.on_error.lock();
                    if slot.is_none() {
                        *slot = Some(handler);
                    }
                }
            });
        }
        None => {
            log::error!(
                "uncaught panic in reaction {}: {}",
                d.debug_name(),
                caught.message()
            );
        }
    }
}

pub(crate) fn dispose(d: DerivationId) {
    if !d.set_disposed() {
        if d.is_running() {
            // The in-flight run unlinks the dependency set when it ends.
            return;
        }
        let _batch = BatchGuard::new();
        clear_observing(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ObservableValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn autorun_runs_once_immediately() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let _reaction = autorun(move || {
            runs_in.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reaction_reruns_on_dependency_change() {
        let value = Arc::new(ObservableValue::new(1));
        let seen = Arc::new(AtomicUsize::new(0));

        let value_in = value.clone();
        let seen_in = seen.clone();
        let _reaction = autorun(move || {
            seen_in.store(value_in.get() as usize, Ordering::Relaxed);
        });
        assert_eq!(seen.load(Ordering::Relaxed), 1);

        value.set(7);
        assert_eq!(seen.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn disposed_reaction_never_runs_again() {
        let value = Arc::new(ObservableValue::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let value_in = value.clone();
        let runs_in = runs.clone();
        let reaction = autorun(move || {
            value_in.get();
            runs_in.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        reaction.dispose();
        reaction.dispose(); // idempotent

        value.set(5);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn effect_panic_is_routed_to_the_error_handler() {
        let value = Arc::new(ObservableValue::new(0));
        let errors: Arc<parking_lot::Mutex<Vec<String>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));

        let value_in = value.clone();
        let reaction = Reaction::new(move || {
            if value_in.get() > 0 {
                panic!("effect went sideways");
            }
        });
        let errors_in = errors.clone();
        reaction.on_error(move |caught| {
            errors_in.lock().push(caught.message().to_string());
        });
        reaction.schedule();
        assert!(errors.lock().is_empty());

        value.set(1);
        assert_eq!(errors.lock().as_slice(), &[String::from("effect went sideways")]);

        // The graph survives: a later change still reaches the reaction.
        value.set(0);
        value.set(2);
        assert_eq!(errors.lock().len(), 2);
    }

    #[test]
    #[should_panic(expected = "cyclic reactions")]
    fn self_retriggering_reaction_is_fatal() {
        let value = Arc::new(ObservableValue::new(0u64));
        let value_in = value.clone();
        let _reaction = autorun(move || {
            let next = value_in.get() + 1;
            if next > 1 {
                // Writing our own dependency re-triggers us forever.
                value_in.set(next);
            }
        });
        value.set(10);
    }
}
