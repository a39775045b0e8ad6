use parking_lot::RwLock;

use crate::arena::{
    detach_observable, observable_arena_insert, report_changed, report_observed, ObservableId,
    ObservableKind, ObservableMeta,
};
use crate::globals::{check_state_modifications_allowed, TrackingGuard};
use crate::notify::{CallbackRegistry, Subscription};

/// A pending write, handed to interceptors before it is applied.
///
/// An interceptor may pass the change through, replace the value, or cancel
/// the write by returning `None`.
pub struct ValueWillChange<T> {
    /// The value about to be stored.
    pub new_value: T,
}

/// An applied write, handed to change listeners after the store.
pub struct ValueDidChange<T> {
    /// The value that was replaced.
    pub old_value: T,
    /// The value now stored.
    pub new_value: T,
}

type Interceptor<T> = dyn FnMut(ValueWillChange<T>) -> Option<ValueWillChange<T>> + Send;
type Listener<T> = dyn FnMut(&ValueDidChange<T>) + Send;
type Enhancer<T> = dyn Fn(T, Option<&T>) -> T + Send + Sync;

/// Outcome of the prepare step of a write. `Unchanged` is the sentinel for
/// writes that normalize to the stored value: nothing propagates.
enum Prepared<T> {
    Changed(T),
    Unchanged,
}

/// A single observable cell.
///
/// Reads inside a tracking scope record a dependency; writes propagate to
/// exactly the derivations whose inputs actually changed. A write that
/// normalizes to the stored value (by `PartialEq`, after interceptors and
/// the enhancer have had their say) is dropped without notifying anyone.
///
/// # Example
/// ```ignore
/// let temperature = ObservableValue::named("temperature", 21.5);
/// let _watch = autorun({
///     let temperature = temperature.clone();
///     move || println!("{} °C", temperature.get())
/// });
/// temperature.set(22.0); // the autorun re-runs
/// temperature.set(22.0); // no change, nothing runs
/// ```
pub struct ObservableValue<T> {
    id: ObservableId,
    cell: RwLock<T>,
    enhancer: Option<Box<Enhancer<T>>>,
    interceptors: CallbackRegistry<Interceptor<T>>,
    listeners: CallbackRegistry<Listener<T>>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ObservableValue<T> {
    /// Create an anonymous observable cell.
    pub fn new(value: T) -> Self {
        Self::build(String::new(), value, None)
    }

    /// Create a named observable cell; the name shows up in diagnostics.
    pub fn named(name: impl Into<String>, value: T) -> Self {
        Self::build(name.into(), value, None)
    }

    /// Create an observable cell whose stored values pass through `enhancer`
    /// (new value in, previous value for reference, stored value out). The
    /// initial value is enhanced too.
    pub fn with_enhancer<E>(name: impl Into<String>, value: T, enhancer: E) -> Self
    where
        E: Fn(T, Option<&T>) -> T + Send + Sync + 'static,
    {
        Self::build(name.into(), value, Some(Box::new(enhancer)))
    }

    fn build(name: String, value: T, enhancer: Option<Box<Enhancer<T>>>) -> Self {
        let value = match &enhancer {
            Some(enhance) => enhance(value, None),
            None => value,
        };
        Self {
            id: observable_arena_insert(ObservableMeta::new(name, ObservableKind::Atom)),
            cell: RwLock::new(value),
            enhancer,
            interceptors: CallbackRegistry::new(),
            listeners: CallbackRegistry::new(),
        }
    }

    /// Read the value, recording a dependency when a derivation is tracking.
    pub fn get(&self) -> T {
        report_observed(self.id);
        self.cell.read().clone()
    }

    /// Write the value.
    ///
    /// Interceptors run first (untracked, registration order; the first to
    /// return `None` cancels the write), then the enhancer. If the result
    /// equals the stored value nothing happens; otherwise the value is
    /// stored, staleness propagates, and change listeners fire (untracked,
    /// registration order).
    ///
    /// Panics when state modifications are not allowed here (from inside a
    /// computed evaluation, or outside an action scope in strict mode).
    pub fn set(&self, new_value: T) {
        check_state_modifications_allowed(self.id);
        match self.prepare_new_value(new_value) {
            Prepared::Changed(value) => self.commit(value),
            Prepared::Unchanged => {
                cov_mark::hit!(value_write_unchanged);
            }
        }
    }

    fn prepare_new_value(&self, mut value: T) -> Prepared<T> {
        if !self.interceptors.is_empty() {
            let _untracked = TrackingGuard::new(None);
            let mut change = ValueWillChange { new_value: value };
            for interceptor in self.interceptors.snapshot() {
                let mut interceptor = interceptor.lock();
                match (*interceptor)(change) {
                    Some(next) => change = next,
                    None => {
                        cov_mark::hit!(interceptor_cancelled_write);
                        return Prepared::Unchanged;
                    }
                }
            }
            value = change.new_value;
        }
        if let Some(enhance) = &self.enhancer {
            let current = self.cell.read();
            value = enhance(value, Some(&current));
        }
        if *self.cell.read() == value {
            Prepared::Unchanged
        } else {
            Prepared::Changed(value)
        }
    }

    fn commit(&self, value: T) {
        let old_value = {
            let mut cell = self.cell.write();
            std::mem::replace(&mut *cell, value.clone())
        };
        // The write lock is released before propagation: reactions draining
        // at the batch close read this cell.
        report_changed(self.id);
        if !self.listeners.is_empty() {
            let _untracked = TrackingGuard::new(None);
            let change = ValueDidChange {
                old_value,
                new_value: value,
            };
            for listener in self.listeners.snapshot() {
                let mut listener = listener.lock();
                (*listener)(&change);
            }
        }
    }

    /// Register an interceptor that sees every write before it is applied.
    /// Keep the returned [`Subscription`] alive for as long as the
    /// interceptor should stay registered.
    pub fn intercept<F>(&self, interceptor: F) -> Subscription
    where
        F: FnMut(ValueWillChange<T>) -> Option<ValueWillChange<T>> + Send + 'static,
    {
        self.interceptors.add(Box::new(interceptor))
    }

    /// Register a change listener fired after every applied write. Keep the
    /// returned [`Subscription`] alive for as long as the listener should
    /// stay registered.
    pub fn observe<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&ValueDidChange<T>) + Send + 'static,
    {
        self.listeners.add(Box::new(listener))
    }

    /// The cell's diagnostic name.
    pub fn name(&self) -> String {
        self.id.debug_name()
    }

    #[cfg(test)]
    pub(crate) fn id(&self) -> ObservableId {
        self.id
    }
}

impl<T> Drop for ObservableValue<T> {
    fn drop(&mut self) {
        detach_observable(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn equal_write_does_not_propagate() {
        cov_mark::check!(value_write_unchanged);
        let v = ObservableValue::new(5);
        v.set(5);
        assert_eq!(v.get(), 5);
    }

    #[test]
    fn interceptors_run_in_order_and_may_rewrite() {
        let v = ObservableValue::new(0);
        let _double = v.intercept(|mut change: ValueWillChange<i32>| {
            change.new_value *= 2;
            Some(change)
        });
        let _add_one = v.intercept(|mut change: ValueWillChange<i32>| {
            change.new_value += 1;
            Some(change)
        });

        v.set(10);
        // Registration order: doubled first, then incremented.
        assert_eq!(v.get(), 21);
    }

    #[test]
    fn interceptor_can_cancel_a_write() {
        cov_mark::check!(interceptor_cancelled_write);
        let v = ObservableValue::new(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = fired.clone();
        let _listener = v.observe(move |_change| {
            fired_in.fetch_add(1, Ordering::Relaxed);
        });
        let _veto = v.intercept(|change: ValueWillChange<i32>| {
            if change.new_value < 0 {
                None
            } else {
                Some(change)
            }
        });

        v.set(-3);
        assert_eq!(v.get(), 1);
        assert_eq!(fired.load(Ordering::Relaxed), 0);

        v.set(7);
        assert_eq!(v.get(), 7);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn listeners_see_old_and_new_values() {
        let v = ObservableValue::new(String::from("before"));
        let seen: Arc<parking_lot::Mutex<Vec<(String, String)>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let _listener = v.observe(move |change: &ValueDidChange<String>| {
            seen_in
                .lock()
                .push((change.old_value.clone(), change.new_value.clone()));
        });

        v.set(String::from("after"));
        assert_eq!(
            seen.lock().as_slice(),
            &[(String::from("before"), String::from("after"))]
        );
    }

    #[test]
    fn enhancer_normalizes_stored_values() {
        let v = ObservableValue::with_enhancer("clamped", 150, |value: i32, _old| {
            value.clamp(0, 100)
        });
        assert_eq!(v.get(), 100);

        v.set(250);
        assert_eq!(v.get(), 100);

        // 250 normalizes to the stored 100, so this write is a non-change.
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = fired.clone();
        let _listener = v.observe(move |_change| {
            fired_in.fetch_add(1, Ordering::Relaxed);
        });
        v.set(170);
        assert_eq!(fired.load(Ordering::Relaxed), 0);

        v.set(42);
        assert_eq!(v.get(), 42);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dropped_subscription_stops_the_listener() {
        let v = ObservableValue::new(0);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = fired.clone();
        let listener = v.observe(move |_change| {
            fired_in.fetch_add(1, Ordering::Relaxed);
        });

        v.set(1);
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        listener.dispose();
        v.set(2);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }
}
