#![deny(missing_docs)]

//! Transparent reactive state: a dependency graph that re-runs exactly what
//! a change actually affects.
//!
//! Reads are recorded, not declared. While a derivation (a computed value or
//! a reaction) runs, every observable it touches becomes a dependency; the
//! set is rebuilt from scratch on each run, so conditional reads narrow and
//! widen it automatically. Writes propagate staleness through the graph in
//! three colors — *stale* for direct changes, *possibly stale* for
//! transitive ones — and recomputation is pull-driven: a possibly-stale
//! derivation confirms its inputs in the order it first read them and stops
//! at the first real change.
//!
//! # Quick start
//!
//! ```ignore
//! use reagenz::{autorun, ComputedValue, ObservableValue, Transaction};
//! use std::sync::Arc;
//!
//! let price = Arc::new(ObservableValue::new(10.0));
//! let quantity = Arc::new(ObservableValue::new(2.0));
//!
//! let total = ComputedValue::new({
//!     let (price, quantity) = (price.clone(), quantity.clone());
//!     move || price.get() * quantity.get()
//! });
//!
//! let report = autorun({
//!     let total = total.clone();
//!     move || println!("total: {}", total.get())
//! }); // prints "total: 20"
//!
//! Transaction::run(|| {
//!     price.set(12.0);
//!     quantity.set(3.0);
//! }); // prints "total: 36", once
//!
//! price.set(12.0); // no change, nothing recomputes
//! drop(report);
//! ```
//!
//! # Core types
//!
//! - [`Atom`] — the smallest observable; containers call
//!   [`report_observed`](Atom::report_observed) /
//!   [`report_changed`](Atom::report_changed) around state they own.
//! - [`ObservableValue`] — a single observable cell with interceptors,
//!   change listeners and an optional write enhancer.
//! - [`ComputedValue`] — a memoized derivation that is itself observable;
//!   recomputes lazily, suspends when its last observer leaves.
//! - [`Reaction`] / [`autorun`] — eager side-effecting consumers.
//! - [`Transaction`] — batches writes so reactions run once, at the
//!   outermost close, seeing no intermediate state.
//!
//! # Batching and mutation rules
//!
//! Every write opens a batch if none is active; reactions and
//! became-unobserved checks run only when the outermost batch closes.
//! Mutating observed state from inside a computed evaluation is a bug and
//! panics. With [`set_strict_mode`] enabled, every mutation must additionally
//! happen inside an [`allow_state_changes`] scope — the contract action
//! wrappers build on.
//!
//! # Threading
//!
//! One runtime lives per OS thread: tracking, batching and reaction queues
//! are thread-local, while node storage is process-wide so handles may move
//! between threads. There is no cross-thread propagation; a reaction runs on
//! the thread that scheduled it.

pub(crate) mod arena;
mod atom;
mod batch;
mod computed;
mod derivation;
mod globals;
mod hash;
mod notify;
mod reaction;
mod value;

pub use atom::Atom;
pub use batch::{end_batch, is_batching, start_batch, Transaction};
pub use computed::ComputedValue;
pub use derivation::CaughtPanic;
pub use globals::{allow_state_changes, set_strict_mode, untracked};
pub use notify::Subscription;
pub use reaction::{autorun, autorun_named, Reaction};
pub use value::{ObservableValue, ValueDidChange, ValueWillChange};
