//! Changeflow is an incremental change-propagation engine for keyed collections.
//!
//! Changeflow programs are written in a collection-oriented style, where a logical
//! collection of values indexed by unique keys is transformed and combined using
//! operators like `filter`, `transform`, `group_by`, and the join family. Rather
//! than re-computing or diffing whole collections, every operator consumes a
//! stream of [`ChangeSet`]s — ordered batches of keyed mutations — maintains just
//! enough private state to interpret them, and emits the derived change sets that
//! keep its own downstream consumers equivalent.
//!
//! Having assembled a pipeline, you mutate the source cache (inserting, updating
//! and removing keyed values); the engine propagates the corresponding additions,
//! updates and removals through every operator to the pipeline's outputs.
//!
//! # Examples
//!
//! ```
//! use changeflow::{ChangeStreamExt, ObservableCache, ObservableExt};
//! use std::{cell::RefCell, rc::Rc};
//!
//! // An editable cache of `i32` values keyed by `i32`.
//! let source = ObservableCache::new();
//!
//! // Keep only even values, squared.
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sink = Rc::clone(&seen);
//! let _sub = source
//!     .connect()
//!     .filter(|value: &i32| value % 2 == 0)
//!     .transform(|value, _key| value * value)
//!     .subscribe(move |changes| sink.borrow_mut().push(changes));
//!
//! source.update(|cache| {
//!     cache.add_or_update(1, 1);
//!     cache.add_or_update(2, 2);
//!     cache.add_or_update(3, 3);
//! });
//!
//! // One batch, containing the single surviving addition.
//! assert_eq!(seen.borrow().len(), 1);
//! assert_eq!(seen.borrow()[0].len(), 1);
//! assert_eq!(seen.borrow()[0][0].current, 4);
//! ```
//!
//! The flow of data is strictly downstream: upstream change sets enter an
//! operator, the operator mutates its private [`ChangeAwareCache`] (or derived
//! state), captures the accumulated changes as one batch, and forwards it.
//! Control flows upstream only through [`Subscription`] disposal, which tears
//! down per-key and parent subscriptions in reverse order.

#![forbid(missing_docs)]

pub mod cache;
pub mod changes;
pub mod errors;
pub mod operators;
pub mod stream;

pub use cache::{Cache, CacheUpdater, ChangeAwareCache, ChangeSetCache, ObservableCache};
pub use changes::{Change, ChangeReason, ChangeSet};
pub use errors::{ItemError, MissingKeyError, SelectorError, SharedError, SortError};
pub use operators::{ChangeStreamExt, SortedStreamExt};
pub use stream::{
    Observable, ObservableExt, Observer, Scheduler, Subject, Subscription, VirtualScheduler,
};

/// A composite trait for value types usable in the engine.
///
/// Values are opaque to the engine except where an operator is handed a
/// comparer or equality comparer, so cloning and `'static` lifetime are all the
/// engine itself requires.
pub trait Data: Clone + 'static {}
impl<T: Clone + 'static> Data for T {}

/// A composite trait for key types usable in the engine.
///
/// Keys uniquely identify an item within a collection, are treated as
/// immutable, and index the engine's internal hash maps.
pub trait Key: Clone + Eq + std::hash::Hash + 'static {}
impl<T: Clone + Eq + std::hash::Hash + 'static> Key for T {}
