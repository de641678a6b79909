//! The stateful caches operators maintain their view of a collection in.
//!
//! A [`Cache`] is the plain materialisation of a change stream: applying each
//! batch in order reconstructs the collection the stream describes. A
//! [`ChangeAwareCache`] is the mutable working state of an operator — every
//! mutation is recorded into a pending buffer that
//! [`capture_changes`](ChangeAwareCache::capture_changes) drains into the
//! operator's outgoing batch. A [`ChangeSetCache`] pairs a change stream with
//! a mirror cache of its accumulated state, and an [`ObservableCache`] is the
//! editable, subscribable hub that fronts a pipeline.

mod change_aware;
mod change_set_cache;
mod observable_cache;
mod plain;

pub use change_aware::ChangeAwareCache;
pub use change_set_cache::ChangeSetCache;
pub use observable_cache::{CacheStream, CacheUpdater, ObservableCache, Watcher};
pub use plain::Cache;
