//! The editable, subscribable cache that fronts a pipeline.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cache::ChangeAwareCache;
use crate::changes::{Change, ChangeSet};
use crate::stream::{BoxedObserver, Observable, Observer, ObservableExt, Subject, Subscription};
use crate::{Data, Key};

struct CacheHub<V, K> {
    cache: ChangeAwareCache<V, K>,
}

/// An editable keyed cache whose mutations are published as change sets.
///
/// Edits are batched through [`update`](Self::update): the whole closure runs
/// against the cache, and the coalesced result is published to subscribers as
/// one atomic batch. [`connect`](Self::connect) replays the current state to a
/// new subscriber as an initial `Add`-only batch before live changes, so a
/// late subscriber reconstructs the same collection as an early one.
///
/// Cloning the handle shares the underlying cache.
pub struct ObservableCache<V, K> {
    state: Rc<RefCell<CacheHub<V, K>>>,
    subject: Subject<ChangeSet<V, K>>,
}

impl<V, K> Clone for ObservableCache<V, K> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            subject: self.subject.clone(),
        }
    }
}

impl<V: Data, K: Key> Default for ObservableCache<V, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Data, K: Key> ObservableCache<V, K> {
    /// An empty cache.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(CacheHub {
                cache: ChangeAwareCache::new(),
            })),
            subject: Subject::new(),
        }
    }

    /// Applies a batch of edits atomically and publishes the captured result.
    ///
    /// Nothing is published when the edits coalesce to no net change.
    pub fn update(&self, edits: impl FnOnce(&mut CacheUpdater<'_, V, K>)) {
        let captured = {
            let mut hub = self.state.borrow_mut();
            let mut updater = CacheUpdater {
                cache: &mut hub.cache,
            };
            edits(&mut updater);
            hub.cache.capture_changes()
        };
        if !captured.is_empty() {
            self.subject.on_next(captured);
        }
    }

    /// The number of entries currently held.
    pub fn len(&self) -> usize {
        self.state.borrow().cache.len()
    }

    /// True when no entries are held.
    pub fn is_empty(&self) -> bool {
        self.state.borrow().cache.is_empty()
    }

    /// The current value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        self.state.borrow().cache.lookup(key).cloned()
    }

    /// A snapshot of the current keys, in arbitrary order.
    pub fn keys(&self) -> Vec<K> {
        self.state.borrow().cache.keys().cloned().collect()
    }

    /// A snapshot of the current entries, in arbitrary order.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.state
            .borrow()
            .cache
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The cache's change stream, suppressing empty batches.
    pub fn connect(&self) -> CacheStream<V, K> {
        self.connect_with(true)
    }

    /// The cache's change stream; `suppress_empty` controls whether
    /// zero-change batches (including an empty initial snapshot) are
    /// delivered.
    pub fn connect_with(&self, suppress_empty: bool) -> CacheStream<V, K> {
        CacheStream {
            cache: self.clone(),
            suppress_empty,
        }
    }

    /// The stream of changes affecting one key, starting with its current
    /// value, if present, as an `Add`.
    pub fn watch(&self, key: K) -> Watcher<V, K> {
        Watcher {
            cache: self.clone(),
            key,
        }
    }

    /// Completes every subscriber. Further edits mutate the cache but are no
    /// longer published.
    pub fn complete(&self) {
        self.subject.on_completed();
    }

    // Fails every subscriber; used when an upstream feeding this cache errors.
    pub(crate) fn fail(&self, error: crate::errors::SharedError) {
        self.subject.on_error(error);
    }

    fn snapshot(&self) -> ChangeSet<V, K> {
        self.state
            .borrow()
            .cache
            .iter()
            .map(|(k, v)| Change::add(k.clone(), v.clone()))
            .collect()
    }
}

/// The batch-edit surface handed to [`ObservableCache::update`] closures.
pub struct CacheUpdater<'a, V, K> {
    cache: &'a mut ChangeAwareCache<V, K>,
}

impl<V: Data, K: Key> CacheUpdater<'_, V, K> {
    /// Writes `value` under `key`.
    pub fn add_or_update(&mut self, key: K, value: V) {
        self.cache.add_or_update(key, value);
    }

    /// Writes every pair in `entries`.
    pub fn load(&mut self, entries: impl IntoIterator<Item = (K, V)>) {
        for (key, value) in entries {
            self.cache.add_or_update(key, value);
        }
    }

    /// Replays an upstream batch into this cache: writes write, removals
    /// remove, refreshes re-signal, `Moved` is skipped.
    pub fn apply(&mut self, changes: &ChangeSet<V, K>) {
        self.cache.apply(changes);
    }

    /// Deletes `key`, if present.
    pub fn remove(&mut self, key: &K) {
        self.cache.remove(key);
    }

    /// Signals that `key` should be re-evaluated downstream.
    pub fn refresh(&mut self, key: &K) {
        self.cache.refresh(key);
    }

    /// Signals re-evaluation of every key.
    pub fn refresh_all(&mut self) {
        self.cache.refresh_all();
    }

    /// Deletes every key.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// The value currently held for `key`, if any.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.cache.lookup(key)
    }

    /// True when a value is held for `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    /// The number of entries currently held.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// True when no entries are held.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// The change stream of an [`ObservableCache`].
pub struct CacheStream<V, K> {
    cache: ObservableCache<V, K>,
    suppress_empty: bool,
}

impl<V, K> Clone for CacheStream<V, K> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            suppress_empty: self.suppress_empty,
        }
    }
}

impl<V: Data, K: Key> Observable for CacheStream<V, K> {
    type Item = ChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V, K>>) -> Subscription {
        let shared = Rc::new(RefCell::new(observer));
        let snapshot = self.cache.snapshot();
        if !snapshot.is_empty() || !self.suppress_empty {
            shared.borrow_mut().on_next(snapshot);
        }
        self.cache.subject.subscribe_shared(shared)
    }
}

/// The per-key stream returned by [`ObservableCache::watch`].
pub struct Watcher<V, K> {
    cache: ObservableCache<V, K>,
    key: K,
}

impl<V, K> Clone for Watcher<V, K>
where
    K: Clone,
{
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            key: self.key.clone(),
        }
    }
}

impl<V: Data, K: Key> Observable for Watcher<V, K> {
    type Item = Change<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<Change<V, K>>) -> Subscription {
        let shared = Rc::new(RefCell::new(observer));
        let error_target = Rc::clone(&shared);
        let completion_target = Rc::clone(&shared);
        let key = self.key.clone();
        self.cache.connect().subscribe_all(
            move |changes: ChangeSet<V, K>| {
                for change in changes.iter() {
                    if change.key == key {
                        shared.borrow_mut().on_next(change.clone());
                    }
                }
            },
            move |error| error_target.borrow_mut().on_error(error),
            move || completion_target.borrow_mut().on_completed(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::ChangeReason;

    #[test]
    fn connect_replays_state_then_live_changes() {
        let cache = ObservableCache::new();
        cache.update(|updater| updater.add_or_update("a", 1));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let _sub = cache
            .connect()
            .subscribe(move |set: ChangeSet<i32, &str>| sink.borrow_mut().push(set));

        cache.update(|updater| updater.add_or_update("b", 2));

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].len(), 1);
        assert_eq!(seen[0][0].reason, ChangeReason::Add);
        assert_eq!(seen[0][0].key, "a");
        assert_eq!(seen[1][0].key, "b");
    }

    #[test]
    fn update_publishes_one_coalesced_batch() {
        let cache = ObservableCache::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let _sub = cache
            .connect()
            .subscribe(move |set: ChangeSet<i32, &str>| sink.borrow_mut().push(set));

        cache.update(|updater| {
            updater.add_or_update("a", 1);
            updater.add_or_update("a", 2);
            updater.add_or_update("b", 9);
            updater.remove(&"b");
        });

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 1);
        assert_eq!(seen[0][0].reason, ChangeReason::Add);
        assert_eq!(seen[0][0].current, 2);
    }

    #[test]
    fn watch_follows_one_key() {
        let cache = ObservableCache::new();
        cache.update(|updater| {
            updater.add_or_update("a", 1);
            updater.add_or_update("b", 2);
        });

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let _sub = cache
            .watch("a")
            .subscribe(move |change: Change<i32, &str>| sink.borrow_mut().push(change));

        cache.update(|updater| {
            updater.add_or_update("a", 10);
            updater.add_or_update("b", 20);
        });

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].reason, ChangeReason::Add);
        assert_eq!(seen[0].current, 1);
        assert_eq!(seen[1].reason, ChangeReason::Update);
        assert_eq!(seen[1].current, 10);
    }
}
