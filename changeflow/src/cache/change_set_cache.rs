//! A change stream paired with a mirror cache of its accumulated state.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cache::Cache;
use crate::changes::ChangeSet;
use crate::errors::SharedError;
use crate::stream::{Observable, ObservableExt, Subscription};
use crate::{Data, Key};

/// Wraps an upstream change stream and materialises whatever it has emitted.
///
/// Subscribing through [`connect`](Self::connect) both forwards each batch and
/// applies it to the mirror cache, so that the cache always reflects the
/// stream's accumulated state at the point a batch is observed. The merge
/// family reads these mirrors when re-selecting the best value for a key.
pub struct ChangeSetCache<V, K, S> {
    source: S,
    cache: Rc<RefCell<Cache<V, K>>>,
}

impl<V: Data, K: Key, S> ChangeSetCache<V, K, S>
where
    S: Observable<Item = ChangeSet<V, K>>,
{
    /// Pairs `source` with an empty mirror cache.
    pub fn new(source: S) -> Self {
        Self {
            source,
            cache: Rc::new(RefCell::new(Cache::new())),
        }
    }

    /// The number of entries accumulated so far.
    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    /// True when nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.cache.borrow().is_empty()
    }

    /// The accumulated value for `key`, if any.
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.cache.borrow().lookup(key).cloned()
    }

    /// A snapshot of the accumulated entries.
    pub fn key_values(&self) -> Vec<(K, V)> {
        self.cache
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The shared mirror handle, for readers that follow the stream.
    pub(crate) fn cache_handle(&self) -> Rc<RefCell<Cache<V, K>>> {
        Rc::clone(&self.cache)
    }

    /// Subscribes to the source, applying each batch to the mirror before
    /// handing it to `on_next`.
    pub fn connect<N, E, C>(&self, mut on_next: N, on_error: E, on_completed: C) -> Subscription
    where
        N: FnMut(ChangeSet<V, K>) + 'static,
        E: FnMut(SharedError) + 'static,
        C: FnMut() + 'static,
    {
        let cache = Rc::clone(&self.cache);
        self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                cache.borrow_mut().apply(&changes);
                on_next(changes);
            },
            on_error,
            on_completed,
        )
    }
}
