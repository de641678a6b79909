//! Combine many change streams (or per-item streams) into one.
//!
//! The merge family flattens a dynamically varying set of source caches into a
//! single result collection. When several sources hold the same key, the
//! published value is arbitrated by a [`MergePolicy`]: first-seen wins by
//! default, or the smallest value under an injected comparer. The shared
//! [`MergeTracker`] owns that arbitration; the operators differ only in where
//! their inner streams come from.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::cache::{Cache, ChangeAwareCache, ChangeSetCache};
use crate::changes::{Change, ChangeReason, ChangeSet};
use crate::errors::SharedError;
use crate::operators::{ChildHandle, ChildSet};
use crate::stream::{
    from_vec, BoxedObserver, Observable, ObservableExt, Observer, Subscription, WorkQueue,
};
use crate::{Data, Key};

/// How a merge arbitrates between sources holding the same key.
pub struct MergePolicy<V> {
    comparer: Option<Rc<dyn Fn(&V, &V) -> Ordering>>,
    equality: Rc<dyn Fn(&V, &V) -> bool>,
}

impl<V> Clone for MergePolicy<V> {
    fn clone(&self) -> Self {
        Self {
            comparer: self.comparer.clone(),
            equality: Rc::clone(&self.equality),
        }
    }
}

impl<V> MergePolicy<V> {
    /// First-seen wins: a key's published value is replaced only when it is
    /// withdrawn by its own source or updated in place.
    pub fn first_seen() -> Self
    where
        V: PartialEq,
    {
        Self {
            comparer: None,
            equality: Rc::new(|a: &V, b: &V| a == b),
        }
    }

    /// The published value is the smallest across all sources under
    /// `comparer`; equivalence is `comparer == Equal`.
    pub fn smallest(comparer: impl Fn(&V, &V) -> Ordering + 'static) -> Self
    where
        V: 'static,
    {
        let comparer: Rc<dyn Fn(&V, &V) -> Ordering> = Rc::new(comparer);
        let tie = Rc::clone(&comparer);
        Self {
            comparer: Some(comparer),
            equality: Rc::new(move |a: &V, b: &V| tie(a, b) == Ordering::Equal),
        }
    }

    /// Like [`smallest`](Self::smallest), with a dedicated equality comparer
    /// taking precedence over `comparer == Equal`.
    pub fn smallest_with_equality(
        comparer: impl Fn(&V, &V) -> Ordering + 'static,
        equality: impl Fn(&V, &V) -> bool + 'static,
    ) -> Self {
        Self {
            comparer: Some(Rc::new(comparer)),
            equality: Rc::new(equality),
        }
    }
}

type SourceCaches<V, K> = Vec<Rc<RefCell<Cache<V, K>>>>;

/// Maintains the merged result cache across a varying set of source caches.
pub(crate) struct MergeTracker<V, K> {
    result: ChangeAwareCache<V, K>,
    policy: MergePolicy<V>,
}

impl<V: Data, K: Key> MergeTracker<V, K> {
    pub(crate) fn new(policy: MergePolicy<V>) -> Self {
        Self {
            result: ChangeAwareCache::new(),
            policy,
        }
    }

    fn equal(&self, a: &V, b: &V) -> bool {
        (self.policy.equality)(a, b)
    }

    fn should_replace(&self, candidate: &V, published: &V) -> bool {
        match &self.policy.comparer {
            Some(comparer) => comparer(candidate, published) == Ordering::Less,
            None => false,
        }
    }

    // The winning value for `key` across `sources`: the first holder without
    // a comparer, the smallest value with one.
    fn select_value(&self, sources: &SourceCaches<V, K>, key: &K) -> Option<V> {
        match &self.policy.comparer {
            None => sources
                .iter()
                .find_map(|source| source.borrow().lookup(key).cloned()),
            Some(comparer) => {
                let mut best: Option<V> = None;
                for source in sources {
                    if let Some(candidate) = source.borrow().lookup(key) {
                        match &best {
                            Some(current) if comparer(candidate, current) != Ordering::Less => {}
                            _ => best = Some(candidate.clone()),
                        }
                    }
                }
                best
            }
        }
    }

    pub(crate) fn process(
        &mut self,
        sources: &SourceCaches<V, K>,
        change: &Change<V, K>,
    ) {
        let key = &change.key;
        match change.reason {
            ChangeReason::Add => self.on_add(change.current.clone(), key),
            ChangeReason::Update => {
                let previous = change.previous.as_ref().unwrap_or(&change.current);
                self.on_update(sources, change.current.clone(), key, previous);
            }
            ChangeReason::Remove => self.on_remove(sources, &change.current, key),
            ChangeReason::Refresh => self.on_refresh(sources, &change.current, key),
            ChangeReason::Moved => {}
        }
    }

    fn on_add(&mut self, value: V, key: &K) {
        match self.result.lookup(key) {
            None => self.result.add_or_update(key.clone(), value),
            Some(published) => {
                if self.should_replace(&value, published) {
                    self.result.add_or_update(key.clone(), value);
                }
            }
        }
    }

    fn on_remove(&mut self, sources: &SourceCaches<V, K>, value: &V, key: &K) {
        let Some(published) = self.result.lookup(key).cloned() else {
            return;
        };
        // Only the published copy's withdrawal matters.
        if !self.equal(&published, value) {
            return;
        }
        match self.select_value(sources, key) {
            Some(best) => {
                if !self.equal(&best, &published) {
                    self.result.add_or_update(key.clone(), best);
                }
            }
            None => self.result.remove(key),
        }
    }

    fn on_update(&mut self, sources: &SourceCaches<V, K>, value: V, key: &K, previous: &V) {
        let Some(published) = self.result.lookup(key).cloned() else {
            self.on_add(value, key);
            return;
        };
        match &self.policy.comparer {
            None => {
                if self.equal(previous, &published) && !self.equal(&value, &published) {
                    self.result.add_or_update(key.clone(), value);
                }
            }
            Some(_) => {
                if self.equal(previous, &published) {
                    if let Some(best) = self.select_value(sources, key) {
                        if !self.equal(&best, &published) {
                            self.result.add_or_update(key.clone(), best);
                        }
                    }
                } else if self.should_replace(&value, &published) {
                    self.result.add_or_update(key.clone(), value);
                }
            }
        }
    }

    fn on_refresh(&mut self, sources: &SourceCaches<V, K>, value: &V, key: &K) {
        let Some(published) = self.result.lookup(key).cloned() else {
            return;
        };
        match &self.policy.comparer {
            Some(_) => match self.select_value(sources, key) {
                Some(best) if !self.equal(&best, &published) => {
                    self.result.add_or_update(key.clone(), best);
                }
                _ => {
                    if self.equal(value, &published) {
                        self.result.refresh(key);
                    }
                }
            },
            None => {
                if self.equal(value, &published) {
                    self.result.refresh(key);
                }
            }
        }
    }

    /// Withdraws every pair a departing source had published, re-selecting
    /// replacements from the remaining `sources`.
    pub(crate) fn remove_items(&mut self, sources: &SourceCaches<V, K>, items: &[(K, V)]) {
        for (key, value) in items {
            self.on_remove(sources, value, key);
        }
    }

    pub(crate) fn capture_changes(&mut self) -> ChangeSet<V, K> {
        self.result.capture_changes()
    }
}

/// The stream produced by
/// [`ChangeStreamExt::merge_many`](super::ChangeStreamExt::merge_many):
/// per-item streams flattened into one stream of destination values.
pub struct MergeMany<S, F> {
    source: S,
    selector: Rc<F>,
}

impl<S, F> MergeMany<S, F> {
    pub(crate) fn new(source: S, selector: F) -> Self {
        Self {
            source,
            selector: Rc::new(selector),
        }
    }
}

impl<S: Clone, F> Clone for MergeMany<S, F> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            selector: Rc::clone(&self.selector),
        }
    }
}

struct MergeManyState<K, D> {
    children: ChildSet<K>,
    parent_sub: Option<Subscription>,
    active: usize,
    done: bool,
    downstream: BoxedObserver<D>,
}

struct MergeManyCore<K, D> {
    state: RefCell<MergeManyState<K, D>>,
    queue: WorkQueue,
}

impl<K: Key, D: 'static> MergeManyCore<K, D> {
    fn fail(&self, error: SharedError) {
        let state = &mut *self.state.borrow_mut();
        if state.done {
            return;
        }
        state.done = true;
        if let Some(parent) = state.parent_sub.take() {
            parent.dispose();
        }
        for child in state.children.drain_reverse() {
            child.dispose();
        }
        state.downstream.on_error(error);
    }

    fn settle(&self) {
        let state = &mut *self.state.borrow_mut();
        if state.active == 0 && !state.done {
            state.done = true;
            state.downstream.on_completed();
        }
    }

    fn teardown(&self) {
        let state = &mut *self.state.borrow_mut();
        state.done = true;
        if let Some(parent) = state.parent_sub.take() {
            parent.dispose();
        }
        for child in state.children.drain_reverse() {
            child.dispose();
        }
    }
}

impl<S, F, R, V, K, D> Observable for MergeMany<S, F>
where
    V: Data,
    K: Key,
    D: 'static,
    S: Observable<Item = ChangeSet<V, K>>,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = D> + 'static,
{
    type Item = D;

    fn subscribe_observer(&self, observer: BoxedObserver<D>) -> Subscription {
        let core = Rc::new(MergeManyCore {
            state: RefCell::new(MergeManyState {
                children: ChildSet::new(),
                parent_sub: None,
                active: 1,
                done: false,
                downstream: observer,
            }),
            queue: WorkQueue::new(),
        });
        let selector = Rc::clone(&self.selector);

        let parent_core = Rc::clone(&core);
        let error_core = Rc::clone(&core);
        let completed_core = Rc::clone(&core);
        let parent_sub = self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let core = Rc::clone(&parent_core);
                let selector = Rc::clone(&selector);
                let work_core = Rc::clone(&core);
                core.queue.run(
                    move || {
                        let state = &mut *work_core.state.borrow_mut();
                        if state.done {
                            return;
                        }
                        for change in changes.iter() {
                            let key = change.key.clone();
                            match change.reason {
                                ChangeReason::Add | ChangeReason::Update => {
                                    if let Some(old) = state.children.remove(&key) {
                                        if !old.is_completed() {
                                            state.active -= 1;
                                        }
                                        old.dispose();
                                    }
                                    let child = subscribe_flattened(
                                        &work_core,
                                        &selector,
                                        &change.current,
                                        &key,
                                    );
                                    state.active += 1;
                                    state.children.insert(key, child);
                                }
                                ChangeReason::Remove => {
                                    if let Some(old) = state.children.remove(&key) {
                                        if !old.is_completed() {
                                            state.active -= 1;
                                        }
                                        old.dispose();
                                    }
                                }
                                ChangeReason::Refresh | ChangeReason::Moved => {}
                            }
                        }
                    },
                    || {},
                );
            },
            move |error| {
                let core = Rc::clone(&error_core);
                let work_core = Rc::clone(&core);
                core.queue.run(move || work_core.fail(error), || {});
            },
            move || {
                let core = Rc::clone(&completed_core);
                let work_core = Rc::clone(&core);
                core.queue.run(
                    move || {
                        let settle = {
                            let state = &mut *work_core.state.borrow_mut();
                            state.active -= 1;
                            state.active == 0
                        };
                        if settle {
                            work_core.settle();
                        }
                    },
                    || {},
                );
            },
        );
        core.state.borrow_mut().parent_sub = Some(parent_sub);

        let teardown_core = Rc::clone(&core);
        Subscription::new(move || {
            let work_core = Rc::clone(&teardown_core);
            teardown_core.queue.run(move || work_core.teardown(), || {});
        })
    }
}

fn subscribe_flattened<V, K, D, F, R>(
    core: &Rc<MergeManyCore<K, D>>,
    selector: &Rc<F>,
    value: &V,
    key: &K,
) -> ChildHandle
where
    V: Data,
    K: Key,
    D: 'static,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = D> + 'static,
{
    let completed = Rc::new(Cell::new(false));
    let values = selector(value, key);

    let value_core = Rc::clone(core);
    let error_core = Rc::clone(core);
    let completed_core = Rc::clone(core);
    let completed_flag = Rc::clone(&completed);
    let subscription = values.subscribe_all(
        move |destination: D| {
            let core = Rc::clone(&value_core);
            let work_core = Rc::clone(&core);
            core.queue.run(
                move || {
                    let state = &mut *work_core.state.borrow_mut();
                    if !state.done {
                        state.downstream.on_next(destination);
                    }
                },
                || {},
            );
        },
        move |error| {
            let core = Rc::clone(&error_core);
            let work_core = Rc::clone(&core);
            core.queue.run(move || work_core.fail(error), || {});
        },
        move || {
            let core = Rc::clone(&completed_core);
            let flag = Rc::clone(&completed_flag);
            let work_core = Rc::clone(&core);
            core.queue.run(
                move || {
                    if !flag.get() {
                        flag.set(true);
                        let settle = {
                            let state = &mut *work_core.state.borrow_mut();
                            state.active -= 1;
                            state.active == 0
                        };
                        if settle {
                            work_core.settle();
                        }
                    }
                },
                || {},
            );
        },
    );

    ChildHandle::new(subscription, completed)
}

/// Merges a fixed set of change streams into one, first-seen-wins.
pub fn merge_change_sets<S, V, K>(sources: Vec<S>) -> MergeChangeSets<crate::stream::FromVec<S>, V>
where
    V: Data + PartialEq,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>> + Clone + 'static,
{
    MergeChangeSets::new(from_vec(sources), MergePolicy::first_seen(), true)
}

/// Merges a fixed set of change streams into one, publishing the smallest
/// value per key under `comparer`.
pub fn merge_change_sets_by<S, V, K>(
    sources: Vec<S>,
    comparer: impl Fn(&V, &V) -> Ordering + 'static,
) -> MergeChangeSets<crate::stream::FromVec<S>, V>
where
    V: Data,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>> + Clone + 'static,
{
    MergeChangeSets::new(from_vec(sources), MergePolicy::smallest(comparer), true)
}

/// The merged stream over a dynamic outer stream of inner change streams.
pub struct MergeChangeSets<SO, V> {
    outer: SO,
    policy: MergePolicy<V>,
    completable: bool,
}

impl<SO, V> MergeChangeSets<SO, V> {
    /// Merges the inner streams delivered by `outer` under `policy`. With
    /// `completable` unset the merged stream never completes, no matter what
    /// the outer or inner streams do.
    pub fn new(outer: SO, policy: MergePolicy<V>, completable: bool) -> Self {
        Self {
            outer,
            policy,
            completable,
        }
    }
}

impl<SO: Clone, V> Clone for MergeChangeSets<SO, V> {
    fn clone(&self) -> Self {
        Self {
            outer: self.outer.clone(),
            policy: self.policy.clone(),
            completable: self.completable,
        }
    }
}

struct InnerSource<V, K> {
    cache: Rc<RefCell<Cache<V, K>>>,
    sub: Subscription,
}

struct MergeSetsState<V, K> {
    tracker: MergeTracker<V, K>,
    inners: IndexMap<u64, InnerSource<V, K>>,
    next_id: u64,
    outer_sub: Option<Subscription>,
    active: usize,
    done: bool,
    downstream: BoxedObserver<ChangeSet<V, K>>,
}

struct MergeSetsCore<V, K> {
    state: RefCell<MergeSetsState<V, K>>,
    queue: WorkQueue,
}

impl<V: Data, K: Key> MergeSetsCore<V, K> {
    fn sources(state: &MergeSetsState<V, K>) -> SourceCaches<V, K> {
        state
            .inners
            .values()
            .map(|inner| Rc::clone(&inner.cache))
            .collect()
    }

    fn emit(&self) {
        let state = &mut *self.state.borrow_mut();
        if state.done {
            return;
        }
        let captured = state.tracker.capture_changes();
        if !captured.is_empty() {
            state.downstream.on_next(captured);
        }
    }

    fn fail(&self, error: SharedError) {
        let state = &mut *self.state.borrow_mut();
        if state.done {
            return;
        }
        state.done = true;
        if let Some(outer) = state.outer_sub.take() {
            outer.dispose();
        }
        for (_, inner) in state.inners.drain(..).rev() {
            inner.sub.dispose();
        }
        state.downstream.on_error(error);
    }

    fn settle(&self) {
        let state = &mut *self.state.borrow_mut();
        if state.active == 0 && !state.done {
            state.done = true;
            state.downstream.on_completed();
        }
    }

    fn teardown(&self) {
        let state = &mut *self.state.borrow_mut();
        state.done = true;
        if let Some(outer) = state.outer_sub.take() {
            outer.dispose();
        }
        for (_, inner) in state.inners.drain(..).rev() {
            inner.sub.dispose();
        }
    }
}

impl<SO, SI, V, K> Observable for MergeChangeSets<SO, V>
where
    V: Data,
    K: Key,
    SO: Observable<Item = SI>,
    SI: Observable<Item = ChangeSet<V, K>> + 'static,
{
    type Item = ChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V, K>>) -> Subscription {
        let core = Rc::new(MergeSetsCore {
            state: RefCell::new(MergeSetsState {
                tracker: MergeTracker::new(self.policy.clone()),
                inners: IndexMap::new(),
                next_id: 0,
                outer_sub: None,
                active: 1,
                done: false,
                downstream: observer,
            }),
            queue: WorkQueue::new(),
        });
        let completable = self.completable;

        let outer_core = Rc::clone(&core);
        let error_core = Rc::clone(&core);
        let completed_core = Rc::clone(&core);
        let outer_sub = self.outer.subscribe_all(
            move |inner: SI| {
                let core = Rc::clone(&outer_core);
                let work_core = Rc::clone(&core);
                let finally_core = Rc::clone(&core);
                core.queue.run(
                    move || attach_inner(&work_core, inner, completable),
                    move || finally_core.emit(),
                );
            },
            move |error| {
                let core = Rc::clone(&error_core);
                let work_core = Rc::clone(&core);
                core.queue.run(move || work_core.fail(error), || {});
            },
            move || {
                if !completable {
                    return;
                }
                let core = Rc::clone(&completed_core);
                let work_core = Rc::clone(&core);
                core.queue.run(
                    move || {
                        let settle = {
                            let state = &mut *work_core.state.borrow_mut();
                            state.active -= 1;
                            state.active == 0
                        };
                        if settle {
                            work_core.settle();
                        }
                    },
                    || {},
                );
            },
        );
        core.state.borrow_mut().outer_sub = Some(outer_sub);

        let teardown_core = Rc::clone(&core);
        Subscription::new(move || {
            let work_core = Rc::clone(&teardown_core);
            teardown_core.queue.run(move || work_core.teardown(), || {});
        })
    }
}

fn attach_inner<SI, V, K>(core: &Rc<MergeSetsCore<V, K>>, inner: SI, completable: bool)
where
    V: Data,
    K: Key,
    SI: Observable<Item = ChangeSet<V, K>> + 'static,
{
    let id = {
        let state = &mut *core.state.borrow_mut();
        if state.done {
            return;
        }
        let id = state.next_id;
        state.next_id += 1;
        id
    };

    let mirrored = ChangeSetCache::new(inner);
    let cache = mirrored.cache_handle();
    let completed = Rc::new(Cell::new(false));

    let batch_core = Rc::clone(core);
    let inner_errors = Rc::clone(core);
    let inner_completed = Rc::clone(core);
    let completed_flag = Rc::clone(&completed);
    let sub = mirrored.connect(
        move |changes: ChangeSet<V, K>| {
            let core = Rc::clone(&batch_core);
            let work_core = Rc::clone(&core);
            let finally_core = Rc::clone(&core);
            core.queue.run(
                move || {
                    let state = &mut *work_core.state.borrow_mut();
                    if state.done {
                        return;
                    }
                    let sources = MergeSetsCore::sources(state);
                    for change in changes.iter() {
                        state.tracker.process(&sources, change);
                    }
                },
                move || finally_core.emit(),
            );
        },
        move |error| {
            let core = Rc::clone(&inner_errors);
            let work_core = Rc::clone(&core);
            core.queue.run(move || work_core.fail(error), || {});
        },
        move || {
            if !completable {
                return;
            }
            let core = Rc::clone(&inner_completed);
            let flag = Rc::clone(&completed_flag);
            let work_core = Rc::clone(&core);
            core.queue.run(
                move || {
                    if !flag.get() {
                        flag.set(true);
                        let settle = {
                            let state = &mut *work_core.state.borrow_mut();
                            state.active -= 1;
                            state.active == 0
                        };
                        if settle {
                            work_core.settle();
                        }
                    }
                },
                || {},
            );
        },
    );

    let state = &mut *core.state.borrow_mut();
    if state.done {
        sub.dispose();
        return;
    }
    if completable {
        state.active += 1;
    }
    state.inners.insert(id, InnerSource { cache, sub });
}

/// The stream produced by
/// [`ChangeStreamExt::merge_many_change_sets`](super::ChangeStreamExt::merge_many_change_sets):
/// a cache of caches flattened into one collection with best-value
/// arbitration.
pub struct MergeManyChangeSets<S, F, V2> {
    source: S,
    selector: Rc<F>,
    policy: MergePolicy<V2>,
}

impl<S, F, V2> MergeManyChangeSets<S, F, V2> {
    pub(crate) fn new(source: S, selector: F, policy: MergePolicy<V2>) -> Self {
        Self {
            source,
            selector: Rc::new(selector),
            policy,
        }
    }
}

impl<S: Clone, F, V2> Clone for MergeManyChangeSets<S, F, V2> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            selector: Rc::clone(&self.selector),
            policy: self.policy.clone(),
        }
    }
}

struct InnerChild<V2, K2> {
    cache: Rc<RefCell<Cache<V2, K2>>>,
    sub: Subscription,
    completed: Rc<Cell<bool>>,
}

struct MergeManySetsState<K, V2, K2> {
    tracker: MergeTracker<V2, K2>,
    inners: IndexMap<K, InnerChild<V2, K2>>,
    parent_sub: Option<Subscription>,
    active: usize,
    done: bool,
    downstream: BoxedObserver<ChangeSet<V2, K2>>,
}

struct MergeManySetsCore<K, V2, K2> {
    state: RefCell<MergeManySetsState<K, V2, K2>>,
    queue: WorkQueue,
}

impl<K: Key, V2: Data, K2: Key> MergeManySetsCore<K, V2, K2> {
    fn sources(state: &MergeManySetsState<K, V2, K2>) -> SourceCaches<V2, K2> {
        state
            .inners
            .values()
            .map(|inner| Rc::clone(&inner.cache))
            .collect()
    }

    fn emit(&self) {
        let state = &mut *self.state.borrow_mut();
        if state.done {
            return;
        }
        let captured = state.tracker.capture_changes();
        if !captured.is_empty() {
            state.downstream.on_next(captured);
        }
    }

    fn fail(&self, error: SharedError) {
        let state = &mut *self.state.borrow_mut();
        if state.done {
            return;
        }
        state.done = true;
        if let Some(parent) = state.parent_sub.take() {
            parent.dispose();
        }
        for (_, inner) in state.inners.drain(..).rev() {
            inner.sub.dispose();
        }
        state.downstream.on_error(error);
    }

    fn settle(&self) {
        let state = &mut *self.state.borrow_mut();
        if state.active == 0 && !state.done {
            state.done = true;
            state.downstream.on_completed();
        }
    }

    fn teardown(&self) {
        let state = &mut *self.state.borrow_mut();
        state.done = true;
        if let Some(parent) = state.parent_sub.take() {
            parent.dispose();
        }
        for (_, inner) in state.inners.drain(..).rev() {
            inner.sub.dispose();
        }
    }

    // Detaches the inner stream for `key` and withdraws everything it had
    // published, re-selecting replacements from the surviving sources.
    fn withdraw(&self, state: &mut MergeManySetsState<K, V2, K2>, key: &K) {
        if let Some(inner) = state.inners.shift_remove(key) {
            if !inner.completed.get() {
                state.active -= 1;
            }
            inner.sub.dispose();
            let departed: Vec<(K2, V2)> = inner
                .cache
                .borrow()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let sources = Self::sources(state);
            state.tracker.remove_items(&sources, &departed);
        }
    }
}

impl<S, F, R, V, K, V2, K2> Observable for MergeManyChangeSets<S, F, V2>
where
    V: Data,
    K: Key,
    V2: Data,
    K2: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = ChangeSet<V2, K2>> + 'static,
{
    type Item = ChangeSet<V2, K2>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V2, K2>>) -> Subscription {
        let core = Rc::new(MergeManySetsCore {
            state: RefCell::new(MergeManySetsState {
                tracker: MergeTracker::new(self.policy.clone()),
                inners: IndexMap::new(),
                parent_sub: None,
                active: 1,
                done: false,
                downstream: observer,
            }),
            queue: WorkQueue::new(),
        });
        let selector = Rc::clone(&self.selector);

        let parent_core = Rc::clone(&core);
        let error_core = Rc::clone(&core);
        let completed_core = Rc::clone(&core);
        let parent_sub = self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let core = Rc::clone(&parent_core);
                let selector = Rc::clone(&selector);
                let work_core = Rc::clone(&core);
                let finally_core = Rc::clone(&core);
                core.queue.run(
                    move || {
                        {
                            let state = &mut *work_core.state.borrow_mut();
                            if state.done {
                                return;
                            }
                            for change in changes.iter() {
                                match change.reason {
                                    ChangeReason::Add | ChangeReason::Update => {
                                        work_core.withdraw(state, &change.key);
                                        attach_keyed_inner(
                                            &work_core,
                                            state,
                                            &selector,
                                            &change.current,
                                            &change.key,
                                        );
                                    }
                                    ChangeReason::Remove => {
                                        work_core.withdraw(state, &change.key);
                                    }
                                    ChangeReason::Refresh | ChangeReason::Moved => {}
                                }
                            }
                        }
                    },
                    move || finally_core.emit(),
                );
            },
            move |error| {
                let core = Rc::clone(&error_core);
                let work_core = Rc::clone(&core);
                core.queue.run(move || work_core.fail(error), || {});
            },
            move || {
                let core = Rc::clone(&completed_core);
                let work_core = Rc::clone(&core);
                core.queue.run(
                    move || {
                        let settle = {
                            let state = &mut *work_core.state.borrow_mut();
                            state.active -= 1;
                            state.active == 0
                        };
                        if settle {
                            work_core.settle();
                        }
                    },
                    || {},
                );
            },
        );
        core.state.borrow_mut().parent_sub = Some(parent_sub);

        let teardown_core = Rc::clone(&core);
        Subscription::new(move || {
            let work_core = Rc::clone(&teardown_core);
            teardown_core.queue.run(move || work_core.teardown(), || {});
        })
    }
}

fn attach_keyed_inner<V, K, V2, K2, F, R>(
    core: &Rc<MergeManySetsCore<K, V2, K2>>,
    state: &mut MergeManySetsState<K, V2, K2>,
    selector: &Rc<F>,
    value: &V,
    key: &K,
) where
    V: Data,
    K: Key,
    V2: Data,
    K2: Key,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = ChangeSet<V2, K2>> + 'static,
{
    let mirrored = ChangeSetCache::new(selector(value, key));
    let cache = mirrored.cache_handle();
    let completed = Rc::new(Cell::new(false));

    let batch_core = Rc::clone(core);
    let inner_errors = Rc::clone(core);
    let inner_completed = Rc::clone(core);
    let completed_flag = Rc::clone(&completed);
    let sub = mirrored.connect(
        move |changes: ChangeSet<V2, K2>| {
            let core = Rc::clone(&batch_core);
            let work_core = Rc::clone(&core);
            let finally_core = Rc::clone(&core);
            core.queue.run(
                move || {
                    let state = &mut *work_core.state.borrow_mut();
                    if state.done {
                        return;
                    }
                    let sources = MergeManySetsCore::sources(state);
                    for change in changes.iter() {
                        state.tracker.process(&sources, change);
                    }
                },
                move || finally_core.emit(),
            );
        },
        move |error| {
            let core = Rc::clone(&inner_errors);
            let work_core = Rc::clone(&core);
            core.queue.run(move || work_core.fail(error), || {});
        },
        move || {
            let core = Rc::clone(&inner_completed);
            let flag = Rc::clone(&completed_flag);
            let work_core = Rc::clone(&core);
            core.queue.run(
                move || {
                    if !flag.get() {
                        flag.set(true);
                        let settle = {
                            let state = &mut *work_core.state.borrow_mut();
                            state.active -= 1;
                            state.active == 0
                        };
                        if settle {
                            work_core.settle();
                        }
                    }
                },
                || {},
            );
        },
    );

    state.active += 1;
    state.inners.insert(
        key.clone(),
        InnerChild {
            cache,
            sub,
            completed,
        },
    );
}
