//! Keep the subset of a collection satisfying a predicate.
//!
//! Four flavours: [`Filter`] evaluates a fixed predicate, [`FilterImmutable`]
//! does the same without keeping a cache (and therefore without index
//! fidelity), [`DynamicFilter`] re-evaluates a whole collection whenever a new
//! predicate (or a re-filter pulse) arrives, and [`FilterOnObservable`] lets
//! every item carry its own boolean stream deciding its membership.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use fnv::FnvHashMap;

use crate::cache::{Cache, ChangeAwareCache};
use crate::changes::{Change, ChangeReason, ChangeSet};
use crate::operators::ChildSet;
use crate::stream::{BoxedObserver, Observable, Observer, ObservableExt, Scheduler, Subscription, WorkQueue};
use crate::{Data, Key};

/// A shared, replaceable predicate as carried by predicate streams.
pub type FilterPredicate<V> = Rc<dyn Fn(&V) -> bool>;

/// Routes one upstream change into a filtered cache.
///
/// This is the static-filter state transition reused by every flavour: writes
/// enter or leave the filtered cache according to the predicate, removals
/// always leave, and a refresh toggles membership when the predicate's verdict
/// has changed out from under the cache.
pub(crate) fn apply_filter_change<V, K, P>(
    filtered: &mut ChangeAwareCache<V, K>,
    predicate: &P,
    change: &Change<V, K>,
) where
    V: Data,
    K: Key,
    P: Fn(&V) -> bool + ?Sized,
{
    match change.reason {
        ChangeReason::Add => {
            if predicate(&change.current) {
                filtered.add_or_update(change.key.clone(), change.current.clone());
            }
        }
        ChangeReason::Update => {
            if predicate(&change.current) {
                filtered.add_or_update(change.key.clone(), change.current.clone());
            } else {
                filtered.remove(&change.key);
            }
        }
        ChangeReason::Remove => filtered.remove(&change.key),
        ChangeReason::Refresh => {
            let passes = predicate(&change.current);
            if filtered.contains_key(&change.key) {
                if passes {
                    filtered.refresh(&change.key);
                } else {
                    filtered.remove(&change.key);
                }
            } else if passes {
                filtered.add_or_update(change.key.clone(), change.current.clone());
            }
        }
        ChangeReason::Moved => {}
    }
}

/// The stream produced by [`ChangeStreamExt::filter`](super::ChangeStreamExt::filter).
pub struct Filter<S, P> {
    source: S,
    predicate: Rc<P>,
}

impl<S, P> Filter<S, P> {
    pub(crate) fn new(source: S, predicate: P) -> Self {
        Self {
            source,
            predicate: Rc::new(predicate),
        }
    }
}

impl<S: Clone, P> Clone for Filter<S, P> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            predicate: Rc::clone(&self.predicate),
        }
    }
}

struct FilterState<V, K> {
    filtered: ChangeAwareCache<V, K>,
    downstream: BoxedObserver<ChangeSet<V, K>>,
    done: bool,
}

impl<S, P, V, K> Observable for Filter<S, P>
where
    V: Data,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    P: Fn(&V) -> bool + 'static,
{
    type Item = ChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V, K>>) -> Subscription {
        let state = Rc::new(RefCell::new(FilterState {
            filtered: ChangeAwareCache::new(),
            downstream: observer,
            done: false,
        }));
        let predicate = Rc::clone(&self.predicate);
        let on_next_state = Rc::clone(&state);
        let error_state = Rc::clone(&state);
        let completed_state = Rc::clone(&state);
        self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let state = &mut *on_next_state.borrow_mut();
                if state.done {
                    return;
                }
                for change in changes.iter() {
                    apply_filter_change(&mut state.filtered, &*predicate, change);
                }
                let captured = state.filtered.capture_changes();
                if !captured.is_empty() {
                    state.downstream.on_next(captured);
                }
            },
            move |error| {
                let state = &mut *error_state.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.downstream.on_error(error);
                }
            },
            move || {
                let state = &mut *completed_state.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.downstream.on_completed();
                }
            },
        )
    }
}

/// The stream produced by
/// [`ChangeStreamExt::filter_immutable`](super::ChangeStreamExt::filter_immutable).
///
/// Stateless: each change is rewritten through the predicate truth table, so
/// no cache is kept and indices are not carried.
pub struct FilterImmutable<S, P> {
    source: S,
    predicate: Rc<P>,
}

impl<S, P> FilterImmutable<S, P> {
    pub(crate) fn new(source: S, predicate: P) -> Self {
        Self {
            source,
            predicate: Rc::new(predicate),
        }
    }
}

impl<S: Clone, P> Clone for FilterImmutable<S, P> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            predicate: Rc::clone(&self.predicate),
        }
    }
}

impl<S, P, V, K> Observable for FilterImmutable<S, P>
where
    V: Data,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    P: Fn(&V) -> bool + 'static,
{
    type Item = ChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V, K>>) -> Subscription {
        let shared = Rc::new(RefCell::new(observer));
        let error_target = Rc::clone(&shared);
        let completion_target = Rc::clone(&shared);
        let predicate = Rc::clone(&self.predicate);
        self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let mut rewritten = ChangeSet::with_capacity(changes.len());
                for change in changes.iter() {
                    let passes = predicate(&change.current);
                    match (change.reason, passes) {
                        (ChangeReason::Add, true) => {
                            rewritten.push(Change::add(change.key.clone(), change.current.clone()));
                        }
                        (ChangeReason::Update, _) => {
                            let passed = change.previous.as_ref().map_or(false, |p| predicate(p));
                            match (passed, passes) {
                                (true, true) => rewritten.push(change.clone().at(None, None)),
                                (true, false) => {
                                    let previous = change
                                        .previous
                                        .clone()
                                        .unwrap_or_else(|| change.current.clone());
                                    rewritten.push(Change::remove(change.key.clone(), previous));
                                }
                                (false, true) => rewritten.push(Change::add(
                                    change.key.clone(),
                                    change.current.clone(),
                                )),
                                (false, false) => {}
                            }
                        }
                        (ChangeReason::Remove, true) => rewritten
                            .push(Change::remove(change.key.clone(), change.current.clone())),
                        (ChangeReason::Refresh, true) => rewritten
                            .push(Change::refresh(change.key.clone(), change.current.clone())),
                        _ => {}
                    }
                }
                if !rewritten.is_empty() {
                    shared.borrow_mut().on_next(rewritten);
                }
            },
            move |error| error_target.borrow_mut().on_error(error),
            move || completion_target.borrow_mut().on_completed(),
        )
    }
}

/// The stream produced by
/// [`ChangeStreamExt::filter_dynamic`](super::ChangeStreamExt::filter_dynamic).
pub struct DynamicFilter<S, PS, RF> {
    source: S,
    predicates: PS,
    refilter: Option<RF>,
}

impl<S, PS, RF> DynamicFilter<S, PS, RF> {
    pub(crate) fn new(source: S, predicates: PS, refilter: Option<RF>) -> Self {
        Self {
            source,
            predicates,
            refilter,
        }
    }
}

impl<S: Clone, PS: Clone, RF: Clone> Clone for DynamicFilter<S, PS, RF> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            predicates: self.predicates.clone(),
            refilter: self.refilter.clone(),
        }
    }
}

struct DynamicFilterState<V, K> {
    all: Cache<V, K>,
    filtered: ChangeAwareCache<V, K>,
    predicate: Option<FilterPredicate<V>>,
    downstream: BoxedObserver<ChangeSet<V, K>>,
    done: bool,
}

impl<V: Data, K: Key> DynamicFilterState<V, K> {
    // Walk the full collection, toggling membership where the predicate's
    // verdict has changed. Values already present keep their cached copy.
    fn evaluate(&mut self) {
        let Some(predicate) = self.predicate.clone() else {
            return;
        };
        let all = &self.all;
        let filtered = &mut self.filtered;
        for (key, value) in all.iter() {
            let passes = predicate(value);
            if passes && !filtered.contains_key(key) {
                filtered.add_or_update(key.clone(), value.clone());
            } else if !passes && filtered.contains_key(key) {
                filtered.remove(key);
            }
        }
    }

    fn emit(&mut self) {
        if self.done {
            return;
        }
        let captured = self.filtered.capture_changes();
        if !captured.is_empty() {
            self.downstream.on_next(captured);
        }
    }
}

impl<S, PS, RF, V, K> Observable for DynamicFilter<S, PS, RF>
where
    V: Data,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    PS: Observable<Item = FilterPredicate<V>>,
    RF: Observable<Item = ()>,
{
    type Item = ChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V, K>>) -> Subscription {
        let state = Rc::new(RefCell::new(DynamicFilterState {
            all: Cache::new(),
            filtered: ChangeAwareCache::new(),
            predicate: None,
            downstream: observer,
            done: false,
        }));

        let predicate_state = Rc::clone(&state);
        let predicate_errors = Rc::clone(&state);
        let predicate_sub = self.predicates.subscribe_all(
            move |predicate: FilterPredicate<V>| {
                let state = &mut *predicate_state.borrow_mut();
                if state.done {
                    return;
                }
                state.predicate = Some(predicate);
                state.evaluate();
                state.emit();
            },
            move |error| {
                let state = &mut *predicate_errors.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.downstream.on_error(error);
                }
            },
            // A finished predicate stream leaves the last predicate in force.
            || {},
        );

        let refilter_sub = match &self.refilter {
            Some(refilter) => {
                let refilter_state = Rc::clone(&state);
                let refilter_errors = Rc::clone(&state);
                refilter.subscribe_all(
                    move |()| {
                        let state = &mut *refilter_state.borrow_mut();
                        if state.done {
                            return;
                        }
                        state.evaluate();
                        state.emit();
                    },
                    move |error| {
                        let state = &mut *refilter_errors.borrow_mut();
                        if !state.done {
                            state.done = true;
                            state.downstream.on_error(error);
                        }
                    },
                    || {},
                )
            }
            None => Subscription::empty(),
        };

        let data_state = Rc::clone(&state);
        let data_errors = Rc::clone(&state);
        let data_completed = Rc::clone(&state);
        let data_sub = self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let state = &mut *data_state.borrow_mut();
                if state.done {
                    return;
                }
                state.all.apply(&changes);
                if let Some(predicate) = state.predicate.clone() {
                    for change in changes.iter() {
                        apply_filter_change(&mut state.filtered, &*predicate, change);
                    }
                }
                state.emit();
            },
            move |error| {
                let state = &mut *data_errors.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.downstream.on_error(error);
                }
            },
            move || {
                let state = &mut *data_completed.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.downstream.on_completed();
                }
            },
        );

        data_sub.also(predicate_sub).also(refilter_sub)
    }
}

/// The stream produced by
/// [`ChangeStreamExt::filter_on_observable`](super::ChangeStreamExt::filter_on_observable).
pub struct FilterOnObservable<S, F> {
    source: S,
    selector: Rc<F>,
    buffer: Option<(Duration, Rc<dyn Scheduler>)>,
}

impl<S, F> FilterOnObservable<S, F> {
    pub(crate) fn new(
        source: S,
        selector: F,
        buffer: Option<(Duration, Rc<dyn Scheduler>)>,
    ) -> Self {
        Self {
            source,
            selector: Rc::new(selector),
            buffer,
        }
    }
}

impl<S: Clone, F> Clone for FilterOnObservable<S, F> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            selector: Rc::clone(&self.selector),
            buffer: self.buffer.clone(),
        }
    }
}

struct FilterObsState<V, K> {
    values: Cache<V, K>,
    passes: FnvHashMap<K, bool>,
    filtered: ChangeAwareCache<V, K>,
    children: ChildSet<K>,
    pending_toggles: Vec<(K, bool)>,
    flush_scheduled: bool,
    parent_sub: Option<Subscription>,
    active: usize,
    done: bool,
    downstream: BoxedObserver<ChangeSet<V, K>>,
}

struct FilterObsCore<V, K> {
    state: RefCell<FilterObsState<V, K>>,
    queue: WorkQueue,
}

impl<V: Data, K: Key> FilterObsCore<V, K> {
    fn emit(&self) {
        let state = &mut *self.state.borrow_mut();
        if state.done {
            return;
        }
        let captured = state.filtered.capture_changes();
        if !captured.is_empty() {
            state.downstream.on_next(captured);
        }
    }

    fn fail(&self, error: crate::errors::SharedError) {
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

fn apply_toggle<V: Data, K: Key>(state: &mut FilterObsState<V, K>, key: K, passes: bool) {
    if state.passes.get(&key) == Some(&passes) {
        return;
    }
    state.passes.insert(key.clone(), passes);
    if passes {
        if let Some(value) = state.values.lookup(&key).cloned() {
            state.filtered.add_or_update(key, value);
        }
    } else {
        state.filtered.remove(&key);
    }
}

impl<S, F, R, V, K> Observable for FilterOnObservable<S, F>
where
    V: Data,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = bool> + 'static,
{
    type Item = ChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V, K>>) -> Subscription {
        let core = Rc::new(FilterObsCore {
            state: RefCell::new(FilterObsState {
                values: Cache::new(),
                passes: FnvHashMap::default(),
                filtered: ChangeAwareCache::new(),
                children: ChildSet::new(),
                pending_toggles: Vec::new(),
                flush_scheduled: false,
                parent_sub: None,
                active: 1,
                done: false,
                downstream: observer,
            }),
            queue: WorkQueue::new(),
        });

        let selector = Rc::clone(&self.selector);
        let buffer = self.buffer.clone();

        let parent_core = Rc::clone(&core);
        let error_core = Rc::clone(&core);
        let completed_core = Rc::clone(&core);
        let parent_sub = self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let core = Rc::clone(&parent_core);
                let selector = Rc::clone(&selector);
                let buffer = buffer.clone();
                let work_core = Rc::clone(&core);
                let finally_core = Rc::clone(&core);
                core.queue.run(
                    move || {
                        handle_parent_batch(&work_core, &selector, &buffer, changes);
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

fn handle_parent_batch<V, K, F, R>(
    core: &Rc<FilterObsCore<V, K>>,
    selector: &Rc<F>,
    buffer: &Option<(Duration, Rc<dyn Scheduler>)>,
    changes: ChangeSet<V, K>,
) where
    V: Data,
    K: Key,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = bool> + 'static,
{
    let state = &mut *core.state.borrow_mut();
    if state.done {
        return;
    }
    for change in changes.iter() {
        let key = change.key.clone();
        match change.reason {
            ChangeReason::Add | ChangeReason::Update => {
                state.values.insert(key.clone(), change.current.clone());
                if state.passes.get(&key) == Some(&true) {
                    state
                        .filtered
                        .add_or_update(key.clone(), change.current.clone());
                }
                if let Some(old) = state.children.remove(&key) {
                    if !old.is_completed() {
                        state.active -= 1;
                    }
                    old.dispose();
                }
                let child = subscribe_membership(core, selector, buffer, &change.current, &key);
                state.active += 1;
                state.children.insert(key, child);
            }
            ChangeReason::Remove => {
                state.values.remove(&key);
                state.passes.remove(&key);
                if let Some(old) = state.children.remove(&key) {
                    if !old.is_completed() {
                        state.active -= 1;
                    }
                    old.dispose();
                }
                state.filtered.remove(&key);
            }
            ChangeReason::Refresh => {
                if state.passes.get(&key) == Some(&true) {
                    state.filtered.refresh(&key);
                }
            }
            ChangeReason::Moved => {}
        }
    }
}

fn subscribe_membership<V, K, F, R>(
    core: &Rc<FilterObsCore<V, K>>,
    selector: &Rc<F>,
    buffer: &Option<(Duration, Rc<dyn Scheduler>)>,
    value: &V,
    key: &K,
) -> crate::operators::ChildHandle
where
    V: Data,
    K: Key,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = bool> + 'static,
{
    let completed = Rc::new(std::cell::Cell::new(false));
    let membership = selector(value, key);
    let buffer = buffer.clone();

    let value_core = Rc::clone(core);
    let value_key = key.clone();
    let error_core = Rc::clone(core);
    let completed_core = Rc::clone(core);
    let completed_flag = Rc::clone(&completed);
    let subscription = membership.subscribe_all(
        move |passes: bool| {
            let core = Rc::clone(&value_core);
            let key = value_key.clone();
            let buffer = buffer.clone();
            let work_core = Rc::clone(&core);
            let finally_core = Rc::clone(&core);
            core.queue.run(
                move || match &buffer {
                    Some((window, scheduler)) => {
                        queue_toggle(&work_core, scheduler, *window, key, passes);
                    }
                    None => {
                        let state = &mut *work_core.state.borrow_mut();
                        if !state.done {
                            apply_toggle(state, key, passes);
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

    crate::operators::ChildHandle::new(subscription, completed)
}

// Buffered mode: membership verdicts accumulate until the window elapses, then
// apply as one batch.
fn queue_toggle<V: Data, K: Key>(
    core: &Rc<FilterObsCore<V, K>>,
    scheduler: &Rc<dyn Scheduler>,
    window: Duration,
    key: K,
    passes: bool,
) {
    let state = &mut *core.state.borrow_mut();
    if state.done {
        return;
    }
    state.pending_toggles.push((key, passes));
    if !state.flush_scheduled {
        state.flush_scheduled = true;
        let due = scheduler.now() + window;
        let flush_core = Rc::clone(core);
        scheduler
            .schedule(
                due,
                Box::new(move || {
                    let core = Rc::clone(&flush_core);
                    let work_core = Rc::clone(&core);
                    let finally_core = Rc::clone(&core);
                    core.queue.run(
                        move || {
                            let state = &mut *work_core.state.borrow_mut();
                            state.flush_scheduled = false;
                            if state.done {
                                return;
                            }
                            let toggles = std::mem::take(&mut state.pending_toggles);
                            for (key, passes) in toggles {
                                apply_toggle(state, key, passes);
                            }
                        },
                        move || finally_core.emit(),
                    );
                }),
            )
            .detach();
    }
}
