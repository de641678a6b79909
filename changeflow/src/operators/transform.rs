//! Project each value of a collection into a destination value.
//!
//! [`Transform`] runs a synchronous selector, [`TryTransform`] adds the
//! fallible form with the per-item error escape hatch and the
//! transform-on-refresh option, [`TransformInPlace`] mutates an existing
//! destination instead of replacing it, [`TransformDeferred`] resolves each
//! destination from a one-shot observable while keeping batches applying in
//! arrival order, and [`TransformOnObservable`] keeps each destination pinned
//! to the latest element of a per-item stream.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use fnv::FnvHashMap;

use crate::cache::{Cache, ChangeAwareCache};
use crate::changes::{Change, ChangeReason, ChangeSet};
use crate::errors::{shared, ItemError, MissingKeyError, SharedError};
use crate::operators::{ChildHandle, ChildSet};
use crate::stream::{BoxedObserver, Observable, Observer, ObservableExt, Subscription, WorkQueue};
use crate::{Data, Key};

/// Options accepted by the fallible transform.
pub struct TransformOptions<V, K> {
    /// Re-run the selector on `Refresh` instead of forwarding it.
    pub transform_on_refresh: bool,
    /// When set, selector failures are routed here with the offending value
    /// and key, and the change is skipped; when absent, the first failure is
    /// forwarded as an error and tears the subscription down.
    pub error_callback: Option<Rc<dyn Fn(ItemError<V, K>)>>,
}

impl<V, K> Default for TransformOptions<V, K> {
    fn default() -> Self {
        Self {
            transform_on_refresh: false,
            error_callback: None,
        }
    }
}

impl<V, K> Clone for TransformOptions<V, K> {
    fn clone(&self) -> Self {
        Self {
            transform_on_refresh: self.transform_on_refresh,
            error_callback: self.error_callback.clone(),
        }
    }
}

/// The stream produced by
/// [`ChangeStreamExt::transform`](super::ChangeStreamExt::transform).
pub struct Transform<S, F> {
    source: S,
    selector: Rc<F>,
    transform_on_refresh: bool,
}

impl<S, F> Transform<S, F> {
    pub(crate) fn new(source: S, selector: F, transform_on_refresh: bool) -> Self {
        Self {
            source,
            selector: Rc::new(selector),
            transform_on_refresh,
        }
    }
}

impl<S: Clone, F> Clone for Transform<S, F> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            selector: Rc::clone(&self.selector),
            transform_on_refresh: self.transform_on_refresh,
        }
    }
}

struct TransformState<D, K> {
    cache: ChangeAwareCache<D, K>,
    downstream: BoxedObserver<ChangeSet<D, K>>,
    done: bool,
}

impl<S, F, V, K, D> Observable for Transform<S, F>
where
    V: Data,
    K: Key,
    D: Data,
    S: Observable<Item = ChangeSet<V, K>>,
    F: Fn(&V, &K) -> D + 'static,
{
    type Item = ChangeSet<D, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<D, K>>) -> Subscription {
        let state = Rc::new(RefCell::new(TransformState {
            cache: ChangeAwareCache::new(),
            downstream: observer,
            done: false,
        }));
        let selector = Rc::clone(&self.selector);
        let transform_on_refresh = self.transform_on_refresh;
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
                    match change.reason {
                        ChangeReason::Add | ChangeReason::Update => {
                            let destination = selector(&change.current, &change.key);
                            state.cache.add_or_update(change.key.clone(), destination);
                        }
                        ChangeReason::Remove => state.cache.remove(&change.key),
                        ChangeReason::Refresh => {
                            if transform_on_refresh {
                                let destination = selector(&change.current, &change.key);
                                state.cache.add_or_update(change.key.clone(), destination);
                            } else {
                                state.cache.refresh(&change.key);
                            }
                        }
                        ChangeReason::Moved => {}
                    }
                }
                let captured = state.cache.capture_changes();
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
/// [`ChangeStreamExt::try_transform`](super::ChangeStreamExt::try_transform).
pub struct TryTransform<S, F, V, K, D> {
    source: S,
    selector: Rc<F>,
    options: TransformOptions<V, K>,
    _destination: std::marker::PhantomData<fn() -> D>,
}

impl<S, F, V, K, D> TryTransform<S, F, V, K, D> {
    pub(crate) fn new(source: S, selector: F, options: TransformOptions<V, K>) -> Self {
        Self {
            source,
            selector: Rc::new(selector),
            options,
            _destination: std::marker::PhantomData,
        }
    }
}

impl<S: Clone, F, V, K, D> Clone for TryTransform<S, F, V, K, D> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            selector: Rc::clone(&self.selector),
            options: self.options.clone(),
            _destination: std::marker::PhantomData,
        }
    }
}

impl<S, F, V, K, D> Observable for TryTransform<S, F, V, K, D>
where
    V: Data,
    K: Key,
    D: Data,
    S: Observable<Item = ChangeSet<V, K>>,
    F: Fn(&V, Option<&D>, &K) -> Result<D, SharedError> + 'static,
{
    type Item = ChangeSet<D, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<D, K>>) -> Subscription {
        let state = Rc::new(RefCell::new(TransformState {
            cache: ChangeAwareCache::new(),
            downstream: observer,
            done: false,
        }));
        let selector = Rc::clone(&self.selector);
        let options = self.options.clone();
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
                    let rerun = matches!(change.reason, ChangeReason::Add | ChangeReason::Update)
                        || (change.reason == ChangeReason::Refresh && options.transform_on_refresh);
                    if rerun {
                        let existing = state.cache.lookup(&change.key);
                        match selector(&change.current, existing, &change.key) {
                            Ok(destination) => {
                                state.cache.add_or_update(change.key.clone(), destination);
                            }
                            Err(error) => match &options.error_callback {
                                Some(callback) => callback(ItemError::new(
                                    error,
                                    change.current.clone(),
                                    change.key.clone(),
                                )),
                                None => {
                                    state.done = true;
                                    state.downstream.on_error(error);
                                    return;
                                }
                            },
                        }
                    } else {
                        match change.reason {
                            ChangeReason::Remove => state.cache.remove(&change.key),
                            ChangeReason::Refresh => state.cache.refresh(&change.key),
                            _ => {}
                        }
                    }
                }
                let captured = state.cache.capture_changes();
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
/// [`ChangeStreamExt::transform_in_place`](super::ChangeStreamExt::transform_in_place).
///
/// Additions run the factory; updates (and, when enabled, refreshes) mutate
/// the existing destination through the update closure and emit a `Refresh`
/// rather than an `Update`. An update arriving for a key with no prior
/// destination is an invariant violation and fails the subscription.
pub struct TransformInPlace<S, FC, FU> {
    source: S,
    factory: Rc<FC>,
    update: Rc<FU>,
    refresh_in_place: bool,
}

impl<S, FC, FU> TransformInPlace<S, FC, FU> {
    pub(crate) fn new(source: S, factory: FC, update: FU, refresh_in_place: bool) -> Self {
        Self {
            source,
            factory: Rc::new(factory),
            update: Rc::new(update),
            refresh_in_place,
        }
    }
}

impl<S: Clone, FC, FU> Clone for TransformInPlace<S, FC, FU> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            factory: Rc::clone(&self.factory),
            update: Rc::clone(&self.update),
            refresh_in_place: self.refresh_in_place,
        }
    }
}

impl<S, FC, FU, V, K, D> Observable for TransformInPlace<S, FC, FU>
where
    V: Data,
    K: Key + std::fmt::Debug,
    D: Data,
    S: Observable<Item = ChangeSet<V, K>>,
    FC: Fn(&V, &K) -> D + 'static,
    FU: Fn(&mut D, &V) + 'static,
{
    type Item = ChangeSet<D, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<D, K>>) -> Subscription {
        let state = Rc::new(RefCell::new(TransformState {
            cache: ChangeAwareCache::new(),
            downstream: observer,
            done: false,
        }));
        let factory = Rc::clone(&self.factory);
        let update = Rc::clone(&self.update);
        let refresh_in_place = self.refresh_in_place;
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
                    match change.reason {
                        ChangeReason::Add => {
                            let destination = factory(&change.current, &change.key);
                            state.cache.add_or_update(change.key.clone(), destination);
                        }
                        ChangeReason::Update => {
                            let mutated = state
                                .cache
                                .mutate(&change.key, |dest| update(dest, &change.current));
                            if !mutated {
                                state.done = true;
                                state
                                    .downstream
                                    .on_error(shared(MissingKeyError::new(&change.key)));
                                return;
                            }
                        }
                        ChangeReason::Remove => state.cache.remove(&change.key),
                        ChangeReason::Refresh => {
                            if refresh_in_place {
                                state
                                    .cache
                                    .mutate(&change.key, |dest| update(dest, &change.current));
                            } else {
                                state.cache.refresh(&change.key);
                            }
                        }
                        ChangeReason::Moved => {}
                    }
                }
                let captured = state.cache.capture_changes();
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

/// A predicate selecting the items a forced re-transform applies to.
pub type RetransformFilter<V, K> = Rc<dyn Fn(&V, &K) -> bool>;

/// The stream produced by
/// [`ChangeStreamExt::transform_deferred`](super::ChangeStreamExt::transform_deferred).
///
/// Each addition or update resolves its destination from a one-shot
/// observable. Batches apply strictly in arrival order: a batch is held until
/// every destination of the batch ahead of it has resolved, so downstream
/// always observes the same order the upstream produced.
pub struct TransformDeferred<S, F, V, K> {
    source: S,
    factory: Rc<F>,
    force: Option<Rc<dyn Observable<Item = RetransformFilter<V, K>>>>,
}

impl<S, F, V, K> TransformDeferred<S, F, V, K> {
    pub(crate) fn new(
        source: S,
        factory: F,
        force: Option<Rc<dyn Observable<Item = RetransformFilter<V, K>>>>,
    ) -> Self {
        Self {
            source,
            factory: Rc::new(factory),
            force,
        }
    }
}

impl<S: Clone, F, V, K> Clone for TransformDeferred<S, F, V, K> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            factory: Rc::clone(&self.factory),
            force: self.force.clone(),
        }
    }
}

struct PendingBatch<V, K, D> {
    changes: ChangeSet<V, K>,
    results: FnvHashMap<usize, D>,
    outstanding: usize,
    started: bool,
    subs: Vec<Subscription>,
}

struct DeferredState<V, K, D> {
    cache: ChangeAwareCache<D, K>,
    values: Cache<V, K>,
    batches: VecDeque<PendingBatch<V, K, D>>,
    subs: Vec<Subscription>,
    parent_done: bool,
    done: bool,
    downstream: BoxedObserver<ChangeSet<D, K>>,
}

struct DeferredCore<V, K, D> {
    state: RefCell<DeferredState<V, K, D>>,
    queue: WorkQueue,
}

impl<V: Data, K: Key, D: Data> DeferredCore<V, K, D> {
    fn emit(&self) {
        let state = &mut *self.state.borrow_mut();
        if state.done {
            return;
        }
        let captured = state.cache.capture_changes();
        if !captured.is_empty() {
            state.downstream.on_next(captured);
        }
        if state.parent_done && state.batches.is_empty() {
            state.done = true;
            state.downstream.on_completed();
        }
    }

    fn fail(&self, error: SharedError) {
        let state = &mut *self.state.borrow_mut();
        if state.done {
            return;
        }
        state.done = true;
        for sub in state.subs.drain(..) {
            sub.dispose();
        }
        for batch in state.batches.drain(..) {
            for sub in batch.subs {
                sub.dispose();
            }
        }
        state.downstream.on_error(error);
    }

    fn teardown(&self) {
        let state = &mut *self.state.borrow_mut();
        state.done = true;
        for sub in state.subs.drain(..) {
            sub.dispose();
        }
        for batch in state.batches.drain(..) {
            for sub in batch.subs {
                sub.dispose();
            }
        }
    }
}

fn start_head<V, K, D, F, R>(core: &Rc<DeferredCore<V, K, D>>, factory: &Rc<F>)
where
    V: Data,
    K: Key,
    D: Data,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = D> + 'static,
{
    // Collect the transforms to spawn while borrowing, subscribe after.
    let spawns: Vec<(usize, V, K)> = {
        let state = &mut *core.state.borrow_mut();
        let Some(head) = state.batches.front_mut() else {
            return;
        };
        if head.started {
            return;
        }
        head.started = true;
        let mut spawns = Vec::new();
        for (index, change) in head.changes.iter().enumerate() {
            if matches!(change.reason, ChangeReason::Add | ChangeReason::Update) {
                spawns.push((index, change.current.clone(), change.key.clone()));
                head.outstanding += 1;
            }
        }
        spawns
    };

    if spawns.is_empty() {
        apply_head(core, factory);
        return;
    }

    for (index, value, key) in spawns {
        let resolved = Rc::new(Cell::new(false));
        let destination = factory(&value, &key);

        let value_core = Rc::clone(core);
        let value_flag = Rc::clone(&resolved);
        let value_factory = Rc::clone(factory);
        let error_core = Rc::clone(core);
        let error_flag = Rc::clone(&resolved);
        let error_factory = Rc::clone(factory);
        let completed_core = Rc::clone(core);
        let completed_flag = Rc::clone(&resolved);
        let completed_factory = Rc::clone(factory);
        let sub = destination.subscribe_all(
            move |result: D| {
                if value_flag.get() {
                    return;
                }
                value_flag.set(true);
                let core = Rc::clone(&value_core);
                let factory = Rc::clone(&value_factory);
                let work_core = Rc::clone(&core);
                let finally_core = Rc::clone(&core);
                core.queue.run(
                    move || resolve_item(&work_core, &factory, index, Some(result)),
                    move || finally_core.emit(),
                );
            },
            move |_error| {
                // A failed transform skips its item; the batch still applies.
                if error_flag.get() {
                    return;
                }
                error_flag.set(true);
                let core = Rc::clone(&error_core);
                let factory = Rc::clone(&error_factory);
                let work_core = Rc::clone(&core);
                let finally_core = Rc::clone(&core);
                core.queue.run(
                    move || resolve_item(&work_core, &factory, index, None),
                    move || finally_core.emit(),
                );
            },
            move || {
                if completed_flag.get() {
                    return;
                }
                completed_flag.set(true);
                let core = Rc::clone(&completed_core);
                let factory = Rc::clone(&completed_factory);
                let work_core = Rc::clone(&core);
                let finally_core = Rc::clone(&core);
                core.queue.run(
                    move || resolve_item(&work_core, &factory, index, None),
                    move || finally_core.emit(),
                );
            },
        );

        let state = &mut *core.state.borrow_mut();
        if let Some(head) = state.batches.front_mut() {
            head.subs.push(sub);
        }
    }
}

fn resolve_item<V, K, D, F, R>(
    core: &Rc<DeferredCore<V, K, D>>,
    factory: &Rc<F>,
    index: usize,
    result: Option<D>,
) where
    V: Data,
    K: Key,
    D: Data,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = D> + 'static,
{
    let ready = {
        let state = &mut *core.state.borrow_mut();
        if state.done {
            return;
        }
        let Some(head) = state.batches.front_mut() else {
            return;
        };
        if let Some(destination) = result {
            head.results.insert(index, destination);
        }
        head.outstanding -= 1;
        head.outstanding == 0
    };
    if ready {
        apply_head(core, factory);
    }
}

fn apply_head<V, K, D, F, R>(core: &Rc<DeferredCore<V, K, D>>, factory: &Rc<F>)
where
    V: Data,
    K: Key,
    D: Data,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = D> + 'static,
{
    {
        let state = &mut *core.state.borrow_mut();
        let Some(mut head) = state.batches.pop_front() else {
            return;
        };
        for (index, change) in head.changes.iter().enumerate() {
            match change.reason {
                ChangeReason::Add | ChangeReason::Update => {
                    if let Some(destination) = head.results.remove(&index) {
                        state.cache.add_or_update(change.key.clone(), destination);
                    }
                }
                ChangeReason::Remove => state.cache.remove(&change.key),
                ChangeReason::Refresh => state.cache.refresh(&change.key),
                ChangeReason::Moved => {}
            }
        }
        for sub in head.subs {
            sub.dispose();
        }
    }
    // Each upstream batch keeps its own downstream batch boundary.
    core.emit();
    start_head(core, factory);
}

fn enqueue_batch<V, K, D, F, R>(
    core: &Rc<DeferredCore<V, K, D>>,
    factory: &Rc<F>,
    changes: ChangeSet<V, K>,
) where
    V: Data,
    K: Key,
    D: Data,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = D> + 'static,
{
    {
        let state = &mut *core.state.borrow_mut();
        if state.done {
            return;
        }
        state.values.apply(&changes);
        state.batches.push_back(PendingBatch {
            changes,
            results: FnvHashMap::default(),
            outstanding: 0,
            started: false,
            subs: Vec::new(),
        });
    }
    start_head(core, factory);
}

impl<S, F, R, V, K, D> Observable for TransformDeferred<S, F, V, K>
where
    V: Data,
    K: Key,
    D: Data,
    S: Observable<Item = ChangeSet<V, K>>,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = D> + 'static,
{
    type Item = ChangeSet<D, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<D, K>>) -> Subscription {
        let core = Rc::new(DeferredCore {
            state: RefCell::new(DeferredState {
                cache: ChangeAwareCache::new(),
                values: Cache::new(),
                batches: VecDeque::new(),
                subs: Vec::new(),
                parent_done: false,
                done: false,
                downstream: observer,
            }),
            queue: WorkQueue::new(),
        });
        let factory = Rc::clone(&self.factory);

        if let Some(force) = &self.force {
            let force_core = Rc::clone(&core);
            let force_factory = Rc::clone(&factory);
            let force_errors = Rc::clone(&core);
            let force_sub = force.subscribe_all(
                move |predicate: RetransformFilter<V, K>| {
                    let core = Rc::clone(&force_core);
                    let factory = Rc::clone(&force_factory);
                    let work_core = Rc::clone(&core);
                    let finally_core = Rc::clone(&core);
                    core.queue.run(
                        move || {
                            // Re-transform matching items as a synthetic batch so it
                            // serialises with real upstream batches.
                            let synthetic: ChangeSet<V, K> = {
                                let state = work_core.state.borrow();
                                state
                                    .values
                                    .iter()
                                    .filter(|(k, v)| predicate(v, k))
                                    .map(|(k, v)| Change::add(k.clone(), v.clone()))
                                    .collect()
                            };
                            if !synthetic.is_empty() {
                                enqueue_batch(&work_core, &factory, synthetic);
                            }
                        },
                        move || finally_core.emit(),
                    );
                },
                move |error| {
                    let core = Rc::clone(&force_errors);
                    let work_core = Rc::clone(&core);
                    core.queue.run(move || work_core.fail(error), || {});
                },
                || {},
            );
            core.state.borrow_mut().subs.push(force_sub);
        }

        let parent_core = Rc::clone(&core);
        let parent_factory = Rc::clone(&factory);
        let error_core = Rc::clone(&core);
        let completed_core = Rc::clone(&core);
        let parent_sub = self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let core = Rc::clone(&parent_core);
                let factory = Rc::clone(&parent_factory);
                let work_core = Rc::clone(&core);
                let finally_core = Rc::clone(&core);
                core.queue.run(
                    move || enqueue_batch(&work_core, &factory, changes),
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
                let finally_core = Rc::clone(&core);
                core.queue.run(
                    move || work_core.state.borrow_mut().parent_done = true,
                    // The emit step owns completion once the queue drains.
                    move || finally_core.emit(),
                );
            },
        );
        core.state.borrow_mut().subs.push(parent_sub);

        let teardown_core = Rc::clone(&core);
        Subscription::new(move || {
            let work_core = Rc::clone(&teardown_core);
            teardown_core.queue.run(move || work_core.teardown(), || {});
        })
    }
}

/// The stream produced by
/// [`ChangeStreamExt::transform_on_observable`](super::ChangeStreamExt::transform_on_observable).
///
/// Each item's destination follows its per-item stream; repeats of the same
/// destination are suppressed.
pub struct TransformOnObservable<S, F> {
    source: S,
    selector: Rc<F>,
}

impl<S, F> TransformOnObservable<S, F> {
    pub(crate) fn new(source: S, selector: F) -> Self {
        Self {
            source,
            selector: Rc::new(selector),
        }
    }
}

impl<S: Clone, F> Clone for TransformOnObservable<S, F> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            selector: Rc::clone(&self.selector),
        }
    }
}

struct TransObsState<K, D> {
    cache: ChangeAwareCache<D, K>,
    latest: FnvHashMap<K, D>,
    children: ChildSet<K>,
    parent_sub: Option<Subscription>,
    active: usize,
    done: bool,
    downstream: BoxedObserver<ChangeSet<D, K>>,
}

struct TransObsCore<K, D> {
    state: RefCell<TransObsState<K, D>>,
    queue: WorkQueue,
}

impl<K: Key, D: Data> TransObsCore<K, D> {
    fn emit(&self) {
        let state = &mut *self.state.borrow_mut();
        if state.done {
            return;
        }
        let captured = state.cache.capture_changes();
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

impl<S, F, R, V, K, D> Observable for TransformOnObservable<S, F>
where
    V: Data,
    K: Key,
    D: Data + PartialEq,
    S: Observable<Item = ChangeSet<V, K>>,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = D> + 'static,
{
    type Item = ChangeSet<D, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<D, K>>) -> Subscription {
        let core = Rc::new(TransObsCore {
            state: RefCell::new(TransObsState {
                cache: ChangeAwareCache::new(),
                latest: FnvHashMap::default(),
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
                let finally_core = Rc::clone(&core);
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
                                    let child = subscribe_destination(
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
                                    state.latest.remove(&key);
                                    state.cache.remove(&key);
                                }
                                ChangeReason::Refresh => state.cache.refresh(&key),
                                ChangeReason::Moved => {}
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

fn subscribe_destination<V, K, D, F, R>(
    core: &Rc<TransObsCore<K, D>>,
    selector: &Rc<F>,
    value: &V,
    key: &K,
) -> ChildHandle
where
    V: Data,
    K: Key,
    D: Data + PartialEq,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = D> + 'static,
{
    let completed = Rc::new(Cell::new(false));
    let destinations = selector(value, key);

    let value_core = Rc::clone(core);
    let value_key = key.clone();
    let error_core = Rc::clone(core);
    let completed_core = Rc::clone(core);
    let completed_flag = Rc::clone(&completed);
    let subscription = destinations.subscribe_all(
        move |destination: D| {
            let core = Rc::clone(&value_core);
            let key = value_key.clone();
            let work_core = Rc::clone(&core);
            let finally_core = Rc::clone(&core);
            core.queue.run(
                move || {
                    let state = &mut *work_core.state.borrow_mut();
                    if state.done {
                        return;
                    }
                    if state.latest.get(&key) == Some(&destination) {
                        return;
                    }
                    state.latest.insert(key.clone(), destination.clone());
                    state.cache.add_or_update(key, destination);
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

    ChildHandle::new(subscription, completed)
}
