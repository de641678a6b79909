//! Evict items by age or by capacity.
//!
//! [`ExpireAfter`] stamps every written item with a deadline taken from a
//! time selector and removes it once the injected scheduler's clock passes
//! that deadline — scheduler time is the authoritative clock. With a poll
//! interval the cache is swept on a fixed cadence; without one, a timer is
//! kept per distinct deadline. [`LimitSize`] keeps only the most recently
//! introduced `limit` items, evicting the oldest beyond capacity after each
//! batch.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use fnv::FnvHashMap;
use smallvec::SmallVec;

use crate::cache::ChangeAwareCache;
use crate::changes::{ChangeReason, ChangeSet};
use crate::errors::SharedError;
use crate::stream::{BoxedObserver, Observable, Observer, ObservableExt, Scheduler, Subscription, WorkQueue};
use crate::{Data, Key};

/// A cached item stamped for eviction bookkeeping.
#[derive(Clone, Debug)]
pub struct ExpirableItem<V, K> {
    /// The cached value.
    pub value: V,
    /// Its key.
    pub key: K,
    /// Absolute deadline on the owning scheduler's clock; `None` never
    /// expires.
    pub expire_at: Option<Duration>,
    /// Monotonic introduction order, used by capacity eviction.
    pub index: u64,
}

/// The stream produced by
/// [`ChangeStreamExt::expire_after`](super::ChangeStreamExt::expire_after).
pub struct ExpireAfter<S, F> {
    source: S,
    time_selector: Rc<F>,
    poll_interval: Option<Duration>,
    scheduler: Rc<dyn Scheduler>,
}

impl<S, F> ExpireAfter<S, F> {
    pub(crate) fn new(
        source: S,
        time_selector: F,
        poll_interval: Option<Duration>,
        scheduler: Rc<dyn Scheduler>,
    ) -> Self {
        Self {
            source,
            time_selector: Rc::new(time_selector),
            poll_interval,
            scheduler,
        }
    }
}

impl<S: Clone, F> Clone for ExpireAfter<S, F> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            time_selector: Rc::clone(&self.time_selector),
            poll_interval: self.poll_interval,
            scheduler: Rc::clone(&self.scheduler),
        }
    }
}

struct ExpireState<V, K> {
    cache: ChangeAwareCache<V, K>,
    registry: FnvHashMap<K, ExpirableItem<V, K>>,
    next_index: u64,
    timers: BTreeMap<Duration, Subscription>,
    parent_sub: Option<Subscription>,
    done: bool,
    downstream: BoxedObserver<ChangeSet<V, K>>,
}

struct ExpireCore<V, K> {
    state: RefCell<ExpireState<V, K>>,
    queue: WorkQueue,
    scheduler: Rc<dyn Scheduler>,
}

impl<V: Data, K: Key> ExpireCore<V, K> {
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
        for (_, timer) in std::mem::take(&mut state.timers) {
            timer.dispose();
        }
        state.downstream.on_error(error);
    }

    fn complete(&self) {
        let state = &mut *self.state.borrow_mut();
        if state.done {
            return;
        }
        state.done = true;
        for (_, timer) in std::mem::take(&mut state.timers) {
            timer.dispose();
        }
        state.downstream.on_completed();
    }

    fn teardown(&self) {
        let state = &mut *self.state.borrow_mut();
        state.done = true;
        if let Some(parent) = state.parent_sub.take() {
            parent.dispose();
        }
        for (_, timer) in std::mem::take(&mut state.timers) {
            timer.dispose();
        }
    }

    // Removes everything whose deadline has passed on the scheduler's clock.
    fn sweep(&self) {
        let now = self.scheduler.now();
        let state = &mut *self.state.borrow_mut();
        if state.done {
            return;
        }
        let expired: SmallVec<[K; 8]> = state
            .registry
            .values()
            .filter(|item| item.expire_at.is_some_and(|deadline| deadline <= now))
            .map(|item| item.key.clone())
            .collect();
        if !expired.is_empty() {
            tracing::debug!(target: "changeflow::expire", count = expired.len(), "evicting expired items");
        }
        for key in expired {
            state.registry.remove(&key);
            state.cache.remove(&key);
        }
    }
}

impl<S, F, V, K> Observable for ExpireAfter<S, F>
where
    V: Data,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    F: Fn(&V) -> Option<Duration> + 'static,
{
    type Item = ChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V, K>>) -> Subscription {
        let core = Rc::new(ExpireCore {
            state: RefCell::new(ExpireState {
                cache: ChangeAwareCache::new(),
                registry: FnvHashMap::default(),
                next_index: 0,
                timers: BTreeMap::new(),
                parent_sub: None,
                done: false,
                downstream: observer,
            }),
            queue: WorkQueue::new(),
            scheduler: Rc::clone(&self.scheduler),
        });
        let time_selector = Rc::clone(&self.time_selector);
        let poll_interval = self.poll_interval;

        if let Some(interval) = poll_interval {
            schedule_poll(&core, interval);
        }

        let parent_core = Rc::clone(&core);
        let error_core = Rc::clone(&core);
        let completed_core = Rc::clone(&core);
        let parent_sub = self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let core = Rc::clone(&parent_core);
                let time_selector = Rc::clone(&time_selector);
                let work_core = Rc::clone(&core);
                let finally_core = Rc::clone(&core);
                core.queue.run(
                    move || {
                        let now = work_core.scheduler.now();
                        let mut new_deadlines: SmallVec<[Duration; 4]> = SmallVec::new();
                        {
                            let state = &mut *work_core.state.borrow_mut();
                            if state.done {
                                return;
                            }
                            for change in changes.iter() {
                                let key = change.key.clone();
                                match change.reason {
                                    ChangeReason::Add | ChangeReason::Update => {
                                        state
                                            .cache
                                            .add_or_update(key.clone(), change.current.clone());
                                        let expire_at =
                                            time_selector(&change.current).map(|ttl| now + ttl);
                                        let index = state.next_index;
                                        state.next_index += 1;
                                        state.registry.insert(
                                            key.clone(),
                                            ExpirableItem {
                                                value: change.current.clone(),
                                                key,
                                                expire_at,
                                                index,
                                            },
                                        );
                                        if poll_interval.is_none() {
                                            if let Some(deadline) = expire_at {
                                                if !state.timers.contains_key(&deadline) {
                                                    new_deadlines.push(deadline);
                                                }
                                            }
                                        }
                                    }
                                    ChangeReason::Remove => {
                                        state.registry.remove(&key);
                                        state.cache.remove(&key);
                                    }
                                    ChangeReason::Refresh => state.cache.refresh(&key),
                                    ChangeReason::Moved => {}
                                }
                            }
                        }
                        for deadline in new_deadlines {
                            schedule_deadline(&work_core, deadline);
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
                core.queue.run(move || work_core.complete(), || {});
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

// One timer per distinct deadline; firing sweeps everything due by then.
fn schedule_deadline<V: Data, K: Key>(core: &Rc<ExpireCore<V, K>>, deadline: Duration) {
    let fire_core = Rc::clone(core);
    let timer = core.scheduler.schedule(
        deadline,
        Box::new(move || {
            let core = Rc::clone(&fire_core);
            let work_core = Rc::clone(&core);
            let finally_core = Rc::clone(&core);
            core.queue.run(
                move || {
                    work_core.state.borrow_mut().timers.remove(&deadline);
                    work_core.sweep();
                },
                move || finally_core.emit(),
            );
        }),
    );
    let state = &mut *core.state.borrow_mut();
    if state.done {
        timer.dispose();
    } else {
        state.timers.insert(deadline, timer);
    }
}

// Recurring sweep on a fixed cadence, re-arming itself after each pass.
fn schedule_poll<V: Data, K: Key>(core: &Rc<ExpireCore<V, K>>, interval: Duration) {
    let due = core.scheduler.now() + interval;
    let fire_core = Rc::clone(core);
    let timer = core.scheduler.schedule(
        due,
        Box::new(move || {
            let core = Rc::clone(&fire_core);
            let work_core = Rc::clone(&core);
            let finally_core = Rc::clone(&core);
            core.queue.run(
                move || {
                    work_core.state.borrow_mut().timers.remove(&due);
                    work_core.sweep();
                    if !work_core.state.borrow().done {
                        schedule_poll(&work_core, interval);
                    }
                },
                move || finally_core.emit(),
            );
        }),
    );
    let state = &mut *core.state.borrow_mut();
    if state.done {
        timer.dispose();
    } else {
        state.timers.insert(due, timer);
    }
}

/// The stream produced by
/// [`ChangeStreamExt::limit_size`](super::ChangeStreamExt::limit_size).
pub struct LimitSize<S> {
    source: S,
    limit: usize,
}

impl<S> LimitSize<S> {
    pub(crate) fn new(source: S, limit: usize) -> Self {
        Self { source, limit }
    }
}

impl<S: Clone> Clone for LimitSize<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            limit: self.limit,
        }
    }
}

struct LimitState<V, K> {
    cache: ChangeAwareCache<V, K>,
    registry: FnvHashMap<K, ExpirableItem<V, K>>,
    next_index: u64,
    downstream: BoxedObserver<ChangeSet<V, K>>,
    done: bool,
}

impl<S, V, K> Observable for LimitSize<S>
where
    V: Data,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>>,
{
    type Item = ChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V, K>>) -> Subscription {
        let state = Rc::new(RefCell::new(LimitState {
            cache: ChangeAwareCache::new(),
            registry: FnvHashMap::default(),
            next_index: 0,
            downstream: observer,
            done: false,
        }));
        let limit = self.limit;

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
                    let key = change.key.clone();
                    match change.reason {
                        ChangeReason::Add | ChangeReason::Update => {
                            state
                                .cache
                                .add_or_update(key.clone(), change.current.clone());
                            // Updates keep their original introduction slot.
                            let index = match state.registry.get(&key) {
                                Some(item) => item.index,
                                None => {
                                    let index = state.next_index;
                                    state.next_index += 1;
                                    index
                                }
                            };
                            state.registry.insert(
                                key.clone(),
                                ExpirableItem {
                                    value: change.current.clone(),
                                    key,
                                    expire_at: None,
                                    index,
                                },
                            );
                        }
                        ChangeReason::Remove => {
                            state.registry.remove(&key);
                            state.cache.remove(&key);
                        }
                        ChangeReason::Refresh => state.cache.refresh(&key),
                        ChangeReason::Moved => {}
                    }
                }
                if state.cache.len() > limit {
                    let mut ordered: Vec<(u64, K)> = state
                        .registry
                        .values()
                        .map(|item| (item.index, item.key.clone()))
                        .collect();
                    ordered.sort_unstable_by_key(|(index, _)| *index);
                    let excess = ordered.len().saturating_sub(limit);
                    for (_, key) in ordered.into_iter().take(excess) {
                        state.registry.remove(&key);
                        state.cache.remove(&key);
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
