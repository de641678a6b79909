//! Re-evaluate items when their own signals say so.
//!
//! [`AutoRefresh`] subscribes a caller-provided re-evaluator stream per item;
//! each pulse becomes a `Refresh` change for that key. Pulses may be batched
//! over a time window on an injected scheduler, so a burst of signals yields
//! one downstream batch.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use fnv::FnvHashSet;

use crate::cache::ChangeAwareCache;
use crate::changes::{ChangeReason, ChangeSet};
use crate::errors::SharedError;
use crate::operators::{ChildHandle, ChildSet};
use crate::stream::{BoxedObserver, Observable, Observer, ObservableExt, Scheduler, Subscription, WorkQueue};
use crate::{Data, Key};

/// The stream produced by
/// [`ChangeStreamExt::auto_refresh`](super::ChangeStreamExt::auto_refresh).
pub struct AutoRefresh<S, F> {
    source: S,
    reevaluator: Rc<F>,
    buffer: Option<(Duration, Rc<dyn Scheduler>)>,
}

impl<S, F> AutoRefresh<S, F> {
    pub(crate) fn new(
        source: S,
        reevaluator: F,
        buffer: Option<(Duration, Rc<dyn Scheduler>)>,
    ) -> Self {
        Self {
            source,
            reevaluator: Rc::new(reevaluator),
            buffer,
        }
    }
}

impl<S: Clone, F> Clone for AutoRefresh<S, F> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            reevaluator: Rc::clone(&self.reevaluator),
            buffer: self.buffer.clone(),
        }
    }
}

struct AutoRefreshState<V, K> {
    cache: ChangeAwareCache<V, K>,
    children: ChildSet<K>,
    pending: Vec<K>,
    flush_scheduled: bool,
    parent_sub: Option<Subscription>,
    active: usize,
    done: bool,
    downstream: BoxedObserver<ChangeSet<V, K>>,
}

struct AutoRefreshCore<V, K> {
    state: RefCell<AutoRefreshState<V, K>>,
    queue: WorkQueue,
}

impl<V: Data, K: Key> AutoRefreshCore<V, K> {
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

impl<S, F, R, V, K> Observable for AutoRefresh<S, F>
where
    V: Data,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = ()> + 'static,
{
    type Item = ChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V, K>>) -> Subscription {
        let core = Rc::new(AutoRefreshCore {
            state: RefCell::new(AutoRefreshState {
                cache: ChangeAwareCache::new(),
                children: ChildSet::new(),
                pending: Vec::new(),
                flush_scheduled: false,
                parent_sub: None,
                active: 1,
                done: false,
                downstream: observer,
            }),
            queue: WorkQueue::new(),
        });
        let reevaluator = Rc::clone(&self.reevaluator);
        let buffer = self.buffer.clone();

        let parent_core = Rc::clone(&core);
        let error_core = Rc::clone(&core);
        let completed_core = Rc::clone(&core);
        let parent_sub = self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let core = Rc::clone(&parent_core);
                let reevaluator = Rc::clone(&reevaluator);
                let buffer = buffer.clone();
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
                                    state
                                        .cache
                                        .add_or_update(key.clone(), change.current.clone());
                                    if let Some(old) = state.children.remove(&key) {
                                        if !old.is_completed() {
                                            state.active -= 1;
                                        }
                                        old.dispose();
                                    }
                                    let child = subscribe_reevaluator(
                                        &work_core,
                                        &reevaluator,
                                        &buffer,
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

fn subscribe_reevaluator<V, K, F, R>(
    core: &Rc<AutoRefreshCore<V, K>>,
    reevaluator: &Rc<F>,
    buffer: &Option<(Duration, Rc<dyn Scheduler>)>,
    value: &V,
    key: &K,
) -> ChildHandle
where
    V: Data,
    K: Key,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = ()> + 'static,
{
    let completed = Rc::new(std::cell::Cell::new(false));
    let pulses = reevaluator(value, key);
    let buffer = buffer.clone();

    let pulse_core = Rc::clone(core);
    let pulse_key = key.clone();
    let error_core = Rc::clone(core);
    let completed_core = Rc::clone(core);
    let completed_flag = Rc::clone(&completed);
    let subscription = pulses.subscribe_all(
        move |()| {
            let core = Rc::clone(&pulse_core);
            let key = pulse_key.clone();
            let buffer = buffer.clone();
            let work_core = Rc::clone(&core);
            let finally_core = Rc::clone(&core);
            core.queue.run(
                move || match &buffer {
                    Some((window, scheduler)) => {
                        defer_refresh(&work_core, scheduler, *window, key);
                    }
                    None => {
                        let state = &mut *work_core.state.borrow_mut();
                        if !state.done {
                            state.cache.refresh(&key);
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

    ChildHandle::new(subscription, completed)
}

// Buffered pulses collapse into one refresh batch when the window elapses.
fn defer_refresh<V: Data, K: Key>(
    core: &Rc<AutoRefreshCore<V, K>>,
    scheduler: &Rc<dyn Scheduler>,
    window: Duration,
    key: K,
) {
    let state = &mut *core.state.borrow_mut();
    if state.done {
        return;
    }
    state.pending.push(key);
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
                            let pending = std::mem::take(&mut state.pending);
                            // A key refreshes once per window, however many
                            // pulses it produced.
                            let mut refreshed = FnvHashSet::default();
                            for key in pending {
                                if refreshed.insert(key.clone()) {
                                    state.cache.refresh(&key);
                                }
                            }
                        },
                        move || finally_core.emit(),
                    );
                }),
            )
            .detach();
    }
}
