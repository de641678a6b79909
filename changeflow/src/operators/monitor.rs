//! Load-state signalling, shared-subscription counting, and removal hooks.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::cache::{Cache, ObservableCache};
use crate::changes::{ChangeReason, ChangeSet};
use crate::stream::{BoxedObserver, Observable, Observer, ObservableExt, Subscription};
use crate::{Data, Key};

/// The load state of a change stream, as reported by
/// [`ChangeStreamExt::monitor_status`](super::ChangeStreamExt::monitor_status).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Subscribed, nothing received yet.
    Pending,
    /// At least one batch has been received.
    Loaded,
    /// The stream failed. Terminal.
    Errored,
    /// The stream completed. Terminal.
    Completed,
}

/// The stream produced by
/// [`ChangeStreamExt::monitor_status`](super::ChangeStreamExt::monitor_status).
///
/// Starts with [`ConnectionStatus::Pending`], reports each transition once,
/// and forwards the source's terminal notification after the matching status.
pub struct MonitorStatus<S> {
    source: S,
}

impl<S> MonitorStatus<S> {
    pub(crate) fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: Clone> Clone for MonitorStatus<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<S> Observable for MonitorStatus<S>
where
    S: Observable,
    S::Item: 'static,
{
    type Item = ConnectionStatus;

    fn subscribe_observer(&self, observer: BoxedObserver<ConnectionStatus>) -> Subscription {
        let shared = Rc::new(RefCell::new(observer));
        shared.borrow_mut().on_next(ConnectionStatus::Pending);

        let status = Rc::new(std::cell::Cell::new(ConnectionStatus::Pending));
        let value_target = Rc::clone(&shared);
        let value_status = Rc::clone(&status);
        let error_target = Rc::clone(&shared);
        let error_status = Rc::clone(&status);
        let completion_target = Rc::clone(&shared);
        let completion_status = Rc::clone(&status);
        self.source.subscribe_all(
            move |_| {
                if value_status.get() == ConnectionStatus::Pending {
                    value_status.set(ConnectionStatus::Loaded);
                    value_target.borrow_mut().on_next(ConnectionStatus::Loaded);
                }
            },
            move |error| {
                error_status.set(ConnectionStatus::Errored);
                error_target.borrow_mut().on_next(ConnectionStatus::Errored);
                error_target.borrow_mut().on_error(error);
            },
            move || {
                completion_status.set(ConnectionStatus::Completed);
                completion_target
                    .borrow_mut()
                    .on_next(ConnectionStatus::Completed);
                completion_target.borrow_mut().on_completed();
            },
        )
    }
}

/// The stream produced by
/// [`ChangeStreamExt::ref_count`](super::ChangeStreamExt::ref_count).
///
/// The first subscriber builds one shared [`ObservableCache`] fed by the
/// upstream; later subscribers attach to it (receiving its accumulated state
/// as an initial batch); the last departure tears it down.
pub struct RefCount<S, V, K> {
    source: S,
    state: Rc<RefCell<RefCountState<V, K>>>,
}

struct RefCountState<V, K> {
    count: usize,
    shared: Option<(ObservableCache<V, K>, Subscription)>,
}

impl<S, V, K> RefCount<S, V, K> {
    pub(crate) fn new(source: S) -> Self {
        Self {
            source,
            state: Rc::new(RefCell::new(RefCountState {
                count: 0,
                shared: None,
            })),
        }
    }
}

impl<S: Clone, V, K> Clone for RefCount<S, V, K> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            state: Rc::clone(&self.state),
        }
    }
}

impl<S, V, K> Observable for RefCount<S, V, K>
where
    V: Data,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>>,
{
    type Item = ChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V, K>>) -> Subscription {
        let cache = {
            let mut state = self.state.borrow_mut();
            if state.shared.is_none() {
                tracing::debug!(target: "changeflow::ref_count", "building shared cache");
                let cache = ObservableCache::new();
                let feed = cache.clone();
                let errored = cache.clone();
                let completed = cache.clone();
                let upstream = self.source.subscribe_all(
                    move |changes: ChangeSet<V, K>| feed.update(|updater| updater.apply(&changes)),
                    move |error| errored.fail(error),
                    move || completed.complete(),
                );
                state.shared = Some((cache, upstream));
            }
            state.count += 1;
            state
                .shared
                .as_ref()
                .map(|(cache, _)| cache.clone())
        };
        let Some(cache) = cache else {
            return Subscription::empty();
        };

        let inner = cache.connect().subscribe_observer(observer);
        let state = Rc::clone(&self.state);
        Subscription::new(move || {
            inner.dispose();
            let mut state = state.borrow_mut();
            state.count -= 1;
            if state.count == 0 {
                tracing::debug!(target: "changeflow::ref_count", "last subscriber left, tearing down");
                if let Some((cache, upstream)) = state.shared.take() {
                    upstream.dispose();
                    cache.complete();
                }
            }
        })
    }
}

/// The stream produced by
/// [`ChangeStreamExt::on_item_removed`](super::ChangeStreamExt::on_item_removed).
///
/// Runs a side effect for every removed item, and — when
/// `invoke_on_unsubscribe` is set — for every item still present when the
/// subscription is disposed.
pub struct OnItemRemoved<S, A> {
    source: S,
    action: Rc<A>,
    invoke_on_unsubscribe: bool,
}

impl<S, A> OnItemRemoved<S, A> {
    pub(crate) fn new(source: S, action: A, invoke_on_unsubscribe: bool) -> Self {
        Self {
            source,
            action: Rc::new(action),
            invoke_on_unsubscribe,
        }
    }
}

impl<S: Clone, A> Clone for OnItemRemoved<S, A> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            action: Rc::clone(&self.action),
            invoke_on_unsubscribe: self.invoke_on_unsubscribe,
        }
    }
}

struct OnItemRemovedState<V, K> {
    mirror: Cache<V, K>,
    downstream: BoxedObserver<ChangeSet<V, K>>,
    done: bool,
}

impl<S, A, V, K> Observable for OnItemRemoved<S, A>
where
    V: Data,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    A: Fn(&V, &K) + 'static,
{
    type Item = ChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V, K>>) -> Subscription {
        let state = Rc::new(RefCell::new(OnItemRemovedState {
            mirror: Cache::new(),
            downstream: observer,
            done: false,
        }));
        let action = Rc::clone(&self.action);
        let invoke_on_unsubscribe = self.invoke_on_unsubscribe;

        let on_next_state = Rc::clone(&state);
        let on_next_action = Rc::clone(&action);
        let error_state = Rc::clone(&state);
        let completed_state = Rc::clone(&state);
        let source_sub = self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let state = &mut *on_next_state.borrow_mut();
                if state.done {
                    return;
                }
                for change in changes.iter() {
                    if change.reason == ChangeReason::Remove {
                        on_next_action(&change.current, &change.key);
                    }
                }
                state.mirror.apply(&changes);
                state.downstream.on_next(changes);
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
        );

        Subscription::new(move || {
            source_sub.dispose();
            if invoke_on_unsubscribe {
                let state = &mut *state.borrow_mut();
                for (key, value) in state.mirror.iter() {
                    action(value, key);
                }
                state.mirror.clear();
            }
        })
    }
}
