//! The reactive substrate: observers, cold observables, subscriptions and
//! schedulers.
//!
//! The engine's operators are independent of any particular reactive runtime;
//! this module supplies the one they are built on. It is a callback-registration
//! substrate, single-threaded and cooperative: an [`Observable`] is cold, and
//! each call to [`Observable::subscribe_observer`] assembles a fresh
//! subscription-scoped state machine; notifications run synchronously on the
//! caller's stack, and re-entrant work inside an operator is serialised by a
//! cooperative work queue rather than a lock.
//!
//! Observers follow the usual grammar: any number of `on_next` calls followed
//! by at most one terminal `on_error` or `on_completed`. After disposal of the
//! returned [`Subscription`], no further notifications are observed.

mod queue;
mod scheduler;
mod subject;

pub use scheduler::{Scheduler, VirtualScheduler};
pub use subject::Subject;

pub(crate) use queue::WorkQueue;
pub(crate) use subject::SharedObserver;

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::errors::SharedError;

/// A push-based consumer of a stream of `T`.
pub trait Observer<T> {
    /// Delivers the next element.
    fn on_next(&mut self, value: T);
    /// Delivers a terminal error. No further notifications follow.
    fn on_error(&mut self, error: SharedError);
    /// Signals successful termination. No further notifications follow.
    fn on_completed(&mut self);
}

/// An observer handle as accepted by [`Observable::subscribe_observer`].
pub type BoxedObserver<T> = Box<dyn Observer<T>>;

/// A cold stream of values.
///
/// Subscribing builds a fresh state machine for this subscription alone;
/// disposing the returned [`Subscription`] tears it down, upstream first, then
/// any per-key child subscriptions in reverse insertion order.
pub trait Observable {
    /// The element type of the stream.
    type Item;

    /// Starts the stream for the given observer.
    fn subscribe_observer(&self, observer: BoxedObserver<Self::Item>) -> Subscription;
}

/// The teardown handle returned by [`Observable::subscribe_observer`].
///
/// Disposal is idempotent, and dropping the handle disposes it.
pub struct Subscription {
    action: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Subscription {
    /// A subscription running `action` on disposal.
    pub fn new(action: impl FnOnce() + 'static) -> Self {
        tracing::trace!(target: "changeflow::stream", "subscription created");
        Self {
            action: RefCell::new(Some(Box::new(action))),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn empty() -> Self {
        Self {
            action: RefCell::new(None),
        }
    }

    /// Runs the teardown, once.
    pub fn dispose(&self) {
        let action = self.action.borrow_mut().take();
        if let Some(action) = action {
            tracing::trace!(target: "changeflow::stream", "subscription disposed");
            action();
        }
    }

    /// Combines two subscriptions into one disposing both, in order.
    pub fn also(self, other: Subscription) -> Subscription {
        Subscription::new(move || {
            self.dispose();
            other.dispose();
        })
    }

    /// Discards the teardown without running it, leaving the underlying
    /// machinery alive for as long as its own references keep it so.
    pub fn detach(self) {
        let _ = self.action.borrow_mut().take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// An [`Observer`] assembled from closures.
pub struct AnonymousObserver<T, N, E, C> {
    on_next: N,
    on_error: E,
    on_completed: C,
    _marker: PhantomData<fn(T)>,
}

impl<T, N, E, C> AnonymousObserver<T, N, E, C>
where
    N: FnMut(T),
    E: FnMut(SharedError),
    C: FnMut(),
{
    /// An observer delegating each notification to the matching closure.
    pub fn new(on_next: N, on_error: E, on_completed: C) -> Self {
        Self {
            on_next,
            on_error,
            on_completed,
            _marker: PhantomData,
        }
    }
}

impl<T, N, E, C> Observer<T> for AnonymousObserver<T, N, E, C>
where
    N: FnMut(T),
    E: FnMut(SharedError),
    C: FnMut(),
{
    fn on_next(&mut self, value: T) {
        (self.on_next)(value);
    }

    fn on_error(&mut self, error: SharedError) {
        (self.on_error)(error);
    }

    fn on_completed(&mut self) {
        (self.on_completed)();
    }
}

/// Convenience subscriptions and the small set of value combinators the
/// operators require.
pub trait ObservableExt: Observable + Sized {
    /// Subscribes with an element callback alone. Errors are logged and
    /// completion is ignored.
    fn subscribe<N>(&self, on_next: N) -> Subscription
    where
        N: FnMut(Self::Item) + 'static,
        Self::Item: 'static,
    {
        self.subscribe_all(
            on_next,
            |error| tracing::error!(target: "changeflow", %error, "unhandled stream error"),
            || {},
        )
    }

    /// Subscribes with one closure per notification kind.
    fn subscribe_all<N, E, C>(&self, on_next: N, on_error: E, on_completed: C) -> Subscription
    where
        N: FnMut(Self::Item) + 'static,
        E: FnMut(SharedError) + 'static,
        C: FnMut() + 'static,
        Self::Item: 'static,
    {
        self.subscribe_observer(Box::new(AnonymousObserver::new(
            on_next,
            on_error,
            on_completed,
        )))
    }

    /// Transforms every element with `f`.
    fn map<U, F>(&self, f: F) -> Map<Self, F>
    where
        Self: Clone,
        F: Fn(Self::Item) -> U + 'static,
    {
        Map {
            source: self.clone(),
            f: Rc::new(f),
        }
    }

    /// Suppresses consecutive repeats of the same element.
    fn distinct_until_changed(&self) -> DistinctUntilChanged<Self>
    where
        Self: Clone,
        Self::Item: PartialEq + Clone,
    {
        DistinctUntilChanged {
            source: self.clone(),
        }
    }

    /// Prepends `value` ahead of the source's own elements.
    fn start_with(&self, value: Self::Item) -> StartWith<Self>
    where
        Self: Clone,
        Self::Item: Clone,
    {
        StartWith {
            source: self.clone(),
            value,
        }
    }
}

impl<S: Observable + Sized> ObservableExt for S {}

/// A stream delivering one value and completing.
pub fn just<T: Clone + 'static>(value: T) -> Just<T> {
    Just { value }
}

/// The stream produced by [`just`].
#[derive(Clone)]
pub struct Just<T> {
    value: T,
}

impl<T: Clone + 'static> Observable for Just<T> {
    type Item = T;

    fn subscribe_observer(&self, mut observer: BoxedObserver<T>) -> Subscription {
        observer.on_next(self.value.clone());
        observer.on_completed();
        Subscription::empty()
    }
}

/// A stream delivering each element of `values` in order and completing.
pub fn from_vec<T: Clone + 'static>(values: Vec<T>) -> FromVec<T> {
    FromVec {
        values: Rc::new(values),
    }
}

/// The stream produced by [`from_vec`].
pub struct FromVec<T> {
    values: Rc<Vec<T>>,
}

impl<T> Clone for FromVec<T> {
    fn clone(&self) -> Self {
        Self {
            values: Rc::clone(&self.values),
        }
    }
}

impl<T: Clone + 'static> Observable for FromVec<T> {
    type Item = T;

    fn subscribe_observer(&self, mut observer: BoxedObserver<T>) -> Subscription {
        for value in self.values.iter() {
            observer.on_next(value.clone());
        }
        observer.on_completed();
        Subscription::empty()
    }
}

/// Delegating impl so shared trait handles compose like owned streams.
impl<O: Observable + ?Sized> Observable for Rc<O> {
    type Item = O::Item;

    fn subscribe_observer(&self, observer: BoxedObserver<Self::Item>) -> Subscription {
        (**self).subscribe_observer(observer)
    }
}

/// The stream produced by [`ObservableExt::map`].
pub struct Map<S, F> {
    source: S,
    f: Rc<F>,
}

impl<S: Clone, F> Clone for Map<S, F> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            f: Rc::clone(&self.f),
        }
    }
}

impl<S, F, U> Observable for Map<S, F>
where
    S: Observable,
    S::Item: 'static,
    F: Fn(S::Item) -> U + 'static,
    U: 'static,
{
    type Item = U;

    fn subscribe_observer(&self, observer: BoxedObserver<U>) -> Subscription {
        let f = Rc::clone(&self.f);
        let shared: SharedObserver<U> = Rc::new(RefCell::new(observer));
        let error_target = Rc::clone(&shared);
        let completion_target = Rc::clone(&shared);
        self.source.subscribe_all(
            move |value| shared.borrow_mut().on_next(f(value)),
            move |error| error_target.borrow_mut().on_error(error),
            move || completion_target.borrow_mut().on_completed(),
        )
    }
}

/// The stream produced by [`ObservableExt::distinct_until_changed`].
pub struct DistinctUntilChanged<S> {
    source: S,
}

impl<S: Clone> Clone for DistinctUntilChanged<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<S> Observable for DistinctUntilChanged<S>
where
    S: Observable,
    S::Item: PartialEq + Clone + 'static,
{
    type Item = S::Item;

    fn subscribe_observer(&self, observer: BoxedObserver<S::Item>) -> Subscription {
        let shared: SharedObserver<S::Item> = Rc::new(RefCell::new(observer));
        let error_target = Rc::clone(&shared);
        let completion_target = Rc::clone(&shared);
        let mut last: Option<S::Item> = None;
        self.source.subscribe_all(
            move |value| {
                if last.as_ref() != Some(&value) {
                    last = Some(value.clone());
                    shared.borrow_mut().on_next(value);
                }
            },
            move |error| error_target.borrow_mut().on_error(error),
            move || completion_target.borrow_mut().on_completed(),
        )
    }
}

/// The stream produced by [`ObservableExt::start_with`].
pub struct StartWith<S: Observable> {
    source: S,
    value: S::Item,
}

impl<S: Observable + Clone> Clone for StartWith<S>
where
    S::Item: Clone,
{
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            value: self.value.clone(),
        }
    }
}

impl<S> Observable for StartWith<S>
where
    S: Observable,
    S::Item: Clone + 'static,
{
    type Item = S::Item;

    fn subscribe_observer(&self, observer: BoxedObserver<S::Item>) -> Subscription {
        let mut observer = observer;
        observer.on_next(self.value.clone());
        self.source.subscribe_observer(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposal_is_idempotent() {
        let count = Rc::new(std::cell::Cell::new(0));
        let counter = Rc::clone(&count);
        let sub = Subscription::new(move || counter.set(counter.get() + 1));
        sub.dispose();
        sub.dispose();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn distinct_suppresses_repeats() {
        let subject = Subject::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let _sub = subject
            .distinct_until_changed()
            .subscribe(move |v: i32| sink.borrow_mut().push(v));
        for v in [1, 1, 2, 2, 1] {
            subject.on_next(v);
        }
        assert_eq!(*seen.borrow(), vec![1, 2, 1]);
    }

    #[test]
    fn start_with_prepends() {
        let subject = Subject::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let _sub = subject
            .start_with(0)
            .subscribe(move |v: i32| sink.borrow_mut().push(v));
        subject.on_next(7);
        assert_eq!(*seen.borrow(), vec![0, 7]);
    }
}
