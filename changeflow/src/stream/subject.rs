//! A multicast hub for push-based notifications.

use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::SharedError;
use crate::stream::{BoxedObserver, Observable, Observer, Subscription};

/// An observer slot shared between a subject and in-flight notification loops.
pub(crate) type SharedObserver<T> = Rc<RefCell<BoxedObserver<T>>>;

enum Terminal {
    Completed,
    Errored(SharedError),
}

struct Entry<T> {
    id: u64,
    observer: SharedObserver<T>,
}

struct SubjectState<T> {
    observers: Vec<Entry<T>>,
    next_id: u64,
    terminal: Option<Terminal>,
}

/// A hot, multicast stream that is both an [`Observable`] and a push target.
///
/// Every registered observer receives each notification; observers registered
/// after termination immediately receive the terminal notification alone.
/// Observer registration order is notification order.
pub struct Subject<T> {
    state: Rc<RefCell<SubjectState<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subject<T> {
    /// An empty, live subject.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SubjectState {
                observers: Vec::new(),
                next_id: 0,
                terminal: None,
            })),
        }
    }

    /// True when at least one observer is registered.
    pub fn has_observers(&self) -> bool {
        !self.state.borrow().observers.is_empty()
    }

    /// The number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.state.borrow().observers.len()
    }

    /// True once the subject has terminated.
    pub fn is_terminated(&self) -> bool {
        self.state.borrow().terminal.is_some()
    }

    // Observers are snapshotted before notifying so that observers may
    // subscribe or dispose from inside a notification.
    fn snapshot(&self) -> Vec<SharedObserver<T>> {
        self.state
            .borrow()
            .observers
            .iter()
            .map(|entry| Rc::clone(&entry.observer))
            .collect()
    }

    /// Delivers an error to all observers and terminates the subject.
    pub fn on_error(&self, error: SharedError) {
        if self.state.borrow().terminal.is_some() {
            return;
        }
        let observers = {
            let mut state = self.state.borrow_mut();
            state.terminal = Some(Terminal::Errored(Rc::clone(&error)));
            std::mem::take(&mut state.observers)
        };
        for entry in observers {
            entry.observer.borrow_mut().on_error(Rc::clone(&error));
        }
    }

    /// Completes all observers and terminates the subject.
    pub fn on_completed(&self) {
        if self.state.borrow().terminal.is_some() {
            return;
        }
        let observers = {
            let mut state = self.state.borrow_mut();
            state.terminal = Some(Terminal::Completed);
            std::mem::take(&mut state.observers)
        };
        for entry in observers {
            entry.observer.borrow_mut().on_completed();
        }
    }

    pub(crate) fn subscribe_shared(&self, observer: SharedObserver<T>) -> Subscription
    where
        T: 'static,
    {
        {
            let state = self.state.borrow();
            match &state.terminal {
                Some(Terminal::Completed) => {
                    drop(state);
                    observer.borrow_mut().on_completed();
                    return Subscription::empty();
                }
                Some(Terminal::Errored(error)) => {
                    let error = Rc::clone(error);
                    drop(state);
                    observer.borrow_mut().on_error(error);
                    return Subscription::empty();
                }
                None => {}
            }
        }
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.next_id;
            state.next_id += 1;
            state.observers.push(Entry { id, observer });
            id
        };
        let state = Rc::clone(&self.state);
        Subscription::new(move || {
            state.borrow_mut().observers.retain(|entry| entry.id != id);
        })
    }
}

impl<T: Clone> Subject<T> {
    /// Delivers `value` to every registered observer.
    pub fn on_next(&self, value: T) {
        if self.state.borrow().terminal.is_some() {
            return;
        }
        for observer in self.snapshot() {
            observer.borrow_mut().on_next(value.clone());
        }
    }
}

impl<T: 'static> Observable for Subject<T> {
    type Item = T;

    fn subscribe_observer(&self, observer: BoxedObserver<T>) -> Subscription {
        self.subscribe_shared(Rc::new(RefCell::new(observer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ObservableExt;

    #[test]
    fn multicasts_to_all_observers() {
        let subject = Subject::new();
        let first = Rc::new(RefCell::new(Vec::new()));
        let second = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&first);
        let _a = subject.subscribe(move |v: i32| sink.borrow_mut().push(v));
        let sink = Rc::clone(&second);
        let _b = subject.subscribe(move |v: i32| sink.borrow_mut().push(v));

        subject.on_next(3);
        assert_eq!(*first.borrow(), vec![3]);
        assert_eq!(*second.borrow(), vec![3]);
    }

    #[test]
    fn disposal_stops_notifications() {
        let subject = Subject::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let sub = subject.subscribe(move |v: i32| sink.borrow_mut().push(v));
        subject.on_next(1);
        sub.dispose();
        subject.on_next(2);
        assert_eq!(*seen.borrow(), vec![1]);
    }

    #[test]
    fn late_subscriber_sees_terminal_state() {
        let subject = Subject::<i32>::new();
        subject.on_completed();
        let completed = Rc::new(std::cell::Cell::new(false));
        let flag = Rc::clone(&completed);
        let _sub = subject.subscribe_all(|_| {}, |_| {}, move || flag.set(true));
        assert!(completed.get());
    }
}
