//! Scheduling of time-based work.
//!
//! Time-based operators never read a wall clock; they ask their injected
//! [`Scheduler`] for the current time and for future callbacks, which makes
//! them deterministic under test. Scheduler time is the authoritative clock.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::Duration;

use crate::stream::Subscription;

/// An abstract clock with one-shot future callbacks.
///
/// Times are offsets from the scheduler's own epoch. Recurring work is
/// expressed by an action re-scheduling itself.
pub trait Scheduler {
    /// The current time.
    fn now(&self) -> Duration;

    /// Runs `action` once the clock reaches `due`. Disposing the returned
    /// subscription cancels the callback.
    fn schedule(&self, due: Duration, action: Box<dyn FnOnce()>) -> Subscription;
}

impl<S: Scheduler + ?Sized> Scheduler for Rc<S> {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn schedule(&self, due: Duration, action: Box<dyn FnOnce()>) -> Subscription {
        (**self).schedule(due, action)
    }
}

struct ScheduledAction {
    due: Duration,
    seq: u64,
    cancelled: Rc<Cell<bool>>,
    action: Option<Box<dyn FnOnce()>>,
}

impl PartialEq for ScheduledAction {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for ScheduledAction {}

impl PartialOrd for ScheduledAction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledAction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

struct VirtualState {
    now: Duration,
    next_seq: u64,
    queue: BinaryHeap<Reverse<ScheduledAction>>,
}

/// A scheduler whose clock advances only when told to.
///
/// Actions fire in `(due, scheduling order)` order as the clock is advanced
/// across their due times; an action scheduled by another action within the
/// advanced range fires during the same advance.
pub struct VirtualScheduler {
    state: Rc<RefCell<VirtualState>>,
}

impl Clone for VirtualScheduler {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualScheduler {
    /// A scheduler whose clock starts at zero.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(VirtualState {
                now: Duration::ZERO,
                next_seq: 0,
                queue: BinaryHeap::new(),
            })),
        }
    }

    /// Advances the clock to `instant`, running every action due on the way.
    pub fn advance_to(&self, instant: Duration) {
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                let ready =
                    matches!(state.queue.peek(), Some(Reverse(entry)) if entry.due <= instant);
                if !ready {
                    None
                } else {
                    let Reverse(mut entry) = state.queue.pop().expect("peeked entry");
                    if entry.due > state.now {
                        state.now = entry.due;
                    }
                    Some(entry.action.take().filter(|_| !entry.cancelled.get()))
                }
            };
            match next {
                // Run outside the borrow: actions may schedule further work.
                Some(Some(action)) => action(),
                Some(None) => {}
                None => break,
            }
        }
        let mut state = self.state.borrow_mut();
        if instant > state.now {
            state.now = instant;
        }
    }

    /// Advances the clock by `delta`.
    pub fn advance_by(&self, delta: Duration) {
        let target = self.state.borrow().now + delta;
        self.advance_to(target);
    }

    /// This scheduler as a shared trait handle, as the operators take it.
    pub fn handle(&self) -> Rc<dyn Scheduler> {
        Rc::new(self.clone())
    }
}

impl Scheduler for VirtualScheduler {
    fn now(&self) -> Duration {
        self.state.borrow().now
    }

    fn schedule(&self, due: Duration, action: Box<dyn FnOnce()>) -> Subscription {
        let cancelled = Rc::new(Cell::new(false));
        {
            let mut state = self.state.borrow_mut();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Reverse(ScheduledAction {
                due,
                seq,
                cancelled: Rc::clone(&cancelled),
                action: Some(action),
            }));
        }
        Subscription::new(move || cancelled.set(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_fire_in_due_order() {
        let scheduler = VirtualScheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let sink = Rc::clone(&order);
        let _b = scheduler.schedule(Duration::from_millis(20), Box::new(move || sink.borrow_mut().push("b")));
        let sink = Rc::clone(&order);
        let _a = scheduler.schedule(Duration::from_millis(10), Box::new(move || sink.borrow_mut().push("a")));

        scheduler.advance_to(Duration::from_millis(15));
        assert_eq!(*order.borrow(), vec!["a"]);
        scheduler.advance_to(Duration::from_millis(25));
        assert_eq!(*order.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn cancellation_prevents_firing() {
        let scheduler = VirtualScheduler::new();
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        let sub = scheduler.schedule(Duration::from_millis(5), Box::new(move || flag.set(true)));
        sub.dispose();
        scheduler.advance_by(Duration::from_millis(10));
        assert!(!fired.get());
    }

    #[test]
    fn rescheduling_action_fires_within_one_advance() {
        let scheduler = VirtualScheduler::new();
        let count = Rc::new(Cell::new(0u32));

        fn tick(scheduler: VirtualScheduler, count: Rc<Cell<u32>>) {
            count.set(count.get() + 1);
            if count.get() < 3 {
                let due = scheduler.now() + Duration::from_millis(10);
                scheduler
                    .schedule(due, {
                        let scheduler = scheduler.clone();
                        let count = Rc::clone(&count);
                        Box::new(move || tick(scheduler, count))
                    })
                    .detach();
            }
        }

        tick(scheduler.clone(), Rc::clone(&count));
        scheduler.advance_to(Duration::from_millis(100));
        assert_eq!(count.get(), 3);
    }
}
