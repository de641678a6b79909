//! Cooperative serialisation of re-entrant operator work.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

/// Serialises the work frames of one operator instance.
///
/// An operator routes every entry point — a parent batch, a child emission, a
/// scheduled callback — through [`WorkQueue::run`]. Work arriving while a
/// frame is active is deferred into that frame instead of starting its own, so
/// state is never observed mid-mutation and each frame ends with exactly one
/// `finally` (the operator's capture-and-emit step). Work deferred from inside
/// `finally` re-runs the drain-then-`finally` cycle until the queue is dry.
pub(crate) struct WorkQueue {
    busy: Cell<bool>,
    pending: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self {
            busy: Cell::new(false),
            pending: RefCell::new(VecDeque::new()),
        }
    }

    /// Runs `work` now if no frame is active, deferring it into the active
    /// frame otherwise. `finally` closes the frame.
    pub(crate) fn run<W, F>(&self, work: W, finally: F)
    where
        W: FnOnce() + 'static,
        F: Fn(),
    {
        if self.busy.get() {
            self.pending.borrow_mut().push_back(Box::new(work));
            return;
        }
        self.busy.set(true);
        work();
        loop {
            loop {
                let next = self.pending.borrow_mut().pop_front();
                match next {
                    Some(deferred) => deferred(),
                    None => break,
                }
            }
            finally();
            if self.pending.borrow().is_empty() {
                break;
            }
        }
        self.busy.set(false);
    }
}
