//! Match two keyed collections on a foreign key.
//!
//! The right side carries a foreign-key selector pointing into the left side's
//! key space. [`RightJoin`] keys its output by the right key and always yields
//! a row per right item, with the left side optional. The left-keyed joins
//! ([`LeftJoin`], [`InnerJoin`], [`FullJoin`]) key their output by the left
//! key over the right side re-keyed by foreign key (latest right wins per
//! foreign key), and differ only in which missing side still yields a row.
//!
//! All joins hold both side caches under one subscription and re-derive only
//! the affected rows on each upstream batch.

use std::cell::RefCell;
use std::rc::Rc;

use fnv::FnvHashMap;
use indexmap::IndexSet;

use crate::cache::{Cache, ChangeAwareCache};
use crate::changes::{ChangeReason, ChangeSet};
use crate::stream::{BoxedObserver, Observable, Observer, ObservableExt, Subscription};
use crate::{Data, Key};

// ---------------------------------------------------------------------------
// Right join: keyed by the right key.
// ---------------------------------------------------------------------------

/// The stream produced by
/// [`ChangeStreamExt::right_join`](super::ChangeStreamExt::right_join).
pub struct RightJoin<SL, SR, FK, FR> {
    left: SL,
    right: SR,
    right_key: Rc<FK>,
    result: Rc<FR>,
}

impl<SL, SR, FK, FR> RightJoin<SL, SR, FK, FR> {
    pub(crate) fn new(left: SL, right: SR, right_key: FK, result: FR) -> Self {
        Self {
            left,
            right,
            right_key: Rc::new(right_key),
            result: Rc::new(result),
        }
    }
}

impl<SL: Clone, SR: Clone, FK, FR> Clone for RightJoin<SL, SR, FK, FR> {
    fn clone(&self) -> Self {
        Self {
            left: self.left.clone(),
            right: self.right.clone(),
            right_key: Rc::clone(&self.right_key),
            result: Rc::clone(&self.result),
        }
    }
}

struct RightJoinState<L, LK, R, RK, D> {
    left: Cache<L, LK>,
    rights: FnvHashMap<RK, R>,
    foreign_of: FnvHashMap<RK, LK>,
    by_foreign: FnvHashMap<LK, IndexSet<RK>>,
    joined: ChangeAwareCache<D, RK>,
    initialized: bool,
    left_done: bool,
    right_done: bool,
    done: bool,
    downstream: BoxedObserver<ChangeSet<D, RK>>,
}

impl<L, LK, R, RK, D> RightJoinState<L, LK, R, RK, D>
where
    L: Data,
    LK: Key,
    R: Data,
    RK: Key,
    D: Data,
{
    fn emit(&mut self) {
        if self.done {
            return;
        }
        let captured = self.joined.capture_changes();
        if !captured.is_empty() {
            self.downstream.on_next(captured);
        }
    }

    fn fail(&mut self, error: crate::errors::SharedError) {
        if !self.done {
            self.done = true;
            self.downstream.on_error(error);
        }
    }

    fn complete_side(&mut self, left: bool) {
        if left {
            self.left_done = true;
        } else {
            self.right_done = true;
        }
        if self.left_done && self.right_done && !self.done {
            self.done = true;
            self.downstream.on_completed();
        }
    }

    fn unlink(&mut self, right_key: &RK, foreign: &LK) {
        if let Some(set) = self.by_foreign.get_mut(foreign) {
            set.shift_remove(right_key);
            if set.is_empty() {
                self.by_foreign.remove(foreign);
            }
        }
    }

    fn link(&mut self, right_key: RK, foreign: LK) {
        self.by_foreign.entry(foreign).or_default().insert(right_key);
    }
}

impl<SL, SR, FK, FR, L, LK, R, RK, D> Observable for RightJoin<SL, SR, FK, FR>
where
    L: Data,
    LK: Key,
    R: Data,
    RK: Key,
    D: Data,
    SL: Observable<Item = ChangeSet<L, LK>>,
    SR: Observable<Item = ChangeSet<R, RK>>,
    FK: Fn(&R) -> LK + 'static,
    FR: Fn(&RK, Option<&L>, &R) -> D + 'static,
{
    type Item = ChangeSet<D, RK>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<D, RK>>) -> Subscription {
        let state = Rc::new(RefCell::new(RightJoinState {
            left: Cache::new(),
            rights: FnvHashMap::default(),
            foreign_of: FnvHashMap::default(),
            by_foreign: FnvHashMap::default(),
            joined: ChangeAwareCache::new(),
            initialized: false,
            left_done: false,
            right_done: false,
            done: false,
            downstream: observer,
        }));
        let right_key = Rc::clone(&self.right_key);
        let result = Rc::clone(&self.result);

        // The left side is attached first so its initial replay fills the
        // cache silently; joins flow once the right side attaches.
        let left_state = Rc::clone(&state);
        let left_result = Rc::clone(&result);
        let left_errors = Rc::clone(&state);
        let left_completed = Rc::clone(&state);
        let left_sub = self.left.subscribe_all(
            move |changes: ChangeSet<L, LK>| {
                let state = &mut *left_state.borrow_mut();
                if state.done {
                    return;
                }
                for change in changes.iter() {
                    let foreign = change.key.clone();
                    match change.reason {
                        ChangeReason::Add | ChangeReason::Update => {
                            state.left.insert(foreign.clone(), change.current.clone());
                        }
                        ChangeReason::Remove => {
                            state.left.remove(&foreign);
                        }
                        ChangeReason::Refresh | ChangeReason::Moved => {}
                    }
                    if !state.initialized {
                        continue;
                    }
                    let affected: Vec<RK> = state
                        .by_foreign
                        .get(&foreign)
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default();
                    for rk in affected {
                        match change.reason {
                            ChangeReason::Refresh => state.joined.refresh(&rk),
                            _ => {
                                if let Some(right) = state.rights.get(&rk).cloned() {
                                    let row =
                                        left_result(&rk, state.left.lookup(&foreign), &right);
                                    state.joined.add_or_update(rk, row);
                                }
                            }
                        }
                    }
                }
                state.emit();
            },
            move |error| left_errors.borrow_mut().fail(error),
            move || left_completed.borrow_mut().complete_side(true),
        );
        state.borrow_mut().initialized = true;

        let right_state = Rc::clone(&state);
        let right_errors = Rc::clone(&state);
        let right_completed = Rc::clone(&state);
        let right_sub = self.right.subscribe_all(
            move |changes: ChangeSet<R, RK>| {
                let state = &mut *right_state.borrow_mut();
                if state.done {
                    return;
                }
                for change in changes.iter() {
                    let rk = change.key.clone();
                    match change.reason {
                        ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                            let foreign = right_key(&change.current);
                            let former = state.foreign_of.insert(rk.clone(), foreign.clone());
                            let moved = former.as_ref() != Some(&foreign);
                            if let Some(former) = former {
                                if moved {
                                    state.unlink(&rk, &former);
                                }
                            }
                            if moved {
                                state.link(rk.clone(), foreign.clone());
                            }
                            state.rights.insert(rk.clone(), change.current.clone());
                            if change.reason == ChangeReason::Refresh && !moved {
                                state.joined.refresh(&rk);
                            } else {
                                let row = result(
                                    &rk,
                                    state.left.lookup(&foreign),
                                    &change.current,
                                );
                                state.joined.add_or_update(rk, row);
                            }
                        }
                        ChangeReason::Remove => {
                            state.rights.remove(&rk);
                            if let Some(foreign) = state.foreign_of.remove(&rk) {
                                state.unlink(&rk, &foreign);
                            }
                            state.joined.remove(&rk);
                        }
                        ChangeReason::Moved => {}
                    }
                }
                state.emit();
            },
            move |error| right_errors.borrow_mut().fail(error),
            move || right_completed.borrow_mut().complete_side(false),
        );

        left_sub.also(right_sub)
    }
}

// ---------------------------------------------------------------------------
// Left-keyed joins: keyed by the left key over the re-keyed right side.
// ---------------------------------------------------------------------------

struct LeftKeyedState<L, LK, R, RK, D> {
    left: Cache<L, LK>,
    rights: FnvHashMap<RK, (LK, R)>,
    by_foreign: FnvHashMap<LK, IndexSet<RK>>,
    joined: ChangeAwareCache<D, LK>,
    left_done: bool,
    right_done: bool,
    done: bool,
    downstream: BoxedObserver<ChangeSet<D, LK>>,
}

type JoinRow<'a, L, LK, R, D> = &'a dyn Fn(&LK, Option<&L>, Option<&R>) -> Option<D>;

impl<L, LK, R, RK, D> LeftKeyedState<L, LK, R, RK, D>
where
    L: Data,
    LK: Key,
    R: Data,
    RK: Key,
    D: Data,
{
    fn new(downstream: BoxedObserver<ChangeSet<D, LK>>) -> Self {
        Self {
            left: Cache::new(),
            rights: FnvHashMap::default(),
            by_foreign: FnvHashMap::default(),
            joined: ChangeAwareCache::new(),
            left_done: false,
            right_done: false,
            done: false,
            downstream,
        }
    }

    fn effective_right(&self, foreign: &LK) -> Option<&R> {
        let rk = self.by_foreign.get(foreign)?.last()?;
        self.rights.get(rk).map(|(_, right)| right)
    }

    fn recompute(&mut self, foreign: &LK, row: JoinRow<'_, L, LK, R, D>) {
        let value = row(foreign, self.left.lookup(foreign), self.effective_right(foreign));
        match value {
            Some(value) => self.joined.add_or_update(foreign.clone(), value),
            None => self.joined.remove(foreign),
        }
    }

    fn apply_left(&mut self, changes: &ChangeSet<L, LK>, row: JoinRow<'_, L, LK, R, D>) {
        for change in changes.iter() {
            let foreign = change.key.clone();
            match change.reason {
                ChangeReason::Add | ChangeReason::Update => {
                    self.left.insert(foreign.clone(), change.current.clone());
                    self.recompute(&foreign, row);
                }
                ChangeReason::Remove => {
                    self.left.remove(&foreign);
                    self.recompute(&foreign, row);
                }
                ChangeReason::Refresh => {
                    if self.joined.contains_key(&foreign) {
                        self.joined.refresh(&foreign);
                    }
                }
                ChangeReason::Moved => {}
            }
        }
    }

    fn apply_right(
        &mut self,
        changes: &ChangeSet<R, RK>,
        right_key: &dyn Fn(&R) -> LK,
        row: JoinRow<'_, L, LK, R, D>,
    ) {
        for change in changes.iter() {
            let rk = change.key.clone();
            match change.reason {
                ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                    let foreign = right_key(&change.current);
                    let former = self
                        .rights
                        .insert(rk.clone(), (foreign.clone(), change.current.clone()));
                    let former_foreign = former.map(|(former, _)| former);
                    let moved = former_foreign.as_ref() != Some(&foreign);
                    if let Some(former) = former_foreign {
                        if moved {
                            if let Some(set) = self.by_foreign.get_mut(&former) {
                                set.shift_remove(&rk);
                                if set.is_empty() {
                                    self.by_foreign.remove(&former);
                                }
                            }
                            self.recompute(&former, row);
                        }
                    }
                    // Latest writer becomes the effective right for its key.
                    let links = self.by_foreign.entry(foreign.clone()).or_default();
                    links.shift_remove(&rk);
                    links.insert(rk);
                    if change.reason == ChangeReason::Refresh && !moved {
                        if self.joined.contains_key(&foreign) {
                            self.joined.refresh(&foreign);
                        }
                    } else {
                        self.recompute(&foreign, row);
                    }
                }
                ChangeReason::Remove => {
                    if let Some((foreign, _)) = self.rights.remove(&rk) {
                        if let Some(set) = self.by_foreign.get_mut(&foreign) {
                            set.shift_remove(&rk);
                            if set.is_empty() {
                                self.by_foreign.remove(&foreign);
                            }
                        }
                        self.recompute(&foreign, row);
                    }
                }
                ChangeReason::Moved => {}
            }
        }
    }

    fn emit(&mut self) {
        if self.done {
            return;
        }
        let captured = self.joined.capture_changes();
        if !captured.is_empty() {
            self.downstream.on_next(captured);
        }
    }

    fn fail(&mut self, error: crate::errors::SharedError) {
        if !self.done {
            self.done = true;
            self.downstream.on_error(error);
        }
    }

    fn complete_side(&mut self, left: bool) {
        if left {
            self.left_done = true;
        } else {
            self.right_done = true;
        }
        if self.left_done && self.right_done && !self.done {
            self.done = true;
            self.downstream.on_completed();
        }
    }
}

macro_rules! left_keyed_join {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name<SL, SR, FK, FJ> {
            left: SL,
            right: SR,
            right_key: Rc<FK>,
            selector: Rc<FJ>,
        }

        impl<SL, SR, FK, FJ> $name<SL, SR, FK, FJ> {
            pub(crate) fn new(left: SL, right: SR, right_key: FK, selector: FJ) -> Self {
                Self {
                    left,
                    right,
                    right_key: Rc::new(right_key),
                    selector: Rc::new(selector),
                }
            }
        }

        impl<SL: Clone, SR: Clone, FK, FJ> Clone for $name<SL, SR, FK, FJ> {
            fn clone(&self) -> Self {
                Self {
                    left: self.left.clone(),
                    right: self.right.clone(),
                    right_key: Rc::clone(&self.right_key),
                    selector: Rc::clone(&self.selector),
                }
            }
        }
    };
}

left_keyed_join!(
    /// The stream produced by
    /// [`ChangeStreamExt::left_join`](super::ChangeStreamExt::left_join):
    /// one row per left item, with the matching right item optional.
    LeftJoin
);
left_keyed_join!(
    /// The stream produced by
    /// [`ChangeStreamExt::inner_join`](super::ChangeStreamExt::inner_join):
    /// a row only where both sides are present.
    InnerJoin
);
left_keyed_join!(
    /// The stream produced by
    /// [`ChangeStreamExt::full_join`](super::ChangeStreamExt::full_join):
    /// a row wherever either side is present.
    FullJoin
);

macro_rules! left_keyed_subscribe {
    ($self:ident, $observer:ident, $adapt:expr) => {{
        let state = Rc::new(RefCell::new(LeftKeyedState::new($observer)));
        let right_key = Rc::clone(&$self.right_key);
        let selector = Rc::clone(&$self.selector);

        let left_state = Rc::clone(&state);
        let left_selector = Rc::clone(&selector);
        let left_errors = Rc::clone(&state);
        let left_completed = Rc::clone(&state);
        let left_sub = $self.left.subscribe_all(
            move |changes| {
                let state = &mut *left_state.borrow_mut();
                if state.done {
                    return;
                }
                let row = $adapt(&left_selector);
                state.apply_left(&changes, &row);
                state.emit();
            },
            move |error| left_errors.borrow_mut().fail(error),
            move || left_completed.borrow_mut().complete_side(true),
        );

        let right_state = Rc::clone(&state);
        let right_errors = Rc::clone(&state);
        let right_completed = Rc::clone(&state);
        let right_sub = $self.right.subscribe_all(
            move |changes| {
                let state = &mut *right_state.borrow_mut();
                if state.done {
                    return;
                }
                let row = $adapt(&selector);
                state.apply_right(&changes, &*right_key, &row);
                state.emit();
            },
            move |error| right_errors.borrow_mut().fail(error),
            move || right_completed.borrow_mut().complete_side(false),
        );

        left_sub.also(right_sub)
    }};
}

impl<SL, SR, FK, FJ, L, LK, R, RK, D> Observable for LeftJoin<SL, SR, FK, FJ>
where
    L: Data,
    LK: Key,
    R: Data,
    RK: Key,
    D: Data,
    SL: Observable<Item = ChangeSet<L, LK>>,
    SR: Observable<Item = ChangeSet<R, RK>>,
    FK: Fn(&R) -> LK + 'static,
    FJ: Fn(&LK, &L, Option<&R>) -> D + 'static,
{
    type Item = ChangeSet<D, LK>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<D, LK>>) -> Subscription {
        left_keyed_subscribe!(self, observer, |selector: &Rc<FJ>| {
            let selector = Rc::clone(selector);
            move |lk: &LK, left: Option<&L>, right: Option<&R>| {
                left.map(|left| selector(lk, left, right))
            }
        })
    }
}

impl<SL, SR, FK, FJ, L, LK, R, RK, D> Observable for InnerJoin<SL, SR, FK, FJ>
where
    L: Data,
    LK: Key,
    R: Data,
    RK: Key,
    D: Data,
    SL: Observable<Item = ChangeSet<L, LK>>,
    SR: Observable<Item = ChangeSet<R, RK>>,
    FK: Fn(&R) -> LK + 'static,
    FJ: Fn(&LK, &L, &R) -> D + 'static,
{
    type Item = ChangeSet<D, LK>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<D, LK>>) -> Subscription {
        left_keyed_subscribe!(self, observer, |selector: &Rc<FJ>| {
            let selector = Rc::clone(selector);
            move |lk: &LK, left: Option<&L>, right: Option<&R>| match (left, right) {
                (Some(left), Some(right)) => Some(selector(lk, left, right)),
                _ => None,
            }
        })
    }
}

impl<SL, SR, FK, FJ, L, LK, R, RK, D> Observable for FullJoin<SL, SR, FK, FJ>
where
    L: Data,
    LK: Key,
    R: Data,
    RK: Key,
    D: Data,
    SL: Observable<Item = ChangeSet<L, LK>>,
    SR: Observable<Item = ChangeSet<R, RK>>,
    FK: Fn(&R) -> LK + 'static,
    FJ: Fn(&LK, Option<&L>, Option<&R>) -> D + 'static,
{
    type Item = ChangeSet<D, LK>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<D, LK>>) -> Subscription {
        left_keyed_subscribe!(self, observer, |selector: &Rc<FJ>| {
            let selector = Rc::clone(selector);
            move |lk: &LK, left: Option<&L>, right: Option<&R>| {
                if left.is_none() && right.is_none() {
                    None
                } else {
                    Some(selector(lk, left, right))
                }
            }
        })
    }
}
