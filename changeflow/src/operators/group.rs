//! Partition a collection into keyed sub-caches.
//!
//! The grouped stream is itself a change stream: its values are [`Group`]
//! handles, added when a group key is first observed and removed — in the same
//! batch — when a group loses its last member. Members move between groups as
//! a `Remove` from the old group's cache and an `Add` into the new one.
//!
//! [`GroupBy`] evaluates a fixed selector, [`GroupOnObservable`] follows a
//! per-item stream of group keys, and [`GroupOnDynamic`] takes the selector
//! itself from a stream, buffering items until the first selector arrives and
//! regrouping everything on each subsequent one (or on a regroup pulse).

use std::cell::RefCell;
use std::rc::Rc;

use fnv::FnvHashMap;
use indexmap::IndexMap;

use crate::cache::{Cache, ChangeAwareCache, ObservableCache};
use crate::changes::{ChangeReason, ChangeSet};
use crate::errors::SharedError;
use crate::operators::{ChildHandle, ChildSet};
use crate::stream::{BoxedObserver, Observable, Observer, ObservableExt, Subscription, WorkQueue};
use crate::{Data, Key};

/// A group of items sharing one group key, backed by its own member cache.
///
/// Equality and hashing are on the group key alone; clones share the member
/// cache.
pub struct Group<V, K, G> {
    key: G,
    cache: ObservableCache<V, K>,
}

impl<V: Data, K: Key, G: Key> Group<V, K, G> {
    fn new(key: G) -> Self {
        Self {
            key,
            cache: ObservableCache::new(),
        }
    }

    /// The group key.
    pub fn key(&self) -> &G {
        &self.key
    }

    /// The member cache: an observable cache of the group's items.
    pub fn cache(&self) -> &ObservableCache<V, K> {
        &self.cache
    }
}

impl<V, K, G: Clone> Clone for Group<V, K, G> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<V, K, G: PartialEq> PartialEq for Group<V, K, G> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<V, K, G: Eq> Eq for Group<V, K, G> {}

impl<V, K, G: std::hash::Hash> std::hash::Hash for Group<V, K, G> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<V, K, G: std::fmt::Debug> std::fmt::Debug for Group<V, K, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("key", &self.key).finish()
    }
}

/// A replaceable grouping selector, as carried by selector streams.
pub type GroupSelector<V, K, G> = Rc<dyn Fn(&V, &K) -> G>;

enum GroupEdit<V, K> {
    Upsert(K, V),
    Remove(K),
    Refresh(K),
}

/// The grouping state shared by all three grouping flavours: the live groups,
/// the key→group index, and the outgoing group-level cache.
struct GroupRoster<V, K, G> {
    groups: FnvHashMap<G, Group<V, K, G>>,
    memberships: FnvHashMap<K, G>,
    out: ChangeAwareCache<Group<V, K, G>, G>,
}

impl<V: Data, K: Key, G: Key> GroupRoster<V, K, G> {
    fn new() -> Self {
        Self {
            groups: FnvHashMap::default(),
            memberships: FnvHashMap::default(),
            out: ChangeAwareCache::new(),
        }
    }

    // Applies per-group edit runs, creating groups on first touch and
    // retiring groups emptied by this batch within the same batch.
    fn flush(&mut self, edits: IndexMap<G, Vec<GroupEdit<V, K>>>) {
        for (group_key, run) in edits {
            let group = match self.groups.get(&group_key) {
                Some(group) => group.clone(),
                None => {
                    let group = Group::new(group_key.clone());
                    self.groups.insert(group_key.clone(), group.clone());
                    self.out.add_or_update(group_key.clone(), group.clone());
                    group
                }
            };
            group.cache.update(|members| {
                for edit in &run {
                    match edit {
                        GroupEdit::Upsert(key, value) => {
                            members.add_or_update(key.clone(), value.clone());
                        }
                        GroupEdit::Remove(key) => members.remove(key),
                        GroupEdit::Refresh(key) => members.refresh(key),
                    }
                }
            });
            if group.cache.is_empty() {
                self.groups.remove(&group_key);
                self.out.remove(&group_key);
                group.cache.complete();
            }
        }
    }

    // Routes one upstream change through `selector` into per-group edits.
    fn route<F>(
        &mut self,
        selector: &F,
        change: &crate::changes::Change<V, K>,
        edits: &mut IndexMap<G, Vec<GroupEdit<V, K>>>,
    ) where
        F: Fn(&V, &K) -> G + ?Sized,
    {
        let key = change.key.clone();
        match change.reason {
            ChangeReason::Add => {
                let group_key = selector(&change.current, &key);
                self.memberships.insert(key.clone(), group_key.clone());
                edits
                    .entry(group_key)
                    .or_default()
                    .push(GroupEdit::Upsert(key, change.current.clone()));
            }
            ChangeReason::Update | ChangeReason::Refresh => {
                let group_key = selector(&change.current, &key);
                let former = self.memberships.insert(key.clone(), group_key.clone());
                match former {
                    Some(former) if former != group_key => {
                        edits
                            .entry(former)
                            .or_default()
                            .push(GroupEdit::Remove(key.clone()));
                        edits
                            .entry(group_key)
                            .or_default()
                            .push(GroupEdit::Upsert(key, change.current.clone()));
                    }
                    Some(_) if change.reason == ChangeReason::Refresh => {
                        edits
                            .entry(group_key)
                            .or_default()
                            .push(GroupEdit::Refresh(key));
                    }
                    _ => {
                        edits
                            .entry(group_key)
                            .or_default()
                            .push(GroupEdit::Upsert(key, change.current.clone()));
                    }
                }
            }
            ChangeReason::Remove => {
                if let Some(former) = self.memberships.remove(&key) {
                    edits.entry(former).or_default().push(GroupEdit::Remove(key));
                }
            }
            ChangeReason::Moved => {}
        }
    }

    fn retire_all(&mut self) {
        for (_, group) in self.groups.drain() {
            group.cache.complete();
        }
        self.memberships.clear();
    }
}

/// The stream produced by
/// [`ChangeStreamExt::group_by`](super::ChangeStreamExt::group_by).
pub struct GroupBy<S, F> {
    source: S,
    selector: Rc<F>,
}

impl<S, F> GroupBy<S, F> {
    pub(crate) fn new(source: S, selector: F) -> Self {
        Self {
            source,
            selector: Rc::new(selector),
        }
    }
}

impl<S: Clone, F> Clone for GroupBy<S, F> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            selector: Rc::clone(&self.selector),
        }
    }
}

struct GroupByState<V, K, G> {
    roster: GroupRoster<V, K, G>,
    downstream: BoxedObserver<ChangeSet<Group<V, K, G>, G>>,
    done: bool,
}

impl<S, F, V, K, G> Observable for GroupBy<S, F>
where
    V: Data,
    K: Key,
    G: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    F: Fn(&V, &K) -> G + 'static,
{
    type Item = ChangeSet<Group<V, K, G>, G>;

    fn subscribe_observer(
        &self,
        observer: BoxedObserver<ChangeSet<Group<V, K, G>, G>>,
    ) -> Subscription {
        let state = Rc::new(RefCell::new(GroupByState {
            roster: GroupRoster::new(),
            downstream: observer,
            done: false,
        }));
        let selector = Rc::clone(&self.selector);
        let on_next_state = Rc::clone(&state);
        let error_state = Rc::clone(&state);
        let completed_state = Rc::clone(&state);
        self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let state = &mut *on_next_state.borrow_mut();
                if state.done {
                    return;
                }
                let mut edits = IndexMap::new();
                for change in changes.iter() {
                    state.roster.route(&*selector, change, &mut edits);
                }
                state.roster.flush(edits);
                let captured = state.roster.out.capture_changes();
                if !captured.is_empty() {
                    state.downstream.on_next(captured);
                }
            },
            move |error| {
                let state = &mut *error_state.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.roster.retire_all();
                    state.downstream.on_error(error);
                }
            },
            move || {
                let state = &mut *completed_state.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.roster.retire_all();
                    state.downstream.on_completed();
                }
            },
        )
    }
}

/// The stream produced by
/// [`ChangeStreamExt::group_on_observable`](super::ChangeStreamExt::group_on_observable).
pub struct GroupOnObservable<S, F> {
    source: S,
    selector: Rc<F>,
}

impl<S, F> GroupOnObservable<S, F> {
    pub(crate) fn new(source: S, selector: F) -> Self {
        Self {
            source,
            selector: Rc::new(selector),
        }
    }
}

impl<S: Clone, F> Clone for GroupOnObservable<S, F> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            selector: Rc::clone(&self.selector),
        }
    }
}

struct GroupObsState<V, K, G> {
    values: Cache<V, K>,
    roster: GroupRoster<V, K, G>,
    children: ChildSet<K>,
    parent_sub: Option<Subscription>,
    active: usize,
    done: bool,
    downstream: BoxedObserver<ChangeSet<Group<V, K, G>, G>>,
}

struct GroupObsCore<V, K, G> {
    state: RefCell<GroupObsState<V, K, G>>,
    queue: WorkQueue,
}

impl<V: Data, K: Key, G: Key> GroupObsCore<V, K, G> {
    fn emit(&self) {
        let state = &mut *self.state.borrow_mut();
        if state.done {
            return;
        }
        let captured = state.roster.out.capture_changes();
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
        state.roster.retire_all();
        state.downstream.on_error(error);
    }

    fn settle(&self) {
        let state = &mut *self.state.borrow_mut();
        if state.active == 0 && !state.done {
            state.done = true;
            state.roster.retire_all();
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
        state.roster.retire_all();
    }
}

// One item's group key arrived: move the member if its group changed.
fn assign_group<V: Data, K: Key, G: Key>(
    state: &mut GroupObsState<V, K, G>,
    key: K,
    group_key: G,
) {
    if state.memberships_match(&key, &group_key) {
        return;
    }
    let Some(value) = state.values.lookup(&key).cloned() else {
        return;
    };
    let mut edits: IndexMap<G, Vec<GroupEdit<V, K>>> = IndexMap::new();
    if let Some(former) = state.roster.memberships.get(&key).cloned() {
        edits
            .entry(former)
            .or_default()
            .push(GroupEdit::Remove(key.clone()));
    }
    state
        .roster
        .memberships
        .insert(key.clone(), group_key.clone());
    edits
        .entry(group_key)
        .or_default()
        .push(GroupEdit::Upsert(key, value));
    state.roster.flush(edits);
}

impl<V: Data, K: Key, G: Key> GroupObsState<V, K, G> {
    fn memberships_match(&self, key: &K, group_key: &G) -> bool {
        self.roster.memberships.get(key) == Some(group_key)
    }
}

impl<S, F, R, V, K, G> Observable for GroupOnObservable<S, F>
where
    V: Data,
    K: Key,
    G: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = G> + 'static,
{
    type Item = ChangeSet<Group<V, K, G>, G>;

    fn subscribe_observer(
        &self,
        observer: BoxedObserver<ChangeSet<Group<V, K, G>, G>>,
    ) -> Subscription {
        let core = Rc::new(GroupObsCore {
            state: RefCell::new(GroupObsState {
                values: Cache::new(),
                roster: GroupRoster::new(),
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
                                    state.values.insert(key.clone(), change.current.clone());
                                    if let Some(group_key) =
                                        state.roster.memberships.get(&key).cloned()
                                    {
                                        let mut edits: IndexMap<G, Vec<GroupEdit<V, K>>> =
                                            IndexMap::new();
                                        edits.entry(group_key).or_default().push(
                                            GroupEdit::Upsert(
                                                key.clone(),
                                                change.current.clone(),
                                            ),
                                        );
                                        state.roster.flush(edits);
                                    }
                                    if let Some(old) = state.children.remove(&key) {
                                        if !old.is_completed() {
                                            state.active -= 1;
                                        }
                                        old.dispose();
                                    }
                                    let child = subscribe_group_key(
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
                                    state.values.remove(&key);
                                    if let Some(former) = state.roster.memberships.remove(&key) {
                                        let mut edits: IndexMap<G, Vec<GroupEdit<V, K>>> =
                                            IndexMap::new();
                                        edits
                                            .entry(former)
                                            .or_default()
                                            .push(GroupEdit::Remove(key));
                                        state.roster.flush(edits);
                                    }
                                }
                                ChangeReason::Refresh => {
                                    if let Some(group_key) =
                                        state.roster.memberships.get(&key).cloned()
                                    {
                                        let mut edits: IndexMap<G, Vec<GroupEdit<V, K>>> =
                                            IndexMap::new();
                                        edits
                                            .entry(group_key)
                                            .or_default()
                                            .push(GroupEdit::Refresh(key));
                                        state.roster.flush(edits);
                                    }
                                }
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

fn subscribe_group_key<V, K, G, F, R>(
    core: &Rc<GroupObsCore<V, K, G>>,
    selector: &Rc<F>,
    value: &V,
    key: &K,
) -> ChildHandle
where
    V: Data,
    K: Key,
    G: Key,
    F: Fn(&V, &K) -> R + 'static,
    R: Observable<Item = G> + 'static,
{
    let completed = Rc::new(std::cell::Cell::new(false));
    let group_keys = selector(value, key);

    let value_core = Rc::clone(core);
    let value_key = key.clone();
    let error_core = Rc::clone(core);
    let completed_core = Rc::clone(core);
    let completed_flag = Rc::clone(&completed);
    let subscription = group_keys.subscribe_all(
        move |group_key: G| {
            let core = Rc::clone(&value_core);
            let key = value_key.clone();
            let work_core = Rc::clone(&core);
            let finally_core = Rc::clone(&core);
            core.queue.run(
                move || {
                    let state = &mut *work_core.state.borrow_mut();
                    if !state.done {
                        assign_group(state, key, group_key);
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

/// The stream produced by
/// [`ChangeStreamExt::group_on_dynamic`](super::ChangeStreamExt::group_on_dynamic).
pub struct GroupOnDynamic<S, SS, RG> {
    source: S,
    selectors: SS,
    regrouper: Option<RG>,
}

impl<S, SS, RG> GroupOnDynamic<S, SS, RG> {
    pub(crate) fn new(source: S, selectors: SS, regrouper: Option<RG>) -> Self {
        Self {
            source,
            selectors,
            regrouper,
        }
    }
}

impl<S: Clone, SS: Clone, RG: Clone> Clone for GroupOnDynamic<S, SS, RG> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            selectors: self.selectors.clone(),
            regrouper: self.regrouper.clone(),
        }
    }
}

struct GroupDynState<V, K, G> {
    all: Cache<V, K>,
    selector: Option<GroupSelector<V, K, G>>,
    roster: GroupRoster<V, K, G>,
    downstream: BoxedObserver<ChangeSet<Group<V, K, G>, G>>,
    done: bool,
}

impl<V: Data, K: Key, G: Key> GroupDynState<V, K, G> {
    // Re-evaluates the whole collection with the current selector, moving
    // whatever changed group and placing whatever was still buffered.
    fn regroup(&mut self) {
        let Some(selector) = self.selector.clone() else {
            return;
        };
        let mut edits: IndexMap<G, Vec<GroupEdit<V, K>>> = IndexMap::new();
        for (key, value) in self.all.iter() {
            let group_key = selector(value, key);
            match self.roster.memberships.get(key) {
                Some(former) if *former == group_key => {}
                Some(former) => {
                    let former = former.clone();
                    edits
                        .entry(former)
                        .or_default()
                        .push(GroupEdit::Remove(key.clone()));
                    edits
                        .entry(group_key.clone())
                        .or_default()
                        .push(GroupEdit::Upsert(key.clone(), value.clone()));
                }
                None => {
                    edits
                        .entry(group_key.clone())
                        .or_default()
                        .push(GroupEdit::Upsert(key.clone(), value.clone()));
                }
            }
        }
        // Membership index rebuilt after the walk; the walk itself must not
        // mutate it while iterating the collection.
        for (group_key, run) in &edits {
            for edit in run {
                match edit {
                    GroupEdit::Upsert(key, _) => {
                        self.roster
                            .memberships
                            .insert(key.clone(), group_key.clone());
                    }
                    GroupEdit::Remove(_) | GroupEdit::Refresh(_) => {}
                }
            }
        }
        self.roster.flush(edits);
    }

    fn emit(&mut self) {
        if self.done {
            return;
        }
        let captured = self.roster.out.capture_changes();
        if !captured.is_empty() {
            self.downstream.on_next(captured);
        }
    }
}

impl<S, SS, RG, V, K, G> Observable for GroupOnDynamic<S, SS, RG>
where
    V: Data,
    K: Key,
    G: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    SS: Observable<Item = GroupSelector<V, K, G>>,
    RG: Observable<Item = ()>,
{
    type Item = ChangeSet<Group<V, K, G>, G>;

    fn subscribe_observer(
        &self,
        observer: BoxedObserver<ChangeSet<Group<V, K, G>, G>>,
    ) -> Subscription {
        let state = Rc::new(RefCell::new(GroupDynState {
            all: Cache::new(),
            selector: None,
            roster: GroupRoster::new(),
            downstream: observer,
            done: false,
        }));

        let selector_state = Rc::clone(&state);
        let selector_errors = Rc::clone(&state);
        let selector_sub = self.selectors.subscribe_all(
            move |selector: GroupSelector<V, K, G>| {
                let state = &mut *selector_state.borrow_mut();
                if state.done {
                    return;
                }
                state.selector = Some(selector);
                state.regroup();
                state.emit();
            },
            move |error| {
                let state = &mut *selector_errors.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.roster.retire_all();
                    state.downstream.on_error(error);
                }
            },
            || {},
        );

        let regroup_sub = match &self.regrouper {
            Some(regrouper) => {
                let regroup_state = Rc::clone(&state);
                let regroup_errors = Rc::clone(&state);
                regrouper.subscribe_all(
                    move |()| {
                        let state = &mut *regroup_state.borrow_mut();
                        if state.done {
                            return;
                        }
                        state.regroup();
                        state.emit();
                    },
                    move |error| {
                        let state = &mut *regroup_errors.borrow_mut();
                        if !state.done {
                            state.done = true;
                            state.roster.retire_all();
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
                if let Some(selector) = state.selector.clone() {
                    let mut edits = IndexMap::new();
                    for change in changes.iter() {
                        state.roster.route(&*selector, change, &mut edits);
                    }
                    state.roster.flush(edits);
                }
                state.emit();
            },
            move |error| {
                let state = &mut *data_errors.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.roster.retire_all();
                    state.downstream.on_error(error);
                }
            },
            move || {
                let state = &mut *data_completed.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.roster.retire_all();
                    state.downstream.on_completed();
                }
            },
        );

        data_sub.also(selector_sub).also(regroup_sub)
    }
}
