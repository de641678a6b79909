//! Maintain a sorted projection of a keyed collection.
//!
//! [`Sort`] keeps a sorted key-value list and annotates every outgoing change
//! with positions, synthesising `Moved` entries when a refresh shifts an item;
//! it is the only producer of `Moved` in the engine. [`BindSorted`] applies
//! the same ordering discipline to a caller-shared list, wholesale-replacing
//! it when a batch crosses the reset threshold.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::changes::{Change, ChangeReason, ChangeSet};
use crate::errors::{shared, SortError};
use crate::stream::{BoxedObserver, Observable, Observer, ObservableExt, Subscription};
use crate::{Data, Key};

/// Behavioural switches for the sorted calculators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SortOptimisations {
    /// Treat `Refresh` as a wholesale re-sort rather than computing per-item
    /// moves.
    pub ignore_evaluates: bool,
    /// Values never change their sort position behind the engine's back, so
    /// current positions may be located by binary search.
    pub compares_immutable_values_only: bool,
}

/// Why a [`KeyValueCollection`] was (re)built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortReason {
    /// First sorted snapshot for this subscription.
    InitialLoad,
    /// An upstream batch changed the data.
    DataChanged,
    /// Refreshes forced a wholesale re-sort.
    Reorder,
    /// The batch crossed the reset threshold and the target was rebuilt.
    Reset,
}

/// An immutable, ordered, indexable snapshot of `(key, value)` pairs.
pub struct KeyValueCollection<V, K> {
    entries: Rc<Vec<(K, V)>>,
    comparer: Rc<dyn Fn(&V, &V) -> Ordering>,
    reason: SortReason,
    optimisations: SortOptimisations,
}

impl<V, K> Clone for KeyValueCollection<V, K> {
    fn clone(&self) -> Self {
        Self {
            entries: Rc::clone(&self.entries),
            comparer: Rc::clone(&self.comparer),
            reason: self.reason,
            optimisations: self.optimisations,
        }
    }
}

impl<V: Data, K: Key> KeyValueCollection<V, K> {
    /// The number of pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The ordered pairs.
    pub fn entries(&self) -> &[(K, V)] {
        &self.entries
    }

    /// The pair at `index`, if in range.
    pub fn get(&self, index: usize) -> Option<&(K, V)> {
        self.entries.get(index)
    }

    /// The position of `key`, if present.
    pub fn position_of(&self, key: &K) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    /// Why this snapshot was built.
    pub fn reason(&self) -> SortReason {
        self.reason
    }

    /// The optimisation flags the producing operator ran under.
    pub fn optimisations(&self) -> SortOptimisations {
        self.optimisations
    }

    /// The comparer the snapshot is ordered by.
    pub fn comparer(&self) -> Rc<dyn Fn(&V, &V) -> Ordering> {
        Rc::clone(&self.comparer)
    }

    // A sub-snapshot (a window or page) sharing this snapshot's ordering.
    pub(crate) fn for_window(source: &KeyValueCollection<V, K>, entries: Vec<(K, V)>) -> Self {
        Self {
            entries: Rc::new(entries),
            comparer: Rc::clone(&source.comparer),
            reason: source.reason,
            optimisations: source.optimisations,
        }
    }
}

/// An indexed change set together with the sorted snapshot it produced.
#[derive(Clone)]
pub struct SortedChangeSet<V, K> {
    /// The changes, annotated with positions; includes synthetic `Moved`
    /// entries for refresh-induced shifts.
    pub changes: ChangeSet<V, K>,
    /// The sorted state after applying `changes`.
    pub collection: KeyValueCollection<V, K>,
}

// Insertion position keeping equal values in arrival order.
fn insert_position<V, K>(
    list: &[(K, V)],
    comparer: &dyn Fn(&V, &V) -> Ordering,
    value: &V,
) -> usize {
    list.partition_point(|(_, existing)| comparer(existing, value) != Ordering::Greater)
}

// Locates `key`, using the sorted neighbourhood of `hint` when values are
// immutable, falling back to a linear scan.
fn locate<V, K: Key>(
    list: &[(K, V)],
    comparer: &dyn Fn(&V, &V) -> Ordering,
    key: &K,
    hint: Option<&V>,
    binary: bool,
) -> Option<usize> {
    if binary {
        if let Some(hint) = hint {
            let start = list.partition_point(|(_, existing)| {
                comparer(existing, hint) == Ordering::Less
            });
            let mut index = start;
            while let Some((k, v)) = list.get(index) {
                if comparer(v, hint) != Ordering::Equal {
                    break;
                }
                if k == key {
                    return Some(index);
                }
                index += 1;
            }
        }
    }
    list.iter().position(|(k, _)| k == key)
}

/// The stream produced by
/// [`ChangeStreamExt::sort`](super::ChangeStreamExt::sort).
pub struct Sort<S, C> {
    source: S,
    comparer: Rc<C>,
    optimisations: SortOptimisations,
}

impl<S, C> Sort<S, C> {
    pub(crate) fn new(source: S, comparer: C, optimisations: SortOptimisations) -> Self {
        Self {
            source,
            comparer: Rc::new(comparer),
            optimisations,
        }
    }
}

impl<S: Clone, C> Clone for Sort<S, C> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            comparer: Rc::clone(&self.comparer),
            optimisations: self.optimisations,
        }
    }
}

struct SortState<V, K> {
    list: Vec<(K, V)>,
    first: bool,
    downstream: BoxedObserver<SortedChangeSet<V, K>>,
    done: bool,
}

impl<S, C, V, K> Observable for Sort<S, C>
where
    V: Data,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    C: Fn(&V, &V) -> Ordering + 'static,
{
    type Item = SortedChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<SortedChangeSet<V, K>>) -> Subscription {
        let state = Rc::new(RefCell::new(SortState {
            list: Vec::new(),
            first: true,
            downstream: observer,
            done: false,
        }));
        let comparer = Rc::clone(&self.comparer);
        let optimisations = self.optimisations;
        let shared_comparer: Rc<dyn Fn(&V, &V) -> Ordering> = {
            let comparer = Rc::clone(&self.comparer);
            Rc::new(move |a: &V, b: &V| comparer(a, b))
        };

        let on_next_state = Rc::clone(&state);
        let error_state = Rc::clone(&state);
        let completed_state = Rc::clone(&state);
        self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let state = &mut *on_next_state.borrow_mut();
                if state.done {
                    return;
                }
                let cmp: &dyn Fn(&V, &V) -> Ordering = &*comparer;
                let binary = optimisations.compares_immutable_values_only;
                let mut out = ChangeSet::with_capacity(changes.len());
                let mut needs_resort = false;
                for change in changes.iter() {
                    match change.reason {
                        ChangeReason::Add => {
                            let position = insert_position(&state.list, cmp, &change.current);
                            state
                                .list
                                .insert(position, (change.key.clone(), change.current.clone()));
                            out.push(
                                Change::add(change.key.clone(), change.current.clone())
                                    .at(Some(position), None),
                            );
                        }
                        ChangeReason::Update => {
                            let former = locate(
                                &state.list,
                                cmp,
                                &change.key,
                                change.previous.as_ref(),
                                binary,
                            );
                            let Some(former) = former else {
                                state.done = true;
                                state.downstream.on_error(shared(SortError::new(
                                    "update for a key missing from the sorted list",
                                )));
                                return;
                            };
                            state.list.remove(former);
                            let position = insert_position(&state.list, cmp, &change.current);
                            state
                                .list
                                .insert(position, (change.key.clone(), change.current.clone()));
                            let previous = change
                                .previous
                                .clone()
                                .unwrap_or_else(|| change.current.clone());
                            out.push(
                                Change::update(change.key.clone(), change.current.clone(), previous)
                                    .at(Some(position), Some(former)),
                            );
                        }
                        ChangeReason::Remove => {
                            let former = locate(
                                &state.list,
                                cmp,
                                &change.key,
                                Some(&change.current),
                                binary,
                            );
                            let Some(former) = former else {
                                continue;
                            };
                            state.list.remove(former);
                            out.push(
                                Change::remove(change.key.clone(), change.current.clone())
                                    .at(Some(former), None),
                            );
                        }
                        ChangeReason::Refresh => {
                            if optimisations.ignore_evaluates {
                                needs_resort = true;
                                out.push(Change::refresh(
                                    change.key.clone(),
                                    change.current.clone(),
                                ));
                                continue;
                            }
                            // The order pre-condition may already be violated
                            // for this key, so only a linear scan is safe.
                            let Some(former) =
                                state.list.iter().position(|(k, _)| k == &change.key)
                            else {
                                continue;
                            };
                            let (key, value) = state.list.remove(former);
                            let position = insert_position(&state.list, cmp, &value);
                            state.list.insert(position, (key, value));
                            out.push(
                                Change::refresh(change.key.clone(), change.current.clone())
                                    .at(Some(position), None),
                            );
                            if position != former {
                                out.push(Change::moved(
                                    change.key.clone(),
                                    change.current.clone(),
                                    position,
                                    former,
                                ));
                            }
                        }
                        ChangeReason::Moved => {}
                    }
                }
                if needs_resort {
                    state.list.sort_by(|a, b| cmp(&a.1, &b.1));
                }
                if out.is_empty() && !needs_resort {
                    return;
                }
                let reason = if state.first {
                    state.first = false;
                    SortReason::InitialLoad
                } else if needs_resort {
                    SortReason::Reorder
                } else {
                    SortReason::DataChanged
                };
                let collection = KeyValueCollection {
                    entries: Rc::new(state.list.clone()),
                    comparer: Rc::clone(&shared_comparer),
                    reason,
                    optimisations,
                };
                state.downstream.on_next(SortedChangeSet {
                    changes: out,
                    collection,
                });
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

/// Options for [`BindSorted`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortAndBindOptions {
    /// Batch size above which the target list is rebuilt wholesale rather
    /// than maintained change by change. Zero disables resets.
    pub reset_threshold: usize,
    /// Replace an updated entry in place when its sort position is unchanged.
    pub use_replace_for_updates: bool,
    /// Locate current positions by binary search; requires values whose sort
    /// position never changes behind the engine's back.
    pub use_binary_search: bool,
}

impl Default for SortAndBindOptions {
    fn default() -> Self {
        Self {
            reset_threshold: 100,
            use_replace_for_updates: false,
            use_binary_search: false,
        }
    }
}

/// The stream produced by
/// [`ChangeStreamExt::bind_sorted`](super::ChangeStreamExt::bind_sorted):
/// maintains a caller-shared sorted list while forwarding batches unchanged.
pub struct BindSorted<S, C, V, K> {
    source: S,
    comparer: Rc<C>,
    options: SortAndBindOptions,
    target: Rc<RefCell<Vec<(K, V)>>>,
}

impl<S, C, V, K> BindSorted<S, C, V, K> {
    pub(crate) fn new(
        source: S,
        comparer: C,
        options: SortAndBindOptions,
        target: Rc<RefCell<Vec<(K, V)>>>,
    ) -> Self {
        Self {
            source,
            comparer: Rc::new(comparer),
            options,
            target,
        }
    }
}

impl<S: Clone, C, V, K> Clone for BindSorted<S, C, V, K> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            comparer: Rc::clone(&self.comparer),
            options: self.options,
            target: Rc::clone(&self.target),
        }
    }
}

struct BindSortedState<V, K> {
    cache: Cache<V, K>,
    downstream: BoxedObserver<ChangeSet<V, K>>,
    done: bool,
}

impl<S, C, V, K> Observable for BindSorted<S, C, V, K>
where
    V: Data,
    K: Key,
    S: Observable<Item = ChangeSet<V, K>>,
    C: Fn(&V, &V) -> Ordering + 'static,
{
    type Item = ChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<ChangeSet<V, K>>) -> Subscription {
        let state = Rc::new(RefCell::new(BindSortedState {
            cache: Cache::new(),
            downstream: observer,
            done: false,
        }));
        let comparer = Rc::clone(&self.comparer);
        let options = self.options;
        let target = Rc::clone(&self.target);

        let on_next_state = Rc::clone(&state);
        let error_state = Rc::clone(&state);
        let completed_state = Rc::clone(&state);
        self.source.subscribe_all(
            move |changes: ChangeSet<V, K>| {
                let state = &mut *on_next_state.borrow_mut();
                if state.done {
                    return;
                }
                state.cache.apply(&changes);
                let cmp: &dyn Fn(&V, &V) -> Ordering = &*comparer;
                if options.reset_threshold > 0 && changes.len() > options.reset_threshold {
                    let mut rebuilt: Vec<(K, V)> = state
                        .cache
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    rebuilt.sort_by(|a, b| cmp(&a.1, &b.1));
                    *target.borrow_mut() = rebuilt;
                } else {
                    let list = &mut *target.borrow_mut();
                    for change in changes.iter() {
                        match change.reason {
                            ChangeReason::Add => {
                                let position = insert_position(list, cmp, &change.current);
                                list.insert(
                                    position,
                                    (change.key.clone(), change.current.clone()),
                                );
                            }
                            ChangeReason::Update => {
                                let former = locate(
                                    list,
                                    cmp,
                                    &change.key,
                                    change.previous.as_ref(),
                                    options.use_binary_search,
                                );
                                let Some(former) = former else {
                                    state.done = true;
                                    state.downstream.on_error(shared(SortError::new(
                                        "update for a key missing from the bound list",
                                    )));
                                    return;
                                };
                                let in_place = options.use_replace_for_updates && {
                                    let fits_left = former == 0
                                        || cmp(&list[former - 1].1, &change.current)
                                            != Ordering::Greater;
                                    let fits_right = former + 1 >= list.len()
                                        || cmp(&list[former + 1].1, &change.current)
                                            != Ordering::Less;
                                    fits_left && fits_right
                                };
                                if in_place {
                                    list[former] = (change.key.clone(), change.current.clone());
                                } else {
                                    list.remove(former);
                                    let position = insert_position(list, cmp, &change.current);
                                    list.insert(
                                        position,
                                        (change.key.clone(), change.current.clone()),
                                    );
                                }
                            }
                            ChangeReason::Remove => {
                                if let Some(former) = locate(
                                    list,
                                    cmp,
                                    &change.key,
                                    Some(&change.current),
                                    options.use_binary_search,
                                ) {
                                    list.remove(former);
                                }
                            }
                            ChangeReason::Refresh => {
                                let Some(former) =
                                    list.iter().position(|(k, _)| k == &change.key)
                                else {
                                    continue;
                                };
                                let (key, value) = list.remove(former);
                                let position = insert_position(list, cmp, &value);
                                list.insert(position, (key, value));
                            }
                            ChangeReason::Moved => {}
                        }
                    }
                }
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
        )
    }
}
