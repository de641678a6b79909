//! Operators over keyed change streams.
//!
//! Every operator consumes a stream of [`ChangeSet`]s and produces another,
//! maintaining just enough private state to translate upstream deltas into
//! downstream deltas. The surface hangs off [`ChangeStreamExt`], implemented
//! blanket-style for any cloneable change stream, and [`SortedStreamExt`] for
//! the windowing operators that require sorted input.
//!
//! Unless stated otherwise an operator suppresses zero-change batches,
//! ignores `Refresh` for keys it does not hold, and treats `Moved` as a
//! no-op (index semantics are local to the sorting subsystem).

pub mod expire;
pub mod filter;
pub mod group;
pub mod join;
pub mod merge;
pub mod monitor;
pub mod refresh;
pub mod sort;
pub mod transform;
pub mod virtualise;

pub use expire::{ExpirableItem, ExpireAfter, LimitSize};
pub use filter::{DynamicFilter, Filter, FilterImmutable, FilterOnObservable, FilterPredicate};
pub use group::{Group, GroupBy, GroupOnDynamic, GroupOnObservable, GroupSelector};
pub use join::{FullJoin, InnerJoin, LeftJoin, RightJoin};
pub use merge::{
    merge_change_sets, merge_change_sets_by, MergeChangeSets, MergeMany, MergeManyChangeSets,
    MergePolicy,
};
pub use monitor::{ConnectionStatus, MonitorStatus, OnItemRemoved, RefCount};
pub use refresh::AutoRefresh;
pub use sort::{
    BindSorted, KeyValueCollection, Sort, SortAndBindOptions, SortOptimisations, SortReason,
    SortedChangeSet,
};
pub use transform::{
    RetransformFilter, Transform, TransformDeferred, TransformInPlace, TransformOnObservable,
    TransformOptions, TryTransform,
};
pub use virtualise::{
    Page, PageRequest, PageResponse, PagedChangeSet, VirtualChangeSet, VirtualRequest,
    VirtualResponse, Virtualise,
};

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::rc::Rc;
use std::time::Duration;

use indexmap::IndexMap;

use crate::changes::ChangeSet;
use crate::stream::{FromVec, Observable, Scheduler, Subscription};
use crate::{Data, Key};

/// One per-key child subscription together with its completion flag.
///
/// The flag lets an operator distinguish a child that finished from one it
/// disposed early, which is what keeps the subscription counter of the
/// parent/child protocol honest.
pub(crate) struct ChildHandle {
    subscription: Subscription,
    completed: Rc<Cell<bool>>,
}

impl ChildHandle {
    pub(crate) fn new(subscription: Subscription, completed: Rc<Cell<bool>>) -> Self {
        Self {
            subscription,
            completed,
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.get()
    }

    pub(crate) fn dispose(self) {
        self.subscription.dispose();
    }
}

/// The per-key child subscriptions of one operator instance, kept in
/// insertion order so teardown can dispose them in reverse.
pub(crate) struct ChildSet<K> {
    children: IndexMap<K, ChildHandle>,
}

impl<K: Key> ChildSet<K> {
    pub(crate) fn new() -> Self {
        Self {
            children: IndexMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, key: K, handle: ChildHandle) {
        self.children.insert(key, handle);
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<ChildHandle> {
        self.children.shift_remove(key)
    }

    pub(crate) fn drain_reverse(&mut self) -> Vec<ChildHandle> {
        self.children.drain(..).rev().map(|(_, handle)| handle).collect()
    }
}

/// Operators available on every keyed change stream.
pub trait ChangeStreamExt<V: Data, K: Key>:
    Observable<Item = ChangeSet<V, K>> + Clone + Sized + 'static
{
    /// Keeps the items satisfying `predicate`.
    ///
    /// # Examples
    ///
    /// ```
    /// use changeflow::{ChangeStreamExt, ObservableCache, ObservableExt};
    /// use std::{cell::RefCell, rc::Rc};
    ///
    /// let source = ObservableCache::new();
    /// let seen = Rc::new(RefCell::new(Vec::new()));
    /// let sink = Rc::clone(&seen);
    /// let _sub = source
    ///     .connect()
    ///     .filter(|value: &i32| value % 2 == 0)
    ///     .subscribe(move |changes| sink.borrow_mut().push(changes));
    ///
    /// source.update(|cache| {
    ///     cache.add_or_update("a", 1);
    ///     cache.add_or_update("b", 2);
    /// });
    ///
    /// assert_eq!(seen.borrow().len(), 1);
    /// assert_eq!(seen.borrow()[0][0].key, "b");
    /// ```
    fn filter<P>(&self, predicate: P) -> Filter<Self, P>
    where
        P: Fn(&V) -> bool + 'static,
    {
        Filter::new(self.clone(), predicate)
    }

    /// Keeps the items satisfying `predicate`, statelessly: updates are
    /// rewritten through a truth table instead of consulting a cache, and
    /// indices are not carried.
    fn filter_immutable<P>(&self, predicate: P) -> FilterImmutable<Self, P>
    where
        P: Fn(&V) -> bool + 'static,
    {
        FilterImmutable::new(self.clone(), predicate)
    }

    /// Filters with the latest predicate from `predicates`, re-evaluating the
    /// whole collection on each new one. Until a predicate arrives, nothing
    /// passes.
    fn filter_dynamic<PS>(&self, predicates: PS) -> DynamicFilter<Self, PS, FromVec<()>>
    where
        PS: Observable<Item = FilterPredicate<V>> + Clone + 'static,
    {
        DynamicFilter::new(self.clone(), predicates, None)
    }

    /// Like [`filter_dynamic`](Self::filter_dynamic), with a pulse stream
    /// forcing re-evaluation under the current predicate.
    fn filter_dynamic_with<PS, RF>(
        &self,
        predicates: PS,
        refilter: RF,
    ) -> DynamicFilter<Self, PS, RF>
    where
        PS: Observable<Item = FilterPredicate<V>> + Clone + 'static,
        RF: Observable<Item = ()> + Clone + 'static,
    {
        DynamicFilter::new(self.clone(), predicates, Some(refilter))
    }

    /// Lets every item decide its own membership through a per-item boolean
    /// stream.
    fn filter_on_observable<F, R>(&self, selector: F) -> FilterOnObservable<Self, F>
    where
        F: Fn(&V, &K) -> R + 'static,
        R: Observable<Item = bool> + 'static,
    {
        FilterOnObservable::new(self.clone(), selector, None)
    }

    /// Like [`filter_on_observable`](Self::filter_on_observable), batching
    /// membership verdicts over `window` on `scheduler`.
    fn filter_on_observable_buffered<F, R>(
        &self,
        selector: F,
        window: Duration,
        scheduler: Rc<dyn Scheduler>,
    ) -> FilterOnObservable<Self, F>
    where
        F: Fn(&V, &K) -> R + 'static,
        R: Observable<Item = bool> + 'static,
    {
        FilterOnObservable::new(self.clone(), selector, Some((window, scheduler)))
    }

    /// Projects every value through `selector`.
    ///
    /// # Examples
    ///
    /// ```
    /// use changeflow::{ChangeStreamExt, ObservableCache, ObservableExt};
    /// use std::{cell::RefCell, rc::Rc};
    ///
    /// let source = ObservableCache::new();
    /// let seen = Rc::new(RefCell::new(Vec::new()));
    /// let sink = Rc::clone(&seen);
    /// let _sub = source
    ///     .connect()
    ///     .transform(|value: &i32, _key| value * value)
    ///     .subscribe(move |changes| sink.borrow_mut().push(changes));
    ///
    /// source.update(|cache| cache.add_or_update(1, 3));
    /// assert_eq!(seen.borrow()[0][0].current, 9);
    /// ```
    fn transform<D, F>(&self, selector: F) -> Transform<Self, F>
    where
        D: Data,
        F: Fn(&V, &K) -> D + 'static,
    {
        Transform::new(self.clone(), selector, false)
    }

    /// Like [`transform`](Self::transform), but a `Refresh` re-runs the
    /// selector instead of being forwarded.
    fn transform_on_refresh<D, F>(&self, selector: F) -> Transform<Self, F>
    where
        D: Data,
        F: Fn(&V, &K) -> D + 'static,
    {
        Transform::new(self.clone(), selector, true)
    }

    /// A fallible transform. The selector sees the existing destination, and
    /// failures are routed per [`TransformOptions`]: to the error callback
    /// (skipping the change), or to the downstream as a fatal error.
    fn try_transform<D, F>(
        &self,
        selector: F,
        options: TransformOptions<V, K>,
    ) -> TryTransform<Self, F, V, K, D>
    where
        D: Data,
        F: Fn(&V, Option<&D>, &K) -> Result<D, crate::errors::SharedError> + 'static,
    {
        TryTransform::new(self.clone(), selector, options)
    }

    /// Builds destinations with `factory` and applies updates by mutating the
    /// existing destination in place, emitting `Refresh` rather than
    /// `Update`. With `refresh_in_place` set, refreshes are applied the same
    /// way. An update for an unknown key fails the subscription.
    fn transform_in_place<D, FC, FU>(
        &self,
        factory: FC,
        update: FU,
        refresh_in_place: bool,
    ) -> TransformInPlace<Self, FC, FU>
    where
        K: std::fmt::Debug,
        D: Data,
        FC: Fn(&V, &K) -> D + 'static,
        FU: Fn(&mut D, &V) + 'static,
    {
        TransformInPlace::new(self.clone(), factory, update, refresh_in_place)
    }

    /// Resolves each destination from a one-shot observable, applying batches
    /// strictly in arrival order.
    fn transform_deferred<D, F, R>(&self, factory: F) -> TransformDeferred<Self, F, V, K>
    where
        D: Data,
        F: Fn(&V, &K) -> R + 'static,
        R: Observable<Item = D> + 'static,
    {
        TransformDeferred::new(self.clone(), factory, None)
    }

    /// Like [`transform_deferred`](Self::transform_deferred), with a trigger
    /// stream forcing matching items to be re-transformed atomically with the
    /// batch flow.
    fn transform_deferred_forced<D, F, R, T>(
        &self,
        factory: F,
        trigger: T,
    ) -> TransformDeferred<Self, F, V, K>
    where
        D: Data,
        F: Fn(&V, &K) -> R + 'static,
        R: Observable<Item = D> + 'static,
        T: Observable<Item = RetransformFilter<V, K>> + 'static,
    {
        TransformDeferred::new(
            self.clone(),
            factory,
            Some(Rc::new(trigger) as Rc<dyn Observable<Item = RetransformFilter<V, K>>>),
        )
    }

    /// Keeps each destination pinned to the latest element of a per-item
    /// stream, suppressing repeats.
    fn transform_on_observable<D, F, R>(&self, selector: F) -> TransformOnObservable<Self, F>
    where
        D: Data + PartialEq,
        F: Fn(&V, &K) -> R + 'static,
        R: Observable<Item = D> + 'static,
    {
        TransformOnObservable::new(self.clone(), selector)
    }

    /// Partitions the collection by `selector` into [`Group`]s, each carrying
    /// its own member cache. A group emptied by a batch is removed in that
    /// same batch.
    ///
    /// # Examples
    ///
    /// ```
    /// use changeflow::{ChangeStreamExt, ObservableCache, ObservableExt};
    /// use std::{cell::RefCell, rc::Rc};
    ///
    /// let source = ObservableCache::new();
    /// let seen = Rc::new(RefCell::new(Vec::new()));
    /// let sink = Rc::clone(&seen);
    /// let _sub = source
    ///     .connect()
    ///     .group_by(|value: &i32, _key: &i32| value % 2)
    ///     .subscribe(move |groups| sink.borrow_mut().push(groups));
    ///
    /// source.update(|cache| {
    ///     cache.add_or_update(1, 1);
    ///     cache.add_or_update(2, 2);
    /// });
    ///
    /// // One batch introducing both parity groups.
    /// assert_eq!(seen.borrow().len(), 1);
    /// assert_eq!(seen.borrow()[0].len(), 2);
    /// ```
    fn group_by<G, F>(&self, selector: F) -> GroupBy<Self, F>
    where
        G: Key,
        F: Fn(&V, &K) -> G + 'static,
    {
        GroupBy::new(self.clone(), selector)
    }

    /// Groups each item by the latest element of its own group-key stream.
    fn group_on_observable<G, F, R>(&self, selector: F) -> GroupOnObservable<Self, F>
    where
        G: Key,
        F: Fn(&V, &K) -> R + 'static,
        R: Observable<Item = G> + 'static,
    {
        GroupOnObservable::new(self.clone(), selector)
    }

    /// Groups with the latest selector from `selectors`, buffering items
    /// until the first selector arrives and regrouping everything on each
    /// subsequent one.
    fn group_on_dynamic<G, SS>(&self, selectors: SS) -> GroupOnDynamic<Self, SS, FromVec<()>>
    where
        G: Key,
        SS: Observable<Item = GroupSelector<V, K, G>> + Clone + 'static,
    {
        GroupOnDynamic::new(self.clone(), selectors, None)
    }

    /// Like [`group_on_dynamic`](Self::group_on_dynamic), with a pulse stream
    /// forcing full re-evaluation under the current selector.
    fn group_on_dynamic_with<G, SS, RG>(
        &self,
        selectors: SS,
        regrouper: RG,
    ) -> GroupOnDynamic<Self, SS, RG>
    where
        G: Key,
        SS: Observable<Item = GroupSelector<V, K, G>> + Clone + 'static,
        RG: Observable<Item = ()> + Clone + 'static,
    {
        GroupOnDynamic::new(self.clone(), selectors, Some(regrouper))
    }

    /// Flattens per-item streams into one stream of their elements. Completes
    /// only once the parent and every per-item stream have completed.
    fn merge_many<D, F, R>(&self, selector: F) -> MergeMany<Self, F>
    where
        D: 'static,
        F: Fn(&V, &K) -> R + 'static,
        R: Observable<Item = D> + 'static,
    {
        MergeMany::new(self.clone(), selector)
    }

    /// Flattens per-item change streams into one collection, first-seen wins
    /// per key. A departing inner stream withdraws everything it published.
    fn merge_many_change_sets<V2, K2, F, R>(&self, selector: F) -> MergeManyChangeSets<Self, F, V2>
    where
        V2: Data + PartialEq,
        K2: Key,
        F: Fn(&V, &K) -> R + 'static,
        R: Observable<Item = ChangeSet<V2, K2>> + 'static,
    {
        MergeManyChangeSets::new(self.clone(), selector, MergePolicy::first_seen())
    }

    /// Like [`merge_many_change_sets`](Self::merge_many_change_sets),
    /// publishing the smallest value per key under `comparer`.
    fn merge_many_change_sets_by<V2, K2, F, R, C>(
        &self,
        selector: F,
        comparer: C,
    ) -> MergeManyChangeSets<Self, F, V2>
    where
        V2: Data,
        K2: Key,
        F: Fn(&V, &K) -> R + 'static,
        R: Observable<Item = ChangeSet<V2, K2>> + 'static,
        C: Fn(&V2, &V2) -> Ordering + 'static,
    {
        MergeManyChangeSets::new(self.clone(), selector, MergePolicy::smallest(comparer))
    }

    /// Joins this stream (the left side) with `right`, keyed by the right
    /// key; every right item yields a row with the matching left item
    /// optional.
    fn right_join<R, RK, D, SR, FK, FR>(
        &self,
        right: SR,
        right_key: FK,
        selector: FR,
    ) -> RightJoin<Self, SR, FK, FR>
    where
        R: Data,
        RK: Key,
        D: Data,
        SR: Observable<Item = ChangeSet<R, RK>> + Clone + 'static,
        FK: Fn(&R) -> K + 'static,
        FR: Fn(&RK, Option<&V>, &R) -> D + 'static,
    {
        RightJoin::new(self.clone(), right, right_key, selector)
    }

    /// Joins this stream (the left side) with `right` re-keyed by foreign
    /// key; every left item yields a row with the matching right item
    /// optional.
    fn left_join<R, RK, D, SR, FK, FJ>(
        &self,
        right: SR,
        right_key: FK,
        selector: FJ,
    ) -> LeftJoin<Self, SR, FK, FJ>
    where
        R: Data,
        RK: Key,
        D: Data,
        SR: Observable<Item = ChangeSet<R, RK>> + Clone + 'static,
        FK: Fn(&R) -> K + 'static,
        FJ: Fn(&K, &V, Option<&R>) -> D + 'static,
    {
        LeftJoin::new(self.clone(), right, right_key, selector)
    }

    /// Joins this stream with `right` re-keyed by foreign key, yielding a row
    /// only where both sides are present.
    fn inner_join<R, RK, D, SR, FK, FJ>(
        &self,
        right: SR,
        right_key: FK,
        selector: FJ,
    ) -> InnerJoin<Self, SR, FK, FJ>
    where
        R: Data,
        RK: Key,
        D: Data,
        SR: Observable<Item = ChangeSet<R, RK>> + Clone + 'static,
        FK: Fn(&R) -> K + 'static,
        FJ: Fn(&K, &V, &R) -> D + 'static,
    {
        InnerJoin::new(self.clone(), right, right_key, selector)
    }

    /// Joins this stream with `right` re-keyed by foreign key, yielding a row
    /// wherever either side is present.
    fn full_join<R, RK, D, SR, FK, FJ>(
        &self,
        right: SR,
        right_key: FK,
        selector: FJ,
    ) -> FullJoin<Self, SR, FK, FJ>
    where
        R: Data,
        RK: Key,
        D: Data,
        SR: Observable<Item = ChangeSet<R, RK>> + Clone + 'static,
        FK: Fn(&R) -> K + 'static,
        FJ: Fn(&K, Option<&V>, Option<&R>) -> D + 'static,
    {
        FullJoin::new(self.clone(), right, right_key, selector)
    }

    /// Maintains a sorted projection, annotating changes with positions and
    /// synthesising `Moved` entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use changeflow::operators::SortOptimisations;
    /// use changeflow::{ChangeStreamExt, ObservableCache, ObservableExt};
    /// use std::{cell::RefCell, rc::Rc};
    ///
    /// let source = ObservableCache::new();
    /// let seen = Rc::new(RefCell::new(Vec::new()));
    /// let sink = Rc::clone(&seen);
    /// let _sub = source
    ///     .connect()
    ///     .sort(|a: &i32, b: &i32| a.cmp(b), SortOptimisations::default())
    ///     .subscribe(move |sorted| sink.borrow_mut().push(sorted));
    ///
    /// source.update(|cache| {
    ///     cache.add_or_update("b", 2);
    ///     cache.add_or_update("a", 1);
    /// });
    ///
    /// let keys: Vec<&str> = seen.borrow()[0]
    ///     .collection
    ///     .entries()
    ///     .iter()
    ///     .map(|(key, _)| *key)
    ///     .collect();
    /// assert_eq!(keys, vec!["a", "b"]);
    /// ```
    fn sort<C>(&self, comparer: C, optimisations: SortOptimisations) -> Sort<Self, C>
    where
        C: Fn(&V, &V) -> Ordering + 'static,
    {
        Sort::new(self.clone(), comparer, optimisations)
    }

    /// Maintains `target` as the sorted rendition of this stream while
    /// forwarding batches unchanged.
    fn bind_sorted<C>(
        &self,
        comparer: C,
        options: SortAndBindOptions,
        target: Rc<RefCell<Vec<(K, V)>>>,
    ) -> BindSorted<Self, C, V, K>
    where
        C: Fn(&V, &V) -> Ordering + 'static,
    {
        BindSorted::new(self.clone(), comparer, options, target)
    }

    /// Evicts items once the scheduler's clock passes `now +
    /// time_selector(value)`, one timer per distinct deadline.
    ///
    /// # Examples
    ///
    /// ```
    /// use changeflow::{ChangeStreamExt, ObservableCache, ObservableExt, VirtualScheduler};
    /// use std::time::Duration;
    /// use std::{cell::RefCell, rc::Rc};
    ///
    /// let scheduler = VirtualScheduler::new();
    /// let source = ObservableCache::new();
    /// let seen = Rc::new(RefCell::new(Vec::new()));
    /// let sink = Rc::clone(&seen);
    /// let _sub = source
    ///     .connect()
    ///     .expire_after(
    ///         |_value: &i32| Some(Duration::from_millis(100)),
    ///         scheduler.handle(),
    ///     )
    ///     .subscribe(move |changes| sink.borrow_mut().push(changes));
    ///
    /// source.update(|cache| cache.add_or_update(1, 1));
    /// scheduler.advance_by(Duration::from_millis(99));
    /// assert_eq!(seen.borrow().len(), 1);
    /// scheduler.advance_by(Duration::from_millis(1));
    /// assert_eq!(seen.borrow().len(), 2);
    /// ```
    fn expire_after<F>(&self, time_selector: F, scheduler: Rc<dyn Scheduler>) -> ExpireAfter<Self, F>
    where
        F: Fn(&V) -> Option<Duration> + 'static,
    {
        ExpireAfter::new(self.clone(), time_selector, None, scheduler)
    }

    /// Like [`expire_after`](Self::expire_after), sweeping on a fixed
    /// `interval` instead of keeping per-deadline timers.
    fn expire_after_polling<F>(
        &self,
        time_selector: F,
        interval: Duration,
        scheduler: Rc<dyn Scheduler>,
    ) -> ExpireAfter<Self, F>
    where
        F: Fn(&V) -> Option<Duration> + 'static,
    {
        ExpireAfter::new(self.clone(), time_selector, Some(interval), scheduler)
    }

    /// Keeps only the most recently introduced `limit` items, evicting the
    /// oldest beyond capacity after each batch.
    fn limit_size(&self, limit: usize) -> LimitSize<Self> {
        LimitSize::new(self.clone(), limit)
    }

    /// Turns each pulse of a per-item re-evaluator stream into a `Refresh`
    /// for that key.
    fn auto_refresh<F, R>(&self, reevaluator: F) -> AutoRefresh<Self, F>
    where
        F: Fn(&V, &K) -> R + 'static,
        R: Observable<Item = ()> + 'static,
    {
        AutoRefresh::new(self.clone(), reevaluator, None)
    }

    /// Like [`auto_refresh`](Self::auto_refresh), batching pulses over
    /// `window` on `scheduler`.
    fn auto_refresh_buffered<F, R>(
        &self,
        reevaluator: F,
        window: Duration,
        scheduler: Rc<dyn Scheduler>,
    ) -> AutoRefresh<Self, F>
    where
        F: Fn(&V, &K) -> R + 'static,
        R: Observable<Item = ()> + 'static,
    {
        AutoRefresh::new(self.clone(), reevaluator, Some((window, scheduler)))
    }

    /// Reports the stream's load state, starting with `Pending`.
    fn monitor_status(&self) -> MonitorStatus<Self> {
        MonitorStatus::new(self.clone())
    }

    /// Shares one materialised cache between subscribers: the first builds
    /// it, later ones replay its accumulated state, the last tears it down.
    fn ref_count(&self) -> RefCount<Self, V, K> {
        RefCount::new(self.clone())
    }

    /// Runs `action` for every removed item; with `invoke_on_unsubscribe`
    /// set, also for the items still present at disposal.
    fn on_item_removed<A>(&self, action: A, invoke_on_unsubscribe: bool) -> OnItemRemoved<Self, A>
    where
        A: Fn(&V, &K) + 'static,
    {
        OnItemRemoved::new(self.clone(), action, invoke_on_unsubscribe)
    }
}

impl<S, V: Data, K: Key> ChangeStreamExt<V, K> for S where
    S: Observable<Item = ChangeSet<V, K>> + Clone + 'static
{
}

/// Operators available on sorted change streams.
pub trait SortedStreamExt<V: Data, K: Key>:
    Observable<Item = SortedChangeSet<V, K>> + Clone + Sized + 'static
{
    /// Projects the window described by the latest request onto the sorted
    /// stream, emitting key-wise deltas between consecutive windows.
    fn virtualise<RQ>(&self, requests: RQ) -> Virtualise<Self, RQ>
    where
        RQ: Observable<Item = VirtualRequest> + Clone + 'static,
    {
        Virtualise::new(self.clone(), requests)
    }

    /// Projects the page described by the latest request onto the sorted
    /// stream, emitting key-wise deltas between consecutive pages.
    fn page<RQ>(&self, requests: RQ) -> Page<Self, RQ>
    where
        RQ: Observable<Item = PageRequest> + Clone + 'static,
    {
        Page::new(self.clone(), requests)
    }
}

impl<S, V: Data, K: Key> SortedStreamExt<V, K> for S where
    S: Observable<Item = SortedChangeSet<V, K>> + Clone + 'static
{
}
