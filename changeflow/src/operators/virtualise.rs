//! Project a moving window (or page) onto a sorted stream.
//!
//! Both operators consume [`SortedChangeSet`]s together with a request
//! stream, slice the requested window out of the latest sorted snapshot, and
//! emit the key-wise delta between consecutive windows alongside a response
//! header. A request that changes nothing — same bounds, identical window —
//! yields no emission.

use std::cell::RefCell;
use std::rc::Rc;

use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};

use crate::changes::{Change, ChangeReason, ChangeSet};
use crate::operators::sort::{KeyValueCollection, SortedChangeSet};
use crate::stream::{BoxedObserver, Observable, Observer, ObservableExt, Subscription};
use crate::{Data, Key};

/// A window request: `size` items from `start`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualRequest {
    /// First index of the window within the sorted collection.
    pub start: usize,
    /// Window length.
    pub size: usize,
}

impl Default for VirtualRequest {
    fn default() -> Self {
        Self { start: 0, size: 25 }
    }
}

/// The header describing the window an emission reflects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualResponse {
    /// The requested window length.
    pub size: usize,
    /// The effective first index (clamped to the collection).
    pub start: usize,
    /// Total items in the underlying sorted collection.
    pub total: usize,
}

/// A windowed delta over a sorted stream.
#[derive(Clone)]
pub struct VirtualChangeSet<V, K> {
    /// The key-wise delta between the previous and current windows.
    pub changes: ChangeSet<V, K>,
    /// The window this emission reflects.
    pub response: VirtualResponse,
    /// The current window contents, in sorted order.
    pub window: KeyValueCollection<V, K>,
}

/// A page request: 1-based `page` of `size` items.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: usize,
    /// Page length.
    pub size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, size: 25 }
    }
}

/// The header describing the page an emission reflects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResponse {
    /// The effective page (clamped to the available pages).
    pub page: usize,
    /// The requested page length.
    pub size: usize,
    /// Number of pages the collection currently spans.
    pub pages: usize,
    /// Total items in the underlying sorted collection.
    pub total: usize,
}

/// A paged delta over a sorted stream.
#[derive(Clone)]
pub struct PagedChangeSet<V, K> {
    /// The key-wise delta between the previous and current pages.
    pub changes: ChangeSet<V, K>,
    /// The page this emission reflects.
    pub response: PageResponse,
    /// The current page contents, in sorted order.
    pub window: KeyValueCollection<V, K>,
}

// The key-wise delta between two windows. Adds carry their window position;
// updates and refreshes from the driving batch are forwarded for keys present
// in both windows.
fn window_delta<V: Data, K: Key>(
    previous: &[(K, V)],
    current: &[(K, V)],
    upstream: Option<&ChangeSet<V, K>>,
) -> ChangeSet<V, K> {
    let mut delta = ChangeSet::new();
    let current_positions: FnvHashMap<&K, usize> = current
        .iter()
        .enumerate()
        .map(|(index, (key, _))| (key, index))
        .collect();
    let previous_keys: FnvHashSet<&K> = previous.iter().map(|(key, _)| key).collect();

    for (key, value) in previous {
        if !current_positions.contains_key(key) {
            delta.push(Change::remove(key.clone(), value.clone()));
        }
    }
    for (index, (key, value)) in current.iter().enumerate() {
        if !previous_keys.contains(key) {
            delta.push(Change::add(key.clone(), value.clone()).at(Some(index), None));
        }
    }
    if let Some(upstream) = upstream {
        for change in upstream.iter() {
            let both = previous_keys.contains(&change.key)
                && current_positions.contains_key(&change.key);
            if !both {
                continue;
            }
            match change.reason {
                ChangeReason::Update | ChangeReason::Refresh => {
                    let position = current_positions.get(&change.key).copied();
                    delta.push(change.clone().at(position, None));
                }
                _ => {}
            }
        }
    }
    delta
}

fn slice_window<V: Data, K: Key>(
    latest: &KeyValueCollection<V, K>,
    start: usize,
    size: usize,
) -> (usize, Vec<(K, V)>) {
    let total = latest.len();
    let start = start.min(total);
    let end = start.saturating_add(size).min(total);
    (start, latest.entries()[start..end].to_vec())
}

fn window_collection<V: Data, K: Key>(
    latest: &KeyValueCollection<V, K>,
    window: &[(K, V)],
) -> KeyValueCollection<V, K> {
    KeyValueCollection::for_window(latest, window.to_vec())
}

/// The stream produced by
/// [`SortedStreamExt::virtualise`](super::SortedStreamExt::virtualise).
pub struct Virtualise<S, RQ> {
    source: S,
    requests: RQ,
}

impl<S, RQ> Virtualise<S, RQ> {
    pub(crate) fn new(source: S, requests: RQ) -> Self {
        Self { source, requests }
    }
}

impl<S: Clone, RQ: Clone> Clone for Virtualise<S, RQ> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            requests: self.requests.clone(),
        }
    }
}

struct VirtualiseState<V, K> {
    latest: Option<KeyValueCollection<V, K>>,
    request: VirtualRequest,
    window: Vec<(K, V)>,
    last_response: Option<VirtualResponse>,
    downstream: BoxedObserver<VirtualChangeSet<V, K>>,
    done: bool,
}

impl<V: Data, K: Key> VirtualiseState<V, K> {
    fn refresh_window(&mut self, upstream: Option<&ChangeSet<V, K>>) {
        let Some(latest) = self.latest.clone() else {
            return;
        };
        let size = self.request.size.max(1);
        let (start, current) = slice_window(&latest, self.request.start, size);
        let delta = window_delta(&self.window, &current, upstream);
        let response = VirtualResponse {
            size,
            start,
            total: latest.len(),
        };
        if delta.is_empty() && self.last_response == Some(response) {
            return;
        }
        self.window = current;
        self.last_response = Some(response);
        let window = window_collection(&latest, &self.window);
        self.downstream.on_next(VirtualChangeSet {
            changes: delta,
            response,
            window,
        });
    }
}

impl<S, RQ, V, K> Observable for Virtualise<S, RQ>
where
    V: Data,
    K: Key,
    S: Observable<Item = SortedChangeSet<V, K>>,
    RQ: Observable<Item = VirtualRequest>,
{
    type Item = VirtualChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<VirtualChangeSet<V, K>>) -> Subscription {
        let state = Rc::new(RefCell::new(VirtualiseState {
            latest: None,
            request: VirtualRequest::default(),
            window: Vec::new(),
            last_response: None,
            downstream: observer,
            done: false,
        }));

        let request_state = Rc::clone(&state);
        let request_errors = Rc::clone(&state);
        let request_sub = self.requests.subscribe_all(
            move |request: VirtualRequest| {
                let state = &mut *request_state.borrow_mut();
                if state.done {
                    return;
                }
                state.request = request;
                state.refresh_window(None);
            },
            move |error| {
                let state = &mut *request_errors.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.downstream.on_error(error);
                }
            },
            || {},
        );

        let data_state = Rc::clone(&state);
        let data_errors = Rc::clone(&state);
        let data_completed = Rc::clone(&state);
        let data_sub = self.source.subscribe_all(
            move |sorted: SortedChangeSet<V, K>| {
                let state = &mut *data_state.borrow_mut();
                if state.done {
                    return;
                }
                state.latest = Some(sorted.collection);
                state.refresh_window(Some(&sorted.changes));
            },
            move |error| {
                let state = &mut *data_errors.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.downstream.on_error(error);
                }
            },
            move || {
                let state = &mut *data_completed.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.downstream.on_completed();
                }
            },
        );

        data_sub.also(request_sub)
    }
}

/// The stream produced by
/// [`SortedStreamExt::page`](super::SortedStreamExt::page).
pub struct Page<S, RQ> {
    source: S,
    requests: RQ,
}

impl<S, RQ> Page<S, RQ> {
    pub(crate) fn new(source: S, requests: RQ) -> Self {
        Self { source, requests }
    }
}

impl<S: Clone, RQ: Clone> Clone for Page<S, RQ> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            requests: self.requests.clone(),
        }
    }
}

struct PageState<V, K> {
    latest: Option<KeyValueCollection<V, K>>,
    request: PageRequest,
    window: Vec<(K, V)>,
    last_response: Option<PageResponse>,
    downstream: BoxedObserver<PagedChangeSet<V, K>>,
    done: bool,
}

impl<V: Data, K: Key> PageState<V, K> {
    fn refresh_page(&mut self, upstream: Option<&ChangeSet<V, K>>) {
        let Some(latest) = self.latest.clone() else {
            return;
        };
        let size = self.request.size.max(1);
        let total = latest.len();
        let pages = total.div_ceil(size).max(1);
        let page = self.request.page.clamp(1, pages);
        let (_, current) = slice_window(&latest, (page - 1) * size, size);
        let delta = window_delta(&self.window, &current, upstream);
        let response = PageResponse {
            page,
            size,
            pages,
            total,
        };
        if delta.is_empty() && self.last_response == Some(response) {
            return;
        }
        self.window = current;
        self.last_response = Some(response);
        let window = window_collection(&latest, &self.window);
        self.downstream.on_next(PagedChangeSet {
            changes: delta,
            response,
            window,
        });
    }
}

impl<S, RQ, V, K> Observable for Page<S, RQ>
where
    V: Data,
    K: Key,
    S: Observable<Item = SortedChangeSet<V, K>>,
    RQ: Observable<Item = PageRequest>,
{
    type Item = PagedChangeSet<V, K>;

    fn subscribe_observer(&self, observer: BoxedObserver<PagedChangeSet<V, K>>) -> Subscription {
        let state = Rc::new(RefCell::new(PageState {
            latest: None,
            request: PageRequest::default(),
            window: Vec::new(),
            last_response: None,
            downstream: observer,
            done: false,
        }));

        let request_state = Rc::clone(&state);
        let request_errors = Rc::clone(&state);
        let request_sub = self.requests.subscribe_all(
            move |request: PageRequest| {
                let state = &mut *request_state.borrow_mut();
                if state.done {
                    return;
                }
                state.request = request;
                state.refresh_page(None);
            },
            move |error| {
                let state = &mut *request_errors.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.downstream.on_error(error);
                }
            },
            || {},
        );

        let data_state = Rc::clone(&state);
        let data_errors = Rc::clone(&state);
        let data_completed = Rc::clone(&state);
        let data_sub = self.source.subscribe_all(
            move |sorted: SortedChangeSet<V, K>| {
                let state = &mut *data_state.borrow_mut();
                if state.done {
                    return;
                }
                state.latest = Some(sorted.collection);
                state.refresh_page(Some(&sorted.changes));
            },
            move |error| {
                let state = &mut *data_errors.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.downstream.on_error(error);
                }
            },
            move || {
                let state = &mut *data_completed.borrow_mut();
                if !state.done {
                    state.done = true;
                    state.downstream.on_completed();
                }
            },
        );

        data_sub.also(request_sub)
    }
}
