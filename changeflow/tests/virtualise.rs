use changeflow::operators::{PageRequest, SortOptimisations, VirtualRequest};
use changeflow::{
    ChangeReason, ChangeStreamExt, ObservableCache, ObservableExt, SortedStreamExt, Subject,
};
use std::{cell::RefCell, rc::Rc};

fn sink<T: 'static>() -> (Rc<RefCell<Vec<T>>>, impl FnMut(T) + 'static) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let push = {
        let seen = Rc::clone(&seen);
        move |item| seen.borrow_mut().push(item)
    };
    (seen, push)
}

fn ten_items() -> ObservableCache<i32, i32> {
    let source = ObservableCache::new();
    source.update(|cache| {
        for i in 0..10 {
            cache.add_or_update(i, i * 10);
        }
    });
    source
}

#[test]
fn virtualise_slices_the_requested_window() {
    let source = ten_items();
    let requests = Subject::new();
    let (seen, push) = sink();
    let _sub = source
        .connect()
        .sort(|a: &i32, b: &i32| a.cmp(b), SortOptimisations::default())
        .virtualise(requests.clone())
        .subscribe(push);

    requests.on_next(VirtualRequest { start: 2, size: 3 });

    let seen = seen.borrow();
    // One emission for the initial default window, one for the new request.
    let windowed = seen.last().unwrap();
    let keys: Vec<i32> = windowed.window.entries().iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![2, 3, 4]);
    assert_eq!(windowed.response.start, 2);
    assert_eq!(windowed.response.size, 3);
    assert_eq!(windowed.response.total, 10);
}

#[test]
fn identical_request_yields_no_emission() {
    let source = ten_items();
    let requests = Subject::new();
    let (seen, push) = sink();
    let _sub = source
        .connect()
        .sort(|a: &i32, b: &i32| a.cmp(b), SortOptimisations::default())
        .virtualise(requests.clone())
        .subscribe(push);

    requests.on_next(VirtualRequest { start: 2, size: 3 });
    let emitted = seen.borrow().len();
    requests.on_next(VirtualRequest { start: 2, size: 3 });
    assert_eq!(seen.borrow().len(), emitted);
}

#[test]
fn inserting_ahead_of_the_window_shifts_it() {
    let source = ten_items();
    let requests = Subject::new();
    let (seen, push) = sink();
    let _sub = source
        .connect()
        .sort(|a: &i32, b: &i32| a.cmp(b), SortOptimisations::default())
        .virtualise(requests.clone())
        .subscribe(push);

    requests.on_next(VirtualRequest { start: 2, size: 3 });
    let before = seen.borrow().len();

    // A value sorting ahead of everything pushes one key in and one key out.
    source.update(|cache| cache.add_or_update(99, -5));

    let seen = seen.borrow();
    assert_eq!(seen.len(), before + 1);
    let delta = &seen[seen.len() - 1].changes;
    assert_eq!(delta.count_of(ChangeReason::Add), 1);
    assert_eq!(delta.count_of(ChangeReason::Remove), 1);
    let added = delta.iter().find(|c| c.reason == ChangeReason::Add).unwrap();
    assert_eq!(added.key, 1);
    let removed = delta
        .iter()
        .find(|c| c.reason == ChangeReason::Remove)
        .unwrap();
    assert_eq!(removed.key, 4);
}

#[test]
fn updates_inside_the_window_are_forwarded() {
    let source = ten_items();
    let requests = Subject::new();
    let (seen, push) = sink();
    let _sub = source
        .connect()
        .sort(|a: &i32, b: &i32| a.cmp(b), SortOptimisations::default())
        .virtualise(requests.clone())
        .subscribe(push);

    requests.on_next(VirtualRequest { start: 2, size: 3 });
    // Nudge a windowed value without changing its position.
    source.update(|cache| cache.add_or_update(3, 31));

    let seen = seen.borrow();
    let delta = &seen.last().unwrap().changes;
    assert_eq!(delta.len(), 1);
    assert_eq!(delta[0].reason, ChangeReason::Update);
    assert_eq!((delta[0].key, delta[0].current), (3, 31));
}

#[test]
fn page_clamps_to_the_available_pages() {
    let source = ten_items();
    let requests = Subject::new();
    let (seen, push) = sink();
    let _sub = source
        .connect()
        .sort(|a: &i32, b: &i32| a.cmp(b), SortOptimisations::default())
        .page(requests.clone())
        .subscribe(push);

    requests.on_next(PageRequest { page: 99, size: 4 });

    let seen = seen.borrow();
    let paged = seen.last().unwrap();
    assert_eq!(paged.response.pages, 3);
    assert_eq!(paged.response.page, 3);
    let keys: Vec<i32> = paged.window.entries().iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![8, 9]);
}

#[test]
fn paging_emits_the_delta_between_pages() {
    let source = ten_items();
    let requests = Subject::new();
    let (seen, push) = sink();
    let _sub = source
        .connect()
        .sort(|a: &i32, b: &i32| a.cmp(b), SortOptimisations::default())
        .page(requests.clone())
        .subscribe(push);

    requests.on_next(PageRequest { page: 1, size: 5 });
    requests.on_next(PageRequest { page: 2, size: 5 });

    let seen = seen.borrow();
    let paged = seen.last().unwrap();
    assert_eq!(paged.changes.count_of(ChangeReason::Remove), 5);
    assert_eq!(paged.changes.count_of(ChangeReason::Add), 5);
    let keys: Vec<i32> = paged.window.entries().iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![5, 6, 7, 8, 9]);
}
