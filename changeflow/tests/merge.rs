use changeflow::operators::{merge_change_sets, merge_change_sets_by};
use changeflow::{
    ChangeReason, ChangeSet, ChangeStreamExt, ObservableCache, ObservableExt, Subject,
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

#[test]
fn merge_with_comparer_publishes_the_smallest_value() {
    let first = ObservableCache::new();
    let second = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<i32, &str>>();
    let merged = merge_change_sets_by(
        vec![first.connect(), second.connect()],
        |a: &i32, b: &i32| a.cmp(b),
    );
    let _sub = merged.subscribe(push);

    first.update(|cache| cache.add_or_update("k", 5));
    second.update(|cache| cache.add_or_update("k", 3));
    second.update(|cache| cache.remove(&"k"));
    first.update(|cache| cache.remove(&"k"));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 4);
    assert_eq!((seen[0][0].reason, seen[0][0].current), (ChangeReason::Add, 5));
    assert_eq!(
        (seen[1][0].reason, seen[1][0].current, seen[1][0].previous),
        (ChangeReason::Update, 3, Some(5))
    );
    assert_eq!(
        (seen[2][0].reason, seen[2][0].current, seen[2][0].previous),
        (ChangeReason::Update, 5, Some(3))
    );
    assert_eq!(
        (seen[3][0].reason, seen[3][0].current),
        (ChangeReason::Remove, 5)
    );
}

#[test]
fn merge_without_comparer_is_first_seen_wins() {
    let first = ObservableCache::new();
    let second = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<i32, &str>>();
    let merged = merge_change_sets(vec![first.connect(), second.connect()]);
    let _sub = merged.subscribe(push);

    first.update(|cache| cache.add_or_update("k", 1));
    // A later source holding the key does not displace the published value.
    second.update(|cache| cache.add_or_update("k", 2));
    // Withdrawal of the published copy falls back to the survivor.
    first.update(|cache| cache.remove(&"k"));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!((seen[0][0].reason, seen[0][0].current), (ChangeReason::Add, 1));
    assert_eq!(
        (seen[1][0].reason, seen[1][0].current, seen[1][0].previous),
        (ChangeReason::Update, 2, Some(1))
    );
}

#[test]
fn merge_replays_source_state_present_before_subscription() {
    let first = ObservableCache::new();
    first.update(|cache| cache.add_or_update("k", 9));

    let (seen, push) = sink::<ChangeSet<i32, &str>>();
    let merged = merge_change_sets(vec![first.connect()]);
    let _sub = merged.subscribe(push);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!((seen[0][0].reason, seen[0][0].current), (ChangeReason::Add, 9));
}

#[test]
fn merge_many_flattens_per_item_streams() {
    let source = ObservableCache::new();
    let first = Subject::new();
    let second = Subject::new();
    let (seen, push) = sink::<i32>();
    let selector = {
        let first = first.clone();
        let second = second.clone();
        move |_value: &i32, key: &i32| {
            if *key == 1 {
                first.clone()
            } else {
                second.clone()
            }
        }
    };
    let _sub = source.connect().merge_many(selector).subscribe(push);

    source.update(|cache| {
        cache.add_or_update(1, 0);
        cache.add_or_update(2, 0);
    });
    first.on_next(10);
    second.on_next(20);
    first.on_next(11);

    assert_eq!(*seen.borrow(), vec![10, 20, 11]);
}

#[test]
fn merge_many_stops_listening_to_removed_items() {
    let source = ObservableCache::new();
    let pulses = Subject::new();
    let (seen, push) = sink::<i32>();
    let selector = {
        let pulses = pulses.clone();
        move |_value: &i32, _key: &i32| pulses.clone()
    };
    let _sub = source.connect().merge_many(selector).subscribe(push);

    source.update(|cache| cache.add_or_update(1, 0));
    pulses.on_next(1);
    source.update(|cache| cache.remove(&1));
    pulses.on_next(2);

    assert_eq!(*seen.borrow(), vec![1]);
}

#[test]
fn merge_many_change_sets_withdraws_departing_inner_caches() {
    let outer: ObservableCache<ObservableCache<i32, &str>, &str> = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<i32, &str>>();
    let _sub = outer
        .connect()
        .merge_many_change_sets(|inner: &ObservableCache<i32, &str>, _key| inner.connect())
        .subscribe(push);

    let first = ObservableCache::new();
    first.update(|cache| cache.add_or_update("x", 1));
    let second = ObservableCache::new();
    second.update(|cache| cache.add_or_update("x", 2));

    outer.update(|cache| cache.add_or_update("a", first.clone()));
    outer.update(|cache| cache.add_or_update("b", second.clone()));
    // First-seen wins, so the second cache's copy stays unpublished.
    outer.update(|cache| cache.remove(&"a"));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!((seen[0][0].reason, seen[0][0].current), (ChangeReason::Add, 1));
    assert_eq!(
        (seen[1][0].reason, seen[1][0].current, seen[1][0].previous),
        (ChangeReason::Update, 2, Some(1))
    );
}

#[test]
fn merged_stream_completes_with_its_sources() {
    let first = ObservableCache::new();
    first.update(|cache| cache.add_or_update("k", 1));

    let completed = Rc::new(RefCell::new(false));
    let completion = Rc::clone(&completed);
    let merged = merge_change_sets(vec![first.connect()]);
    let _sub = merged.subscribe_all(
        |_: ChangeSet<i32, &str>| {},
        |_| {},
        move || *completion.borrow_mut() = true,
    );

    assert!(!*completed.borrow());
    first.complete();
    assert!(*completed.borrow());
}
