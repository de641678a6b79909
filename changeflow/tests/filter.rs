use changeflow::operators::FilterPredicate;
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
fn static_filter_keeps_even_values() {
    let source = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<i32, i32>>();
    let _sub = source
        .connect()
        .filter(|value: &i32| value % 2 == 0)
        .subscribe(push);

    source.update(|cache| {
        cache.add_or_update(1, 1);
        cache.add_or_update(2, 2);
        cache.add_or_update(3, 3);
    });
    source.update(|cache| {
        cache.add_or_update(1, 10);
        cache.add_or_update(2, 21);
    });

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);

    assert_eq!(seen[0].len(), 1);
    assert_eq!(seen[0][0].reason, ChangeReason::Add);
    assert_eq!(seen[0][0].key, 2);

    // Key 1 became even and entered; key 2 became odd and left.
    assert_eq!(seen[1].len(), 2);
    let added = seen[1].iter().find(|c| c.reason == ChangeReason::Add).unwrap();
    assert_eq!((added.key, added.current), (1, 10));
    let removed = seen[1]
        .iter()
        .find(|c| c.reason == ChangeReason::Remove)
        .unwrap();
    assert_eq!(removed.key, 2);
}

#[test]
fn refresh_is_forwarded_only_for_items_in_filter() {
    let source = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<i32, &str>>();
    let _sub = source
        .connect()
        .filter(|value: &i32| value % 2 == 0)
        .subscribe(push);

    source.update(|cache| {
        cache.add_or_update("in", 2);
        cache.add_or_update("out", 1);
    });
    source.update(|cache| cache.refresh(&"in"));
    source.update(|cache| cache.refresh(&"out"));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].len(), 1);
    assert_eq!(seen[1][0].reason, ChangeReason::Refresh);
    assert_eq!(seen[1][0].key, "in");
}

#[test]
fn filter_replays_existing_state_to_late_subscribers() {
    let source = ObservableCache::new();
    source.update(|cache| {
        cache.add_or_update(1, 1);
        cache.add_or_update(2, 2);
    });

    let (seen, push) = sink::<ChangeSet<i32, i32>>();
    let _sub = source
        .connect()
        .filter(|value: &i32| value % 2 == 0)
        .subscribe(push);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].len(), 1);
    assert_eq!(seen[0][0].key, 2);
}

#[test]
fn dynamic_filter_reevaluates_on_each_predicate() {
    let source = ObservableCache::new();
    let predicates: Subject<FilterPredicate<i32>> = Subject::new();
    let (seen, push) = sink::<ChangeSet<i32, i32>>();
    let _sub = source
        .connect()
        .filter_dynamic(predicates.clone())
        .subscribe(push);

    source.update(|cache| {
        cache.add_or_update(1, 1);
        cache.add_or_update(2, 2);
        cache.add_or_update(3, 3);
    });
    // No predicate yet: nothing passes, nothing is emitted.
    assert!(seen.borrow().is_empty());

    predicates.on_next(Rc::new(|value: &i32| *value > 0));
    predicates.on_next(Rc::new(|value: &i32| *value >= 2));
    predicates.on_next(Rc::new(|value: &i32| *value > 10));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].count_of(ChangeReason::Add), 3);
    assert_eq!(seen[1].count_of(ChangeReason::Remove), 1);
    assert_eq!(seen[1][0].key, 1);
    assert_eq!(seen[2].count_of(ChangeReason::Remove), 2);
}

#[test]
fn dynamic_filter_applies_current_predicate_to_new_data() {
    let source = ObservableCache::new();
    let predicates: Subject<FilterPredicate<i32>> = Subject::new();
    let (seen, push) = sink::<ChangeSet<i32, i32>>();
    let _sub = source
        .connect()
        .filter_dynamic(predicates.clone())
        .subscribe(push);

    predicates.on_next(Rc::new(|value: &i32| *value >= 10));
    source.update(|cache| {
        cache.add_or_update(1, 5);
        cache.add_or_update(2, 15);
    });

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].len(), 1);
    assert_eq!(seen[0][0].key, 2);
}

#[test]
fn filter_immutable_rewrites_updates_through_the_truth_table() {
    let source: Subject<ChangeSet<i32, &str>> = Subject::new();
    let (seen, push) = sink::<ChangeSet<i32, &str>>();
    let _sub = source.filter_immutable(|value: &i32| value % 2 == 0).subscribe(push);

    source.on_next(ChangeSet::from(vec![
        changeflow::Change::add("a", 2),
        changeflow::Change::add("b", 1),
    ]));
    // in -> out becomes a remove, out -> in becomes an add.
    source.on_next(ChangeSet::from(vec![
        changeflow::Change::update("a", 3, 2),
        changeflow::Change::update("b", 4, 1),
    ]));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].len(), 1);
    assert_eq!(seen[0][0].key, "a");

    assert_eq!(seen[1].len(), 2);
    assert_eq!(seen[1][0].reason, ChangeReason::Remove);
    assert_eq!(seen[1][0].key, "a");
    assert_eq!(seen[1][1].reason, ChangeReason::Add);
    assert_eq!((seen[1][1].key, seen[1][1].current), ("b", 4));
}

#[test]
fn filter_on_observable_follows_membership_streams() {
    let source = ObservableCache::new();
    let first = Subject::new();
    let second = Subject::new();
    let (seen, push) = sink::<ChangeSet<i32, i32>>();
    let membership = {
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
    let _sub = source
        .connect()
        .filter_on_observable(membership)
        .subscribe(push);

    source.update(|cache| {
        cache.add_or_update(1, 10);
        cache.add_or_update(2, 20);
    });
    // No verdicts yet: nothing is in filter.
    assert!(seen.borrow().is_empty());

    first.on_next(true);
    second.on_next(true);
    first.on_next(false);
    // Repeated verdicts are not transitions.
    second.on_next(true);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 3);
    assert_eq!((seen[0][0].reason, seen[0][0].key), (ChangeReason::Add, 1));
    assert_eq!((seen[1][0].reason, seen[1][0].key), (ChangeReason::Add, 2));
    assert_eq!((seen[2][0].reason, seen[2][0].key), (ChangeReason::Remove, 1));
}

#[test]
fn disposal_stops_the_filtered_stream() {
    let source = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<i32, i32>>();
    let sub = source.connect().filter(|_: &i32| true).subscribe(push);

    source.update(|cache| cache.add_or_update(1, 1));
    sub.dispose();
    source.update(|cache| cache.add_or_update(2, 2));

    assert_eq!(seen.borrow().len(), 1);
}
