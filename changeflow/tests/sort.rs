use changeflow::operators::{SortAndBindOptions, SortOptimisations, SortedChangeSet};
use changeflow::{ChangeReason, ChangeStreamExt, ObservableCache, ObservableExt};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn sink<T: 'static>() -> (Rc<RefCell<Vec<T>>>, impl FnMut(T) + 'static) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let push = {
        let seen = Rc::clone(&seen);
        move |item| seen.borrow_mut().push(item)
    };
    (seen, push)
}

fn keys_of(sorted: &SortedChangeSet<i32, &'static str>) -> Vec<&'static str> {
    sorted.collection.entries().iter().map(|(k, _)| *k).collect()
}

#[test]
fn additions_are_annotated_with_their_positions() {
    let source = ObservableCache::new();
    let (seen, push) = sink::<SortedChangeSet<i32, &str>>();
    let _sub = source
        .connect()
        .sort(|a: &i32, b: &i32| a.cmp(b), SortOptimisations::default())
        .subscribe(push);

    source.update(|cache| cache.add_or_update("b", 20));
    source.update(|cache| cache.add_or_update("a", 10));
    source.update(|cache| cache.add_or_update("c", 30));

    let seen = seen.borrow();
    assert_eq!(keys_of(&seen[2]), vec!["a", "b", "c"]);
    assert_eq!(seen[1].changes[0].current_index, Some(0));
    assert_eq!(seen[2].changes[0].current_index, Some(2));
}

#[test]
fn updates_report_both_positions() {
    let source = ObservableCache::new();
    let (seen, push) = sink::<SortedChangeSet<i32, &str>>();
    let _sub = source
        .connect()
        .sort(|a: &i32, b: &i32| a.cmp(b), SortOptimisations::default())
        .subscribe(push);

    source.update(|cache| {
        cache.add_or_update("a", 10);
        cache.add_or_update("b", 20);
        cache.add_or_update("c", 30);
    });
    // "a" jumps to the back.
    source.update(|cache| cache.add_or_update("a", 40));

    let seen = seen.borrow();
    let update = &seen[1].changes[0];
    assert_eq!(update.reason, ChangeReason::Update);
    assert_eq!(update.previous_index, Some(0));
    assert_eq!(update.current_index, Some(2));
    assert_eq!(keys_of(&seen[1]), vec!["b", "c", "a"]);
}

#[test]
fn refresh_produces_a_synthetic_move() {
    // Values with interior mutability: a refresh is how the engine learns a
    // sort key changed behind its back.
    let source: ObservableCache<Rc<Cell<i32>>, &str> = ObservableCache::new();
    let (seen, push) = sink::<SortedChangeSet<Rc<Cell<i32>>, &str>>();
    let _sub = source
        .connect()
        .sort(
            |a: &Rc<Cell<i32>>, b: &Rc<Cell<i32>>| a.get().cmp(&b.get()),
            SortOptimisations::default(),
        )
        .subscribe(push);

    let first = Rc::new(Cell::new(10));
    let second = Rc::new(Cell::new(20));
    source.update(|cache| {
        cache.add_or_update("a", Rc::clone(&first));
        cache.add_or_update("b", Rc::clone(&second));
    });

    first.set(30);
    source.update(|cache| cache.refresh(&"a"));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    let reasons: Vec<ChangeReason> = seen[1].changes.iter().map(|c| c.reason).collect();
    assert_eq!(reasons, vec![ChangeReason::Refresh, ChangeReason::Moved]);
    let moved = &seen[1].changes[1];
    assert_eq!(moved.previous_index, Some(0));
    assert_eq!(moved.current_index, Some(1));
}

#[test]
fn ignore_evaluates_resorts_wholesale() {
    let source: ObservableCache<Rc<Cell<i32>>, &str> = ObservableCache::new();
    let (seen, push) = sink::<SortedChangeSet<Rc<Cell<i32>>, &str>>();
    let optimisations = SortOptimisations {
        ignore_evaluates: true,
        ..SortOptimisations::default()
    };
    let _sub = source
        .connect()
        .sort(
            |a: &Rc<Cell<i32>>, b: &Rc<Cell<i32>>| a.get().cmp(&b.get()),
            optimisations,
        )
        .subscribe(push);

    let first = Rc::new(Cell::new(10));
    source.update(|cache| {
        cache.add_or_update("a", Rc::clone(&first));
        cache.add_or_update("b", Rc::new(Cell::new(20)));
    });
    first.set(30);
    source.update(|cache| cache.refresh(&"a"));

    let seen = seen.borrow();
    let order: Vec<&str> = seen[1]
        .collection
        .entries()
        .iter()
        .map(|(k, _)| *k)
        .collect();
    assert_eq!(order, vec!["b", "a"]);
    // No per-item move is computed on this path.
    assert_eq!(seen[1].changes.count_of(ChangeReason::Moved), 0);
}

#[test]
fn bind_sorted_maintains_the_target_list() {
    let source = ObservableCache::new();
    let target = Rc::new(RefCell::new(Vec::new()));
    let (_seen, push) = sink::<changeflow::ChangeSet<i32, &str>>();
    let _sub = source
        .connect()
        .bind_sorted(
            |a: &i32, b: &i32| a.cmp(b),
            SortAndBindOptions::default(),
            Rc::clone(&target),
        )
        .subscribe(push);

    source.update(|cache| cache.add_or_update("b", 20));
    source.update(|cache| cache.add_or_update("a", 10));
    source.update(|cache| cache.add_or_update("a", 30));
    source.update(|cache| cache.remove(&"b"));

    let target = target.borrow();
    assert_eq!(*target, vec![("a", 30)]);
}

#[test]
fn bind_sorted_resets_above_the_threshold() {
    let source = ObservableCache::new();
    let target = Rc::new(RefCell::new(Vec::new()));
    let options = SortAndBindOptions {
        reset_threshold: 2,
        ..SortAndBindOptions::default()
    };
    let (_seen, push) = sink::<changeflow::ChangeSet<i32, &str>>();
    let _sub = source
        .connect()
        .bind_sorted(|a: &i32, b: &i32| a.cmp(b), options, Rc::clone(&target))
        .subscribe(push);

    source.update(|cache| {
        cache.add_or_update("c", 30);
        cache.add_or_update("a", 10);
        cache.add_or_update("b", 20);
    });

    let target = target.borrow();
    assert_eq!(*target, vec![("a", 10), ("b", 20), ("c", 30)]);
}

#[test]
fn bind_sorted_replaces_in_place_when_position_is_stable() {
    let source = ObservableCache::new();
    let target = Rc::new(RefCell::new(Vec::new()));
    let options = SortAndBindOptions {
        use_replace_for_updates: true,
        ..SortAndBindOptions::default()
    };
    let (_seen, push) = sink::<changeflow::ChangeSet<i32, &str>>();
    let _sub = source
        .connect()
        .bind_sorted(|a: &i32, b: &i32| a.cmp(b), options, Rc::clone(&target))
        .subscribe(push);

    source.update(|cache| {
        cache.add_or_update("a", 10);
        cache.add_or_update("b", 20);
    });
    // 15 still sits between nothing and 20: same slot.
    source.update(|cache| cache.add_or_update("a", 15));

    let target = target.borrow();
    assert_eq!(*target, vec![("a", 15), ("b", 20)]);
}
