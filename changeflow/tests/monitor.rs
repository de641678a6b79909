use changeflow::errors::{shared, SelectorError};
use changeflow::operators::ConnectionStatus;
use changeflow::{ChangeSet, ChangeStreamExt, ObservableCache, ObservableExt, Subject};
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
fn monitor_reports_pending_then_loaded_once() {
    let source = ObservableCache::new();
    let (seen, push) = sink::<ConnectionStatus>();
    let _sub = source.connect().monitor_status().subscribe(push);

    assert_eq!(*seen.borrow(), vec![ConnectionStatus::Pending]);
    source.update(|cache| cache.add_or_update(1, 1));
    source.update(|cache| cache.add_or_update(2, 2));

    assert_eq!(
        *seen.borrow(),
        vec![ConnectionStatus::Pending, ConnectionStatus::Loaded]
    );
}

#[test]
fn monitor_reports_terminal_states() {
    let completing = ObservableCache::<i32, i32>::new();
    let (statuses, push) = sink::<ConnectionStatus>();
    let _sub = completing.connect().monitor_status().subscribe(push);
    completing.complete();
    assert_eq!(
        *statuses.borrow(),
        vec![ConnectionStatus::Pending, ConnectionStatus::Completed]
    );

    let failing: Subject<ChangeSet<i32, i32>> = Subject::new();
    let (statuses, push) = sink::<ConnectionStatus>();
    let errors = Rc::new(RefCell::new(Vec::new()));
    let error_sink = Rc::clone(&errors);
    let _sub = failing.monitor_status().subscribe_all(
        push,
        move |error| error_sink.borrow_mut().push(error),
        || {},
    );
    failing.on_error(shared(SelectorError::new("boom")));
    assert_eq!(
        *statuses.borrow(),
        vec![ConnectionStatus::Pending, ConnectionStatus::Errored]
    );
    assert_eq!(errors.borrow().len(), 1);
}

#[test]
fn ref_count_shares_one_cache_between_subscribers() {
    let source = ObservableCache::new();
    let counted = source.connect().filter(|_: &i32| true).ref_count();

    source.update(|cache| cache.add_or_update("k", 1));

    let (first_seen, push) = sink::<ChangeSet<i32, &str>>();
    let first = counted.subscribe(push);
    let (second_seen, push) = sink::<ChangeSet<i32, &str>>();
    let second = counted.subscribe(push);

    // Both subscribers see the accumulated state as an initial batch.
    assert_eq!(first_seen.borrow().len(), 1);
    assert_eq!(second_seen.borrow().len(), 1);
    assert_eq!(second_seen.borrow()[0][0].current, 1);

    source.update(|cache| cache.add_or_update("k", 2));
    assert_eq!(first_seen.borrow().len(), 2);
    assert_eq!(second_seen.borrow().len(), 2);

    first.dispose();
    second.dispose();
    // The shared cache is gone; a new subscriber rebuilds from upstream.
    let (third_seen, push) = sink::<ChangeSet<i32, &str>>();
    let _third = counted.subscribe(push);
    assert_eq!(third_seen.borrow().len(), 1);
    assert_eq!(third_seen.borrow()[0][0].current, 2);
}

#[test]
fn on_item_removed_runs_for_removals() {
    let source = ObservableCache::new();
    let removed = Rc::new(RefCell::new(Vec::new()));
    let removal_sink = Rc::clone(&removed);
    let (_seen, push) = sink::<ChangeSet<i32, &str>>();
    let _sub = source
        .connect()
        .on_item_removed(
            move |value: &i32, key: &&str| removal_sink.borrow_mut().push((*key, *value)),
            false,
        )
        .subscribe(push);

    source.update(|cache| cache.add_or_update("a", 1));
    source.update(|cache| cache.remove(&"a"));

    assert_eq!(*removed.borrow(), vec![("a", 1)]);
}

#[test]
fn on_item_removed_sweeps_survivors_on_unsubscribe() {
    let source = ObservableCache::new();
    let removed = Rc::new(RefCell::new(Vec::new()));
    let removal_sink = Rc::clone(&removed);
    let (_seen, push) = sink::<ChangeSet<i32, &str>>();
    let sub = source
        .connect()
        .on_item_removed(
            move |value: &i32, key: &&str| removal_sink.borrow_mut().push((*key, *value)),
            true,
        )
        .subscribe(push);

    source.update(|cache| {
        cache.add_or_update("a", 1);
        cache.add_or_update("b", 2);
    });
    sub.dispose();

    let mut swept = removed.borrow().clone();
    swept.sort_unstable();
    assert_eq!(swept, vec![("a", 1), ("b", 2)]);
}
