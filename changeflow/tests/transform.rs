use changeflow::errors::{shared, SelectorError};
use changeflow::operators::TransformOptions;
use changeflow::stream::{BoxedObserver, Observable, Observer, Subscription};
use changeflow::{
    Change, ChangeReason, ChangeSet, ChangeStreamExt, ItemError, ObservableCache, ObservableExt,
    Subject,
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

// A one-shot source that replays its value to subscribers arriving after it
// resolved, which is how deferred transform results behave.
struct Latch<T> {
    state: Rc<RefCell<LatchState<T>>>,
}

struct LatchState<T> {
    value: Option<T>,
    waiting: Vec<BoxedObserver<T>>,
}

impl<T> Latch<T> {
    fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(LatchState {
                value: None,
                waiting: Vec::new(),
            })),
        }
    }
}

impl<T> Clone for Latch<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: Clone + 'static> Latch<T> {
    fn resolve(&self, value: T) {
        let waiting = {
            let mut state = self.state.borrow_mut();
            state.value = Some(value.clone());
            std::mem::take(&mut state.waiting)
        };
        for mut observer in waiting {
            observer.on_next(value.clone());
            observer.on_completed();
        }
    }
}

impl<T: Clone + 'static> Observable for Latch<T> {
    type Item = T;

    fn subscribe_observer(&self, mut observer: BoxedObserver<T>) -> Subscription {
        let resolved = self.state.borrow().value.clone();
        match resolved {
            Some(value) => {
                observer.on_next(value);
                observer.on_completed();
            }
            None => self.state.borrow_mut().waiting.push(observer),
        }
        Subscription::empty()
    }
}

#[test]
fn transform_squares_values() {
    let source = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<i32, i32>>();
    let _sub = source
        .connect()
        .transform(|value: &i32, _key| value * value)
        .subscribe(push);

    source.update(|cache| cache.add_or_update(1, 2));
    source.update(|cache| cache.add_or_update(1, 3));
    source.update(|cache| cache.remove(&1));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 3);
    assert_eq!((seen[0][0].reason, seen[0][0].current), (ChangeReason::Add, 4));
    assert_eq!(
        (seen[1][0].reason, seen[1][0].current, seen[1][0].previous),
        (ChangeReason::Update, 9, Some(4))
    );
    assert_eq!(
        (seen[2][0].reason, seen[2][0].current),
        (ChangeReason::Remove, 9)
    );
}

#[test]
fn transform_forwards_refresh_unless_told_otherwise() {
    let source = ObservableCache::new();
    let (plain, push_plain) = sink::<ChangeSet<i32, i32>>();
    let _a = source
        .connect()
        .transform(|value: &i32, _key| value * 2)
        .subscribe(push_plain);
    let (rerun, push_rerun) = sink::<ChangeSet<i32, i32>>();
    let _b = source
        .connect()
        .transform_on_refresh(|value: &i32, _key| value * 2)
        .subscribe(push_rerun);

    source.update(|cache| cache.add_or_update(1, 5));
    source.update(|cache| cache.refresh(&1));

    assert_eq!(plain.borrow()[1][0].reason, ChangeReason::Refresh);
    assert_eq!(rerun.borrow()[1][0].reason, ChangeReason::Update);
}

#[test]
fn try_transform_routes_failures_to_the_callback() {
    let source = ObservableCache::new();
    let failures: Rc<RefCell<Vec<ItemError<i32, i32>>>> = Rc::new(RefCell::new(Vec::new()));
    let callback = {
        let failures = Rc::clone(&failures);
        move |error: ItemError<i32, i32>| failures.borrow_mut().push(error)
    };
    let (seen, push) = sink::<ChangeSet<i32, i32>>();
    let _sub = source
        .connect()
        .try_transform(
            |value: &i32, _existing: Option<&i32>, _key: &i32| {
                if *value < 0 {
                    Err(shared(SelectorError::new("negative value")))
                } else {
                    Ok(value * 10)
                }
            },
            TransformOptions {
                transform_on_refresh: false,
                error_callback: Some(Rc::new(callback)),
            },
        )
        .subscribe(push);

    source.update(|cache| {
        cache.add_or_update(1, 7);
        cache.add_or_update(2, -1);
    });

    // The failing item is skipped, the rest of the batch survives.
    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].len(), 1);
    assert_eq!(seen[0][0].current, 70);

    let failures = failures.borrow();
    assert_eq!(failures.len(), 1);
    assert_eq!((failures[0].value, failures[0].key), (-1, 2));
}

#[test]
fn try_transform_without_callback_fails_the_subscription() {
    let source = ObservableCache::new();
    let errors = Rc::new(RefCell::new(Vec::new()));
    let error_sink = Rc::clone(&errors);
    let (seen, push) = sink::<ChangeSet<i32, i32>>();
    let _sub = source
        .connect()
        .try_transform(
            |_value: &i32, _existing: Option<&i32>, _key: &i32| {
                Err(shared(SelectorError::new("always fails")))
            },
            TransformOptions::default(),
        )
        .subscribe_all(push, move |error| error_sink.borrow_mut().push(error), || {});

    source.update(|cache| cache.add_or_update(1, 1));
    source.update(|cache| cache.add_or_update(2, 2));

    assert!(seen.borrow().is_empty());
    // Only the first failure is delivered; the subscription is dead after it.
    assert_eq!(errors.borrow().len(), 1);
}

#[test]
fn transform_in_place_mutates_and_emits_refresh() {
    let source = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<Rc<RefCell<String>>, i32>>();
    let _sub = source
        .connect()
        .transform_in_place(
            |value: &i32, _key| Rc::new(RefCell::new(format!("v{value}"))),
            |destination, value| *destination.borrow_mut() = format!("v{value}"),
            false,
        )
        .subscribe(push);

    source.update(|cache| cache.add_or_update(1, 10));
    source.update(|cache| cache.add_or_update(1, 11));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0][0].reason, ChangeReason::Add);
    assert_eq!(seen[1][0].reason, ChangeReason::Refresh);
    assert_eq!(*seen[1][0].current.borrow(), "v11");
}

#[test]
fn transform_in_place_fails_on_update_for_unknown_key() {
    let source: Subject<ChangeSet<i32, i32>> = Subject::new();
    let errors = Rc::new(RefCell::new(Vec::new()));
    let error_sink = Rc::clone(&errors);
    let _sub = source
        .transform_in_place(
            |value: &i32, _key| *value,
            |destination, value| *destination = *value,
            false,
        )
        .subscribe_all(
            |_: ChangeSet<i32, i32>| {},
            move |error| error_sink.borrow_mut().push(error),
            || {},
        );

    source.on_next(ChangeSet::from(vec![Change::update(7, 2, 1)]));

    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].to_string().contains("no entry for key"));
}

#[test]
fn transform_deferred_applies_batches_in_arrival_order() {
    let source = ObservableCache::new();
    let first = Latch::new();
    let second = Latch::new();
    let (seen, push) = sink::<ChangeSet<i32, i32>>();
    let factory = {
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
    let _sub = source.connect().transform_deferred(factory).subscribe(push);

    source.update(|cache| cache.add_or_update(1, 0));
    source.update(|cache| cache.add_or_update(2, 0));

    // The second result is ready first, but the first batch gates it.
    second.resolve(20);
    assert!(seen.borrow().is_empty());
    first.resolve(10);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!((seen[0][0].key, seen[0][0].current), (1, 10));
    assert_eq!((seen[1][0].key, seen[1][0].current), (2, 20));
}

#[test]
fn transform_on_observable_follows_destination_streams() {
    let source = ObservableCache::new();
    let destinations = Subject::new();
    let (seen, push) = sink::<ChangeSet<i32, i32>>();
    let selector = {
        let destinations = destinations.clone();
        move |_value: &i32, _key: &i32| destinations.clone()
    };
    let _sub = source
        .connect()
        .transform_on_observable(selector)
        .subscribe(push);

    source.update(|cache| cache.add_or_update(1, 0));
    destinations.on_next(5);
    // Repeats of the same destination are suppressed.
    destinations.on_next(5);
    destinations.on_next(6);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!((seen[0][0].reason, seen[0][0].current), (ChangeReason::Add, 5));
    assert_eq!(
        (seen[1][0].reason, seen[1][0].current),
        (ChangeReason::Update, 6)
    );
}
