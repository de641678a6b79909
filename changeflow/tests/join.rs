use changeflow::{ChangeReason, ChangeSet, ChangeStreamExt, ObservableCache, ObservableExt};
use std::{cell::RefCell, rc::Rc};

// The right side carries its foreign key in the first tuple slot.
type Right = (char, &'static str);

fn sink<T: 'static>() -> (Rc<RefCell<Vec<T>>>, impl FnMut(T) + 'static) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let push = {
        let seen = Rc::clone(&seen);
        move |item| seen.borrow_mut().push(item)
    };
    (seen, push)
}

#[test]
fn right_join_yields_a_row_per_right_item() {
    let left: ObservableCache<&'static str, char> = ObservableCache::new();
    let right: ObservableCache<Right, i32> = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<(Option<&'static str>, &'static str), i32>>();
    let _sub = left
        .connect()
        .right_join(
            right.connect(),
            |r: &Right| r.0,
            |_rk: &i32, l: Option<&&'static str>, r: &Right| (l.copied(), r.1),
        )
        .subscribe(push);

    left.update(|cache| {
        cache.add_or_update('A', "l1");
        cache.add_or_update('B', "l2");
    });
    right.update(|cache| {
        cache.add_or_update(1, ('A', "r1"));
        cache.add_or_update(2, ('C', "r2"));
    });

    {
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 2);
        let row1 = seen[0].iter().find(|c| c.key == 1).unwrap();
        assert_eq!(row1.current, (Some("l1"), "r1"));
        let row2 = seen[0].iter().find(|c| c.key == 2).unwrap();
        assert_eq!(row2.current, (None, "r2"));
    }

    // Removing a referenced left item downgrades the row, not the key.
    left.update(|cache| cache.remove(&'A'));
    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].len(), 1);
    assert_eq!(seen[1][0].reason, ChangeReason::Update);
    assert_eq!(seen[1][0].key, 1);
    assert_eq!(seen[1][0].current, (None, "r1"));
    assert_eq!(seen[1][0].previous, Some((Some("l1"), "r1")));
}

#[test]
fn right_join_tracks_foreign_key_changes() {
    let left: ObservableCache<&'static str, char> = ObservableCache::new();
    let right: ObservableCache<Right, i32> = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<(Option<&'static str>, &'static str), i32>>();
    let _sub = left
        .connect()
        .right_join(
            right.connect(),
            |r: &Right| r.0,
            |_rk: &i32, l: Option<&&'static str>, r: &Right| (l.copied(), r.1),
        )
        .subscribe(push);

    left.update(|cache| {
        cache.add_or_update('A', "l1");
        cache.add_or_update('B', "l2");
    });
    right.update(|cache| cache.add_or_update(1, ('A', "r1")));
    right.update(|cache| cache.add_or_update(1, ('B', "r1")));

    {
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1][0].current, (Some("l2"), "r1"));
    }

    // The old foreign key no longer reaches the row.
    left.update(|cache| cache.remove(&'A'));
    assert_eq!(seen.borrow().len(), 2);
}

#[test]
fn left_join_keeps_every_left_row() {
    let left: ObservableCache<&'static str, char> = ObservableCache::new();
    let right: ObservableCache<Right, i32> = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<(&'static str, Option<&'static str>), char>>();
    let _sub = left
        .connect()
        .left_join(
            right.connect(),
            |r: &Right| r.0,
            |_lk: &char, l: &&'static str, r: Option<&Right>| (*l, r.map(|r| r.1)),
        )
        .subscribe(push);

    left.update(|cache| cache.add_or_update('A', "l1"));
    right.update(|cache| cache.add_or_update(1, ('A', "r1")));
    right.update(|cache| cache.remove(&1));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0][0].current, ("l1", None));
    assert_eq!(seen[1][0].current, ("l1", Some("r1")));
    assert_eq!(seen[2][0].current, ("l1", None));
}

#[test]
fn inner_join_requires_both_sides() {
    let left: ObservableCache<&'static str, char> = ObservableCache::new();
    let right: ObservableCache<Right, i32> = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<(&'static str, &'static str), char>>();
    let _sub = left
        .connect()
        .inner_join(
            right.connect(),
            |r: &Right| r.0,
            |_lk: &char, l: &&'static str, r: &Right| (*l, r.1),
        )
        .subscribe(push);

    left.update(|cache| cache.add_or_update('A', "l1"));
    // Left alone yields nothing.
    assert!(seen.borrow().is_empty());

    right.update(|cache| cache.add_or_update(1, ('A', "r1")));
    left.update(|cache| cache.remove(&'A'));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(
        (seen[0][0].reason, seen[0][0].current),
        (ChangeReason::Add, ("l1", "r1"))
    );
    assert_eq!(seen[1][0].reason, ChangeReason::Remove);
}

#[test]
fn full_join_keeps_either_side() {
    let left: ObservableCache<&'static str, char> = ObservableCache::new();
    let right: ObservableCache<Right, i32> = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<(Option<&'static str>, Option<&'static str>), char>>();
    let _sub = left
        .connect()
        .full_join(
            right.connect(),
            |r: &Right| r.0,
            |_lk: &char, l: Option<&&'static str>, r: Option<&Right>| {
                (l.copied(), r.map(|r| r.1))
            },
        )
        .subscribe(push);

    right.update(|cache| cache.add_or_update(1, ('A', "r1")));
    left.update(|cache| cache.add_or_update('A', "l1"));
    left.update(|cache| cache.remove(&'A'));
    right.update(|cache| cache.remove(&1));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[0][0].current, (None, Some("r1")));
    assert_eq!(seen[1][0].current, (Some("l1"), Some("r1")));
    assert_eq!(seen[2][0].current, (None, Some("r1")));
    assert_eq!(seen[3][0].reason, ChangeReason::Remove);
}

#[test]
fn latest_right_wins_per_foreign_key() {
    let left: ObservableCache<&'static str, char> = ObservableCache::new();
    let right: ObservableCache<Right, i32> = ObservableCache::new();
    let (seen, push) = sink::<ChangeSet<(&'static str, Option<&'static str>), char>>();
    let _sub = left
        .connect()
        .left_join(
            right.connect(),
            |r: &Right| r.0,
            |_lk: &char, l: &&'static str, r: Option<&Right>| (*l, r.map(|r| r.1)),
        )
        .subscribe(push);

    left.update(|cache| cache.add_or_update('A', "l1"));
    right.update(|cache| cache.add_or_update(1, ('A', "r1")));
    right.update(|cache| cache.add_or_update(2, ('A', "r2")));
    // Removing the effective right falls back to the earlier one.
    right.update(|cache| cache.remove(&2));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[1][0].current, ("l1", Some("r1")));
    assert_eq!(seen[2][0].current, ("l1", Some("r2")));
    assert_eq!(seen[3][0].current, ("l1", Some("r1")));
}
