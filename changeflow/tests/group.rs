use changeflow::operators::{Group, GroupSelector};
use changeflow::{
    ChangeReason, ChangeSet, ChangeStreamExt, ObservableCache, ObservableExt, Subject,
};
use std::{cell::RefCell, rc::Rc};

type GroupSet = ChangeSet<Group<i32, i32, i32>, i32>;

fn sink<T: 'static>() -> (Rc<RefCell<Vec<T>>>, impl FnMut(T) + 'static) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let push = {
        let seen = Rc::clone(&seen);
        move |item| seen.borrow_mut().push(item)
    };
    (seen, push)
}

#[test]
fn group_by_introduces_groups_on_first_member() {
    let source = ObservableCache::new();
    let (seen, push) = sink::<GroupSet>();
    let _sub = source
        .connect()
        .group_by(|value: &i32, _key: &i32| value % 2)
        .subscribe(push);

    source.update(|cache| {
        cache.add_or_update(1, 1);
        cache.add_or_update(3, 3);
    });
    // Same group again: no group-level change.
    source.update(|cache| cache.add_or_update(5, 5));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].len(), 1);
    assert_eq!(seen[0][0].reason, ChangeReason::Add);
    assert_eq!(*seen[0][0].current.key(), 1);
    assert_eq!(seen[0][0].current.cache().len(), 3);
}

#[test]
fn group_by_moves_members_between_groups() {
    let source = ObservableCache::new();
    let (seen, push) = sink::<GroupSet>();
    let _sub = source
        .connect()
        .group_by(|value: &i32, _key: &i32| value % 2)
        .subscribe(push);

    source.update(|cache| {
        cache.add_or_update(1, 1);
        cache.add_or_update(2, 3);
    });
    // Key 2 moves to the even group; the odd group keeps key 1.
    source.update(|cache| cache.add_or_update(2, 4));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].len(), 1);
    assert_eq!(seen[1][0].reason, ChangeReason::Add);
    assert_eq!(*seen[1][0].current.key(), 0);

    let odd = seen[0][0].current.clone();
    assert_eq!(odd.cache().len(), 1);
    assert_eq!(odd.cache().get(&1), Some(1));
}

#[test]
fn empty_group_is_removed_in_the_same_batch() {
    let source = ObservableCache::new();
    let (seen, push) = sink::<GroupSet>();
    let _sub = source
        .connect()
        .group_by(|value: &i32, _key: &i32| value % 2)
        .subscribe(push);

    source.update(|cache| cache.add_or_update(1, 1));
    source.update(|cache| cache.add_or_update(1, 2));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    let reasons: Vec<ChangeReason> = seen[1].iter().map(|c| c.reason).collect();
    assert!(reasons.contains(&ChangeReason::Remove));
    assert!(reasons.contains(&ChangeReason::Add));
    let removed = seen[1]
        .iter()
        .find(|c| c.reason == ChangeReason::Remove)
        .unwrap();
    assert_eq!(*removed.current.key(), 1);
}

#[test]
fn member_caches_publish_their_own_changes() {
    let source = ObservableCache::new();
    let member_changes = Rc::new(RefCell::new(Vec::new()));
    let member_subs = Rc::new(RefCell::new(Vec::new()));
    let sink_handle = Rc::clone(&member_changes);
    let subs_handle = Rc::clone(&member_subs);
    let _sub = source
        .connect()
        .group_by(|value: &i32, _key: &i32| value % 2)
        .subscribe(move |groups: GroupSet| {
            for change in groups.iter() {
                if change.reason == ChangeReason::Add {
                    let sink = Rc::clone(&sink_handle);
                    let sub = change
                        .current
                        .cache()
                        .connect()
                        .subscribe(move |members: ChangeSet<i32, i32>| {
                            sink.borrow_mut().push(members)
                        });
                    subs_handle.borrow_mut().push(sub);
                }
            }
        });

    source.update(|cache| cache.add_or_update(1, 1));
    source.update(|cache| cache.add_or_update(3, 3));

    let member_changes = member_changes.borrow();
    assert_eq!(member_changes.len(), 2);
    assert_eq!(member_changes[0][0].key, 1);
    assert_eq!(member_changes[1][0].key, 3);
}

#[test]
fn group_on_dynamic_buffers_until_a_selector_arrives() {
    let source = ObservableCache::new();
    let selectors: Subject<GroupSelector<i32, i32, i32>> = Subject::new();
    let (seen, push) = sink::<GroupSet>();
    let _sub = source
        .connect()
        .group_on_dynamic(selectors.clone())
        .subscribe(push);

    source.update(|cache| {
        cache.add_or_update(1, 1);
        cache.add_or_update(2, 2);
    });
    assert!(seen.borrow().is_empty());

    selectors.on_next(Rc::new(|value: &i32, _key: &i32| value % 2));
    {
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].count_of(ChangeReason::Add), 2);
    }

    // A new selector regroups everything: the odd group empties and is
    // removed; the even group absorbs the move without a group-level change.
    selectors.on_next(Rc::new(|_value: &i32, _key: &i32| 0));
    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].len(), 1);
    assert_eq!(seen[1][0].reason, ChangeReason::Remove);
    assert_eq!(*seen[1][0].current.key(), 1);
}

#[test]
fn group_on_observable_moves_on_group_key_emissions() {
    let source = ObservableCache::new();
    let group_keys = Subject::new();
    let (seen, push) = sink::<GroupSet>();
    let selector = {
        let group_keys = group_keys.clone();
        move |_value: &i32, _key: &i32| group_keys.clone()
    };
    let _sub = source
        .connect()
        .group_on_observable(selector)
        .subscribe(push);

    source.update(|cache| cache.add_or_update(1, 10));
    // Not grouped until the first group key arrives.
    assert!(seen.borrow().is_empty());

    group_keys.on_next(7);
    group_keys.on_next(9);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(*seen[0][0].current.key(), 7);
    let reasons: Vec<ChangeReason> = seen[1].iter().map(|c| c.reason).collect();
    assert_eq!(reasons, vec![ChangeReason::Remove, ChangeReason::Add]);
    let added = &seen[1][1];
    assert_eq!(*added.current.key(), 9);
    assert_eq!(added.current.cache().get(&1), Some(10));
}
