mod test_utils;
use test_utils::{new_tree, setup, value};

#[test]
fn test_delete_existing_and_absent() {
    setup();

    let (tree, _dir) = new_tree(4);
    for i in 1..=10 {
        tree.insert(&i, &value(i)).unwrap();
    }

    assert!(tree.delete(&3).unwrap());
    assert!(!tree.delete(&3).unwrap());
    assert!(!tree.delete(&99).unwrap());

    assert_eq!(tree.get(&3).unwrap(), None);
    assert_eq!(tree.get(&4).unwrap(), Some(value(4)));
    tree.check_integrity().unwrap();
}

#[test]
fn test_delete_everything() {
    setup();

    let (tree, _dir) = new_tree(4);
    for i in 1..=50 {
        tree.insert(&i, &value(i)).unwrap();
    }
    for i in 1..=50 {
        assert!(tree.delete(&i).unwrap(), "key {} must be present", i);
    }

    for i in 1..=50 {
        assert_eq!(tree.get(&i).unwrap(), None);
    }
    assert_eq!(tree.scan_all().unwrap().count(), 0);
    tree.check_integrity().unwrap();
}

#[test]
fn test_root_shrink() {
    setup();

    // order 4, 5 keys: a root with two leaf children
    let (tree, _dir) = new_tree(4);
    for i in 1..=5 {
        tree.insert(&i, &value(i)).unwrap();
    }
    assert_eq!(tree.stats().unwrap().depth, 2);

    // emptying the right leaf drops it from the root, which then holds a
    // single child and shrinks away
    for i in 3..=5 {
        assert!(tree.delete(&i).unwrap());
    }
    let stats = tree.stats().unwrap();
    assert_eq!(stats.depth, 1, "sole child must have been promoted to root");
    assert_eq!(stats.keys, 2);

    assert_eq!(tree.get(&1).unwrap(), Some(value(1)));
    assert_eq!(tree.get(&2).unwrap(), Some(value(2)));
    tree.check_integrity().unwrap();
}

#[test]
fn test_interleaved_inserts_and_deletes() {
    setup();

    let (tree, _dir) = new_tree(4);
    for round in 0..10 {
        for i in 0..40 {
            let key = round * 40 + i;
            tree.insert(&key, &value(key)).unwrap();
        }
        // remove every other key of the round
        for i in (0..40).step_by(2) {
            let key = round * 40 + i;
            assert!(tree.delete(&key).unwrap());
        }
        tree.check_integrity().unwrap();
    }

    let live = tree.scan_all().unwrap().count();
    assert_eq!(live, 10 * 20);
}
