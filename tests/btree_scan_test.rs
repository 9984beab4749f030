use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::thread_rng;

mod test_utils;
use test_utils::{new_tree, setup, value};

#[test]
fn test_range_against_reference_model() {
    setup();

    let (tree, _dir) = new_tree(4);
    let mut model: BTreeMap<i64, String> = BTreeMap::new();

    let mut keys: Vec<i64> = (0..300).map(|i| i * 3).collect();
    keys.shuffle(&mut thread_rng());
    for key in keys {
        tree.insert(&key, &value(key)).unwrap();
        model.insert(key, value(key));
    }

    for (lo, hi) in [(0, 897), (10, 11), (-5, 40), (300, 300)] {
        let got: Vec<String> = tree
            .range(&lo, &hi)
            .unwrap()
            .map(|item| item.unwrap().1)
            .collect();
        let want: Vec<String> = model
            .range(lo..=hi)
            .map(|(_, v)| v.clone())
            .collect();
        assert_eq!(got, want, "range [{}, {}]", lo, hi);
    }

    // an inverted range yields nothing
    assert_eq!(tree.range(&500, &200).unwrap().count(), 0);
}

#[test]
fn test_point_range() {
    setup();

    let (tree, _dir) = new_tree(4);
    for i in 1..=10 {
        tree.insert(&i, &value(i)).unwrap();
    }

    // a [k, k] range holds at most one element
    let got: Vec<String> = tree
        .range(&7, &7)
        .unwrap()
        .map(|item| item.unwrap().1)
        .collect();
    assert_eq!(got, vec![value(7)]);

    let got: Vec<String> = tree
        .range(&11, &11)
        .unwrap()
        .map(|item| item.unwrap().1)
        .collect();
    assert!(got.is_empty());
}

#[test]
fn test_scan_on_empty_tree() {
    setup();

    let (tree, _dir) = new_tree(4);
    assert_eq!(tree.scan_all().unwrap().count(), 0);
    assert_eq!(tree.range(&0, &100).unwrap().count(), 0);
}

#[test]
fn test_scan_crosses_leaf_boundaries() {
    setup();

    // order 4 with 100 keys spreads entries over many chained leaves
    let (tree, _dir) = new_tree(4);
    for i in 0..100 {
        tree.insert(&i, &value(i)).unwrap();
    }

    let got: Vec<i64> = tree
        .range(&13, &77)
        .unwrap()
        .map(|item| item.unwrap().0)
        .collect();
    assert_eq!(got, (13..=77).collect::<Vec<i64>>());
}
