use small_kv::{Database, KvError, TransactionState};

mod test_utils;
use test_utils::{setup, value, TestEnv};

#[test]
fn test_transaction_visibility() {
    setup();

    let env = TestEnv::new();
    let db: Database<String, String> = env.open(4);

    let tx = db.begin_transaction().unwrap();
    db.put_tx(&"x".to_string(), &"1".to_string(), &tx).unwrap();

    // invisible outside the transaction, visible inside
    assert_eq!(db.get(&"x".to_string()).unwrap(), None);
    assert_eq!(
        db.get_tx(&"x".to_string(), &tx).unwrap(),
        Some("1".to_string())
    );

    db.commit_transaction(&tx).unwrap();
    assert_eq!(db.get(&"x".to_string()).unwrap(), Some("1".to_string()));
    assert_eq!(tx.state(), TransactionState::Committed);
}

#[test]
fn test_rollback_discards_operations() {
    setup();

    let env = TestEnv::new();
    let db: Database<i64, String> = env.open(4);
    db.put(&1, &value(1)).unwrap();

    let tx = db.begin_transaction().unwrap();
    db.put_tx(&2, &value(2), &tx).unwrap();
    db.delete_tx(&1, &tx).unwrap();
    db.rollback_transaction(&tx).unwrap();

    // nothing the transaction did is visible
    assert_eq!(db.get(&1).unwrap(), Some(value(1)));
    assert_eq!(db.get(&2).unwrap(), None);
    assert_eq!(tx.state(), TransactionState::Aborted);
}

#[test]
fn test_read_your_writes_delete() {
    setup();

    let env = TestEnv::new();
    let db: Database<i64, String> = env.open(4);
    db.put(&1, &value(1)).unwrap();

    let tx = db.begin_transaction().unwrap();
    assert!(db.delete_tx(&1, &tx).unwrap());
    assert_eq!(db.get_tx(&1, &tx).unwrap(), None);
    assert!(!db.contains_key_tx(&1, &tx).unwrap());
    // still present outside
    assert_eq!(db.get(&1).unwrap(), Some(value(1)));

    db.commit_transaction(&tx).unwrap();
    assert_eq!(db.get(&1).unwrap(), None);
}

#[test]
fn test_range_merges_pending_operations() {
    setup();

    let env = TestEnv::new();
    let db: Database<i64, String> = env.open(4);
    for i in 0..10 {
        db.put(&i, &value(i)).unwrap();
    }

    let tx = db.begin_transaction().unwrap();
    db.put_tx(&4, &"patched".to_string(), &tx).unwrap();
    db.delete_tx(&5, &tx).unwrap();
    db.put_tx(&100, &value(100), &tx).unwrap();

    let inside = db.range_tx(&3, &101, &tx).unwrap();
    assert_eq!(
        inside,
        vec![
            value(3),
            "patched".to_string(),
            value(6),
            value(7),
            value(8),
            value(9),
            value(100),
        ]
    );

    // the committed view is untouched until commit
    let outside = db.range(&3, &101).unwrap();
    assert_eq!(outside.len(), 7);
    assert_eq!(outside[2], value(5));
}

#[test]
fn test_operations_on_terminated_transaction_fail() {
    setup();

    let env = TestEnv::new();
    let db: Database<i64, String> = env.open(4);

    let tx = db.begin_transaction().unwrap();
    db.commit_transaction(&tx).unwrap();

    match db.put_tx(&1, &value(1), &tx) {
        Err(KvError::Precondition(msg)) => assert!(msg.contains("not active")),
        other => panic!("expected precondition error, got {:?}", other),
    }
    match db.commit_transaction(&tx) {
        Err(KvError::Precondition(_)) => {}
        other => panic!("expected precondition error, got {:?}", other),
    }
}

#[test]
fn test_compare_and_set_operation_time() {
    setup();

    let env = TestEnv::new();
    let db: Database<String, String> = env.open(4);
    let k = "c".to_string();

    // expected absent on an absent key succeeds
    assert!(db
        .compare_and_set(&k, None, &"0".to_string())
        .unwrap());
    assert_eq!(db.get(&k).unwrap(), Some("0".to_string()));

    // wrong expectation returns false and records nothing
    assert!(!db
        .compare_and_set(&k, Some(&"9".to_string()), &"1".to_string())
        .unwrap());
    assert_eq!(db.get(&k).unwrap(), Some("0".to_string()));

    // right expectation flips the value
    assert!(db
        .compare_and_set(&k, Some(&"0".to_string()), &"1".to_string())
        .unwrap());
    assert_eq!(db.get(&k).unwrap(), Some("1".to_string()));
}

#[test]
fn test_compare_and_set_commit_race() {
    setup();

    let env = TestEnv::new();
    let db: Database<String, String> = env.open(4);
    let k = "c".to_string();
    db.put(&k, &"0".to_string()).unwrap();

    let tx1 = db.begin_transaction().unwrap();
    let tx2 = db.begin_transaction().unwrap();

    // both see "0" at operation time, so both record the operation
    assert!(db
        .compare_and_set_tx(&k, Some(&"0".to_string()), &"1".to_string(), &tx1)
        .unwrap());
    assert!(db
        .compare_and_set_tx(&k, Some(&"0".to_string()), &"2".to_string(), &tx2)
        .unwrap());

    db.commit_transaction(&tx1).unwrap();

    // the loser fails deterministically at commit-time validation
    match db.commit_transaction(&tx2) {
        Err(KvError::CompareAndSetFailure {
            key,
            expected,
            actual,
        }) => {
            assert_eq!(key, b"c".to_vec());
            assert_eq!(expected, Some(b"0".to_vec()));
            assert_eq!(actual, Some(b"1".to_vec()));
        }
        other => panic!("expected compare-and-set failure, got {:?}", other),
    }
    assert_eq!(tx2.state(), TransactionState::Aborted);
    assert_eq!(db.get(&k).unwrap(), Some("1".to_string()));
}

#[test]
fn test_cas_loser_discards_other_operations() {
    setup();

    let env = TestEnv::new();
    let db: Database<String, String> = env.open(4);
    let k = "c".to_string();
    db.put(&k, &"0".to_string()).unwrap();

    let tx1 = db.begin_transaction().unwrap();
    let tx2 = db.begin_transaction().unwrap();
    assert!(db
        .compare_and_set_tx(&k, Some(&"0".to_string()), &"1".to_string(), &tx1)
        .unwrap());
    assert!(db
        .compare_and_set_tx(&k, Some(&"0".to_string()), &"2".to_string(), &tx2)
        .unwrap());
    // the loser also buffered an unrelated write
    db.put_tx(&"other".to_string(), &"data".to_string(), &tx2)
        .unwrap();

    db.commit_transaction(&tx1).unwrap();
    assert!(db.commit_transaction(&tx2).is_err());

    // every operation of the losing transaction is discarded
    assert_eq!(db.get(&"other".to_string()).unwrap(), None);
}
