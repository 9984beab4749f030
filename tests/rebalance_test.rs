use std::sync::Arc;

use small_kv::{
    btree::BTree,
    storage::{buffer_pool::BufferPool, disk_manager::DiskManager},
    Database,
};

mod test_utils;
use test_utils::{setup, value, TestEnv};

fn fresh_tree_file(dir: &tempfile::TempDir, name: &str, order: usize) -> BTreeHandle {
    let path = dir.path().join(name);
    let disk_manager = DiskManager::open(&path).unwrap();
    let pool = Arc::new(BufferPool::new(disk_manager, 64));
    BTreeHandle { pool, order }
}

struct BTreeHandle {
    pool: Arc<BufferPool>,
    order: usize,
}

#[test]
fn test_bulk_load_packs_leaves() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let entries: Vec<(i64, String)> = (0..64).map(|i| (i, value(i))).collect();

    let handle = fresh_tree_file(&dir, "packed.db", 4);
    let tree = BTree::bulk_load(handle.pool, handle.order, &entries).unwrap();
    tree.check_integrity().unwrap();

    let stats = tree.stats().unwrap();
    assert_eq!(stats.keys, 64);
    // 64 keys at order 4 pack into exactly 16 full leaves
    assert_eq!(stats.leaf_nodes, 16);
    assert!((stats.mean_leaf_fill() - 1.0).abs() < 1e-9);

    for (key, val) in &entries {
        assert_eq!(tree.get(key).unwrap(), Some(val.clone()));
    }
}

#[test]
fn test_bulk_load_empty_input() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let handle = fresh_tree_file(&dir, "empty.db", 4);
    let tree: BTree<i64, String> = BTree::bulk_load(handle.pool, handle.order, &[]).unwrap();

    assert_eq!(tree.scan_all().unwrap().count(), 0);
    tree.check_integrity().unwrap();
}

#[test]
fn test_rebuild_preserves_the_mapping() {
    setup();

    // build a tree with plenty of deletions, so it carries underfull
    // leaves and orphan pages
    let env = TestEnv::new();
    let db: Database<i64, String> = env.open(4);
    for i in 0..200 {
        db.put(&i, &value(i)).unwrap();
    }
    for i in (0..200).filter(|i| i % 3 != 0) {
        assert!(db.delete(&i).unwrap());
    }

    let before = db.scan_all().unwrap();
    let sparse_stats = db.btree().stats().unwrap();
    db.close().unwrap();

    // rebuild into a fresh file the way the offline tool does
    let dir = tempfile::tempdir().unwrap();
    let handle = fresh_tree_file(&dir, "rebuilt.db", 4);
    let rebuilt = BTree::bulk_load(handle.pool, handle.order, &before).unwrap();
    rebuilt.check_integrity().unwrap();

    let after: Vec<(i64, String)> = rebuilt
        .scan_all()
        .unwrap()
        .map(|item| item.unwrap())
        .collect();
    assert_eq!(after, before);

    // the rebuild must be denser than the deletion-scarred original
    let packed_stats = rebuilt.stats().unwrap();
    assert!(packed_stats.leaf_nodes < sparse_stats.leaf_nodes);
    assert!(packed_stats.mean_leaf_fill() > sparse_stats.mean_leaf_fill());
}
