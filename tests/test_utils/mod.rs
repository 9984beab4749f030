#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use small_kv::{
    btree::BTree,
    storage::{buffer_pool::BufferPool, disk_manager::DiskManager},
    utils::init_log,
    Database, DatabaseConfig, KeyType, ValueType,
};

/// # Conduct the initialization
///
/// - Setting up log configurations.
pub fn setup() {
    init_log();
}

/// A scratch directory holding one database's data and log files.
pub struct TestEnv {
    dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.path().join("tree.db")
    }

    pub fn wal_path(&self) -> PathBuf {
        self.dir.path().join("tree.wal")
    }

    /// Open the database with the given order and a roomy buffer pool.
    pub fn open<K: KeyType, V: ValueType>(&self, order: usize) -> Database<K, V> {
        self.open_with(DatabaseConfig {
            order,
            buffer_capacity: 64,
        })
    }

    pub fn open_with<K: KeyType, V: ValueType>(&self, config: DatabaseConfig) -> Database<K, V> {
        Database::open(self.data_path(), self.wal_path(), config).unwrap()
    }
}

/// A bare tree over a fresh file, bypassing the database facade. Used by
/// the structural tests.
pub fn new_tree(order: usize) -> (BTree<i64, String>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let disk_manager = DiskManager::open(dir.path().join("tree.db")).unwrap();
    let pool = Arc::new(BufferPool::new(disk_manager, 64));
    let tree = BTree::open(pool, order).unwrap();
    (tree, dir)
}

pub fn value(i: i64) -> String {
    format!("value{}", i)
}
