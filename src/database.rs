use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, RwLock},
};

use log::warn;

use crate::{
    btree::BTree,
    error::KvError,
    io::{Decodeable, Encodeable},
    storage::{
        buffer_pool::{BufferPool, DEFAULT_CAPACITY},
        cell::{KeyType, ValueType},
        disk_manager::DiskManager,
        page::{MAX_KEY_LEN, MAX_VALUE_LEN},
    },
    transaction::{coordinator::TransactionCoordinator, tx::CasCheck, Transaction},
    tx_log::{LogManager, LogRecord, OpKind},
    types::KvResult,
    utils::HandyRwLock,
};

#[derive(Debug, Clone, Copy)]
pub struct DatabaseConfig {
    /// Maximum number of keys per tree node.
    pub order: usize,
    /// Buffer pool capacity in pages.
    pub buffer_capacity: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            order: 32,
            buffer_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// The public face of the engine.
///
/// Owns exactly one buffer pool (which owns the disk manager and data
/// file), one write-ahead log and one transaction coordinator. A
/// process-wide reader/writer lock serializes the API: reads share it,
/// writes take it exclusively. Every operation has a transactional and
/// an autocommit form; autocommit wraps begin, the operation and commit
/// around the call, rolling back on failure.
pub struct Database<K: KeyType, V: ValueType> {
    btree: BTree<K, V>,
    buffer_pool: Arc<BufferPool>,
    log_manager: Arc<LogManager>,
    coordinator: TransactionCoordinator,
    /// Facade lock. The payload is the closed flag.
    state: RwLock<bool>,
}

impl<K: KeyType, V: ValueType> Database<K, V> {
    /// Open (or create) the database. Recovery runs to completion before
    /// the handle is returned: committed transactions in the log are
    /// replayed into the tree and the tree is made durable.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        data_path: P,
        wal_path: Q,
        config: DatabaseConfig,
    ) -> KvResult<Self> {
        let disk_manager = DiskManager::open(data_path)?;
        let buffer_pool = Arc::new(BufferPool::new(disk_manager, config.buffer_capacity));
        let btree = BTree::open(buffer_pool.clone(), config.order)?;
        let log_manager = Arc::new(LogManager::open(wal_path)?);
        let coordinator = TransactionCoordinator::new(log_manager.clone());

        coordinator.recover(&btree)?;
        buffer_pool.flush_all()?;
        buffer_pool.sync()?;

        Ok(Self {
            btree,
            buffer_pool,
            log_manager,
            coordinator,
            state: RwLock::new(false),
        })
    }

    // ------------------------------------------------------------------
    // reads
    // ------------------------------------------------------------------

    pub fn get(&self, key: &K) -> KvResult<Option<V>> {
        let _guard = self.read_guard()?;
        self.btree.get(key)
    }

    pub fn get_tx(&self, key: &K, tx: &Transaction) -> KvResult<Option<V>> {
        let _guard = self.read_guard()?;
        self.read_visible(Some(tx), key)
    }

    pub fn contains_key(&self, key: &K) -> KvResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn contains_key_tx(&self, key: &K, tx: &Transaction) -> KvResult<bool> {
        Ok(self.get_tx(key, tx)?.is_some())
    }

    /// Values for all keys in the inclusive range `[lo, hi]`, in key
    /// order.
    pub fn range(&self, lo: &K, hi: &K) -> KvResult<Vec<V>> {
        let _guard = self.read_guard()?;
        let mut values = Vec::new();
        for item in self.btree.range(lo, hi)? {
            let (_, value) = item?;
            values.push(value);
        }
        Ok(values)
    }

    /// Range read inside a transaction: the transaction's buffered
    /// operations overlay the committed tree, most recent per key wins.
    pub fn range_tx(&self, lo: &K, hi: &K, tx: &Transaction) -> KvResult<Vec<V>> {
        let _guard = self.read_guard()?;

        let mut merged: BTreeMap<K, V> = BTreeMap::new();
        for item in self.btree.range(lo, hi)? {
            let (key, value) = item?;
            merged.insert(key, value);
        }
        for record in tx.ops_snapshot() {
            if !record.op.is_data() {
                continue;
            }
            let key = K::decode(&record.key)?;
            if key < *lo || key > *hi {
                continue;
            }
            match record.op {
                OpKind::Delete => {
                    merged.remove(&key);
                }
                _ => {
                    merged.insert(key, V::decode(&record.new_value)?);
                }
            }
        }
        Ok(merged.into_iter().map(|(_, v)| v).collect())
    }

    /// Every live pair in key order. The offline rebalance tool feeds on
    /// this.
    pub fn scan_all(&self) -> KvResult<Vec<(K, V)>> {
        let _guard = self.read_guard()?;
        let mut pairs = Vec::new();
        for item in self.btree.scan_all()? {
            pairs.push(item?);
        }
        Ok(pairs)
    }

    pub fn size(&self) -> KvResult<usize> {
        let _guard = self.read_guard()?;
        let mut count = 0;
        for item in self.btree.scan_all()? {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> KvResult<bool> {
        let _guard = self.read_guard()?;
        match self.btree.scan_all()?.next() {
            Some(item) => {
                item?;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    // ------------------------------------------------------------------
    // writes
    // ------------------------------------------------------------------

    pub fn put(&self, key: &K, value: &V) -> KvResult {
        let _guard = self.write_guard()?;
        self.autocommit(|tx| self.buffer_put(tx, key, value))
    }

    pub fn put_tx(&self, key: &K, value: &V, tx: &Transaction) -> KvResult {
        let _guard = self.write_guard()?;
        self.buffer_put(tx, key, value)
    }

    /// Remove the key. Returns whether it was present (from this
    /// transaction's point of view).
    pub fn delete(&self, key: &K) -> KvResult<bool> {
        let _guard = self.write_guard()?;
        self.autocommit(|tx| self.buffer_delete(tx, key))
    }

    pub fn delete_tx(&self, key: &K, tx: &Transaction) -> KvResult<bool> {
        let _guard = self.write_guard()?;
        self.buffer_delete(tx, key)
    }

    /// Conditional update: succeeds only if the current value equals
    /// `expected` (`None` meaning the key must be absent). The check runs
    /// here against the visible state and again at commit against the
    /// committed tree; of two racing transactions at most one commits.
    pub fn compare_and_set(&self, key: &K, expected: Option<&V>, new: &V) -> KvResult<bool> {
        let _guard = self.write_guard()?;
        self.autocommit(|tx| self.buffer_cas(tx, key, expected, new))
    }

    pub fn compare_and_set_tx(
        &self,
        key: &K,
        expected: Option<&V>,
        new: &V,
        tx: &Transaction,
    ) -> KvResult<bool> {
        let _guard = self.write_guard()?;
        self.buffer_cas(tx, key, expected, new)
    }

    // ------------------------------------------------------------------
    // transactions
    // ------------------------------------------------------------------

    pub fn begin_transaction(&self) -> KvResult<Transaction> {
        let _guard = self.read_guard()?;
        self.coordinator.begin()
    }

    pub fn commit_transaction(&self, tx: &Transaction) -> KvResult {
        let _guard = self.write_guard()?;
        self.coordinator.commit(tx, &self.btree)
    }

    pub fn rollback_transaction(&self, tx: &Transaction) -> KvResult {
        let _guard = self.write_guard()?;
        self.coordinator.rollback(tx)
    }

    // ------------------------------------------------------------------
    // maintenance
    // ------------------------------------------------------------------

    /// Flush all dirty pages and fsync both files.
    pub fn flush(&self) -> KvResult {
        let _guard = self.write_guard()?;
        self.buffer_pool.flush_all()?;
        self.buffer_pool.sync()?;
        self.log_manager.flush()
    }

    /// Roll back active transactions, flush everything and mark the
    /// database closed. Any call after close fails.
    pub fn close(&self) -> KvResult {
        let mut closed = self.state.wl();
        if *closed {
            return Err(KvError::precondition("database is closed"));
        }
        self.coordinator.shutdown()?;
        self.buffer_pool.flush_all()?;
        self.buffer_pool.sync()?;
        self.log_manager.close()?;
        *closed = true;
        Ok(())
    }

    /// Direct access to the underlying tree, for tooling and tests.
    pub fn btree(&self) -> &BTree<K, V> {
        &self.btree
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn read_guard(&self) -> KvResult<std::sync::RwLockReadGuard<'_, bool>> {
        let guard = self.state.rl();
        if *guard {
            return Err(KvError::precondition("database is closed"));
        }
        Ok(guard)
    }

    fn write_guard(&self) -> KvResult<std::sync::RwLockWriteGuard<'_, bool>> {
        let guard = self.state.wl();
        if *guard {
            return Err(KvError::precondition("database is closed"));
        }
        Ok(guard)
    }

    fn autocommit<R>(&self, op: impl FnOnce(&Transaction) -> KvResult<R>) -> KvResult<R> {
        let tx = self.coordinator.begin()?;
        match op(&tx) {
            Ok(result) => {
                self.coordinator.commit(&tx, &self.btree)?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback_err) = self.coordinator.rollback(&tx) {
                    warn!("rollback of autocommit {} failed: {}", tx, rollback_err);
                }
                Err(e)
            }
        }
    }

    /// The value the transaction sees for the key: its own most recent
    /// buffered operation if any, the committed tree otherwise.
    fn read_visible(&self, tx: Option<&Transaction>, key: &K) -> KvResult<Option<V>> {
        if let Some(tx) = tx {
            if let Some(pending) = tx.pending_value(&key.encode()) {
                return match pending {
                    Some(bytes) => Ok(Some(V::decode(&bytes)?)),
                    None => Ok(None),
                };
            }
        }
        self.btree.get(key)
    }

    fn check_entry_size(key: &K, value: &V) -> KvResult {
        let klen = key.encoded_size();
        let vlen = value.encoded_size();
        if klen > MAX_KEY_LEN || vlen > MAX_VALUE_LEN {
            return Err(KvError::precondition(format!(
                "entry too large: key {} bytes (max {}), value {} bytes (max {})",
                klen, MAX_KEY_LEN, vlen, MAX_VALUE_LEN
            )));
        }
        Ok(())
    }

    fn buffer_put(&self, tx: &Transaction, key: &K, value: &V) -> KvResult {
        tx.ensure_active()?;
        Self::check_entry_size(key, value)?;
        let old = self.read_visible(Some(tx), key)?;
        let op = if old.is_some() {
            OpKind::Update
        } else {
            OpKind::Insert
        };
        let record = LogRecord::data(
            tx.id(),
            op,
            key.encode(),
            value.encode(),
            old.map(|v| v.encode()).unwrap_or_default(),
        );
        self.coordinator.add_operation(tx, record)
    }

    fn buffer_delete(&self, tx: &Transaction, key: &K) -> KvResult<bool> {
        tx.ensure_active()?;
        let old = match self.read_visible(Some(tx), key)? {
            Some(old) => old,
            None => return Ok(false),
        };
        let record = LogRecord::data(
            tx.id(),
            OpKind::Delete,
            key.encode(),
            Vec::new(),
            old.encode(),
        );
        self.coordinator.add_operation(tx, record)?;
        Ok(true)
    }

    fn buffer_cas(
        &self,
        tx: &Transaction,
        key: &K,
        expected: Option<&V>,
        new: &V,
    ) -> KvResult<bool> {
        tx.ensure_active()?;
        Self::check_entry_size(key, new)?;
        let current = self.read_visible(Some(tx), key)?;
        if current.as_ref() != expected {
            return Ok(false);
        }

        let record = LogRecord::data(
            tx.id(),
            OpKind::Cas,
            key.encode(),
            new.encode(),
            current.map(|v| v.encode()).unwrap_or_default(),
        );
        self.coordinator.add_operation(tx, record)?;
        tx.push_cas_check(CasCheck {
            key: key.encode(),
            expected: expected.map(|v| v.encode()),
        });
        Ok(true)
    }
}

impl<K: KeyType, V: ValueType> Drop for Database<K, V> {
    fn drop(&mut self) {
        let already_closed = *self.state.rl();
        if !already_closed {
            if let Err(e) = self.close() {
                warn!("close on drop failed: {}", e);
            }
        }
    }
}
