use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use log::{info, warn};

use crate::{
    btree::BTree,
    error::KvError,
    io::{Decodeable, Encodeable},
    storage::cell::{KeyType, ValueType},
    transaction::tx::{Transaction, TransactionState},
    tx_log::{LogManager, LogRecord, OpKind},
    types::KvResult,
};

/// Drives the transaction protocol against the WAL and the tree.
///
/// The WAL is the authority: a transaction is committed exactly when its
/// commit record is durably on disk. Commit order is: data records
/// (already appended as they were submitted), apply to the tree, append
/// the commit marker, flush. A crash between any two of those steps is
/// recoverable.
pub struct TransactionCoordinator {
    log_manager: Arc<LogManager>,
    next_tx_id: AtomicU64,
    active: Mutex<HashSet<u64>>,
}

impl TransactionCoordinator {
    pub fn new(log_manager: Arc<LogManager>) -> Self {
        Self {
            log_manager,
            next_tx_id: AtomicU64::new(1),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Start a transaction. The begin marker is durable before the
    /// handle is returned.
    pub fn begin(&self) -> KvResult<Transaction> {
        let id = self.next_tx_id.fetch_add(1, Ordering::Relaxed);
        let tx = Transaction::new(id);

        let mut marker = LogRecord::marker(id, OpKind::TxBegin);
        self.log_manager.append(&mut marker)?;
        self.log_manager.flush()?;

        self.active.lock().unwrap().insert(id);
        Ok(tx)
    }

    /// Append a data record to the WAL (not yet flushed) and buffer it on
    /// the transaction.
    pub fn add_operation(&self, tx: &Transaction, mut record: LogRecord) -> KvResult {
        tx.ensure_active()?;
        debug_assert!(record.op.is_data());
        self.log_manager.append(&mut record)?;
        tx.push_op(record);
        Ok(())
    }

    /// Validate compare-and-set preconditions, apply the buffered
    /// operations to the tree in order, append the commit marker and
    /// flush. A failed precondition aborts the transaction instead and
    /// surfaces a compare-and-set error; its other operations are
    /// discarded.
    pub fn commit<K: KeyType, V: ValueType>(
        &self,
        tx: &Transaction,
        tree: &BTree<K, V>,
    ) -> KvResult {
        tx.ensure_active()?;

        for check in tx.cas_checks_snapshot() {
            let key = K::decode(&check.key)?;
            let actual = tree.get(&key)?.map(|v| v.encode());
            if actual != check.expected {
                self.terminate(tx, TransactionState::Aborted)?;
                return Err(KvError::CompareAndSetFailure {
                    key: check.key,
                    expected: check.expected,
                    actual,
                });
            }
        }

        for record in tx.ops_snapshot() {
            let key = K::decode(&record.key)?;
            match record.op {
                OpKind::Insert | OpKind::Update | OpKind::Cas => {
                    let value = V::decode(&record.new_value)?;
                    tree.insert(&key, &value)?;
                }
                OpKind::Delete => {
                    tree.delete(&key)?;
                }
                _ => {}
            }
        }

        self.terminate(tx, TransactionState::Committed)
    }

    /// Abort the transaction. The tree was never touched, so appending
    /// the rollback marker and flushing is all there is to do.
    pub fn rollback(&self, tx: &Transaction) -> KvResult {
        tx.ensure_active()?;
        self.terminate(tx, TransactionState::Aborted)
    }

    fn terminate(&self, tx: &Transaction, state: TransactionState) -> KvResult {
        let op = match state {
            TransactionState::Committed => OpKind::TxCommit,
            TransactionState::Aborted => OpKind::TxRollback,
            TransactionState::Active => {
                return Err(KvError::precondition("cannot terminate into active state"))
            }
        };
        let mut marker = LogRecord::marker(tx.id(), op);
        self.log_manager.append(&mut marker)?;
        self.log_manager.flush()?;

        tx.set_state(state);
        self.active.lock().unwrap().remove(&tx.id());
        Ok(())
    }

    /// Replay the WAL against the tree. Only transactions whose commit
    /// record made it to disk are applied, in commit order. A transaction
    /// with a begin record but no terminator crashed mid-flight and is
    /// rolled back.
    pub fn recover<K: KeyType, V: ValueType>(&self, tree: &BTree<K, V>) -> KvResult {
        let records = self.log_manager.read_all()?;

        let mut pending: HashMap<u64, Vec<LogRecord>> = HashMap::new();
        let mut committed: Vec<(u64, u64, Vec<LogRecord>)> = Vec::new();
        let mut max_tx_id = 0u64;

        for record in records {
            max_tx_id = max_tx_id.max(record.tx_id);
            match record.op {
                OpKind::TxBegin => {
                    pending.insert(record.tx_id, Vec::new());
                }
                OpKind::TxCommit => match pending.remove(&record.tx_id) {
                    Some(ops) => committed.push((record.sequence, record.tx_id, ops)),
                    None => warn!(
                        "commit marker for unknown transaction {} ignored",
                        record.tx_id
                    ),
                },
                OpKind::TxRollback => {
                    pending.remove(&record.tx_id);
                }
                _ => {
                    pending.entry(record.tx_id).or_default().push(record);
                }
            }
        }

        committed.sort_by_key(|(sequence, _, _)| *sequence);
        let replayed = committed.len();
        for (_, _, ops) in committed {
            for record in ops {
                let key = K::decode(&record.key)?;
                match record.op {
                    // compare-and-set was validated at its original
                    // commit; replay treats it as a plain upsert
                    OpKind::Insert | OpKind::Update | OpKind::Cas => {
                        let value = V::decode(&record.new_value)?;
                        tree.insert(&key, &value)?;
                    }
                    OpKind::Delete => {
                        tree.delete(&key)?;
                    }
                    _ => {}
                }
            }
        }

        for (tx_id, ops) in &pending {
            warn!(
                "transaction {} has no terminator in the log, rolling back {} operation(s)",
                tx_id,
                ops.len()
            );
        }

        self.next_tx_id.store(max_tx_id + 1, Ordering::Relaxed);
        info!(
            "recovery done, {} transaction(s) replayed, {} rolled back",
            replayed,
            pending.len()
        );
        Ok(())
    }

    /// Roll back every still-active transaction and clear state.
    pub fn shutdown(&self) -> KvResult {
        let ids: Vec<u64> = {
            let mut active = self.active.lock().unwrap();
            active.drain().collect()
        };
        if ids.is_empty() {
            return Ok(());
        }
        warn!("shutdown with {} active transaction(s)", ids.len());
        for id in ids {
            let mut marker = LogRecord::marker(id, OpKind::TxRollback);
            self.log_manager.append(&mut marker)?;
        }
        self.log_manager.flush()?;
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}
