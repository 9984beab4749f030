use core::fmt;
use std::sync::Mutex;

use crate::{
    error::KvError,
    tx_log::{LogRecord, OpKind},
    types::KvResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// A compare-and-set precondition remembered for commit-time validation.
/// `expected` of `None` means the key must be absent.
#[derive(Debug, Clone)]
pub struct CasCheck {
    pub key: Vec<u8>,
    pub expected: Option<Vec<u8>>,
}

/// One transaction: its id, state, the data operations buffered so far
/// (in submission order) and any compare-and-set preconditions.
///
/// A transaction is created active and terminates exactly once, as
/// committed or aborted. The tree is never touched before commit; reads
/// inside the transaction overlay the buffered operations on top of the
/// committed tree.
pub struct Transaction {
    id: u64,
    state: Mutex<TransactionState>,
    ops: Mutex<Vec<LogRecord>>,
    cas_checks: Mutex<Vec<CasCheck>>,
}

impl Transaction {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::Active),
            ops: Mutex::new(Vec::new()),
            cas_checks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Mutating a transaction that already terminated is a caller bug.
    pub fn ensure_active(&self) -> KvResult {
        let state = self.state();
        if state != TransactionState::Active {
            return Err(KvError::precondition(format!(
                "transaction {} is {:?}, not active",
                self.id, state
            )));
        }
        Ok(())
    }

    pub(crate) fn push_op(&self, record: LogRecord) {
        self.ops.lock().unwrap().push(record);
    }

    pub(crate) fn push_cas_check(&self, check: CasCheck) {
        self.cas_checks.lock().unwrap().push(check);
    }

    pub(crate) fn ops_snapshot(&self) -> Vec<LogRecord> {
        self.ops.lock().unwrap().clone()
    }

    pub(crate) fn cas_checks_snapshot(&self) -> Vec<CasCheck> {
        self.cas_checks.lock().unwrap().clone()
    }

    pub fn pending_op_count(&self) -> usize {
        self.ops.lock().unwrap().len()
    }

    /// Read-your-writes lookup: the most recent buffered operation for
    /// the encoded key wins. `Some(None)` means the key is deleted in
    /// this transaction; `None` means the transaction has no opinion.
    pub(crate) fn pending_value(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        let ops = self.ops.lock().unwrap();
        for record in ops.iter().rev() {
            if !record.op.is_data() || record.key != key {
                continue;
            }
            return match record.op {
                OpKind::Delete => Some(None),
                _ => Some(Some(record.new_value.clone())),
            };
        }
        None
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
