//! Lazy, forward-only cursor over the leaf chain.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::{
    btree::node::Node,
    error::KvError,
    storage::{
        buffer_pool::{BufferPool, PageGuard},
        cell::{KeyType, ValueType},
        page::{PageId, INVALID_PAGE_ID},
    },
    types::KvResult,
};

/// Yields `(key, value)` pairs in ascending key order, bounded
/// inclusively by the optional `lo` and `hi` keys. Only the current
/// leaf is materialized; the next leaf loads when the current one is
/// drained. Dropping the cursor cancels the scan.
pub struct RangeIter<K, V> {
    pool: Arc<BufferPool>,
    entries: VecDeque<(K, V)>,
    next_leaf: PageId,
    lo: Option<K>,
    hi: Option<K>,
    finished: bool,
}

impl<K: KeyType, V: ValueType> RangeIter<K, V> {
    pub(crate) fn new(
        pool: Arc<BufferPool>,
        first_leaf: PageId,
        lo: Option<K>,
        hi: Option<K>,
    ) -> Self {
        Self {
            pool,
            entries: VecDeque::new(),
            next_leaf: first_leaf,
            lo,
            hi,
            finished: false,
        }
    }

    fn load_next_leaf(&mut self) -> KvResult<bool> {
        if self.next_leaf == INVALID_PAGE_ID {
            return Ok(false);
        }
        let guard = PageGuard::fetch(&self.pool, self.next_leaf)?;
        let node = guard.with_data(Node::<K, V>::decode)?;
        match node {
            Node::Leaf(leaf) => {
                self.next_leaf = leaf.next_leaf;
                self.entries = leaf.keys.into_iter().zip(leaf.values).collect();
                Ok(true)
            }
            Node::Internal(_) => Err(KvError::corruption(format!(
                "leaf chain points at internal node {}",
                guard.pid()
            ))),
        }
    }
}

impl<K: KeyType, V: ValueType> Iterator for RangeIter<K, V> {
    type Item = KvResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.entries.pop_front() {
                Some((key, value)) => {
                    if let Some(lo) = &self.lo {
                        // only the first leaf can hold keys below the bound
                        if key < *lo {
                            continue;
                        }
                    }
                    if let Some(hi) = &self.hi {
                        if key > *hi {
                            self.finished = true;
                            return None;
                        }
                    }
                    return Some(Ok((key, value)));
                }
                None => {
                    match self.load_next_leaf() {
                        Ok(true) => continue,
                        Ok(false) => {
                            self.finished = true;
                            return None;
                        }
                        Err(e) => {
                            self.finished = true;
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}
