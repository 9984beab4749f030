//! The disk-resident B+ tree.
//!
//! Every operation follows the same page discipline: fetch the page
//! through the buffer pool (which pins it), materialize the node,
//! operate on the value, serialize it back into the page if it changed,
//! and let the guard unpin on scope exit. Pages on the path of one
//! logical operation stay pinned until all dirty images are serialized,
//! so mid-flight eviction cannot tear an operation apart.

use std::marker::PhantomData;
use std::sync::Arc;

use log::debug;

use crate::{
    btree::{
        iter::RangeIter,
        node::{InternalNode, LeafNode, Node},
    },
    error::KvError,
    storage::{
        buffer_pool::{BufferPool, PageGuard},
        cell::{KeyType, ValueType},
        page::{PageId, INVALID_PAGE_ID, METADATA_PAGE_ID},
    },
    types::KvResult,
};

/// Result of an insert that overflowed a child: the separator to add to
/// the parent and the page id of the new right sibling.
struct Split<K> {
    key: K,
    right_pid: PageId,
}

#[derive(Debug, Clone, Copy)]
pub struct TreeStats {
    pub depth: usize,
    pub leaf_nodes: u64,
    pub internal_nodes: u64,
    pub keys: u64,
    pub order: usize,
}

impl TreeStats {
    /// Mean number of keys per leaf relative to the order.
    pub fn mean_leaf_fill(&self) -> f64 {
        if self.leaf_nodes == 0 {
            return 0.0;
        }
        self.keys as f64 / (self.leaf_nodes as f64 * self.order as f64)
    }
}

pub struct BTree<K, V> {
    pool: Arc<BufferPool>,
    /// Maximum number of keys a node may hold before it must split.
    order: usize,
    _marker: PhantomData<(K, V)>,
}

impl<K: KeyType, V: ValueType> BTree<K, V> {
    /// Open the tree stored in the pool's data file. A fresh file gets a
    /// metadata page and an empty root leaf.
    pub fn open(pool: Arc<BufferPool>, order: usize) -> KvResult<Self> {
        if order < 2 {
            return Err(KvError::precondition(format!(
                "tree order must be at least 2, got {}",
                order
            )));
        }
        let tree = Self {
            pool,
            order,
            _marker: PhantomData,
        };

        if tree.pool.num_disk_pages() == 0 {
            let meta_pid = tree.pool.allocate_page_id();
            debug_assert_eq!(meta_pid, METADATA_PAGE_ID);

            let mut root_guard = PageGuard::alloc(&tree.pool)?;
            let root_pid = root_guard.pid();
            root_guard.write_body(&Node::<K, V>::Leaf(LeafNode::empty()).encode())?;
            drop(root_guard);

            tree.set_root_page_id(root_pid)?;
            tree.pool.flush_all()?;
            tree.pool.sync()?;
            debug!("fresh tree initialized, root page: {}", root_pid);
        } else {
            let root = tree.root_page_id()?;
            if root == METADATA_PAGE_ID || root == INVALID_PAGE_ID {
                return Err(KvError::corruption(format!(
                    "metadata page holds no usable root page id ({})",
                    root
                )));
            }
        }
        Ok(tree)
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn root_page_id(&self) -> KvResult<PageId> {
        let guard = PageGuard::fetch(&self.pool, METADATA_PAGE_ID)?;
        let root = guard.with_data(|data| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[0..8]);
            u64::from_be_bytes(buf)
        });
        Ok(root)
    }

    fn set_root_page_id(&self, root: PageId) -> KvResult {
        let mut guard = PageGuard::fetch(&self.pool, METADATA_PAGE_ID)?;
        guard.write_body(&root.to_be_bytes())?;
        Ok(())
    }

    pub fn get(&self, key: &K) -> KvResult<Option<V>> {
        let mut pid = self.root_page_id()?;
        loop {
            let guard = PageGuard::fetch(&self.pool, pid)?;
            let node = guard.with_data(Node::<K, V>::decode)?;
            match node {
                Node::Leaf(leaf) => {
                    return Ok(match leaf.keys.binary_search(key) {
                        Ok(i) => Some(leaf.values[i].clone()),
                        Err(_) => None,
                    });
                }
                Node::Internal(internal) => {
                    pid = internal.children[internal.child_index(key)];
                }
            }
        }
    }

    /// Insert the pair, overwriting the value if the key exists. Splits
    /// full nodes on the way back up and grows a new root when the old
    /// root itself split.
    pub fn insert(&self, key: &K, value: &V) -> KvResult {
        let root_pid = self.root_page_id()?;
        if let Some(split) = self.insert_into(root_pid, key, value)? {
            let mut guard = PageGuard::alloc(&self.pool)?;
            let new_root_pid = guard.pid();
            let new_root: InternalNode<K> = InternalNode {
                keys: vec![split.key],
                children: vec![root_pid, split.right_pid],
            };
            guard.write_body(&Node::<K, V>::Internal(new_root).encode())?;
            drop(guard);

            self.set_root_page_id(new_root_pid)?;
            debug!("root split, new root page: {}", new_root_pid);
        }
        Ok(())
    }

    fn insert_into(&self, pid: PageId, key: &K, value: &V) -> KvResult<Option<Split<K>>> {
        let mut guard = PageGuard::fetch(&self.pool, pid)?;
        let node = guard.with_data(Node::<K, V>::decode)?;
        match node {
            Node::Leaf(mut leaf) => {
                match leaf.keys.binary_search(key) {
                    Ok(i) => {
                        // duplicate insert overwrites
                        leaf.values[i] = value.clone();
                        guard.write_body(&Node::Leaf(leaf).encode())?;
                        return Ok(None);
                    }
                    Err(i) => {
                        leaf.keys.insert(i, key.clone());
                        leaf.values.insert(i, value.clone());
                    }
                }

                if leaf.keys.len() <= self.order {
                    guard.write_body(&Node::Leaf(leaf).encode())?;
                    return Ok(None);
                }

                // overflow: move the upper half to a new right sibling
                // and splice it into the leaf chain
                let (promoted, mut right) = leaf.split();
                let mut right_guard = PageGuard::alloc(&self.pool)?;
                let right_pid = right_guard.pid();
                right.next_leaf = leaf.next_leaf;
                leaf.next_leaf = right_pid;
                right_guard.write_body(&Node::Leaf(right).encode())?;
                guard.write_body(&Node::Leaf(leaf).encode())?;
                Ok(Some(Split {
                    key: promoted,
                    right_pid,
                }))
            }
            Node::Internal(mut internal) => {
                let child_index = internal.child_index(key);
                let child_pid = internal.children[child_index];
                let child_split = self.insert_into(child_pid, key, value)?;

                let split = match child_split {
                    None => return Ok(None),
                    Some(split) => split,
                };

                internal.keys.insert(child_index, split.key);
                internal.children.insert(child_index + 1, split.right_pid);

                if internal.keys.len() <= self.order {
                    guard.write_body(&Node::<K, V>::Internal(internal).encode())?;
                    return Ok(None);
                }

                let (promoted, right) = internal.split();
                let mut right_guard = PageGuard::alloc(&self.pool)?;
                let right_pid = right_guard.pid();
                right_guard.write_body(&Node::<K, V>::Internal(right).encode())?;
                guard.write_body(&Node::<K, V>::Internal(internal).encode())?;
                Ok(Some(Split {
                    key: promoted,
                    right_pid,
                }))
            }
        }
    }

    /// Remove the key. Returns whether it was present. No borrowing or
    /// merging happens on underflow; the only structural response is
    /// dropping emptied children and shrinking an emptied internal root.
    pub fn delete(&self, key: &K) -> KvResult<bool> {
        let root_pid = self.root_page_id()?;
        let (removed, _) = self.delete_from(root_pid, key)?;
        if removed {
            self.shrink_root()?;
        }
        Ok(removed)
    }

    fn delete_from(&self, pid: PageId, key: &K) -> KvResult<(bool, bool)> {
        let mut guard = PageGuard::fetch(&self.pool, pid)?;
        let node = guard.with_data(Node::<K, V>::decode)?;
        match node {
            Node::Leaf(mut leaf) => match leaf.keys.binary_search(key) {
                Ok(i) => {
                    leaf.keys.remove(i);
                    leaf.values.remove(i);
                    let emptied = leaf.keys.is_empty();
                    if leaf.keys.len() < self.order / 2 {
                        debug!(
                            "leaf {} under half occupancy after delete ({} keys)",
                            pid,
                            leaf.keys.len()
                        );
                    }
                    guard.write_body(&Node::Leaf(leaf).encode())?;
                    Ok((true, emptied))
                }
                Err(_) => Ok((false, false)),
            },
            Node::Internal(mut internal) => {
                let child_index = internal.child_index(key);
                let child_pid = internal.children[child_index];
                let (removed, child_emptied) = self.delete_from(child_pid, key)?;

                if !child_emptied {
                    return Ok((removed, false));
                }

                // The emptied child is unlinked and becomes an orphan
                // page. One separator goes with it.
                internal.children.remove(child_index);
                if !internal.keys.is_empty() {
                    let key_index = child_index.saturating_sub(1);
                    internal.keys.remove(key_index);
                }
                let emptied = internal.children.is_empty();
                guard.write_body(&Node::<K, V>::Internal(internal).encode())?;
                Ok((removed, emptied))
            }
        }
    }

    /// Promote the sole child of an emptied internal root. Repeats in
    /// case the promoted child is itself an emptied internal node.
    fn shrink_root(&self) -> KvResult {
        loop {
            let root_pid = self.root_page_id()?;
            let guard = PageGuard::fetch(&self.pool, root_pid)?;
            let node = guard.with_data(Node::<K, V>::decode)?;
            let sole_child = match node {
                Node::Internal(ref internal)
                    if internal.keys.is_empty() && internal.children.len() == 1 =>
                {
                    internal.children[0]
                }
                _ => return Ok(()),
            };
            drop(guard);
            self.set_root_page_id(sole_child)?;
            debug!("root shrink, page {} replaces {}", sole_child, root_pid);
        }
    }

    /// Inclusive range scan. The cursor walks the leaf chain and holds at
    /// most one leaf in memory at a time.
    pub fn range(&self, lo: &K, hi: &K) -> KvResult<RangeIter<K, V>> {
        let leaf_pid = self.find_leaf(lo)?;
        Ok(RangeIter::new(
            self.pool.clone(),
            leaf_pid,
            Some(lo.clone()),
            Some(hi.clone()),
        ))
    }

    /// Scan every live pair in key order.
    pub fn scan_all(&self) -> KvResult<RangeIter<K, V>> {
        let leaf_pid = self.leftmost_leaf()?;
        Ok(RangeIter::new(self.pool.clone(), leaf_pid, None, None))
    }

    fn find_leaf(&self, key: &K) -> KvResult<PageId> {
        let mut pid = self.root_page_id()?;
        loop {
            let guard = PageGuard::fetch(&self.pool, pid)?;
            let node = guard.with_data(Node::<K, V>::decode)?;
            match node {
                Node::Leaf(_) => return Ok(pid),
                Node::Internal(internal) => {
                    pid = internal.children[internal.child_index(key)];
                }
            }
        }
    }

    fn leftmost_leaf(&self) -> KvResult<PageId> {
        let mut pid = self.root_page_id()?;
        loop {
            let guard = PageGuard::fetch(&self.pool, pid)?;
            let node = guard.with_data(Node::<K, V>::decode)?;
            match node {
                Node::Leaf(_) => return Ok(pid),
                Node::Internal(internal) => pid = internal.children[0],
            }
        }
    }

    /// Walk the whole tree and verify its structural invariants: key
    /// ordering inside nodes, separator bounds between parent and child,
    /// uniform leaf depth, and the leaf chain visiting every live key in
    /// ascending order.
    pub fn check_integrity(&self) -> KvResult {
        let root_pid = self.root_page_id()?;
        let mut leaf_depth = None;
        let tree_keys = self.check_node(root_pid, None, None, 0, &mut leaf_depth)?;

        let mut chain_keys = 0u64;
        let mut prev: Option<K> = None;
        for item in self.scan_all()? {
            let (key, _) = item?;
            if let Some(prev) = &prev {
                if *prev >= key {
                    return Err(KvError::corruption(format!(
                        "leaf chain out of order near {:?}",
                        key
                    )));
                }
            }
            prev = Some(key);
            chain_keys += 1;
        }
        if chain_keys != tree_keys {
            return Err(KvError::corruption(format!(
                "leaf chain holds {} keys but the tree holds {}",
                chain_keys, tree_keys
            )));
        }
        Ok(())
    }

    fn check_node(
        &self,
        pid: PageId,
        lower: Option<&K>,
        upper: Option<&K>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> KvResult<u64> {
        let guard = PageGuard::fetch(&self.pool, pid)?;
        let node = guard.with_data(Node::<K, V>::decode)?;
        drop(guard);

        let keys = match &node {
            Node::Leaf(leaf) => &leaf.keys,
            Node::Internal(internal) => &internal.keys,
        };
        for pair in keys.windows(2) {
            if pair[0] >= pair[1] {
                return Err(KvError::corruption(format!(
                    "keys out of order in node {}",
                    pid
                )));
            }
        }
        if let (Some(lower), Some(first)) = (lower, keys.first()) {
            if first < lower {
                return Err(KvError::corruption(format!(
                    "node {} violates its lower separator bound",
                    pid
                )));
            }
        }
        if let (Some(upper), Some(last)) = (upper, keys.last()) {
            if last >= upper {
                return Err(KvError::corruption(format!(
                    "node {} violates its upper separator bound",
                    pid
                )));
            }
        }

        match node {
            Node::Leaf(leaf) => {
                match leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(expected) if *expected != depth => {
                        return Err(KvError::corruption(format!(
                            "leaf {} at depth {}, expected {}",
                            pid, depth, expected
                        )));
                    }
                    _ => {}
                }
                Ok(leaf.keys.len() as u64)
            }
            Node::Internal(internal) => {
                if internal.children.len() != internal.keys.len() + 1 {
                    return Err(KvError::corruption(format!(
                        "internal node {} has {} keys but {} children",
                        pid,
                        internal.keys.len(),
                        internal.children.len()
                    )));
                }
                let mut count = 0;
                for (i, child) in internal.children.iter().enumerate() {
                    let child_lower = if i == 0 {
                        lower
                    } else {
                        Some(&internal.keys[i - 1])
                    };
                    let child_upper = if i == internal.keys.len() {
                        upper
                    } else {
                        Some(&internal.keys[i])
                    };
                    count +=
                        self.check_node(*child, child_lower, child_upper, depth + 1, leaf_depth)?;
                }
                Ok(count)
            }
        }
    }

    /// Render the tree structure level by level, for debugging. Callers
    /// usually feed this to `debug!`.
    pub fn draw(&self) -> KvResult<String> {
        let mut depiction = String::new();
        depiction.push_str("\n----- TREE STRUCTURE START -----\n");
        let root_pid = self.root_page_id()?;
        self.draw_subtree(root_pid, 0, &mut depiction)?;
        depiction.push_str("----- TREE STRUCTURE END   -----\n");
        Ok(depiction)
    }

    fn draw_subtree(&self, pid: PageId, level: usize, depiction: &mut String) -> KvResult {
        let guard = PageGuard::fetch(&self.pool, pid)?;
        let node = guard.with_data(Node::<K, V>::decode)?;
        drop(guard);

        let prefix = "│   ".repeat(level);
        match node {
            Node::Leaf(leaf) => {
                let first = leaf.keys.first();
                let last = leaf.keys.last();
                depiction.push_str(&format!(
                    "{}├── leaf {}: {} key(s), range [{:?}, {:?}], next {}\n",
                    prefix,
                    pid,
                    leaf.keys.len(),
                    first,
                    last,
                    if leaf.next_leaf == INVALID_PAGE_ID {
                        "none".to_string()
                    } else {
                        leaf.next_leaf.to_string()
                    }
                ));
            }
            Node::Internal(internal) => {
                depiction.push_str(&format!(
                    "{}├── internal {}: {} key(s), {} children\n",
                    prefix,
                    pid,
                    internal.keys.len(),
                    internal.children.len()
                ));
                for child in &internal.children {
                    self.draw_subtree(*child, level + 1, depiction)?;
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> KvResult<TreeStats> {
        let mut stats = TreeStats {
            depth: 0,
            leaf_nodes: 0,
            internal_nodes: 0,
            keys: 0,
            order: self.order,
        };
        let root_pid = self.root_page_id()?;
        self.collect_stats(root_pid, 1, &mut stats)?;
        Ok(stats)
    }

    fn collect_stats(&self, pid: PageId, depth: usize, stats: &mut TreeStats) -> KvResult {
        let guard = PageGuard::fetch(&self.pool, pid)?;
        let node = guard.with_data(Node::<K, V>::decode)?;
        drop(guard);

        stats.depth = stats.depth.max(depth);
        match node {
            Node::Leaf(leaf) => {
                stats.leaf_nodes += 1;
                stats.keys += leaf.keys.len() as u64;
            }
            Node::Internal(internal) => {
                stats.internal_nodes += 1;
                for child in &internal.children {
                    self.collect_stats(*child, depth + 1, stats)?;
                }
            }
        }
        Ok(())
    }

    /// Build a densely packed tree from sorted, unique entries into a
    /// fresh data file: leaves are filled to the order, then the internal
    /// levels grow bottom-up. The offline rebalance tool is the caller.
    pub fn bulk_load(
        pool: Arc<BufferPool>,
        order: usize,
        entries: &[(K, V)],
    ) -> KvResult<BTree<K, V>> {
        if order < 2 {
            return Err(KvError::precondition(format!(
                "tree order must be at least 2, got {}",
                order
            )));
        }
        if pool.num_disk_pages() != 0 {
            return Err(KvError::precondition(
                "bulk load requires a fresh data file",
            ));
        }
        for pair in entries.windows(2) {
            if pair[0].0 >= pair[1].0 {
                return Err(KvError::precondition(
                    "bulk load input must be sorted by strictly increasing key",
                ));
            }
        }

        let tree = Self {
            pool,
            order,
            _marker: PhantomData,
        };
        let meta_pid = tree.pool.allocate_page_id();
        debug_assert_eq!(meta_pid, METADATA_PAGE_ID);

        if entries.is_empty() {
            let mut guard = PageGuard::alloc(&tree.pool)?;
            let root_pid = guard.pid();
            guard.write_body(&Node::<K, V>::Leaf(LeafNode::empty()).encode())?;
            drop(guard);
            tree.set_root_page_id(root_pid)?;
            tree.pool.flush_all()?;
            tree.pool.sync()?;
            return Ok(tree);
        }

        // stage 1: pack the leaf level and thread the chain
        let chunks: Vec<&[(K, V)]> = entries.chunks(order).collect();
        let leaf_pids: Vec<PageId> = chunks.iter().map(|_| tree.pool.allocate_page_id()).collect();
        let mut level: Vec<(K, PageId)> = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let leaf = LeafNode {
                keys: chunk.iter().map(|(k, _)| k.clone()).collect(),
                values: chunk.iter().map(|(_, v)| v.clone()).collect(),
                next_leaf: leaf_pids.get(i + 1).copied().unwrap_or(INVALID_PAGE_ID),
            };
            let mut guard = PageGuard::fetch(&tree.pool, leaf_pids[i])?;
            guard.write_body(&Node::Leaf(leaf).encode())?;
            level.push((chunk[0].0.clone(), leaf_pids[i]));
        }

        // stage 2: grow internal levels until one node remains
        let fanout = order + 1;
        while level.len() > 1 {
            let groups = crate::utils::ceil_div(level.len(), fanout);
            let base = level.len() / groups;
            let extra = level.len() % groups;

            let mut next_level: Vec<(K, PageId)> = Vec::with_capacity(groups);
            let mut start = 0;
            for g in 0..groups {
                let len = if g < extra { base + 1 } else { base };
                let group = &level[start..start + len];
                start += len;

                let internal: InternalNode<K> = InternalNode {
                    keys: group[1..].iter().map(|(k, _)| k.clone()).collect(),
                    children: group.iter().map(|(_, pid)| *pid).collect(),
                };
                let pid = tree.pool.allocate_page_id();
                let mut guard = PageGuard::fetch(&tree.pool, pid)?;
                guard.write_body(&Node::<K, V>::Internal(internal).encode())?;
                next_level.push((group[0].0.clone(), pid));
            }
            level = next_level;
        }

        tree.set_root_page_id(level[0].1)?;
        tree.pool.flush_all()?;
        tree.pool.sync()?;
        Ok(tree)
    }
}
