//! In-memory node images and their page body codec.
//!
//! A node is materialized from a page on demand, operated on as a plain
//! value, and serialized back if it changed. It never retains a page
//! reference beyond the operation.
//!
//! # Page body format
//!
//! Shared header: 1 node-kind byte, then a u32 key count, then that many
//! length-prefixed key encodings.
//!
//! - Leaf tail: u64 next-leaf page id (invalid sentinel on the last
//!   leaf), then the length-prefixed value encodings.
//! - Internal tail: key count + 1 child page ids, each u64.

use crate::{
    error::KvError,
    io::{Decodeable, Encodeable, SmallReader, SmallWriter},
    storage::{
        cell::{KeyType, ValueType},
        page::PageId,
    },
    types::KvResult,
};

const NODE_KIND_LEAF: u8 = 1;
const NODE_KIND_INTERNAL: u8 = 2;

pub enum Node<K, V> {
    Leaf(LeafNode<K, V>),
    Internal(InternalNode<K>),
}

pub struct LeafNode<K, V> {
    pub keys: Vec<K>,
    pub values: Vec<V>,
    pub next_leaf: PageId,
}

pub struct InternalNode<K> {
    pub keys: Vec<K>,
    pub children: Vec<PageId>,
}

impl<K: KeyType, V: ValueType> Node<K, V> {
    pub fn decode(bytes: &[u8]) -> KvResult<Self> {
        let mut reader = SmallReader::new(bytes);
        let kind = reader.read_u8()?;
        match kind {
            NODE_KIND_LEAF => {
                let key_count = reader.read_u32()? as usize;
                let keys = read_cells::<K>(&mut reader, key_count)?;
                let next_leaf = reader.read_u64()?;
                let values = read_cells::<V>(&mut reader, key_count)?;
                Ok(Node::Leaf(LeafNode {
                    keys,
                    values,
                    next_leaf,
                }))
            }
            NODE_KIND_INTERNAL => {
                let key_count = reader.read_u32()? as usize;
                let keys = read_cells::<K>(&mut reader, key_count)?;
                let mut children = Vec::with_capacity(key_count + 1);
                for _ in 0..key_count + 1 {
                    children.push(reader.read_u64()?);
                }
                Ok(Node::Internal(InternalNode { keys, children }))
            }
            other => Err(KvError::corruption(format!(
                "impossible node kind byte {}",
                other
            ))),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = SmallWriter::new();
        match self {
            Node::Leaf(leaf) => {
                writer.write_u8(NODE_KIND_LEAF);
                writer.write_u32(leaf.keys.len() as u32);
                for key in &leaf.keys {
                    writer.write_slot(&key.encode());
                }
                writer.write_u64(leaf.next_leaf);
                for value in &leaf.values {
                    writer.write_slot(&value.encode());
                }
            }
            Node::Internal(node) => {
                writer.write_u8(NODE_KIND_INTERNAL);
                writer.write_u32(node.keys.len() as u32);
                for key in &node.keys {
                    writer.write_slot(&key.encode());
                }
                for child in &node.children {
                    writer.write_u64(*child);
                }
            }
        }
        writer.to_bytes()
    }
}

fn read_cells<T: Decodeable>(reader: &mut SmallReader, count: usize) -> KvResult<Vec<T>> {
    let mut cells = Vec::with_capacity(count);
    for _ in 0..count {
        let slot = reader.read_slot()?;
        cells.push(T::decode(slot)?);
    }
    Ok(cells)
}

impl<K: KeyType, V: ValueType> LeafNode<K, V> {
    pub fn empty() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            next_leaf: crate::storage::page::INVALID_PAGE_ID,
        }
    }

    /// Split off the upper half. The first key of the new right node is
    /// the promoted separator; the leaf keeps its copy.
    pub fn split(&mut self) -> (K, LeafNode<K, V>) {
        let mid = self.keys.len() / 2;
        let right_keys = self.keys.split_off(mid);
        let right_values = self.values.split_off(mid);
        let promoted = right_keys[0].clone();
        let right = LeafNode {
            keys: right_keys,
            values: right_values,
            next_leaf: self.next_leaf,
        };
        (promoted, right)
    }
}

impl<K: KeyType> InternalNode<K> {
    /// Index of the child to descend into: the slot of the smallest key
    /// strictly greater than `key`, or the last child if none is.
    pub fn child_index(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k <= key)
    }

    /// Split off the upper half. The middle key moves up to the parent
    /// and is retained by neither half.
    pub fn split(&mut self) -> (K, InternalNode<K>) {
        let mid = self.keys.len() / 2;
        let right_keys = self.keys.split_off(mid + 1);
        let right_children = self.children.split_off(mid + 1);
        let promoted = self.keys.pop().unwrap();
        let right = InternalNode {
            keys: right_keys,
            children: right_children,
        };
        (promoted, right)
    }
}
