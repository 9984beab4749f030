pub mod iter;
pub mod node;
pub mod tree;

pub use iter::RangeIter;
pub use tree::{BTree, TreeStats};
