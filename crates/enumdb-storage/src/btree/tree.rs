//! Int-to-int B-tree operations.

use super::header::{TreeHeader, HEADER_SIZE};
use super::node::{node_size, Node};
use super::{BTreeConfig, MAX_CHILDREN, MIN_CHILDREN};
use crate::storage::ByteStorage;
use enumdb_common::{ByteOrder, Result, StorageError};
use tracing::{debug, warn};

/// Index of the first tree node; node 0 holds the header.
const FIRST_NODE: u32 = 1;

/// Persistent B-tree from `i32` keys to `i32` values.
///
/// Lookups take `&self`, mutations `&mut self`: one writer at a time, and
/// callers sharing a tree across threads wrap it in a lock.
pub struct IntToIntBTree {
    storage: Box<dyn ByteStorage>,
    header: TreeHeader,
    order: ByteOrder,
    node_size: usize,
}

impl IntToIntBTree {
    /// Opens the tree stored in `storage`, creating it if the storage is empty.
    ///
    /// An existing tree keeps the branching factor recorded in its header.
    pub fn open(storage: Box<dyn ByteStorage>, config: &BTreeConfig) -> Result<Self> {
        config.validate()?;
        if storage.is_empty()? {
            return Self::create(storage, config);
        }

        let order = storage.byte_order();
        let mut buf = [0u8; HEADER_SIZE];
        storage.read(0, &mut buf)?;
        let header = TreeHeader::decode(&buf, order)?;
        Self::check_header(&header, storage.len()?)?;

        if header.max_children != config.max_children {
            warn!(
                path = %storage.path().display(),
                stored = header.max_children,
                requested = config.max_children,
                "keeping stored B-tree branching factor"
            );
        }
        debug!(
            path = %storage.path().display(),
            entries = header.entry_count,
            height = header.height,
            nodes = header.node_count,
            "opened B-tree"
        );

        Ok(Self {
            node_size: header.node_size as usize,
            storage,
            header,
            order,
        })
    }

    /// Initializes an empty tree, discarding any previous content.
    pub fn create(storage: Box<dyn ByteStorage>, config: &BTreeConfig) -> Result<Self> {
        config.validate()?;
        if !storage.is_empty()? {
            storage.set_len(0)?;
        }
        let node_size = node_size(config.max_children);
        let mut tree = Self {
            order: storage.byte_order(),
            storage,
            header: TreeHeader {
                max_children: config.max_children,
                node_size: node_size as u32,
                root: FIRST_NODE,
                height: 1,
                node_count: FIRST_NODE + 1,
                entry_count: 0,
            },
            node_size,
        };
        tree.write_node(&Node::new_leaf(FIRST_NODE))?;
        tree.write_header()?;
        debug!(
            path = %tree.storage.path().display(),
            max_children = config.max_children,
            "created B-tree"
        );
        Ok(tree)
    }

    fn check_header(header: &TreeHeader, storage_len: u64) -> Result<()> {
        if !(MIN_CHILDREN..=MAX_CHILDREN).contains(&header.max_children) {
            return Err(StorageError::corrupted(format!(
                "B-tree branching factor {} out of range",
                header.max_children
            )));
        }
        if header.node_size as usize != node_size(header.max_children) {
            return Err(StorageError::corrupted(format!(
                "B-tree node size {} does not match branching factor {}",
                header.node_size, header.max_children
            )));
        }
        if header.node_count <= FIRST_NODE
            || header.root < FIRST_NODE
            || header.root >= header.node_count
            || header.height == 0
        {
            return Err(StorageError::corrupted(format!(
                "B-tree header inconsistent: root {}, height {}, nodes {}",
                header.root, header.height, header.node_count
            )));
        }
        let required = header.node_count as u64 * header.node_size as u64;
        if storage_len < required {
            return Err(StorageError::corrupted(format!(
                "B-tree file holds {storage_len} bytes, {} nodes need {required}",
                header.node_count
            )));
        }
        Ok(())
    }

    /// Number of key/value pairs.
    pub fn len(&self) -> u64 {
        self.header.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.header.entry_count == 0
    }

    /// Levels from root to leaves (1 for a lone root leaf).
    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn max_children(&self) -> u32 {
        self.header.max_children
    }

    /// Allocated nodes, including the header node.
    pub fn node_count(&self) -> u32 {
        self.header.node_count
    }

    pub fn storage(&self) -> &dyn ByteStorage {
        self.storage.as_ref()
    }

    fn read_node(&self, index: u32) -> Result<Node> {
        if index < FIRST_NODE || index >= self.header.node_count {
            return Err(StorageError::corrupted(format!(
                "node index {index} outside 1..{}",
                self.header.node_count
            )));
        }
        let mut buf = vec![0u8; self.node_size];
        self.storage
            .read(index as u64 * self.node_size as u64, &mut buf)?;
        Node::decode(
            index,
            &buf,
            self.header.max_children,
            self.header.node_count,
            self.order,
        )
    }

    fn write_node(&mut self, node: &Node) -> Result<()> {
        let mut buf = vec![0u8; self.node_size];
        node.encode(self.header.max_children, self.order, &mut buf);
        self.storage
            .write(node.index as u64 * self.node_size as u64, &buf)
    }

    fn write_header(&mut self) -> Result<()> {
        self.storage.write(0, &self.header.encode(self.order))
    }

    fn allocate_node(&mut self) -> Result<u32> {
        let index = self.header.node_count;
        self.header.node_count = index
            .checked_add(1)
            .ok_or_else(|| StorageError::corrupted("B-tree node count overflow"))?;
        Ok(index)
    }

    /// Looks up the value stored for `key`.
    pub fn get(&self, key: i32) -> Result<Option<i32>> {
        let mut index = self.header.root;
        for _ in 0..self.header.height {
            let node = self.read_node(index)?;
            match node.keys.binary_search(&key) {
                Ok(i) => return Ok(Some(node.values[i])),
                Err(_) if node.is_leaf() => return Ok(None),
                Err(i) => index = node.children[i],
            }
        }
        Err(StorageError::corrupted(format!(
            "B-tree path longer than height {}",
            self.header.height
        )))
    }

    /// Stores `value` under `key` and returns the value it replaced.
    pub fn put(&mut self, key: i32, value: i32) -> Result<Option<i32>> {
        // Internal nodes visited on the way down, with the child slot taken
        let mut path: Vec<(Node, usize)> = Vec::with_capacity(self.header.height as usize);
        let mut index = self.header.root;

        let mut node = loop {
            if path.len() >= self.header.height as usize {
                return Err(StorageError::corrupted(format!(
                    "B-tree path longer than height {}",
                    self.header.height
                )));
            }
            let mut node = self.read_node(index)?;
            match node.keys.binary_search(&key) {
                Ok(i) => {
                    let previous = std::mem::replace(&mut node.values[i], value);
                    if previous != value {
                        self.write_node(&node)?;
                    }
                    return Ok(Some(previous));
                }
                Err(i) if node.is_leaf() => {
                    node.keys.insert(i, key);
                    node.values.insert(i, value);
                    break node;
                }
                Err(i) => {
                    index = node.children[i];
                    path.push((node, i));
                }
            }
        };
        self.header.entry_count += 1;

        let capacity = self.header.max_children as usize - 1;
        loop {
            if node.keys.len() <= capacity {
                self.write_node(&node)?;
                break;
            }

            let (median_key, median_value, right) = self.split(&mut node)?;
            self.write_node(&node)?;
            self.write_node(&right)?;

            match path.pop() {
                Some((mut parent, slot)) => {
                    parent.keys.insert(slot, median_key);
                    parent.values.insert(slot, median_value);
                    parent.children.insert(slot + 1, right.index);
                    node = parent;
                }
                None => {
                    let root = Node {
                        index: self.allocate_node()?,
                        keys: vec![median_key],
                        values: vec![median_value],
                        children: vec![node.index, right.index],
                    };
                    self.write_node(&root)?;
                    self.header.root = root.index;
                    self.header.height += 1;
                    debug!(root = root.index, height = self.header.height, "B-tree grew a level");
                    break;
                }
            }
        }

        self.write_header()?;
        Ok(None)
    }

    /// Splits an overfull node in place.
    ///
    /// Returns the median pair to promote and the new right sibling.
    fn split(&mut self, node: &mut Node) -> Result<(i32, i32, Node)> {
        let mid = node.keys.len() / 2;
        let right_keys = node.keys.split_off(mid + 1);
        let right_values = node.values.split_off(mid + 1);
        let right_children = if node.is_leaf() {
            Vec::new()
        } else {
            node.children.split_off(mid + 1)
        };
        let (Some(median_key), Some(median_value)) = (node.keys.pop(), node.values.pop()) else {
            return Err(StorageError::corrupted("split of an empty node"));
        };

        let right = Node {
            index: self.allocate_node()?,
            keys: right_keys,
            values: right_values,
            children: right_children,
        };
        debug!(left = node.index, right = right.index, median = median_key, "split B-tree node");
        Ok((median_key, median_value, right))
    }

    /// Visits every pair in ascending key order.
    ///
    /// Stops as soon as `visitor` returns false; the result tells whether the
    /// traversal ran to completion.
    pub fn process_mappings(&self, mut visitor: impl FnMut(i32, i32) -> bool) -> Result<bool> {
        self.visit(self.header.root, 0, &mut visitor)
    }

    fn visit(&self, index: u32, depth: u32, visitor: &mut dyn FnMut(i32, i32) -> bool) -> Result<bool> {
        if depth >= self.header.height {
            return Err(StorageError::corrupted(format!(
                "B-tree path longer than height {}",
                self.header.height
            )));
        }
        let node = self.read_node(index)?;
        for (i, (&key, &value)) in node.keys.iter().zip(&node.values).enumerate() {
            if !node.is_leaf() && !self.visit(node.children[i], depth + 1, visitor)? {
                return Ok(false);
            }
            if !visitor(key, value) {
                return Ok(false);
            }
        }
        match node.children.last() {
            Some(&last) => self.visit(last, depth + 1, visitor),
            None => Ok(true),
        }
    }

    /// Writes the header and makes every change durable.
    pub fn force(&mut self) -> Result<()> {
        if !self.storage.is_read_only() {
            self.write_header()?;
        }
        self.storage.force()
    }

    pub fn close(&mut self) -> Result<()> {
        if self.storage.is_closed() {
            return Ok(());
        }
        let forced = self.force();
        let closed = self.storage.close();
        debug!(path = %self.storage.path().display(), "closed B-tree");
        forced.and(closed)
    }

    pub fn is_closed(&self) -> bool {
        self.storage.is_closed()
    }
}

impl std::fmt::Debug for IntToIntBTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntToIntBTree")
            .field("path", &self.storage.path())
            .field("header", &self.header)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryStorage;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use std::path::Path;

    fn memory_tree(max_children: u32) -> IntToIntBTree {
        let storage = Box::new(InMemoryStorage::new(Path::new("tree"), ByteOrder::BigEndian));
        IntToIntBTree::open(storage, &BTreeConfig { max_children }).unwrap()
    }

    fn collect(tree: &IntToIntBTree) -> Vec<(i32, i32)> {
        let mut pairs = Vec::new();
        assert!(tree
            .process_mappings(|k, v| {
                pairs.push((k, v));
                true
            })
            .unwrap());
        pairs
    }

    #[test]
    fn test_empty_tree() {
        let tree = memory_tree(4);
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.get(42).unwrap(), None);
        assert!(collect(&tree).is_empty());
    }

    #[test]
    fn test_splits_with_small_fanout() {
        let mut tree = memory_tree(4);
        for key in [5, 3, 8, 1, 4, 7, 9, 2, 6] {
            assert_eq!(tree.put(key, key * 10).unwrap(), None);
        }
        assert_eq!(tree.len(), 9);
        assert!(tree.height() > 1);
        for key in 1..=9 {
            assert_eq!(tree.get(key).unwrap(), Some(key * 10));
        }
        assert_eq!(tree.get(0).unwrap(), None);
        assert_eq!(tree.get(10).unwrap(), None);

        let keys: Vec<i32> = collect(&tree).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn test_overwrite_in_place() {
        let mut tree = memory_tree(4);
        for key in 0..50 {
            tree.put(key, 1).unwrap();
        }
        let nodes = tree.node_count();
        // Keys promoted into internal nodes are overwritten where they live
        for key in 0..50 {
            assert_eq!(tree.put(key, key + 100).unwrap(), Some(1));
        }
        assert_eq!(tree.len(), 50);
        assert_eq!(tree.node_count(), nodes);
        for key in 0..50 {
            assert_eq!(tree.get(key).unwrap(), Some(key + 100));
        }
    }

    #[test]
    fn test_signed_keys_ordering() {
        let mut tree = memory_tree(5);
        for key in [0, -1, i32::MIN, i32::MAX, 17, -17, 1] {
            tree.put(key, key.wrapping_mul(3)).unwrap();
        }
        let keys: Vec<i32> = collect(&tree).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![i32::MIN, -17, -1, 0, 1, 17, i32::MAX]);
    }

    #[test]
    fn test_ascending_and_descending_inserts() {
        let mut ascending = memory_tree(4);
        let mut descending = memory_tree(4);
        for key in 0..500 {
            ascending.put(key, key).unwrap();
            descending.put(499 - key, key).unwrap();
        }
        assert_eq!(collect(&ascending).len(), 500);
        assert_eq!(collect(&descending).len(), 500);
        for key in 0..500 {
            assert_eq!(ascending.get(key).unwrap(), Some(key));
            assert_eq!(descending.get(key).unwrap(), Some(499 - key));
        }
    }

    #[test]
    fn test_traversal_stops_early() {
        let mut tree = memory_tree(4);
        for key in 0..100 {
            tree.put(key, key).unwrap();
        }
        let mut seen = Vec::new();
        let completed = tree
            .process_mappings(|k, _| {
                seen.push(k);
                k < 41
            })
            .unwrap();
        assert!(!completed);
        assert_eq!(seen, (0..=41).collect::<Vec<_>>());
    }

    #[test]
    fn test_random_against_reference() {
        let mut rng = StdRng::seed_from_u64(0x1213);
        let mut tree = memory_tree(6);
        let mut reference = BTreeMap::new();
        for _ in 0..5_000 {
            let key = rng.random_range(-2_000..2_000);
            let value: i32 = rng.random();
            assert_eq!(tree.put(key, value).unwrap(), reference.insert(key, value));
        }
        assert_eq!(tree.len(), reference.len() as u64);
        let expected: Vec<(i32, i32)> = reference.into_iter().collect();
        assert_eq!(collect(&tree), expected);
    }

    #[test]
    fn test_corrupt_child_pointer_detected() {
        let mut tree = memory_tree(4);
        for key in 0..20 {
            tree.put(key, key).unwrap();
        }
        // Point the root's first child far outside the tree
        let root_offset = tree.header.root as u64 * tree.node_size as u64;
        let children_at = root_offset + 8 + 3 * 8;
        tree.storage.put_i32(children_at, 9_999).unwrap();

        assert!(tree.get(-1).unwrap_err().is_corruption());
        assert!(tree.process_mappings(|_, _| true).unwrap_err().is_corruption());
    }

    #[test]
    fn test_closed_tree() {
        let mut tree = memory_tree(4);
        tree.put(1, 1).unwrap();
        tree.close().unwrap();
        assert!(tree.is_closed());
        assert!(tree.get(1).unwrap_err().is_closed());
        assert!(tree.put(2, 2).unwrap_err().is_closed());
    }
}
