// src/btree.rs
// In-memory B+ tree mapping each key to a bucket of values

use std::fmt::Display;
use std::ops::Bound;

use crate::error::{NestDbError, Result};

// B+ Tree Configuration
const BTREE_ORDER: usize = 32;
const MAX_KEYS: usize = BTREE_ORDER - 1; // 31

/// B+ Tree Node
#[derive(Debug, Clone)]
enum Node<K, V> {
    Internal {
        keys: Vec<K>,
        children: Vec<Box<Node<K, V>>>,
    },
    Leaf {
        keys: Vec<K>,
        values: Vec<Vec<V>>,
    },
}

impl<K, V> Node<K, V> {
    fn empty_leaf() -> Box<Self> {
        Box::new(Node::Leaf {
            keys: Vec::new(),
            values: Vec::new(),
        })
    }

    fn is_empty(&self) -> bool {
        match self {
            Node::Leaf { keys, .. } => keys.is_empty(),
            Node::Internal { children, .. } => children.is_empty(),
        }
    }
}

/// Split result when node overflows
#[derive(Debug)]
struct SplitResult<K, V> {
    key: K,                 // Key to push up
    right: Box<Node<K, V>>, // New right node
}

/// B+ tree where every key owns a bucket of values.
///
/// A unique tree rejects a second value for an existing key. A key disappears
/// once its bucket is empty; emptied nodes are pruned but siblings are never
/// merged.
#[derive(Debug, Clone)]
pub struct BPlusTree<K, V> {
    root: Box<Node<K, V>>,
    field: String,
    unique: bool,
    num_keys: usize,
    tree_height: u32,
}

impl<K, V> BPlusTree<K, V>
where
    K: Ord + Clone + Display,
    V: Clone,
{
    pub fn new(field: impl Into<String>, unique: bool) -> Self {
        BPlusTree {
            root: Node::empty_leaf(),
            field: field.into(),
            unique,
            num_keys: 0,
            tree_height: 1,
        }
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Find the child holding `key`: child[i] has keys < keys[i],
    /// child[i+1] has keys >= keys[i]
    fn child_index(keys: &[K], key: &K) -> usize {
        match keys.binary_search(key) {
            Ok(pos) => pos + 1, // Found exact match in separator -> go right
            Err(pos) => pos,    // Not found -> pos is correct child
        }
    }

    /// Bucket stored under `key`
    pub fn search(&self, key: &K) -> Option<&[V]> {
        let mut node = &self.root;
        loop {
            match node.as_ref() {
                Node::Internal { keys, children } => {
                    node = &children[Self::child_index(keys, key)];
                }
                Node::Leaf { keys, values } => {
                    return keys
                        .binary_search(key)
                        .ok()
                        .map(|idx| values[idx].as_slice());
                }
            }
        }
    }

    /// Add `value` to the bucket of `key`
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        let existing = self.search(&key).is_some();
        if self.unique && existing {
            return Err(NestDbError::UniqueConstraintViolation {
                key: key.to_string(),
                field: self.field.clone(),
            });
        }

        // Take root ownership for mutation
        let old_root = std::mem::replace(&mut self.root, Node::empty_leaf());

        match Self::insert_into_node(old_root, key, value) {
            (new_node, None) => {
                self.root = new_node;
            }
            (left_node, Some(split)) => {
                // Root split - create new root
                self.root = Box::new(Node::Internal {
                    keys: vec![split.key],
                    children: vec![left_node, split.right],
                });
                self.tree_height += 1;
            }
        }

        if !existing {
            self.num_keys += 1;
        }
        Ok(())
    }

    fn insert_into_node(
        mut node: Box<Node<K, V>>,
        key: K,
        value: V,
    ) -> (Box<Node<K, V>>, Option<SplitResult<K, V>>) {
        match *node {
            Node::Leaf {
                ref mut keys,
                ref mut values,
            } => {
                let pos = match keys.binary_search(&key) {
                    Ok(pos) => {
                        values[pos].push(value);
                        return (node, None);
                    }
                    Err(pos) => pos,
                };

                keys.insert(pos, key);
                values.insert(pos, vec![value]);

                if keys.len() <= MAX_KEYS {
                    return (node, None);
                }

                // Split leaf
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid);
                let right_values = values.split_off(mid);
                let split_key = right_keys[0].clone();

                let right = Box::new(Node::Leaf {
                    keys: right_keys,
                    values: right_values,
                });
                (node, Some(SplitResult { key: split_key, right }))
            }
            Node::Internal {
                ref mut keys,
                ref mut children,
            } => {
                let idx = Self::child_index(keys, &key);

                let child = children.remove(idx);
                let (new_child, split_opt) = Self::insert_into_node(child, key, value);
                children.insert(idx, new_child);

                let Some(split) = split_opt else {
                    return (node, None);
                };

                keys.insert(idx, split.key);
                children.insert(idx + 1, split.right);

                if keys.len() <= MAX_KEYS {
                    return (node, None);
                }

                // Split internal node (n+1 children for n keys)
                let mid = keys.len() / 2;
                let right_children = children.split_off(mid + 1);
                let mid_key = keys.remove(mid);
                let right_keys = keys.split_off(mid);

                let right = Box::new(Node::Internal {
                    keys: right_keys,
                    children: right_children,
                });
                (node, Some(SplitResult { key: mid_key, right }))
            }
        }
    }

    /// Remove the values of `key` accepted by `matches`; returns how many went
    pub fn delete<F>(&mut self, key: &K, matches: F) -> usize
    where
        F: FnMut(&V) -> bool,
    {
        let (removed, emptied) = Self::delete_from_node(&mut self.root, key, matches);
        if emptied {
            self.num_keys -= 1;
            self.collapse_root();
        }
        removed
    }

    /// Drop internal roots left with at most one child
    fn collapse_root(&mut self) {
        loop {
            let child = match self.root.as_mut() {
                Node::Internal { children, .. } if children.len() <= 1 => children.pop(),
                _ => return,
            };
            self.root = child.unwrap_or_else(Node::empty_leaf);
            self.tree_height = if self.root.is_empty() { 1 } else { self.tree_height - 1 };
        }
    }

    fn delete_from_node<F>(node: &mut Node<K, V>, key: &K, mut matches: F) -> (usize, bool)
    where
        F: FnMut(&V) -> bool,
    {
        match node {
            Node::Leaf { keys, values } => {
                let Ok(idx) = keys.binary_search(key) else {
                    return (0, false);
                };
                let before = values[idx].len();
                values[idx].retain(|v| !matches(v));
                let removed = before - values[idx].len();

                if values[idx].is_empty() {
                    keys.remove(idx);
                    values.remove(idx);
                    return (removed, true);
                }
                (removed, false)
            }
            Node::Internal { keys, children } => {
                let idx = Self::child_index(keys, key);
                let (removed, emptied) = Self::delete_from_node(&mut children[idx], key, matches);

                // an empty child goes together with the separator on its left
                // (or on its right when it is the first child)
                if children[idx].is_empty() {
                    children.remove(idx);
                    if !keys.is_empty() {
                        keys.remove(idx.saturating_sub(1));
                    }
                }
                (removed, emptied)
            }
        }
    }

    /// Values whose key lies within the bounds, in key order
    pub fn range(&self, lower: Bound<&K>, upper: Bound<&K>) -> Vec<V> {
        let mut results = Vec::new();
        Self::range_node(&self.root, lower, upper, &mut results);
        results
    }

    fn above_upper(key: &K, upper: Bound<&K>) -> bool {
        match upper {
            Bound::Included(end) => key > end,
            Bound::Excluded(end) => key >= end,
            Bound::Unbounded => false,
        }
    }

    fn below_lower(key: &K, lower: Bound<&K>) -> bool {
        match lower {
            Bound::Included(start) => key < start,
            Bound::Excluded(start) => key <= start,
            Bound::Unbounded => false,
        }
    }

    fn range_node(node: &Node<K, V>, lower: Bound<&K>, upper: Bound<&K>, results: &mut Vec<V>) {
        match node {
            Node::Internal { keys, children } => {
                let start_idx = match lower {
                    Bound::Included(start) | Bound::Excluded(start) => {
                        // keys equal to a separator live on its right
                        keys.partition_point(|k| k <= start)
                    }
                    Bound::Unbounded => 0,
                };

                for i in start_idx..children.len() {
                    // child i only holds keys >= keys[i-1]
                    if i > 0 && Self::above_upper(&keys[i - 1], upper) {
                        break;
                    }
                    Self::range_node(&children[i], lower, upper, results);
                }
            }
            Node::Leaf { keys, values } => {
                for (key, bucket) in keys.iter().zip(values.iter()) {
                    if Self::below_lower(key, lower) {
                        continue;
                    }
                    if Self::above_upper(key, upper) {
                        break;
                    }
                    results.extend(bucket.iter().cloned());
                }
            }
        }
    }

    /// In-order traversal of every value
    pub fn all(&self) -> Vec<V> {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }

    pub fn clear(&mut self) {
        self.root = Node::empty_leaf();
        self.num_keys = 0;
        self.tree_height = 1;
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.num_keys
    }

    pub fn is_empty(&self) -> bool {
        self.num_keys == 0
    }

    pub fn height(&self) -> u32 {
        self.tree_height
    }
}
