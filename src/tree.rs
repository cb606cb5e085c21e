//! Red-black tree keyed by (hash, key bytes)
//!
//! Keys order by hash first, then by the key bytes up to the shorter length,
//! with a prefix sorting before any longer key that extends it. The ordering
//! is total and deterministic, which is all the balancing needs; it is not
//! plain lexicographic byte order.
//!
//! Nodes are individually boxed and linked with raw pointers that never
//! escape this module. `set_value_ex` accepts a node the caller built up
//! front, so storing a value does not have to allocate inside the tree; the
//! tree takes ownership either way.

use bitflags::bitflags;
use std::cmp::Ordering;

use crate::error::{Error, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TreeOptions: u32 {
        /// Compare key bytes ASCII case-insensitively.
        const CASE_INSENSITIVE = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct NodeFlags: u8 {
        const RED = 1 << 0;
        const IN_TREE = 1 << 1;
        /// Allocated by the tree itself rather than handed in by the caller.
        const TREE_ALLOCATED = 1 << 2;
    }
}

pub struct Node<V> {
    hash: u32,
    key: Box<[u8]>,
    value: V,
    flags: NodeFlags,
    left: *mut Node<V>,
    right: *mut Node<V>,
    parent: *mut Node<V>,
}

impl<V> Node<V> {
    /// Build a detached node carrying `key` and `value`, ready for
    /// [`Tree::set_value_ex`].
    pub fn with(hash: u32, key: &[u8], value: V) -> Box<Node<V>> {
        Box::new(Node {
            hash,
            key: key.into(),
            value,
            flags: NodeFlags::empty(),
            left: std::ptr::null_mut(),
            right: std::ptr::null_mut(),
            parent: std::ptr::null_mut(),
        })
    }

    pub fn key_hash(&self) -> u32 {
        self.hash
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    /// Whether this node was allocated by the tree rather than the caller.
    pub fn tree_allocated(&self) -> bool {
        self.flags.contains(NodeFlags::TREE_ALLOCATED)
    }

    fn is_red(node: *mut Node<V>) -> bool {
        !node.is_null() && unsafe { (*node).flags.contains(NodeFlags::RED) }
    }

    fn set_red(node: *mut Node<V>) {
        unsafe { (*node).flags.insert(NodeFlags::RED) }
    }

    fn set_black(node: *mut Node<V>) {
        if !node.is_null() {
            unsafe { (*node).flags.remove(NodeFlags::RED) }
        }
    }
}

pub struct Tree<V> {
    root: *mut Node<V>,
    len: usize,
    options: TreeOptions,
}

// Nodes are owned by the tree and only reachable through it.
unsafe impl<V: Send> Send for Tree<V> {}
unsafe impl<V: Sync> Sync for Tree<V> {}

impl<V> Default for Tree<V> {
    fn default() -> Tree<V> {
        Tree::new()
    }
}

impl<V> Tree<V> {
    pub fn new() -> Tree<V> {
        Tree::with_options(TreeOptions::empty())
    }

    pub fn with_options(options: TreeOptions) -> Tree<V> {
        Tree { root: std::ptr::null_mut(), len: 0, options }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // =========================================================================
    // ORDERING
    // =========================================================================

    fn compare_bytes(&self, a: &[u8], b: &[u8]) -> Ordering {
        let fold = self.options.contains(TreeOptions::CASE_INSENSITIVE);
        let common = a.len().min(b.len());
        for index in 0..common {
            let (x, y) = if fold {
                (a[index].to_ascii_lowercase(), b[index].to_ascii_lowercase())
            } else {
                (a[index], b[index])
            };
            match x.cmp(&y) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        // A prefix sorts before any key extending it.
        a.len().cmp(&b.len())
    }

    fn compare_key(&self, hash: u32, key: &[u8], node: &Node<V>) -> Ordering {
        hash.cmp(&node.hash).then_with(|| self.compare_bytes(key, &node.key))
    }

    /// Iterative search. Returns the match (if any) together with the parent
    /// where an insertion would attach and the direction of the last step.
    fn find_node(&self, hash: u32, key: &[u8]) -> (*mut Node<V>, *mut Node<V>, Ordering) {
        let mut parent = std::ptr::null_mut();
        let mut last = Ordering::Less;
        let mut cursor = self.root;
        while !cursor.is_null() {
            let node = unsafe { &*cursor };
            last = self.compare_key(hash, key, node);
            if last == Ordering::Equal {
                return (cursor, parent, last);
            }
            parent = cursor;
            cursor = if last == Ordering::Less { node.left } else { node.right };
        }
        (std::ptr::null_mut(), parent, last)
    }

    // =========================================================================
    // LOOKUP
    // =========================================================================

    pub fn get_value(&self, hash: u32, key: &[u8]) -> Option<&V> {
        let (found, _, _) = self.find_node(hash, key);
        if found.is_null() { None } else { Some(unsafe { &(*found).value }) }
    }

    pub fn get_value_mut(&mut self, hash: u32, key: &[u8]) -> Option<&mut V> {
        let (found, _, _) = self.find_node(hash, key);
        if found.is_null() { None } else { Some(unsafe { &mut (*found).value }) }
    }

    pub fn get_node(&self, hash: u32, key: &[u8]) -> Option<&Node<V>> {
        let (found, _, _) = self.find_node(hash, key);
        if found.is_null() { None } else { Some(unsafe { &*found }) }
    }

    // =========================================================================
    // INSERTION
    // =========================================================================

    /// Insert or replace. An existing key keeps its node and only swaps the
    /// payload; duplicate keys are not an error.
    pub fn set_value(&mut self, hash: u32, key: &[u8], value: V) -> Result<()> {
        let (found, parent, last) = self.find_node(hash, key);
        if !found.is_null() {
            unsafe { (*found).value = value };
            return Ok(());
        }
        let mut node = Node::with(hash, key, value);
        node.flags.insert(NodeFlags::TREE_ALLOCATED);
        self.attach(node, parent, last);
        Ok(())
    }

    /// Insert or replace with a caller-built node, so the tree itself never
    /// allocates. If the key already exists the new node is stitched into
    /// the old node's place (colour, children and parent links carry over)
    /// and the old node is dropped.
    pub fn set_value_ex(&mut self, node: Box<Node<V>>) -> Result<()> {
        let (found, parent, last) = self.find_node(node.hash, &node.key);
        if found.is_null() {
            self.attach(node, parent, last);
            return Ok(());
        }
        unsafe {
            let fresh = Box::into_raw(node);
            let old = found;
            (*fresh).left = (*old).left;
            (*fresh).right = (*old).right;
            (*fresh).parent = (*old).parent;
            if !(*fresh).left.is_null() {
                (*(*fresh).left).parent = fresh;
            }
            if !(*fresh).right.is_null() {
                (*(*fresh).right).parent = fresh;
            }
            if (*fresh).parent.is_null() {
                self.root = fresh;
            } else if (*(*fresh).parent).left == old {
                (*(*fresh).parent).left = fresh;
            } else {
                (*(*fresh).parent).right = fresh;
            }
            (*fresh).flags.set(NodeFlags::RED, (*old).flags.contains(NodeFlags::RED));
            (*fresh).flags.insert(NodeFlags::IN_TREE);
            (*old).flags.remove(NodeFlags::IN_TREE);
            drop(Box::from_raw(old));
        }
        Ok(())
    }

    fn attach(&mut self, node: Box<Node<V>>, parent: *mut Node<V>, last: Ordering) {
        let fresh = Box::into_raw(node);
        unsafe {
            (*fresh).left = std::ptr::null_mut();
            (*fresh).right = std::ptr::null_mut();
            (*fresh).parent = parent;
            (*fresh).flags.insert(NodeFlags::IN_TREE | NodeFlags::RED);
            if parent.is_null() {
                self.root = fresh;
            } else if last == Ordering::Less {
                (*parent).left = fresh;
            } else {
                (*parent).right = fresh;
            }
            self.len += 1;
            self.insert_fixup(fresh);
        }
    }

    /// RB-INSERT fix-up, CLRS §14.3.
    unsafe fn insert_fixup(&mut self, mut x: *mut Node<V>) {
        unsafe {
            while x != self.root && Node::is_red((*x).parent) {
                let parent = (*x).parent;
                let grand = (*parent).parent;
                if parent == (*grand).left {
                    let uncle = (*grand).right;
                    if Node::is_red(uncle) {
                        Node::set_black(parent);
                        Node::set_black(uncle);
                        Node::set_red(grand);
                        x = grand;
                    } else {
                        if x == (*parent).right {
                            x = parent;
                            self.left_rotate(x);
                        }
                        let parent = (*x).parent;
                        let grand = (*parent).parent;
                        Node::set_black(parent);
                        Node::set_red(grand);
                        self.right_rotate(grand);
                    }
                } else {
                    let uncle = (*grand).left;
                    if Node::is_red(uncle) {
                        Node::set_black(parent);
                        Node::set_black(uncle);
                        Node::set_red(grand);
                        x = grand;
                    } else {
                        if x == (*parent).left {
                            x = parent;
                            self.right_rotate(x);
                        }
                        let parent = (*x).parent;
                        let grand = (*parent).parent;
                        Node::set_black(parent);
                        Node::set_red(grand);
                        self.left_rotate(grand);
                    }
                }
            }
            Node::set_black(self.root);
        }
    }

    unsafe fn left_rotate(&mut self, x: *mut Node<V>) {
        unsafe {
            let y = (*x).right;
            (*x).right = (*y).left;
            if !(*y).left.is_null() {
                (*(*y).left).parent = x;
            }
            (*y).parent = (*x).parent;
            if (*x).parent.is_null() {
                self.root = y;
            } else if x == (*(*x).parent).left {
                (*(*x).parent).left = y;
            } else {
                (*(*x).parent).right = y;
            }
            (*y).left = x;
            (*x).parent = y;
        }
    }

    unsafe fn right_rotate(&mut self, x: *mut Node<V>) {
        unsafe {
            let y = (*x).left;
            (*x).left = (*y).right;
            if !(*y).right.is_null() {
                (*(*y).right).parent = x;
            }
            (*y).parent = (*x).parent;
            if (*x).parent.is_null() {
                self.root = y;
            } else if x == (*(*x).parent).right {
                (*(*x).parent).right = y;
            } else {
                (*(*x).parent).left = y;
            }
            (*y).right = x;
            (*x).parent = y;
        }
    }

    // =========================================================================
    // DELETION
    // =========================================================================

    /// Remove a key. Returns false when the key is absent.
    pub fn remove_value(&mut self, hash: u32, key: &[u8]) -> bool {
        self.remove(hash, key).is_some()
    }

    /// Remove a key and hand back its value.
    pub fn remove(&mut self, hash: u32, key: &[u8]) -> Option<V> {
        let (target, _, _) = self.find_node(hash, key);
        if target.is_null() {
            return None;
        }
        unsafe {
            let z = target;
            // The node actually unlinked: z itself, or its successor when z
            // has two children. Unlike the textbook we really remove z from
            // the tree rather than copying values across, so a node a caller
            // embedded keeps following its value.
            let y = if (*z).left.is_null() || (*z).right.is_null() {
                z
            } else {
                self.next_ptr(z)
            };
            let x = if !(*y).left.is_null() { (*y).left } else { (*y).right };

            if !x.is_null() {
                (*x).parent = (*y).parent;
            }
            let mut fixup_parent = (*y).parent;
            if (*y).parent.is_null() {
                self.root = x;
            } else if y == (*(*y).parent).left {
                (*(*y).parent).left = x;
            } else {
                (*(*y).parent).right = x;
            }

            let removed_red = (*y).flags.contains(NodeFlags::RED);
            if y != z {
                // Move y into z's position.
                (*y).left = (*z).left;
                (*y).right = (*z).right;
                (*y).parent = (*z).parent;
                if !(*z).left.is_null() {
                    (*(*z).left).parent = y;
                }
                if !(*z).right.is_null() {
                    (*(*z).right).parent = y;
                }
                if (*z).parent.is_null() {
                    self.root = y;
                } else if (*(*z).parent).left == z {
                    (*(*z).parent).left = y;
                } else {
                    (*(*z).parent).right = y;
                }
                (*y).flags.set(NodeFlags::RED, (*z).flags.contains(NodeFlags::RED));
                if fixup_parent == z {
                    fixup_parent = y;
                }
            }

            if !removed_red {
                self.fixup_after_delete(x, fixup_parent);
            }

            (*z).flags.remove(NodeFlags::IN_TREE);
            self.len -= 1;
            let boxed = Box::from_raw(z);
            Some(boxed.value)
        }
    }

    /// RB-DELETE fix-up, CLRS §14.4, with the parent threaded explicitly
    /// because `x` may be null.
    unsafe fn fixup_after_delete(&mut self, mut x: *mut Node<V>, mut parent: *mut Node<V>) {
        unsafe {
            while x != self.root && !Node::is_red(x) && !parent.is_null() {
                if x == (*parent).left {
                    let mut w = (*parent).right;
                    if w.is_null() {
                        break;
                    }
                    if Node::is_red(w) {
                        Node::set_black(w);
                        Node::set_red(parent);
                        self.left_rotate(parent);
                        w = (*parent).right;
                        if w.is_null() {
                            break;
                        }
                    }
                    if !Node::is_red((*w).left) && !Node::is_red((*w).right) {
                        Node::set_red(w);
                        x = parent;
                        parent = (*x).parent;
                    } else {
                        if !Node::is_red((*w).right) {
                            Node::set_black((*w).left);
                            Node::set_red(w);
                            self.right_rotate(w);
                            w = (*parent).right;
                        }
                        (*w).flags.set(NodeFlags::RED, Node::is_red(parent));
                        Node::set_black(parent);
                        Node::set_black((*w).right);
                        self.left_rotate(parent);
                        x = self.root;
                        parent = std::ptr::null_mut();
                    }
                } else {
                    let mut w = (*parent).left;
                    if w.is_null() {
                        break;
                    }
                    if Node::is_red(w) {
                        Node::set_black(w);
                        Node::set_red(parent);
                        self.right_rotate(parent);
                        w = (*parent).left;
                        if w.is_null() {
                            break;
                        }
                    }
                    if !Node::is_red((*w).left) && !Node::is_red((*w).right) {
                        Node::set_red(w);
                        x = parent;
                        parent = (*x).parent;
                    } else {
                        if !Node::is_red((*w).left) {
                            Node::set_black((*w).right);
                            Node::set_red(w);
                            self.left_rotate(w);
                            w = (*parent).left;
                        }
                        (*w).flags.set(NodeFlags::RED, Node::is_red(parent));
                        Node::set_black(parent);
                        Node::set_black((*w).left);
                        self.right_rotate(parent);
                        x = self.root;
                        parent = std::ptr::null_mut();
                    }
                }
            }
            Node::set_black(x);
        }
    }

    /// Drop every node.
    pub fn remove_all_values(&mut self) {
        unsafe fn drop_subtree<V>(node: *mut Node<V>) {
            if node.is_null() {
                return;
            }
            unsafe {
                drop_subtree((*node).left);
                drop_subtree((*node).right);
                drop(Box::from_raw(node));
            }
        }
        unsafe { drop_subtree(self.root) };
        self.root = std::ptr::null_mut();
        self.len = 0;
    }

    // =========================================================================
    // ITERATION
    // =========================================================================

    fn min_ptr(&self, mut cursor: *mut Node<V>) -> *mut Node<V> {
        unsafe {
            while !cursor.is_null() && !(*cursor).left.is_null() {
                cursor = (*cursor).left;
            }
        }
        cursor
    }

    fn max_ptr(&self, mut cursor: *mut Node<V>) -> *mut Node<V> {
        unsafe {
            while !cursor.is_null() && !(*cursor).right.is_null() {
                cursor = (*cursor).right;
            }
        }
        cursor
    }

    /// Tree-Successor, CLRS §14.2.
    fn next_ptr(&self, node: *mut Node<V>) -> *mut Node<V> {
        unsafe {
            if !(*node).right.is_null() {
                return self.min_ptr((*node).right);
            }
            let mut child = node;
            let mut cursor = (*node).parent;
            while !cursor.is_null() && child == (*cursor).right {
                child = cursor;
                cursor = (*cursor).parent;
            }
            cursor
        }
    }

    fn prev_ptr(&self, node: *mut Node<V>) -> *mut Node<V> {
        unsafe {
            if !(*node).left.is_null() {
                return self.max_ptr((*node).left);
            }
            let mut child = node;
            let mut cursor = (*node).parent;
            while !cursor.is_null() && child == (*cursor).left {
                child = cursor;
                cursor = (*cursor).parent;
            }
            cursor
        }
    }

    /// The smallest node.
    pub fn first(&self) -> Option<&Node<V>> {
        self.next(None)
    }

    /// In-order successor; `None` starts at the minimum.
    pub fn next(&self, node: Option<&Node<V>>) -> Option<&Node<V>> {
        let found = match node {
            None => self.min_ptr(self.root),
            Some(node) => self.next_ptr((node as *const Node<V>).cast_mut()),
        };
        if found.is_null() { None } else { Some(unsafe { &*found }) }
    }

    /// In-order predecessor; `None` starts at the maximum.
    pub fn prev(&self, node: Option<&Node<V>>) -> Option<&Node<V>> {
        let found = match node {
            None => self.max_ptr(self.root),
            Some(node) => self.prev_ptr((node as *const Node<V>).cast_mut()),
        };
        if found.is_null() { None } else { Some(unsafe { &*found }) }
    }

    pub fn iter(&self) -> Iter<'_, V> {
        Iter { tree: self, cursor: None }
    }

    // =========================================================================
    // VALIDATION
    // =========================================================================

    /// Walk the whole tree checking the red-black invariants, parent/child
    /// agreement, strict key ordering and equal black heights.
    pub fn check_state(&self) -> Result<()> {
        if self.root.is_null() {
            if self.len != 0 {
                return Err(Error::Corruption("empty tree with nonzero count"));
            }
            return Ok(());
        }
        unsafe {
            if !(*self.root).parent.is_null() {
                return Err(Error::Corruption("root has a parent"));
            }
            if Node::is_red(self.root) {
                return Err(Error::Corruption("root is red"));
            }
            let mut count = 0usize;
            self.check_node(self.root, &mut count)?;
            if count != self.len {
                return Err(Error::Corruption("node count mismatch"));
            }
        }
        // Strictly increasing in-order traversal.
        let mut previous: Option<&Node<V>> = None;
        let mut cursor = self.first();
        while let Some(node) = cursor {
            if let Some(prev) = previous {
                if self.compare_key(node.hash, &node.key, prev) != Ordering::Greater {
                    return Err(Error::Corruption("in-order keys not increasing"));
                }
            }
            previous = Some(node);
            cursor = self.next(Some(node));
        }
        Ok(())
    }

    /// Returns the black height of the subtree.
    unsafe fn check_node(&self, node: *mut Node<V>, count: &mut usize) -> Result<usize> {
        unsafe {
            *count += 1;
            if !(*node).flags.contains(NodeFlags::IN_TREE) {
                return Err(Error::Corruption("node not marked in-tree"));
            }

            let left = (*node).left;
            let right = (*node).right;
            if Node::is_red(node) && (Node::is_red(left) || Node::is_red(right)) {
                return Err(Error::Corruption("red node with red child"));
            }

            let left_height = if left.is_null() {
                1
            } else {
                if (*left).parent != node {
                    return Err(Error::Corruption("left child disowns its parent"));
                }
                if self.compare_key((*node).hash, &(*node).key, &*left) != Ordering::Greater {
                    return Err(Error::Corruption("left child not smaller"));
                }
                self.check_node(left, count)?
            };

            let right_height = if right.is_null() {
                1
            } else {
                if (*right).parent != node {
                    return Err(Error::Corruption("right child disowns its parent"));
                }
                if self.compare_key((*node).hash, &(*node).key, &*right) != Ordering::Less {
                    return Err(Error::Corruption("right child not larger"));
                }
                self.check_node(right, count)?
            };

            if left_height != right_height {
                return Err(Error::Corruption("black heights differ"));
            }
            Ok(left_height + if Node::is_red(node) { 0 } else { 1 })
        }
    }
}

impl<V> Drop for Tree<V> {
    fn drop(&mut self) {
        self.remove_all_values();
    }
}

pub struct Iter<'a, V> {
    tree: &'a Tree<V>,
    cursor: Option<&'a Node<V>>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a Node<V>;

    fn next(&mut self) -> Option<&'a Node<V>> {
        self.cursor = self.tree.next(self.cursor);
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(key: &[u8]) -> u32 {
        // Deliberately collision-rich for these tests.
        key.iter().map(|&b| b as u32).sum::<u32>() & 0xF
    }

    #[test]
    fn test_set_get_remove() {
        let mut tree: Tree<u32> = Tree::new();
        assert!(tree.is_empty());
        tree.set_value(1, b"alpha", 10).unwrap();
        tree.set_value(2, b"beta", 20).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.get_value(1, b"alpha"), Some(&10));
        assert_eq!(tree.get_value(2, b"beta"), Some(&20));
        assert_eq!(tree.get_value(3, b"alpha"), None);

        assert!(tree.remove_value(1, b"alpha"));
        assert_eq!(tree.get_value(1, b"alpha"), None);
        assert!(!tree.remove_value(1, b"alpha"));
        assert_eq!(tree.len(), 1);
        tree.check_state().unwrap();
    }

    #[test]
    fn test_replace_keeps_count() {
        let mut tree: Tree<&'static str> = Tree::new();
        tree.set_value(7, b"key", "one").unwrap();
        tree.set_value(7, b"key", "two").unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get_value(7, b"key"), Some(&"two"));
    }

    #[test]
    fn test_set_value_ex_replaces_in_place() {
        let mut tree: Tree<u32> = Tree::new();
        for index in 0u32..50 {
            let key = index.to_be_bytes();
            tree.set_value(index & 3, &key, index).unwrap();
        }
        tree.check_state().unwrap();

        // Replace an interior value through a caller-built node.
        let key = 20u32.to_be_bytes();
        let node = Node::with(20 & 3, &key, 999u32);
        assert!(!node.tree_allocated());
        tree.set_value_ex(node).unwrap();
        assert_eq!(tree.len(), 50);
        assert_eq!(tree.get_value(20 & 3, &key), Some(&999));
        tree.check_state().unwrap();

        // And insert a brand new key the same way.
        let key = 77u32.to_be_bytes();
        tree.set_value_ex(Node::with(77 & 3, &key, 77)).unwrap();
        assert_eq!(tree.len(), 51);
        tree.check_state().unwrap();
    }

    #[test]
    fn test_iteration_is_ordered_and_complete() {
        let mut tree: Tree<usize> = Tree::new();
        let keys: Vec<Vec<u8>> = (0..200usize).map(|i| format!("key{i:04}").into_bytes()).collect();
        for (index, key) in keys.iter().enumerate() {
            tree.set_value(hash_of(key), key, index).unwrap();
        }
        tree.check_state().unwrap();

        let mut seen = 0;
        let mut cursor = tree.first();
        let mut last: Option<(u32, Vec<u8>)> = None;
        while let Some(node) = cursor {
            if let Some((lh, lk)) = &last {
                assert!((node.key_hash(), node.key()) > (*lh, lk.as_slice()));
            }
            last = Some((node.key_hash(), node.key().to_vec()));
            seen += 1;
            cursor = tree.next(Some(node));
        }
        assert_eq!(seen, 200);

        // Reverse direction visits the same population.
        let mut seen_rev = 0;
        let mut cursor = tree.prev(None);
        while let Some(node) = cursor {
            seen_rev += 1;
            cursor = tree.prev(Some(node));
        }
        assert_eq!(seen_rev, 200);

        assert_eq!(tree.iter().count(), 200);
    }

    #[test]
    fn test_prefix_sorts_first() {
        let mut tree: Tree<u8> = Tree::new();
        tree.set_value(5, b"abc", 1).unwrap();
        tree.set_value(5, b"ab", 2).unwrap();
        tree.set_value(5, b"abcd", 3).unwrap();
        let first = tree.first().unwrap();
        assert_eq!(first.key(), b"ab");
        let second = tree.next(Some(first)).unwrap();
        assert_eq!(second.key(), b"abc");
        tree.check_state().unwrap();
    }

    #[test]
    fn test_case_insensitive_option() {
        let mut tree: Tree<u8> = Tree::with_options(TreeOptions::CASE_INSENSITIVE);
        tree.set_value(9, b"Name", 1).unwrap();
        tree.set_value(9, b"nAME", 2).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get_value(9, b"NAME"), Some(&2));

        let mut sensitive: Tree<u8> = Tree::new();
        sensitive.set_value(9, b"Name", 1).unwrap();
        sensitive.set_value(9, b"nAME", 2).unwrap();
        assert_eq!(sensitive.len(), 2);
    }

    #[test]
    fn test_random_churn_keeps_invariants() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut tree: Tree<u64> = Tree::new();
        let mut shadow = std::collections::BTreeMap::new();

        for round in 0..2000u64 {
            let key_num: u16 = rng.r#gen::<u16>() % 512;
            let key = key_num.to_be_bytes();
            let hash = u32::from(key_num % 16);
            if rng.r#gen::<bool>() {
                tree.set_value(hash, &key, round).unwrap();
                shadow.insert(key_num, round);
            } else {
                let expect = shadow.remove(&key_num).is_some();
                assert_eq!(tree.remove_value(hash, &key), expect);
            }
            if round % 250 == 0 {
                tree.check_state().unwrap();
            }
        }
        tree.check_state().unwrap();
        assert_eq!(tree.len(), shadow.len());
        for (key_num, value) in &shadow {
            let key = key_num.to_be_bytes();
            assert_eq!(tree.get_value(u32::from(key_num % 16), &key), Some(value));
        }
    }

    #[test]
    fn test_remove_all_values() {
        let mut tree: Tree<String> = Tree::new();
        for index in 0..64u32 {
            tree.set_value(index, &index.to_be_bytes(), index.to_string()).unwrap();
        }
        tree.remove_all_values();
        assert!(tree.is_empty());
        assert_eq!(tree.first().map(|n| n.key_hash()), None);
        tree.check_state().unwrap();
    }
}
