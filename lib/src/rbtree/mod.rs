// Copyright 2025 The Strata Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Red-black tree keyed by `u32`, with nodes held in an [`Arena`].
//!
//! A tree owns nothing but its root, min and max indices, which makes
//! cloning a tree trivially cheap and lets sibling trees (branch forks)
//! share one arena. Every operation takes the arena explicitly.

mod arena;

pub use arena::Arena;
pub use arena::HibernateError;
pub use arena::NIL;

use arena::Node;

/// A red-black tree view into an arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RbTree {
    root: u32,
    min: u32,
    max: u32,
    len: u32,
}

impl RbTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the node with the smallest key, or [`NIL`].
    pub fn first(&self) -> u32 {
        self.min
    }

    /// Index of the node with the largest key, or [`NIL`].
    pub fn last(&self) -> u32 {
        self.max
    }

    /// Inserts `(key, value)` and returns the node index. If the key already
    /// exists the existing node is returned unchanged and the flag is false.
    pub fn insert(&mut self, arena: &mut Arena, key: u32, value: u32) -> (u32, bool) {
        let mut parent = NIL;
        let mut cursor = self.root;
        while cursor != NIL {
            parent = cursor;
            let node_key = arena.node(cursor).key;
            cursor = if key < node_key {
                arena.node(cursor).left
            } else if key > node_key {
                arena.node(cursor).right
            } else {
                return (cursor, false);
            };
        }
        let index = arena.alloc();
        *arena.node_mut(index) = Node {
            key,
            value,
            left: NIL,
            right: NIL,
            parent,
            red: true,
        };
        if parent == NIL {
            self.root = index;
        } else if key < arena.node(parent).key {
            arena.node_mut(parent).left = index;
        } else {
            arena.node_mut(parent).right = index;
        }
        if self.min == NIL || key < arena.node(self.min).key {
            self.min = index;
        }
        if self.max == NIL || key > arena.node(self.max).key {
            self.max = index;
        }
        self.len += 1;
        self.insert_fixup(arena, index);
        (index, true)
    }

    /// Removes the node with the given key, freeing its slot. Returns false
    /// if the key is absent.
    pub fn delete_key(&mut self, arena: &mut Arena, key: u32) -> bool {
        let index = self.find(arena, key);
        if index == NIL {
            false
        } else {
            self.delete_at(arena, index);
            true
        }
    }

    /// Removes the node at `index`, freeing its slot.
    pub fn delete_at(&mut self, arena: &mut Arena, z: u32) {
        debug_assert_ne!(z, NIL, "deleting the null sentinel");
        let new_min = if self.min == z {
            self.next(arena, z)
        } else {
            self.min
        };
        let new_max = if self.max == z {
            self.prev(arena, z)
        } else {
            self.max
        };

        let mut y = z;
        let mut y_was_red = arena.node(y).red;
        let x;
        if arena.node(z).left == NIL {
            x = arena.node(z).right;
            self.transplant(arena, z, x);
        } else if arena.node(z).right == NIL {
            x = arena.node(z).left;
            self.transplant(arena, z, x);
        } else {
            y = Self::subtree_min(arena, arena.node(z).right);
            y_was_red = arena.node(y).red;
            x = arena.node(y).right;
            if arena.node(y).parent == z {
                arena.node_mut(x).parent = y;
            } else {
                self.transplant(arena, y, x);
                let z_right = arena.node(z).right;
                arena.node_mut(y).right = z_right;
                arena.node_mut(z_right).parent = y;
            }
            self.transplant(arena, z, y);
            let z_left = arena.node(z).left;
            arena.node_mut(y).left = z_left;
            arena.node_mut(z_left).parent = y;
            arena.node_mut(y).red = arena.node(z).red;
        }
        if !y_was_red {
            self.delete_fixup(arena, x);
        }
        arena.free(z);
        self.min = new_min;
        self.max = new_max;
        self.len -= 1;
        if self.len == 0 {
            debug_assert_eq!(self.root, NIL);
        }
    }

    /// Index of the node with exactly `key`, or [`NIL`].
    pub fn find(&self, arena: &Arena, key: u32) -> u32 {
        let mut cursor = self.root;
        while cursor != NIL {
            let node_key = arena.node(cursor).key;
            cursor = if key < node_key {
                arena.node(cursor).left
            } else if key > node_key {
                arena.node(cursor).right
            } else {
                return cursor;
            };
        }
        NIL
    }

    /// Index of the node with the smallest key `>= key`, or [`NIL`].
    pub fn find_ge(&self, arena: &Arena, key: u32) -> u32 {
        let mut result = NIL;
        let mut cursor = self.root;
        while cursor != NIL {
            if arena.node(cursor).key >= key {
                result = cursor;
                cursor = arena.node(cursor).left;
            } else {
                cursor = arena.node(cursor).right;
            }
        }
        result
    }

    /// Index of the node with the largest key `<= key`, or [`NIL`].
    pub fn find_le(&self, arena: &Arena, key: u32) -> u32 {
        let mut result = NIL;
        let mut cursor = self.root;
        while cursor != NIL {
            if arena.node(cursor).key <= key {
                result = cursor;
                cursor = arena.node(cursor).right;
            } else {
                cursor = arena.node(cursor).left;
            }
        }
        result
    }

    /// In-order successor of `x`, or [`NIL`].
    pub fn next(&self, arena: &Arena, mut x: u32) -> u32 {
        if arena.node(x).right != NIL {
            return Self::subtree_min(arena, arena.node(x).right);
        }
        let mut parent = arena.node(x).parent;
        while parent != NIL && x == arena.node(parent).right {
            x = parent;
            parent = arena.node(parent).parent;
        }
        parent
    }

    /// In-order predecessor of `x`, or [`NIL`].
    pub fn prev(&self, arena: &Arena, mut x: u32) -> u32 {
        if arena.node(x).left != NIL {
            return Self::subtree_max(arena, arena.node(x).left);
        }
        let mut parent = arena.node(x).parent;
        while parent != NIL && x == arena.node(parent).left {
            x = parent;
            parent = arena.node(parent).parent;
        }
        parent
    }

    /// In-order `(key, value)` iterator.
    pub fn iter<'a>(&'a self, arena: &'a Arena) -> Iter<'a> {
        Iter {
            tree: self,
            arena,
            cursor: self.min,
        }
    }

    fn subtree_min(arena: &Arena, mut x: u32) -> u32 {
        while arena.node(x).left != NIL {
            x = arena.node(x).left;
        }
        x
    }

    fn subtree_max(arena: &Arena, mut x: u32) -> u32 {
        while arena.node(x).right != NIL {
            x = arena.node(x).right;
        }
        x
    }

    fn rotate_left(&mut self, arena: &mut Arena, x: u32) {
        let y = arena.node(x).right;
        let y_left = arena.node(y).left;
        arena.node_mut(x).right = y_left;
        if y_left != NIL {
            arena.node_mut(y_left).parent = x;
        }
        let x_parent = arena.node(x).parent;
        arena.node_mut(y).parent = x_parent;
        if x_parent == NIL {
            self.root = y;
        } else if arena.node(x_parent).left == x {
            arena.node_mut(x_parent).left = y;
        } else {
            arena.node_mut(x_parent).right = y;
        }
        arena.node_mut(y).left = x;
        arena.node_mut(x).parent = y;
    }

    fn rotate_right(&mut self, arena: &mut Arena, x: u32) {
        let y = arena.node(x).left;
        let y_right = arena.node(y).right;
        arena.node_mut(x).left = y_right;
        if y_right != NIL {
            arena.node_mut(y_right).parent = x;
        }
        let x_parent = arena.node(x).parent;
        arena.node_mut(y).parent = x_parent;
        if x_parent == NIL {
            self.root = y;
        } else if arena.node(x_parent).right == x {
            arena.node_mut(x_parent).right = y;
        } else {
            arena.node_mut(x_parent).left = y;
        }
        arena.node_mut(y).right = x;
        arena.node_mut(x).parent = y;
    }

    fn transplant(&mut self, arena: &mut Arena, u: u32, v: u32) {
        let u_parent = arena.node(u).parent;
        if u_parent == NIL {
            self.root = v;
        } else if arena.node(u_parent).left == u {
            arena.node_mut(u_parent).left = v;
        } else {
            arena.node_mut(u_parent).right = v;
        }
        // The sentinel's parent is written through here; the delete fixup
        // relies on it.
        arena.node_mut(v).parent = u_parent;
    }

    fn insert_fixup(&mut self, arena: &mut Arena, mut z: u32) {
        while arena.node(arena.node(z).parent).red {
            let parent = arena.node(z).parent;
            let grandparent = arena.node(parent).parent;
            if parent == arena.node(grandparent).left {
                let uncle = arena.node(grandparent).right;
                if arena.node(uncle).red {
                    arena.node_mut(parent).red = false;
                    arena.node_mut(uncle).red = false;
                    arena.node_mut(grandparent).red = true;
                    z = grandparent;
                } else {
                    if z == arena.node(parent).right {
                        z = parent;
                        self.rotate_left(arena, z);
                    }
                    let parent = arena.node(z).parent;
                    let grandparent = arena.node(parent).parent;
                    arena.node_mut(parent).red = false;
                    arena.node_mut(grandparent).red = true;
                    self.rotate_right(arena, grandparent);
                }
            } else {
                let uncle = arena.node(grandparent).left;
                if arena.node(uncle).red {
                    arena.node_mut(parent).red = false;
                    arena.node_mut(uncle).red = false;
                    arena.node_mut(grandparent).red = true;
                    z = grandparent;
                } else {
                    if z == arena.node(parent).left {
                        z = parent;
                        self.rotate_right(arena, z);
                    }
                    let parent = arena.node(z).parent;
                    let grandparent = arena.node(parent).parent;
                    arena.node_mut(parent).red = false;
                    arena.node_mut(grandparent).red = true;
                    self.rotate_left(arena, grandparent);
                }
            }
        }
        let root = self.root;
        arena.node_mut(root).red = false;
    }

    fn delete_fixup(&mut self, arena: &mut Arena, mut x: u32) {
        while x != self.root && !arena.node(x).red {
            let parent = arena.node(x).parent;
            if x == arena.node(parent).left {
                let mut w = arena.node(parent).right;
                if arena.node(w).red {
                    arena.node_mut(w).red = false;
                    arena.node_mut(parent).red = true;
                    self.rotate_left(arena, parent);
                    w = arena.node(parent).right;
                }
                let w_left = arena.node(w).left;
                let w_right = arena.node(w).right;
                if !arena.node(w_left).red && !arena.node(w_right).red {
                    arena.node_mut(w).red = true;
                    x = parent;
                } else {
                    if !arena.node(w_right).red {
                        arena.node_mut(w_left).red = false;
                        arena.node_mut(w).red = true;
                        self.rotate_right(arena, w);
                        w = arena.node(parent).right;
                    }
                    arena.node_mut(w).red = arena.node(parent).red;
                    arena.node_mut(parent).red = false;
                    let w_right = arena.node(w).right;
                    arena.node_mut(w_right).red = false;
                    self.rotate_left(arena, parent);
                    x = self.root;
                }
            } else {
                let mut w = arena.node(parent).left;
                if arena.node(w).red {
                    arena.node_mut(w).red = false;
                    arena.node_mut(parent).red = true;
                    self.rotate_right(arena, parent);
                    w = arena.node(parent).left;
                }
                let w_left = arena.node(w).left;
                let w_right = arena.node(w).right;
                if !arena.node(w_left).red && !arena.node(w_right).red {
                    arena.node_mut(w).red = true;
                    x = parent;
                } else {
                    if !arena.node(w_left).red {
                        arena.node_mut(w_right).red = false;
                        arena.node_mut(w).red = true;
                        self.rotate_left(arena, w);
                        w = arena.node(parent).left;
                    }
                    arena.node_mut(w).red = arena.node(parent).red;
                    arena.node_mut(parent).red = false;
                    let w_left = arena.node(w).left;
                    arena.node_mut(w_left).red = false;
                    self.rotate_right(arena, parent);
                    x = self.root;
                }
            }
        }
        arena.node_mut(x).red = false;
    }

    /// Checks the red-black invariants, key ordering, and the cached
    /// min/max/len fields. Panics on violation.
    pub fn validate(&self, arena: &Arena) {
        assert!(!arena.node(NIL).red, "sentinel turned red");
        if self.root == NIL {
            assert_eq!(self.min, NIL);
            assert_eq!(self.max, NIL);
            assert_eq!(self.len, 0);
            return;
        }
        assert!(!arena.node(self.root).red, "red root");
        let mut count = 0;
        let mut prev_key = None;
        let mut cursor = self.min;
        while cursor != NIL {
            let key = arena.node(cursor).key;
            if let Some(prev) = prev_key {
                assert!(prev < key, "keys not strictly ascending: {prev} then {key}");
            }
            prev_key = Some(key);
            count += 1;
            cursor = self.next(arena, cursor);
        }
        assert_eq!(count, self.len, "cached length mismatch");
        assert_eq!(self.min, Self::subtree_min(arena, self.root));
        assert_eq!(self.max, Self::subtree_max(arena, self.root));
        Self::check_subtree(arena, self.root, false);
    }

    /// Returns the black height of the subtree, asserting equal heights and
    /// no red-red parent-child pairs on the way.
    fn check_subtree(arena: &Arena, x: u32, parent_red: bool) -> u32 {
        if x == NIL {
            return 1;
        }
        let node = arena.node(x);
        assert!(!(parent_red && node.red), "red node with red child");
        let left = Self::check_subtree(arena, node.left, node.red);
        let right = Self::check_subtree(arena, node.right, node.red);
        assert_eq!(left, right, "unequal black heights");
        left + u32::from(!node.red)
    }
}

/// In-order iterator over `(key, value)` pairs.
pub struct Iter<'a> {
    tree: &'a RbTree,
    arena: &'a Arena,
    cursor: u32,
}

impl Iterator for Iter<'_> {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let node = self.arena.node(self.cursor);
        self.cursor = self.tree.next(self.arena, self.cursor);
        Some((node.key, node.value))
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools as _;

    use super::*;

    // Deterministic pseudo-random sequence; tests must not depend on an RNG
    // crate seed policy.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u32 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 33) as u32
        }
    }

    fn collect(tree: &RbTree, arena: &Arena) -> Vec<(u32, u32)> {
        tree.iter(arena).collect()
    }

    #[test]
    fn test_insert_ascending() {
        let mut arena = Arena::new();
        let mut tree = RbTree::new();
        for i in 0..100 {
            tree.insert(&mut arena, i, i + 1000);
            tree.validate(&arena);
        }
        assert_eq!(tree.len(), 100);
        assert_eq!(arena.key(tree.first()), 0);
        assert_eq!(arena.key(tree.last()), 99);
        let pairs = collect(&tree, &arena);
        assert_eq!(pairs.len(), 100);
        assert!(pairs.iter().tuple_windows().all(|(a, b)| a.0 < b.0));
    }

    #[test]
    fn test_insert_existing_key_keeps_value() {
        let mut arena = Arena::new();
        let mut tree = RbTree::new();
        let (first, inserted) = tree.insert(&mut arena, 5, 1);
        assert!(inserted);
        let (second, inserted) = tree.insert(&mut arena, 5, 2);
        assert!(!inserted);
        assert_eq!(first, second);
        assert_eq!(arena.value(first), 1);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_random_insert_delete_keeps_invariants() {
        let mut arena = Arena::new();
        let mut tree = RbTree::new();
        let mut rng = Lcg(17);
        let mut keys = Vec::new();
        for _ in 0..400 {
            let key = rng.next() % 1000;
            if tree.insert(&mut arena, key, key).1 {
                keys.push(key);
            }
        }
        tree.validate(&arena);
        keys.sort_unstable();
        assert_eq!(
            collect(&tree, &arena).iter().map(|(k, _)| *k).collect_vec(),
            keys
        );
        // Delete every other key and re-validate along the way.
        for (i, key) in keys.iter().enumerate() {
            if i % 2 == 0 {
                assert!(tree.delete_key(&mut arena, *key));
                tree.validate(&arena);
            }
        }
        let remaining: Vec<u32> = keys
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 2 == 1)
            .map(|(_, k)| *k)
            .collect();
        assert_eq!(
            collect(&tree, &arena).iter().map(|(k, _)| *k).collect_vec(),
            remaining
        );
        assert_eq!(arena.len(), remaining.len());
    }

    #[test]
    fn test_delete_all() {
        let mut arena = Arena::new();
        let mut tree = RbTree::new();
        for i in 0..50 {
            tree.insert(&mut arena, i, 0);
        }
        for i in 0..50 {
            assert!(tree.delete_key(&mut arena, i));
            tree.validate(&arena);
        }
        assert!(tree.is_empty());
        assert_eq!(tree.first(), NIL);
        assert_eq!(tree.last(), NIL);
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_find_bounds() {
        let mut arena = Arena::new();
        let mut tree = RbTree::new();
        for key in [10, 20, 30] {
            tree.insert(&mut arena, key, key);
        }
        assert_eq!(arena.key(tree.find_ge(&arena, 10)), 10);
        assert_eq!(arena.key(tree.find_ge(&arena, 11)), 20);
        assert_eq!(tree.find_ge(&arena, 31), NIL);
        assert_eq!(arena.key(tree.find_le(&arena, 30)), 30);
        assert_eq!(arena.key(tree.find_le(&arena, 29)), 20);
        assert_eq!(tree.find_le(&arena, 9), NIL);
        assert_eq!(tree.find(&arena, 20), tree.find_le(&arena, 20));
        assert_eq!(tree.find(&arena, 21), NIL);
    }

    #[test]
    fn test_next_prev_walk() {
        let mut arena = Arena::new();
        let mut tree = RbTree::new();
        for key in [5, 1, 9, 3, 7] {
            tree.insert(&mut arena, key, 0);
        }
        let mut forward = Vec::new();
        let mut cursor = tree.first();
        while cursor != NIL {
            forward.push(arena.key(cursor));
            cursor = tree.next(&arena, cursor);
        }
        assert_eq!(forward, [1, 3, 5, 7, 9]);
        let mut backward = Vec::new();
        let mut cursor = tree.last();
        while cursor != NIL {
            backward.push(arena.key(cursor));
            cursor = tree.prev(&arena, cursor);
        }
        assert_eq!(backward, [9, 7, 5, 3, 1]);
    }

    #[test]
    fn test_sibling_trees_share_arena() {
        let mut arena = Arena::new();
        let mut left = RbTree::new();
        let mut right = RbTree::new();
        for i in 0..20 {
            left.insert(&mut arena, i, 100 + i);
            right.insert(&mut arena, i * 2, 200 + i);
        }
        left.validate(&arena);
        right.validate(&arena);
        assert_eq!(arena.len(), 40);
        // Mutating one sibling leaves the other untouched.
        for i in 0..10 {
            left.delete_key(&mut arena, i);
        }
        left.validate(&arena);
        right.validate(&arena);
        assert_eq!(right.len(), 20);
        assert_eq!(arena.len(), 30);
    }

    #[test]
    fn test_hibernation_preserves_tree() {
        let mut arena = Arena::new();
        let mut tree = RbTree::new();
        let mut rng = Lcg(99);
        for _ in 0..300 {
            let key = rng.next() % 10_000;
            tree.insert(&mut arena, key, key ^ 0xff);
        }
        let pairs = collect(&tree, &arena);
        let (min, max, len) = (tree.first(), tree.last(), tree.len());
        arena.hibernate();
        arena.boot().unwrap();
        assert_eq!(collect(&tree, &arena), pairs);
        assert_eq!((tree.first(), tree.last(), tree.len()), (min, max, len));
        tree.validate(&arena);
    }
}
