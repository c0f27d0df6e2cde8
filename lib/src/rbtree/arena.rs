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

//! Index-based node allocator backing the red-black trees.
//!
//! Nodes live in one growable array; index 0 is the null sentinel shared by
//! all trees in the arena. Freed slots are chained through their `left`
//! field, so the six per-field byte slices produced by hibernation capture
//! the complete allocator state.

use std::io::Read as _;
use std::io::Write as _;
use std::path::Path;

use tempfile::NamedTempFile;
use thiserror::Error;

/// The null node index.
pub const NIL: u32 = 0;

/// One tree node. `key` and `value` are the payload; the remaining fields
/// are intrusive tree links.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Node {
    pub key: u32,
    pub value: u32,
    pub left: u32,
    pub right: u32,
    pub parent: u32,
    pub red: bool,
}

/// Error raised when persisting or restoring a hibernated arena.
#[derive(Debug, Error)]
pub enum HibernateError {
    #[error("I/O error on hibernation scratch file")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("hibernated arena data is corrupt: {reason}")]
    Corrupt { reason: String },
}

#[derive(Debug)]
struct Hibernated {
    /// Length of the node array before hibernation, including the sentinel.
    node_count: usize,
    /// Free-list length before hibernation, for consistency checking on boot.
    free_len: u32,
    /// The six compressed field slices, in (key, value, left, right, parent,
    /// color) order. `None` once spilled to disk.
    blocks: Option<[Vec<u8>; 6]>,
    file: Option<NamedTempFile>,
}

#[derive(Debug)]
enum Storage {
    Live(Vec<Node>),
    Hibernated(Box<Hibernated>),
}

/// Growable node arena with a free list and two-stage hibernation.
#[derive(Debug)]
pub struct Arena {
    storage: Storage,
    free_head: u32,
    free_len: u32,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Arena {
    fn clone(&self) -> Self {
        match &self.storage {
            Storage::Live(nodes) => Self {
                storage: Storage::Live(nodes.clone()),
                free_head: self.free_head,
                free_len: self.free_len,
            },
            Storage::Hibernated(_) => panic!("attempt to clone a hibernated arena"),
        }
    }
}

impl Arena {
    pub fn new() -> Self {
        Self {
            // Index 0 is the null sentinel; it is black and never allocated.
            storage: Storage::Live(vec![Node::default()]),
            free_head: NIL,
            free_len: 0,
        }
    }

    fn live(&self) -> &Vec<Node> {
        match &self.storage {
            Storage::Live(nodes) => nodes,
            Storage::Hibernated(_) => panic!("use of a hibernated arena"),
        }
    }

    fn live_mut(&mut self) -> &mut Vec<Node> {
        match &mut self.storage {
            Storage::Live(nodes) => nodes,
            Storage::Hibernated(_) => panic!("use of a hibernated arena"),
        }
    }

    /// Number of allocated (live) nodes, excluding the sentinel.
    pub fn len(&self) -> usize {
        let total = match &self.storage {
            Storage::Live(nodes) => nodes.len(),
            Storage::Hibernated(h) => h.node_count,
        };
        total - 1 - self.free_len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_hibernated(&self) -> bool {
        matches!(self.storage, Storage::Hibernated(_))
    }

    /// Allocates a zeroed node and returns its index.
    pub fn alloc(&mut self) -> u32 {
        if self.free_head != NIL {
            let index = self.free_head;
            let next = self.live()[index as usize].left;
            self.live_mut()[index as usize] = Node::default();
            self.free_head = next;
            self.free_len -= 1;
            index
        } else {
            let nodes = self.live_mut();
            nodes.push(Node::default());
            (nodes.len() - 1) as u32
        }
    }

    /// Returns a node to the free list.
    pub fn free(&mut self, index: u32) {
        debug_assert_ne!(index, NIL, "freeing the null sentinel");
        let head = self.free_head;
        self.live_mut()[index as usize] = Node {
            left: head,
            ..Node::default()
        };
        self.free_head = index;
        self.free_len += 1;
    }

    pub(crate) fn node(&self, index: u32) -> &Node {
        &self.live()[index as usize]
    }

    pub(crate) fn node_mut(&mut self, index: u32) -> &mut Node {
        &mut self.live_mut()[index as usize]
    }

    pub fn key(&self, index: u32) -> u32 {
        self.node(index).key
    }

    pub fn value(&self, index: u32) -> u32 {
        self.node(index).value
    }

    /// Rewrites a node key in place. The caller must preserve the ordering
    /// of the tree(s) the node belongs to.
    pub fn set_key(&mut self, index: u32, key: u32) {
        self.node_mut(index).key = key;
    }

    pub fn set_value(&mut self, index: u32, value: u32) {
        self.node_mut(index).value = value;
    }

    /// Compacts the arena into six LZ4-compressed field slices, releasing
    /// the structured node array. All structural operations are rejected
    /// until [`Self::boot`].
    pub fn hibernate(&mut self) {
        let blocks = self.compress();
        let node_count = self.live().len();
        self.storage = Storage::Hibernated(Box::new(Hibernated {
            node_count,
            free_len: self.free_len,
            blocks: Some(blocks),
            file: None,
        }));
    }

    /// Like [`Self::hibernate`], but additionally spills the compressed
    /// slices to a scratch file in `dir` and releases them from memory.
    ///
    /// On I/O failure the arena is left live and fully usable.
    pub fn hibernate_to_disk(&mut self, dir: &Path) -> Result<(), HibernateError> {
        let blocks = self.compress();
        let node_count = self.live().len();
        let mut file = NamedTempFile::with_prefix_in("arena-", dir)?;
        for block in &blocks {
            file.write_all(&(block.len() as u64).to_le_bytes())?;
            file.write_all(block)?;
        }
        file.flush()?;
        self.storage = Storage::Hibernated(Box::new(Hibernated {
            node_count,
            free_len: self.free_len,
            blocks: None,
            file: Some(file),
        }));
        Ok(())
    }

    /// Decompresses and rebuilds the node array. The scratch file, if any,
    /// is deleted on success.
    pub fn boot(&mut self) -> Result<(), HibernateError> {
        let Storage::Hibernated(hibernated) = &mut self.storage else {
            panic!("boot of a live arena");
        };
        let blocks = match (hibernated.blocks.take(), hibernated.file.take()) {
            (Some(blocks), _) => blocks,
            (None, Some(file)) => read_blocks(file)?,
            (None, None) => unreachable!("hibernated arena with neither blocks nor file"),
        };
        let nodes = decompress(&blocks, hibernated.node_count)?;
        let expected_free = hibernated.free_len;
        self.storage = Storage::Live(nodes);
        // Consistency check: the free list must have survived intact.
        let mut walked = 0;
        let mut cursor = self.free_head;
        while cursor != NIL && walked <= expected_free {
            walked += 1;
            cursor = self.node(cursor).left;
        }
        if walked != expected_free {
            return Err(HibernateError::Corrupt {
                reason: format!("free list length {walked}, recorded {expected_free}"),
            });
        }
        Ok(())
    }

    fn compress(&self) -> [Vec<u8>; 6] {
        let nodes = self.live();
        let n = nodes.len();
        let mut keys = Vec::with_capacity(n * 4);
        let mut values = Vec::with_capacity(n * 4);
        let mut lefts = Vec::with_capacity(n * 4);
        let mut rights = Vec::with_capacity(n * 4);
        let mut parents = Vec::with_capacity(n * 4);
        let mut colors = vec![0_u8; n.div_ceil(8)];
        for (i, node) in nodes.iter().enumerate() {
            keys.extend_from_slice(&node.key.to_le_bytes());
            values.extend_from_slice(&node.value.to_le_bytes());
            lefts.extend_from_slice(&node.left.to_le_bytes());
            rights.extend_from_slice(&node.right.to_le_bytes());
            parents.extend_from_slice(&node.parent.to_le_bytes());
            if node.red {
                colors[i / 8] |= 1 << (i % 8);
            }
        }
        [&keys, &values, &lefts, &rights, &parents, &colors]
            .map(|field| lz4_flex::compress_prepend_size(field))
    }
}

fn read_blocks(file: NamedTempFile) -> Result<[Vec<u8>; 6], HibernateError> {
    let mut reader = file.reopen()?;
    let mut blocks: [Vec<u8>; 6] = Default::default();
    for block in &mut blocks {
        let mut len_bytes = [0_u8; 8];
        reader.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;
        let mut data = vec![0_u8; len];
        reader.read_exact(&mut data)?;
        *block = data;
    }
    // `file` is dropped here, deleting the scratch file.
    Ok(blocks)
}

fn decompress(blocks: &[Vec<u8>; 6], node_count: usize) -> Result<Vec<Node>, HibernateError> {
    let mut fields = Vec::with_capacity(6);
    for (i, block) in blocks.iter().enumerate() {
        let expected = if i == 5 {
            node_count.div_ceil(8)
        } else {
            node_count * 4
        };
        let data =
            lz4_flex::decompress_size_prepended(block).map_err(|err| HibernateError::Corrupt {
                reason: err.to_string(),
            })?;
        if data.len() != expected {
            return Err(HibernateError::Corrupt {
                reason: format!("field slice {i} has {} bytes, expected {expected}", data.len()),
            });
        }
        fields.push(data);
    }
    let word = |field: &[u8], i: usize| {
        u32::from_le_bytes(field[i * 4..i * 4 + 4].try_into().unwrap())
    };
    let nodes = (0..node_count)
        .map(|i| Node {
            key: word(&fields[0], i),
            value: word(&fields[1], i),
            left: word(&fields[2], i),
            right: word(&fields[3], i),
            parent: word(&fields[4], i),
            red: fields[5][i / 8] & (1 << (i % 8)) != 0,
        })
        .collect();
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: u32) -> Arena {
        let mut arena = Arena::new();
        for i in 0..n {
            let index = arena.alloc();
            arena.set_key(index, i);
            arena.set_value(index, i * 2);
        }
        arena
    }

    #[test]
    fn test_alloc_free_reuse() {
        let mut arena = Arena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        assert_eq!((a, b), (1, 2));
        assert_eq!(arena.len(), 2);
        arena.free(a);
        assert_eq!(arena.len(), 1);
        // The freed slot is reused before the array grows.
        assert_eq!(arena.alloc(), a);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_hibernate_roundtrip() {
        let mut arena = filled(100);
        arena.free(7);
        arena.free(42);
        let before: Vec<Node> = (0..101).map(|i| *arena.node(i)).collect();
        arena.hibernate();
        assert!(arena.is_hibernated());
        assert_eq!(arena.len(), 98);
        arena.boot().unwrap();
        let after: Vec<Node> = (0..101).map(|i| *arena.node(i)).collect();
        assert_eq!(before, after);
        assert_eq!(arena.len(), 98);
    }

    #[test]
    fn test_hibernate_to_disk_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = filled(512);
        arena.free(3);
        let before: Vec<Node> = (0..513).map(|i| *arena.node(i)).collect();
        arena.hibernate_to_disk(dir.path()).unwrap();
        let scratch: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(scratch.len(), 1);
        arena.boot().unwrap();
        let after: Vec<Node> = (0..513).map(|i| *arena.node(i)).collect();
        assert_eq!(before, after);
        // The scratch file is gone after a successful boot.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_hibernate_to_disk_failure_keeps_arena_live() {
        let mut arena = filled(10);
        let missing = Path::new("/nonexistent/strata-hibernation");
        assert!(arena.hibernate_to_disk(missing).is_err());
        assert!(!arena.is_hibernated());
        assert_eq!(arena.key(5), 4);
    }

    #[test]
    #[should_panic(expected = "use of a hibernated arena")]
    fn test_use_while_hibernated_panics() {
        let mut arena = filled(10);
        arena.hibernate();
        arena.alloc();
    }

    #[test]
    #[should_panic(expected = "use of a hibernated arena")]
    fn test_double_hibernation_panics() {
        let mut arena = filled(10);
        arena.hibernate();
        arena.hibernate();
    }

    #[test]
    #[should_panic(expected = "boot of a live arena")]
    fn test_boot_live_panics() {
        let mut arena = filled(10);
        arena.boot().unwrap();
    }

    #[test]
    #[should_panic(expected = "clone a hibernated arena")]
    fn test_clone_hibernated_panics() {
        let mut arena = filled(10);
        arena.hibernate();
        let _clone = arena.clone();
    }
}
