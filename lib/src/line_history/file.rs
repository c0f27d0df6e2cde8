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

//! Snapshot of one tracked file as a tree of line runs.
//!
//! Each tree node `(start, value)` represents a run of consecutive lines
//! sharing one packed `(author, tick)` value, up to the next node's key. A
//! terminal node at the current length marks end-of-file. Keys are always
//! `{0, k1, .., length}` for a non-empty file and adjacent runs never share
//! a value.

use smallvec::SmallVec;

use super::FileId;
use super::LineHistoryChange;
use crate::backend::AuthorId;
use crate::backend::Tick;
use crate::rbtree::Arena;
use crate::rbtree::NIL;
use crate::rbtree::RbTree;

/// Number of low bits of a packed value holding the tick.
pub const TICK_BITS: u32 = 14;

const TICK_MASK: u32 = (1 << TICK_BITS) - 1;

/// Sentinel tick distinguishable from any real tick inside packed values.
pub const TREE_MERGE_MARK: Tick = TICK_MASK;

/// Value of the end-of-file terminal node. Equals
/// `pack(AuthorId::MISSING, TREE_MERGE_MARK)`, which no real `(author,
/// tick)` pair can produce.
const TREE_END: u32 = u32::MAX;

// The author sentinel must occupy exactly the bits above the tick.
const _: () = assert!(AuthorId::MISSING.0 == (1 << (32 - TICK_BITS)) - 1);
const _: () = assert!(TREE_END == (AuthorId::MISSING.0 << TICK_BITS) | TICK_MASK);

/// Packs an author and a tick into one order-comparable word.
///
/// For a fixed author, packed values order by tick; ordering across authors
/// is unspecified.
pub fn pack(author: AuthorId, tick: Tick) -> u32 {
    debug_assert!(author.0 <= AuthorId::MISSING.0);
    debug_assert!(tick <= TICK_MASK);
    (author.0 << TICK_BITS) | (tick & TICK_MASK)
}

/// Inverse of [`pack`].
pub fn unpack(value: u32) -> (AuthorId, Tick) {
    (AuthorId(value >> TICK_BITS), value & TICK_MASK)
}

/// The current snapshot of a tracked path.
#[derive(Clone, Copy, Debug)]
pub struct File {
    id: FileId,
    tree: RbTree,
}

impl File {
    /// Creates a file of `length` lines authored by `(author, tick)`.
    pub fn new(id: FileId, author: AuthorId, tick: Tick, length: u32, arena: &mut Arena) -> Self {
        let mut tree = RbTree::new();
        if length > 0 {
            tree.insert(arena, 0, pack(author, tick));
        }
        tree.insert(arena, length, TREE_END);
        Self { id, tree }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    /// Current number of lines. The terminal node's key is the length.
    pub fn len(&self, arena: &Arena) -> u32 {
        arena.key(self.tree.last())
    }

    pub fn is_empty(&self, arena: &Arena) -> bool {
        self.len(arena) == 0
    }

    /// Applies one edit at `position` (a 0-based line index in the new
    /// state): `ins` inserted lines attributed to `(author, tick)` and `del`
    /// deleted lines. Emits one positive change for the insertion and one
    /// negative change per deleted run.
    pub fn update(
        &mut self,
        arena: &mut Arena,
        author: AuthorId,
        tick: Tick,
        position: u32,
        ins: u32,
        del: u32,
        out: &mut Vec<LineHistoryChange>,
    ) {
        if ins == 0 && del == 0 {
            return;
        }
        let new_value = pack(author, tick);
        let old_len = self.len(arena);
        assert!(
            position <= old_len,
            "edit at line {position} past end of {old_len}-line file",
        );
        assert!(
            del <= old_len - position,
            "deleting {del} lines at {position} of a {old_len}-line file",
        );
        let end = position + del;

        if ins > 0 {
            // Authorship of an insertion belongs only to the inserter.
            out.push(LineHistoryChange {
                file_id: self.id,
                curr_tick: tick,
                prev_tick: tick,
                curr_author: author,
                prev_author: author,
                delta: ins as i32,
            });
        }

        // Value of the run covering the line just before `position`.
        let left_value = if position == 0 {
            None
        } else {
            let node = self.tree.find_le(arena, position);
            let node = if arena.key(node) == position {
                self.tree.prev(arena, node)
            } else {
                node
            };
            Some(arena.value(node))
        };

        // Whether the run resuming at `end` already has a node there. The
        // terminal guarantees one when `end` is the old length.
        let end_node = self.tree.find(arena, end);
        let end_value = if end_node == NIL {
            arena.value(self.tree.find_le(arena, end))
        } else {
            arena.value(end_node)
        };

        // Emit one negative change per deleted span and collect the nodes
        // whose keys fall inside the deleted range.
        let mut removed: SmallVec<[u32; 8]> = SmallVec::new();
        if del > 0 {
            let mut cursor = self.tree.find_le(arena, position);
            if arena.key(cursor) == position {
                removed.push(cursor);
            }
            let mut span_start = position;
            loop {
                let next = self.tree.next(arena, cursor);
                let next_key = if next == NIL { old_len } else { arena.key(next) };
                let span_end = next_key.min(end);
                if span_end > span_start {
                    let (prev_author, prev_tick) = unpack(arena.value(cursor));
                    out.push(LineHistoryChange {
                        file_id: self.id,
                        curr_tick: tick,
                        prev_tick,
                        curr_author: author,
                        prev_author,
                        delta: -((span_end - span_start) as i32),
                    });
                }
                if next_key >= end {
                    break;
                }
                cursor = next;
                span_start = next_key;
                removed.push(cursor);
            }
            for index in removed {
                self.tree.delete_at(arena, index);
            }
        }

        // Shift the keys of every surviving node at or after `end`.
        if ins != del {
            let mut cursor = self.tree.find_ge(arena, end);
            while cursor != NIL {
                let key = arena.key(cursor);
                arena.set_key(cursor, key - del + ins);
                cursor = self.tree.next(arena, cursor);
            }
        }

        let resume = position + ins;
        if ins > 0 {
            if left_value != Some(new_value) {
                self.tree.insert(arena, position, new_value);
            }
            if end_node == NIL {
                // The run spanning the old `end` must be split to terminate
                // the inserted run, unless the values coalesce.
                if end_value != new_value {
                    self.tree.insert(arena, resume, end_value);
                }
            } else if end_value == new_value {
                let node = self.tree.find(arena, resume);
                debug_assert_ne!(arena.value(node), TREE_END);
                self.tree.delete_at(arena, node);
            }
        } else {
            // Pure deletion: the content at `end` now resumes at `position`.
            if end_node == NIL {
                if position == 0 || left_value != Some(end_value) {
                    self.tree.insert(arena, position, end_value);
                }
            } else if position > 0 && left_value == Some(end_value) {
                let node = self.tree.find(arena, position);
                debug_assert_ne!(arena.value(node), TREE_END);
                self.tree.delete_at(arena, node);
            }
        }
    }

    /// The `(start, end, value)` runs of the file, excluding the terminal.
    pub fn runs(&self, arena: &Arena) -> Vec<(u32, u32, u32)> {
        let mut runs = Vec::new();
        let mut cursor = self.tree.first();
        while cursor != NIL {
            let next = self.tree.next(arena, cursor);
            if next == NIL {
                break;
            }
            runs.push((arena.key(cursor), arena.key(next), arena.value(cursor)));
            cursor = next;
        }
        runs
    }

    /// Expands the runs into one value per line.
    pub fn lines(&self, arena: &Arena) -> Vec<u32> {
        let mut lines = Vec::with_capacity(self.len(arena) as usize);
        for (start, end, value) in self.runs(arena) {
            lines.resize(lines.len() + (end - start) as usize, value);
        }
        lines
    }

    /// Frees every node of the file, leaving the tree unusable.
    pub fn dispose(&mut self, arena: &mut Arena) {
        let mut cursor = self.tree.first();
        let mut indices: Vec<u32> = Vec::with_capacity(self.tree.len());
        while cursor != NIL {
            indices.push(cursor);
            cursor = self.tree.next(arena, cursor);
        }
        for index in indices {
            arena.free(index);
        }
        self.tree = RbTree::new();
    }

    /// Checks the run-tree invariants on top of the red-black ones. Panics
    /// on violation.
    pub fn validate(&self, arena: &Arena) {
        self.tree.validate(arena);
        assert!(!self.tree.is_empty(), "file without a terminal node");
        assert_eq!(
            arena.value(self.tree.last()),
            TREE_END,
            "terminal node carries a run value",
        );
        let len = self.len(arena);
        if len > 0 {
            assert_eq!(arena.key(self.tree.first()), 0, "first run must start at 0");
        }
        let mut prev_value = None;
        for (_, _, value) in self.runs(arena) {
            assert_ne!(value, TREE_END, "terminal value inside the file");
            assert_ne!(prev_value, Some(value), "adjacent runs share a value");
            prev_value = Some(value);
        }
    }
}
