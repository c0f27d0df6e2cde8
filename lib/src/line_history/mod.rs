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

//! The line-history engine.
//!
//! Tracks every text file of the replayed history as a tree of line runs
//! and turns tree-diff edit scripts into a stream of
//! [`LineHistoryChange`] records. Runs inside the pipeline as the
//! `LineHistory` item; branch forks clone the arena, branch merges
//! reconcile the name maps.

mod file;

pub use file::File;
pub use file::TICK_BITS;
pub use file::TREE_MERGE_MARK;
pub use file::pack;
pub use file::unpack;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;

use crate::backend::AuthorId;
use crate::backend::ChangeKind;
use crate::backend::DiffKind;
use crate::backend::FileDiffData;
use crate::backend::Repository;
use crate::backend::Tick;
use crate::backend::TreeChange;
use crate::items::DEP_AUTHOR;
use crate::items::DEP_FILE_DIFFS;
use crate::items::DEP_TICK;
use crate::items::DEP_TREE_CHANGES;
use crate::object_id::ObjectId as _;
use crate::pipeline::Deps;
use crate::pipeline::Outputs;
use crate::pipeline::PipelineItem;
use crate::pipeline::ResolveError;
use crate::pipeline::RunError;
use crate::pipeline::facts;
use crate::pipeline::facts::Facts;
use crate::pipeline::output;
use crate::rbtree::Arena;
use crate::rbtree::HibernateError;

/// Bus key carrying the engine's per-commit change batch
/// (`Vec<LineHistoryChange>`).
pub const DEP_LINE_HISTORY_CHANGES: &str = "line_history_changes";

/// Dense identity of a tracked path, stable across renames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// `delta` of the sentinel record signalling a file removal.
pub const FILE_REMOVED: i32 = i32::MIN;

/// One line-attribution change.
///
/// `delta > 0` is an insertion (`curr` equals `prev`); `delta < 0` is a
/// deletion of lines previously attributed to `(prev_author, prev_tick)`;
/// `delta == FILE_REMOVED` with missing authors signals the file itself was
/// removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct LineHistoryChange {
    pub file_id: FileId,
    pub curr_tick: Tick,
    pub prev_tick: Tick,
    pub curr_author: AuthorId,
    pub prev_author: AuthorId,
    pub delta: i32,
}

impl LineHistoryChange {
    /// The sentinel record emitted after a file's remaining lines have been
    /// deleted.
    pub fn file_removed(file_id: FileId, tick: Tick) -> Self {
        Self {
            file_id,
            curr_tick: tick,
            prev_tick: tick,
            curr_author: AuthorId::MISSING,
            prev_author: AuthorId::MISSING,
            delta: FILE_REMOVED,
        }
    }

    pub fn is_file_removal(&self) -> bool {
        self.delta == FILE_REMOVED
    }
}

/// Error raised while applying edit scripts.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(
        "line count mismatch for {path} ({before_blob} -> {after_blob}): \
         expected {expected} lines, tracked {actual}"
    )]
    Integrity {
        path: String,
        before_blob: String,
        after_blob: String,
        expected: usize,
        actual: usize,
    },
    #[error("unsupported edit script for {path}: {reason}")]
    UnsupportedDiff { path: String, reason: String },
}

/// The engine's per-branch state and pipeline item.
#[derive(Clone, Debug)]
pub struct LineHistory {
    arena: Arena,
    files: HashMap<FileId, File>,
    names: HashMap<String, FileId>,
    /// Names this branch stopped tracking (renamed away or deleted),
    /// retaining the surviving id for resolver queries.
    abandoned: HashMap<String, FileId>,
    /// Abandoned-name sets frozen by ancestors at fork points, shared
    /// read-only between siblings.
    inherited: Vec<Rc<HashMap<String, FileId>>>,
    next_id: u32,
    hibernation_threshold: usize,
    hibernation_on_disk: bool,
    hibernation_dir: Option<PathBuf>,
    debug: bool,
}

impl Default for LineHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl LineHistory {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            files: HashMap::new(),
            names: HashMap::new(),
            abandoned: HashMap::new(),
            inherited: Vec::new(),
            next_id: 1,
            hibernation_threshold: 0,
            hibernation_on_disk: false,
            hibernation_dir: None,
            debug: false,
        }
    }

    /// Number of currently tracked paths.
    pub fn tracked_len(&self) -> usize {
        self.names.len()
    }

    /// The id of a currently tracked path.
    pub fn tracked(&self, name: &str) -> Option<FileId> {
        self.names.get(name).copied()
    }

    /// Resolves a path to an id, consulting the authoritative map first,
    /// then the branch's own abandoned names, then the sets inherited from
    /// ancestor forks.
    pub fn resolve(&self, name: &str) -> Option<FileId> {
        self.names
            .get(name)
            .or_else(|| self.abandoned.get(name))
            .copied()
            .or_else(|| {
                self.inherited
                    .iter()
                    .rev()
                    .find_map(|set| set.get(name).copied())
            })
    }

    /// Current line count of a tracked path.
    pub fn len_of(&self, name: &str) -> Option<u32> {
        let id = self.names.get(name)?;
        Some(self.files[id].len(&self.arena))
    }

    /// Per-line `(author, tick)` attribution of a tracked path.
    pub fn lines_of(&self, name: &str) -> Option<Vec<(AuthorId, Tick)>> {
        let id = self.names.get(name)?;
        Some(
            self.files[id]
                .lines(&self.arena)
                .into_iter()
                .map(unpack)
                .collect(),
        )
    }

    fn handle_insert(
        &mut self,
        change: &TreeChange,
        diff: Option<&FileDiffData>,
        author: AuthorId,
        tick: Tick,
        out: &mut Vec<LineHistoryChange>,
    ) {
        let entry = change.after.as_ref().expect("insertion without after entry");
        let Some(diff) = diff else {
            // Binary files are not tracked.
            return;
        };
        let new_lines = diff.new_lines as u32;
        if let Some(&id) = self.names.get(&entry.path) {
            // The path can reappear through a merge replay while this branch
            // still tracks it; replace the content under the existing id.
            let file = self.files.get_mut(&id).expect("tracked name without file");
            let old_len = file.len(&self.arena);
            file.update(&mut self.arena, author, tick, 0, new_lines, old_len, out);
        } else {
            let id = FileId(self.next_id);
            self.next_id += 1;
            let mut file = File::new(id, author, tick, 0, &mut self.arena);
            file.update(&mut self.arena, author, tick, 0, new_lines, 0, out);
            self.files.insert(id, file);
            self.names.insert(entry.path.clone(), id);
        }
        if self.debug {
            let id = self.names[&entry.path];
            self.files[&id].validate(&self.arena);
        }
    }

    fn handle_delete(
        &mut self,
        path: &str,
        author: AuthorId,
        tick: Tick,
        out: &mut Vec<LineHistoryChange>,
    ) {
        let Some(id) = self.names.remove(path) else {
            // Binary or otherwise untracked path.
            return;
        };
        let mut file = self.files.remove(&id).expect("tracked name without file");
        let len = file.len(&self.arena);
        file.update(&mut self.arena, author, tick, 0, 0, len, out);
        out.push(LineHistoryChange::file_removed(id, tick));
        file.dispose(&mut self.arena);
        self.abandoned.insert(path.to_owned(), id);
    }

    fn handle_modify(
        &mut self,
        change: &TreeChange,
        diff: Option<&FileDiffData>,
        author: AuthorId,
        tick: Tick,
        out: &mut Vec<LineHistoryChange>,
    ) -> Result<(), HistoryError> {
        let before = change.before.as_ref().expect("modification without before entry");
        let after = change.after.as_ref().expect("modification without after entry");
        if before.path != after.path {
            // A rename transplants the file and keeps its id; the old name
            // stays resolvable.
            if let Some(id) = self.names.remove(&before.path) {
                self.abandoned.insert(before.path.clone(), id);
                self.names.insert(after.path.clone(), id);
            }
        }
        match (self.names.get(&after.path).copied(), diff) {
            (Some(id), Some(diff)) => self.apply_edits(id, change, diff, author, tick, out)?,
            // The path was never tracked, so the former content was binary;
            // the transition to text is an insertion.
            (None, Some(_)) => self.handle_insert(change, diff, author, tick, out),
            // Text went binary; the new content counts as no content.
            (Some(_), None) => self.handle_delete(&after.path.clone(), author, tick, out),
            (None, None) => {}
        }
        Ok(())
    }

    fn apply_edits(
        &mut self,
        id: FileId,
        change: &TreeChange,
        diff: &FileDiffData,
        author: AuthorId,
        tick: Tick,
        out: &mut Vec<LineHistoryChange>,
    ) -> Result<(), HistoryError> {
        let integrity = |expected: usize, actual: usize| HistoryError::Integrity {
            path: change.path().to_owned(),
            before_blob: change.before.as_ref().map(|e| e.id.hex()).unwrap_or_default(),
            after_blob: change.after.as_ref().map(|e| e.id.hex()).unwrap_or_default(),
            expected,
            actual,
        };
        let unsupported = |reason: &str| HistoryError::UnsupportedDiff {
            path: change.path().to_owned(),
            reason: reason.to_owned(),
        };
        let file = self.files.get_mut(&id).expect("tracked name without file");
        let actual = file.len(&self.arena) as usize;
        if actual != diff.old_lines {
            return Err(integrity(diff.old_lines, actual));
        }

        // `position` is the 0-based line index in the new file state. The
        // one-slot pending buffer pairs a deletion immediately followed by
        // an insertion into a single replacement update.
        let mut position: u32 = 0;
        let mut pending: Option<(DiffKind, u32)> = None;
        let flush = |file: &mut File,
                     arena: &mut Arena,
                     pending: Option<(DiffKind, u32)>,
                     position: &mut u32,
                     out: &mut Vec<LineHistoryChange>| {
            match pending {
                Some((DiffKind::Insert, lines)) => {
                    file.update(arena, author, tick, *position, lines, 0, out);
                    *position += lines;
                }
                Some((DiffKind::Delete, lines)) => {
                    file.update(arena, author, tick, *position, 0, lines, out);
                }
                Some((DiffKind::Equal, _)) | None => {}
            }
        };
        for chunk in &diff.diffs {
            let lines = chunk.line_count() as u32;
            match chunk.kind {
                DiffKind::Equal => {
                    flush(file, &mut self.arena, pending.take(), &mut position, out);
                    position += lines;
                }
                DiffKind::Insert => match pending.take() {
                    Some((DiffKind::Delete, deleted)) => {
                        file.update(&mut self.arena, author, tick, position, lines, deleted, out);
                        position += lines;
                    }
                    Some(_) => {
                        return Err(unsupported("insertion while another insertion is pending"));
                    }
                    None => pending = Some((DiffKind::Insert, lines)),
                },
                DiffKind::Delete => {
                    if pending.is_some() {
                        return Err(unsupported("deletion while another edit is pending"));
                    }
                    pending = Some((DiffKind::Delete, lines));
                }
            }
        }
        flush(file, &mut self.arena, pending.take(), &mut position, out);

        let result = file.len(&self.arena) as usize;
        if result != diff.new_lines {
            return Err(integrity(diff.new_lines, result));
        }
        if self.debug {
            file.validate(&self.arena);
        }
        Ok(())
    }
}

impl PipelineItem for LineHistory {
    fn name(&self) -> &'static str {
        "LineHistory"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[DEP_LINE_HISTORY_CHANGES]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[DEP_TICK, DEP_AUTHOR, DEP_TREE_CHANGES, DEP_FILE_DIFFS]
    }

    fn configure(&mut self, facts: &mut Facts) -> Result<(), ResolveError> {
        self.hibernation_threshold =
            facts.int_or(facts::LINE_HISTORY_HIBERNATION_THRESHOLD, 0).max(0) as usize;
        self.hibernation_on_disk = facts.bool_or(facts::LINE_HISTORY_HIBERNATION_ON_DISK, false);
        self.hibernation_dir = facts
            .path(facts::LINE_HISTORY_HIBERNATION_DIRECTORY)
            .map(Path::to_owned);
        self.debug = facts.bool_or(facts::LINE_HISTORY_DEBUG, false);
        Ok(())
    }

    fn initialize(&mut self, _repo: &Arc<Repository>) -> Result<(), ResolveError> {
        self.arena = Arena::new();
        self.files.clear();
        self.names.clear();
        self.abandoned.clear();
        self.inherited.clear();
        self.next_id = 1;
        Ok(())
    }

    fn consume(&mut self, deps: &Deps) -> Result<Outputs, RunError> {
        let tick = *deps.get::<Tick>(DEP_TICK)?;
        let author = *deps.get::<AuthorId>(DEP_AUTHOR)?;
        let changes = deps.get::<Vec<TreeChange>>(DEP_TREE_CHANGES)?;
        let diffs = deps.get::<HashMap<String, FileDiffData>>(DEP_FILE_DIFFS)?;
        let mut out = Vec::new();
        for change in changes {
            let diff = diffs.get(change.path());
            match change.kind {
                ChangeKind::Insert => self.handle_insert(change, diff, author, tick, &mut out),
                ChangeKind::Delete => {
                    let path = change
                        .before
                        .as_ref()
                        .expect("deletion without before entry")
                        .path
                        .clone();
                    self.handle_delete(&path, author, tick, &mut out);
                }
                ChangeKind::Modify => {
                    self.handle_modify(change, diff, author, tick, &mut out)?;
                }
            }
        }
        Ok(vec![output(DEP_LINE_HISTORY_CHANGES, out)])
    }

    fn fork(&mut self, n: usize) -> Vec<Box<dyn PipelineItem>> {
        let mut inherited = self.inherited.clone();
        if !self.abandoned.is_empty() {
            inherited.push(Rc::new(self.abandoned.clone()));
        }
        (0..n)
            .map(|_| {
                Box::new(Self {
                    arena: self.arena.clone(),
                    files: self.files.clone(),
                    names: self.names.clone(),
                    abandoned: HashMap::new(),
                    inherited: inherited.clone(),
                    next_id: self.next_id,
                    hibernation_threshold: self.hibernation_threshold,
                    hibernation_on_disk: self.hibernation_on_disk,
                    hibernation_dir: self.hibernation_dir.clone(),
                    debug: self.debug,
                }) as Box<dyn PipelineItem>
            })
            .collect()
    }

    fn merge(&mut self, siblings: &mut [&mut dyn PipelineItem]) {
        // Tree contents are never combined; downstream consumers have
        // already seen the sibling branches' change streams. Only the name
        // maps are reconciled so resolver queries stay complete.
        for sibling in siblings {
            let Some(other) = sibling.as_any().downcast_ref::<Self>() else {
                continue;
            };
            for (name, id) in &other.abandoned {
                self.abandoned.entry(name.clone()).or_insert(*id);
            }
            for (name, id) in &other.names {
                if !self.names.contains_key(name) {
                    self.abandoned.entry(name.clone()).or_insert(*id);
                }
            }
            for set in &other.inherited {
                if !self.inherited.iter().any(|own| Rc::ptr_eq(own, set)) {
                    self.inherited.push(set.clone());
                }
            }
            self.next_id = self.next_id.max(other.next_id);
        }
    }

    fn hibernate(&mut self) -> Result<(), HibernateError> {
        if self.arena.len() < self.hibernation_threshold {
            return Ok(());
        }
        if self.hibernation_on_disk {
            let dir = self
                .hibernation_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            self.arena.hibernate_to_disk(&dir)
        } else {
            self.arena.hibernate();
            Ok(())
        }
    }

    fn boot(&mut self) -> Result<(), HibernateError> {
        if !self.arena.is_hibernated() {
            // Hibernation was a threshold no-op.
            return Ok(());
        }
        self.arena.boot()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
