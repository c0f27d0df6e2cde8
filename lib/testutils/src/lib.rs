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

//! In-memory backends, scripted repositories and observable test items for
//! strata-lib integration tests.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use itertools::EitherOrBoth;
use itertools::Itertools as _;
use strata_lib::backend::AuthorId;
use strata_lib::backend::ChangeKind;
use strata_lib::backend::Commit;
use strata_lib::backend::CommitSource;
use strata_lib::backend::DiffChunk;
use strata_lib::backend::DiffKind;
use strata_lib::backend::DiffProvider;
use strata_lib::backend::FileDiffData;
use strata_lib::backend::IdentityResolver;
use strata_lib::backend::Repository;
use strata_lib::backend::Signature;
use strata_lib::backend::SourceError;
use strata_lib::backend::SourceResult;
use strata_lib::backend::Timestamp;
use strata_lib::backend::TreeChange;
use strata_lib::backend::TreeEntry;
use strata_lib::line_history::DEP_LINE_HISTORY_CHANGES;
use strata_lib::line_history::LineHistoryChange;
use strata_lib::object_id::BlobId;
use strata_lib::object_id::CommitId;
use strata_lib::object_id::ObjectId as _;
use strata_lib::pipeline::DEP_COMMIT;
use strata_lib::pipeline::DEP_IS_MERGE;
use strata_lib::pipeline::Deps;
use strata_lib::pipeline::Outputs;
use strata_lib::pipeline::PipelineItem;
use strata_lib::pipeline::RunError;
use strata_lib::pipeline::output;

const DAY_MS: i64 = 24 * 3600 * 1000;

/// Pads a hex prefix to a full 40-character commit id.
pub fn commit_id(hex: &str) -> CommitId {
    let padded = format!("{hex:0<40}");
    CommitId::try_from_hex(padded).expect("invalid hex prefix")
}

/// Pads a hex prefix to an 8-character blob id.
pub fn blob_id(hex: &str) -> BlobId {
    let padded = format!("{hex:0<8}");
    BlobId::try_from_hex(padded).expect("invalid hex prefix")
}

/// `lines` distinct text lines, salted so different blobs never collide.
pub fn text_of(lines: usize, salt: &str) -> String {
    (0..lines).map(|i| format!("{salt}{i}\n")).collect()
}

#[derive(Clone, Debug)]
pub enum Blob {
    Text(String),
    Binary,
}

/// A scripted in-memory repository.
#[derive(Clone, Debug, Default)]
pub struct TestRepo {
    pub commits: Vec<Commit>,
    pub blobs: HashMap<BlobId, Blob>,
    pub authors: Vec<(String, String)>,
}

impl TestRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an author and returns their dense identity.
    pub fn add_author(&mut self, name: &str, email: &str) -> AuthorId {
        self.authors.push((name.to_owned(), email.to_owned()));
        AuthorId(self.authors.len() as u32 - 1)
    }

    pub fn add_text(&mut self, hex: &str, content: impl Into<String>) -> BlobId {
        let id = blob_id(hex);
        self.blobs.insert(id.clone(), Blob::Text(content.into()));
        id
    }

    pub fn add_binary(&mut self, hex: &str) -> BlobId {
        let id = blob_id(hex);
        self.blobs.insert(id.clone(), Blob::Binary);
        id
    }

    /// Adds a commit authored by `author` (an index returned by
    /// [`Self::add_author`]) `day` days after the epoch.
    pub fn add_commit(
        &mut self,
        hash: &str,
        parents: &[&str],
        author: AuthorId,
        day: i64,
        tree: &[(&str, BlobId)],
    ) -> CommitId {
        let id = commit_id(hash);
        let (name, email) = self.authors[author.0 as usize].clone();
        let commit = Commit::new(
            id.clone(),
            parents.iter().map(|parent| commit_id(parent)).collect(),
            Signature {
                name,
                email,
                timestamp: Timestamp::from_millis(day * DAY_MS),
            },
            tree.iter()
                .map(|(path, blob)| TreeEntry {
                    path: (*path).to_owned(),
                    id: blob.clone(),
                })
                .collect(),
        );
        self.commits.push(commit);
        id
    }

    pub fn commits_rc(&self) -> Vec<Rc<Commit>> {
        self.commits.iter().cloned().map(Rc::new).collect()
    }

    /// Builds the backend bundle the pipeline consumes.
    pub fn build(&self) -> Repository {
        Repository {
            source: Box::new(InMemorySource {
                commits: self.commits.clone(),
            }),
            diffs: Box::new(TestDiffProvider {
                blobs: self.blobs.clone(),
            }),
            identities: Box::new(TestIdentities {
                authors: self.authors.clone(),
            }),
        }
    }
}

pub struct InMemorySource {
    commits: Vec<Commit>,
}

impl CommitSource for InMemorySource {
    fn commits(&self) -> SourceResult<Vec<Commit>> {
        Ok(self.commits.clone())
    }

    fn head_commit(&self) -> SourceResult<Commit> {
        self.commits
            .last()
            .cloned()
            .ok_or_else(|| SourceError::Other("empty test repository".into()))
    }

    fn load_commits_from_path(&self, path: &Path) -> SourceResult<Vec<Commit>> {
        let text = std::fs::read_to_string(path).map_err(|err| SourceError::ReadCommits {
            source: Box::new(err),
        })?;
        let by_hash: HashMap<String, &Commit> = self
            .commits
            .iter()
            .map(|commit| (commit.id.hex(), commit))
            .collect();
        Ok(text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| by_hash.get(line.trim()).map(|commit| (*commit).clone()))
            .collect())
    }
}

pub struct TestIdentities {
    authors: Vec<(String, String)>,
}

impl IdentityResolver for TestIdentities {
    fn count(&self) -> usize {
        self.authors.len()
    }

    fn name_of(&self, id: AuthorId) -> Option<&str> {
        self.authors.get(id.0 as usize).map(|(name, _)| name.as_str())
    }

    fn id_of(&self, name: &str) -> Option<AuthorId> {
        self.authors
            .iter()
            .position(|(n, email)| n == name || email == name)
            .map(|index| AuthorId(index as u32))
    }

    fn for_each(&self, cb: &mut dyn FnMut(AuthorId, &str)) {
        for (index, (name, _)) in self.authors.iter().enumerate() {
            cb(AuthorId(index as u32), name);
        }
    }
}

pub struct TestDiffProvider {
    blobs: HashMap<BlobId, Blob>,
}

impl TestDiffProvider {
    fn blob(&self, id: &BlobId) -> &Blob {
        self.blobs.get(id).expect("unregistered blob in test tree")
    }
}

impl DiffProvider for TestDiffProvider {
    /// Like the default tree diff, but with exact-blob rename detection: a
    /// deletion and an insertion of the same blob become one modification
    /// with differing paths.
    fn tree_changes(
        &self,
        before: &[TreeEntry],
        after: &[TreeEntry],
    ) -> SourceResult<Vec<TreeChange>> {
        let raw = plain_tree_changes(before, after);
        let mut inserts: Vec<TreeChange> = Vec::new();
        let mut rest: Vec<TreeChange> = Vec::new();
        for change in raw {
            if change.kind == ChangeKind::Insert {
                inserts.push(change);
            } else {
                rest.push(change);
            }
        }
        let mut result = Vec::new();
        for change in rest {
            if change.kind == ChangeKind::Delete {
                let deleted = change.before.as_ref().unwrap();
                if let Some(position) = inserts
                    .iter()
                    .position(|insert| insert.after.as_ref().unwrap().id == deleted.id)
                {
                    let insert = inserts.remove(position);
                    let inserted = insert.after.unwrap();
                    result.push(TreeChange::modify(
                        deleted.path.clone(),
                        deleted.id.clone(),
                        inserted.path,
                        inserted.id,
                    ));
                    continue;
                }
            }
            result.push(change);
        }
        result.extend(inserts);
        Ok(result)
    }

    fn line_diff(&self, change: &TreeChange) -> SourceResult<Option<FileDiffData>> {
        let after = change.after.as_ref().map(|entry| self.blob(&entry.id));
        let before = change.before.as_ref().map(|entry| self.blob(&entry.id));
        match change.kind {
            ChangeKind::Insert => match after {
                Some(Blob::Text(text)) => Ok(Some(full_insert(text))),
                _ => Ok(None),
            },
            ChangeKind::Delete => Ok(None),
            ChangeKind::Modify => match (before, after) {
                (Some(Blob::Text(old)), Some(Blob::Text(new))) => {
                    Ok(Some(line_diff_script(old, new)))
                }
                (Some(Blob::Binary), Some(Blob::Text(text))) => Ok(Some(full_insert(text))),
                _ => Ok(None),
            },
        }
    }
}

fn plain_tree_changes(before: &[TreeEntry], after: &[TreeEntry]) -> Vec<TreeChange> {
    before
        .iter()
        .merge_join_by(after, |b, a| b.path.cmp(&a.path))
        .filter_map(|pair| match pair {
            EitherOrBoth::Left(b) => Some(TreeChange::delete(b.path.clone(), b.id.clone())),
            EitherOrBoth::Right(a) => Some(TreeChange::insert(a.path.clone(), a.id.clone())),
            EitherOrBoth::Both(b, a) if b.id != a.id => Some(TreeChange::modify(
                b.path.clone(),
                b.id.clone(),
                a.path.clone(),
                a.id.clone(),
            )),
            EitherOrBoth::Both(..) => None,
        })
        .collect()
}

fn count_lines(text: &str) -> usize {
    text.split_inclusive('\n').count()
}

fn full_insert(text: &str) -> FileDiffData {
    FileDiffData {
        old_lines: 0,
        new_lines: count_lines(text),
        diffs: vec![DiffChunk::new(DiffKind::Insert, text)],
    }
}

/// Edit script between two texts: a shared prefix, one delete/insert pair,
/// and a shared suffix. Enough structure for replay tests.
pub fn line_diff_script(old: &str, new: &str) -> FileDiffData {
    let old_lines: Vec<&str> = old.split_inclusive('\n').collect();
    let new_lines: Vec<&str> = new.split_inclusive('\n').collect();
    let shortest = old_lines.len().min(new_lines.len());
    let mut prefix = 0;
    while prefix < shortest && old_lines[prefix] == new_lines[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < shortest - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }
    let mut diffs = Vec::new();
    if prefix > 0 {
        diffs.push(DiffChunk::new(
            DiffKind::Equal,
            old_lines[..prefix].concat(),
        ));
    }
    if old_lines.len() - suffix > prefix {
        diffs.push(DiffChunk::new(
            DiffKind::Delete,
            old_lines[prefix..old_lines.len() - suffix].concat(),
        ));
    }
    if new_lines.len() - suffix > prefix {
        diffs.push(DiffChunk::new(
            DiffKind::Insert,
            new_lines[prefix..new_lines.len() - suffix].concat(),
        ));
    }
    if suffix > 0 {
        diffs.push(DiffChunk::new(
            DiffKind::Equal,
            old_lines[old_lines.len() - suffix..].concat(),
        ));
    }
    FileDiffData {
        old_lines: old_lines.len(),
        new_lines: new_lines.len(),
        diffs,
    }
}

/// Observable state shared by a [`TestItem`] and all its forks.
#[derive(Clone, Debug, Default)]
pub struct TestItemState {
    pub forked: bool,
    pub merged: bool,
    pub commits_seen: BTreeSet<String>,
    pub consume_calls: usize,
    /// +1 per ordinary commit consumed, +2 per merge-commit visit.
    pub merge_state: u32,
    /// Number of consumes that saw `is_merge == true`.
    pub merge_flags: usize,
    pub hibernations: usize,
    pub boots: usize,
}

/// A pipeline item that records what the runtime does to it.
#[derive(Clone, Debug, Default)]
pub struct TestItem {
    pub state: Rc<RefCell<TestItemState>>,
}

impl TestItem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Rc<RefCell<TestItemState>> {
        self.state.clone()
    }
}

impl PipelineItem for TestItem {
    fn name(&self) -> &'static str {
        "TestItem"
    }

    fn provides(&self) -> &'static [&'static str] {
        &["test"]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    fn consume(&mut self, deps: &Deps) -> Result<Outputs, RunError> {
        let commit = deps.get::<Commit>(DEP_COMMIT)?;
        let is_merge = *deps.get::<bool>(DEP_IS_MERGE)?;
        let mut state = self.state.borrow_mut();
        state.consume_calls += 1;
        state.commits_seen.insert(commit.id.hex());
        state.merge_state += if commit.parents.len() < 2 { 1 } else { 2 };
        if is_merge {
            state.merge_flags += 1;
        }
        Ok(vec![output("test", ())])
    }

    fn fork(&mut self, n: usize) -> Vec<Box<dyn PipelineItem>> {
        self.state.borrow_mut().forked = true;
        (0..n)
            .map(|_| Box::new(self.clone()) as Box<dyn PipelineItem>)
            .collect()
    }

    fn merge(&mut self, _siblings: &mut [&mut dyn PipelineItem]) {
        self.state.borrow_mut().merged = true;
    }

    fn hibernate(&mut self) -> Result<(), strata_lib::rbtree::HibernateError> {
        self.state.borrow_mut().hibernations += 1;
        Ok(())
    }

    fn boot(&mut self) -> Result<(), strata_lib::rbtree::HibernateError> {
        self.state.borrow_mut().boots += 1;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Collects every [`LineHistoryChange`] the engine emits, across all
/// branches, tagged with the emitting commit.
#[derive(Clone, Debug, Default)]
pub struct ChangeCollector {
    pub changes: Rc<RefCell<Vec<(String, LineHistoryChange)>>>,
}

impl ChangeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> Rc<RefCell<Vec<(String, LineHistoryChange)>>> {
        self.changes.clone()
    }
}

impl PipelineItem for ChangeCollector {
    fn name(&self) -> &'static str {
        "ChangeCollector"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[DEP_LINE_HISTORY_CHANGES]
    }

    fn consume(&mut self, deps: &Deps) -> Result<Outputs, RunError> {
        let commit = deps.get::<Commit>(DEP_COMMIT)?;
        let changes = deps.get::<Vec<LineHistoryChange>>(DEP_LINE_HISTORY_CHANGES)?;
        let mut log = self.changes.borrow_mut();
        for change in changes {
            log.push((commit.id.hex(), *change));
        }
        Ok(Vec::new())
    }

    fn fork(&mut self, n: usize) -> Vec<Box<dyn PipelineItem>> {
        (0..n)
            .map(|_| Box::new(self.clone()) as Box<dyn PipelineItem>)
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
