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

//! Adapts the external diff provider into bus values.
//!
//! Per branch the item remembers the previously consumed commit's tree and
//! diffs the current commit against it, which matches the replay order: a
//! merge commit is diffed against the continuing branch's own tip.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::ChangeKind;
use crate::backend::Commit;
use crate::backend::FileDiffData;
use crate::backend::Repository;
use crate::backend::TreeEntry;
use crate::pipeline::DEP_COMMIT;
use crate::pipeline::Deps;
use crate::pipeline::Outputs;
use crate::pipeline::PipelineItem;
use crate::pipeline::ResolveError;
use crate::pipeline::RunError;
use crate::pipeline::facts;
use crate::pipeline::facts::Facts;
use crate::pipeline::output;

/// Bus key carrying the tree diff of the current commit
/// (`Vec<TreeChange>`).
pub const DEP_TREE_CHANGES: &str = "tree_changes";
/// Bus key carrying the per-path line edit scripts
/// (`HashMap<String, FileDiffData>`).
pub const DEP_FILE_DIFFS: &str = "file_diffs";

/// Provides `tree_changes` and `file_diffs` from the external
/// [`crate::backend::DiffProvider`].
#[derive(Clone, Debug, Default)]
pub struct TreeChangesItem {
    repo: Option<Arc<Repository>>,
    previous_tree: Vec<TreeEntry>,
    fail_on_errors: bool,
}

impl TreeChangesItem {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineItem for TreeChangesItem {
    fn name(&self) -> &'static str {
        "TreeChanges"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[DEP_TREE_CHANGES, DEP_FILE_DIFFS]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    fn configure(&mut self, facts: &mut Facts) -> Result<(), ResolveError> {
        self.fail_on_errors = facts.bool_or(facts::CHANGES_FAIL_ON_ERRORS, false);
        Ok(())
    }

    fn initialize(&mut self, repo: &Arc<Repository>) -> Result<(), ResolveError> {
        self.repo = Some(repo.clone());
        self.previous_tree.clear();
        Ok(())
    }

    fn consume(&mut self, deps: &Deps) -> Result<Outputs, RunError> {
        let commit = deps.get::<Commit>(DEP_COMMIT)?;
        let repo = self.repo.as_ref().expect("item consumed before initialization");
        let changes = repo.diffs.tree_changes(&self.previous_tree, commit.tree())?;
        let mut kept = Vec::with_capacity(changes.len());
        let mut diffs = HashMap::new();
        for change in changes {
            if change.kind == ChangeKind::Delete {
                kept.push(change);
                continue;
            }
            match repo.diffs.line_diff(&change) {
                Ok(Some(diff)) => {
                    diffs.insert(change.path().to_owned(), diff);
                    kept.push(change);
                }
                // Binary content: the engine decides what the absence of an
                // edit script means for this change kind.
                Ok(None) => kept.push(change),
                Err(err) if self.fail_on_errors => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(path = change.path(), "skipping undiffable file: {err}");
                }
            }
        }
        self.previous_tree = commit.tree().to_vec();
        Ok(vec![
            output(DEP_TREE_CHANGES, kept),
            output::<HashMap<String, FileDiffData>>(DEP_FILE_DIFFS, diffs),
        ])
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
