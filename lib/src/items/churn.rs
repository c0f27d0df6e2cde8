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

//! Leaf item aggregating line churn per tick and author.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::rc::Rc;

use crate::backend::AuthorId;
use crate::backend::Commit;
use crate::backend::Tick;
use crate::line_history::DEP_LINE_HISTORY_CHANGES;
use crate::line_history::LineHistoryChange;
use crate::pipeline::DEP_COMMIT;
use crate::pipeline::Deps;
use crate::pipeline::LeafItem;
use crate::pipeline::Outputs;
use crate::pipeline::PipelineItem;
use crate::pipeline::RunError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChurnCounts {
    pub added: u64,
    pub removed: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct AuthorChurn {
    pub author: AuthorId,
    pub added: u64,
    pub removed: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct TickChurn {
    pub tick: Tick,
    pub authors: Vec<AuthorChurn>,
}

/// Finalized per-tick/per-author added and removed line counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChurnReport {
    pub ticks: Vec<TickChurn>,
}

#[derive(Debug, Default)]
struct ChurnState {
    per_tick: BTreeMap<Tick, BTreeMap<AuthorId, ChurnCounts>>,
}

/// Leaf item counting inserted and deleted lines per tick and author.
///
/// Merge commits author no lines and are skipped entirely, so every counted
/// commit is consumed exactly once across all branches; the accumulator is
/// therefore shared between forks and `merge` has nothing to reconcile.
#[derive(Clone, Debug, Default)]
pub struct LineChurn {
    state: Rc<RefCell<ChurnState>>,
}

impl LineChurn {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineItem for LineChurn {
    fn name(&self) -> &'static str {
        "LineChurn"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[DEP_LINE_HISTORY_CHANGES]
    }

    fn consume(&mut self, deps: &Deps) -> Result<Outputs, RunError> {
        let commit = deps.get::<Commit>(DEP_COMMIT)?;
        if commit.is_merge() {
            return Ok(Vec::new());
        }
        let changes = deps.get::<Vec<LineHistoryChange>>(DEP_LINE_HISTORY_CHANGES)?;
        let mut state = self.state.borrow_mut();
        for change in changes {
            if change.is_file_removal() {
                continue;
            }
            let counts = state
                .per_tick
                .entry(change.curr_tick)
                .or_default()
                .entry(if change.delta > 0 {
                    change.curr_author
                } else {
                    change.prev_author
                })
                .or_default();
            if change.delta > 0 {
                counts.added += change.delta as u64;
            } else {
                counts.removed += u64::from(change.delta.unsigned_abs());
            }
        }
        Ok(Vec::new())
    }

    fn fork(&mut self, n: usize) -> Vec<Box<dyn PipelineItem>> {
        (0..n)
            .map(|_| Box::new(self.clone()) as Box<dyn PipelineItem>)
            .collect()
    }

    fn as_leaf(&mut self) -> Option<&mut dyn LeafItem> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl LeafItem for LineChurn {
    fn flag(&self) -> &'static str {
        "churn"
    }

    fn finalize(&mut self) -> Box<dyn Any> {
        let state = self.state.borrow();
        let ticks = state
            .per_tick
            .iter()
            .map(|(tick, authors)| TickChurn {
                tick: *tick,
                authors: authors
                    .iter()
                    .map(|(author, counts)| AuthorChurn {
                        author: *author,
                        added: counts.added,
                        removed: counts.removed,
                    })
                    .collect(),
            })
            .collect();
        Box::new(ChurnReport { ticks })
    }

    fn serialize(&self, result: &dyn Any, out: &mut dyn io::Write) -> io::Result<()> {
        let report = result
            .downcast_ref::<ChurnReport>()
            .expect("churn result of foreign type");
        serde_json::to_writer_pretty(&mut *out, report)?;
        out.write_all(b"\n")
    }
}
