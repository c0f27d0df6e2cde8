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

//! The pipeline item capability interface and the keyed dependency bus.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::Arc;

use super::RunError;
use super::facts::Facts;
use crate::backend::Repository;
use crate::pipeline::ResolveError;
use crate::rbtree::HibernateError;

/// Bus key carrying the current [`crate::backend::Commit`].
pub const DEP_COMMIT: &str = "commit";
/// Bus key carrying the plan action index (`usize`).
pub const DEP_INDEX: &str = "index";
/// Bus key that is `true` exactly on the first commit following a merge on
/// the same branch.
pub const DEP_IS_MERGE: &str = "is_merge";

/// The keyed value map passed to [`PipelineItem::consume`].
///
/// Each value carries the exact type produced by its provider; readers
/// downcast through [`Deps::get`].
#[derive(Clone, Default)]
pub struct Deps {
    values: HashMap<&'static str, Rc<dyn Any>>,
}

impl Deps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any>(&mut self, key: &'static str, value: T) {
        self.values.insert(key, Rc::new(value));
    }

    pub fn insert_rc(&mut self, key: &'static str, value: Rc<dyn Any>) {
        self.values.insert(key, value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Reads a dependency, failing if it is absent or of the wrong type.
    pub fn get<T: Any>(&self, key: &'static str) -> Result<&T, RunError> {
        let value = self
            .values
            .get(key)
            .ok_or(RunError::MissingDependency { key })?;
        value
            .downcast_ref::<T>()
            .ok_or(RunError::MistypedDependency { key })
    }
}

/// Outputs returned from one [`PipelineItem::consume`] call, merged back
/// into the bus under the item's provided keys.
pub type Outputs = Vec<(&'static str, Rc<dyn Any>)>;

/// Wraps a value for an [`Outputs`] list.
pub fn output<T: Any>(key: &'static str, value: T) -> (&'static str, Rc<dyn Any>) {
    (key, Rc::new(value))
}

/// One analysis unit of the pipeline.
///
/// Items declare the bus keys they provide and require; the runtime resolves
/// the resulting bipartite graph, drives `consume` per commit in dependency
/// order, and forks/merges per-branch instances in lockstep with the plan.
pub trait PipelineItem: Any {
    /// Stable name the item is registered and summoned under.
    fn name(&self) -> &'static str;

    /// Bus keys this item writes.
    fn provides(&self) -> &'static [&'static str];

    /// Bus keys this item reads.
    fn requires(&self) -> &'static [&'static str];

    /// Feature tags that must all be enabled for this item to resolve.
    fn features(&self) -> &'static [&'static str] {
        &[]
    }

    /// Receives the shared fact map before initialization. Facts written
    /// here are visible to items configured later.
    fn configure(&mut self, _facts: &mut Facts) -> Result<(), ResolveError> {
        Ok(())
    }

    /// Receives the repository handle after configuration, in dependency
    /// order.
    fn initialize(&mut self, _repo: &Arc<Repository>) -> Result<(), ResolveError> {
        Ok(())
    }

    /// Processes one commit. `deps` holds the seeded keys plus the outputs
    /// of every upstream item for this commit.
    fn consume(&mut self, deps: &Deps) -> Result<Outputs, RunError>;

    /// Clones this item's per-branch state into `n` new instances. The
    /// original continues on the source branch.
    fn fork(&mut self, n: usize) -> Vec<Box<dyn PipelineItem>>;

    /// Combines sibling branch state into `self` after a merge action. The
    /// siblings stay alive until their branches are deleted.
    fn merge(&mut self, _siblings: &mut [&mut dyn PipelineItem]) {}

    /// Compacts memory while the owning branch is dormant.
    fn hibernate(&mut self) -> Result<(), HibernateError> {
        Ok(())
    }

    /// Restores state compacted by [`Self::hibernate`].
    fn boot(&mut self) -> Result<(), HibernateError> {
        Ok(())
    }

    /// Releases resources when the owning branch is deleted.
    fn dispose(&mut self) {}

    /// Whether the item should be disposed right after its first consume.
    fn one_shot(&self) -> bool {
        false
    }

    /// The optional leaf capability; leaf items surface finalized results
    /// to the caller.
    fn as_leaf(&mut self) -> Option<&mut dyn LeafItem> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Optional capability of items whose results are surfaced to callers.
pub trait LeafItem: PipelineItem {
    /// The command-line flag that selects this item.
    fn flag(&self) -> &'static str;

    /// Produces the final result after the whole plan has executed.
    fn finalize(&mut self) -> Box<dyn Any>;

    /// Writes a finalized result to `out`.
    fn serialize(&self, result: &dyn Any, out: &mut dyn io::Write) -> io::Result<()>;
}
