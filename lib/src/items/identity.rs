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

//! Resolves commit author signatures to dense identities.

use std::any::Any;
use std::sync::Arc;

use crate::backend::AuthorId;
use crate::backend::Commit;
use crate::backend::Repository;
use crate::pipeline::DEP_COMMIT;
use crate::pipeline::Deps;
use crate::pipeline::Outputs;
use crate::pipeline::PipelineItem;
use crate::pipeline::ResolveError;
use crate::pipeline::RunError;
use crate::pipeline::output;

/// Bus key carrying the current commit's resolved author (`AuthorId`).
pub const DEP_AUTHOR: &str = "author";

/// Provides `author`: the commit author signature pushed through the
/// external identity resolver. Unmatched signatures yield
/// [`AuthorId::MISSING`].
#[derive(Clone, Debug, Default)]
pub struct IdentityDetector {
    repo: Option<Arc<Repository>>,
}

impl IdentityDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineItem for IdentityDetector {
    fn name(&self) -> &'static str {
        "IdentityDetector"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[DEP_AUTHOR]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    fn initialize(&mut self, repo: &Arc<Repository>) -> Result<(), ResolveError> {
        self.repo = Some(repo.clone());
        Ok(())
    }

    fn consume(&mut self, deps: &Deps) -> Result<Outputs, RunError> {
        let commit = deps.get::<Commit>(DEP_COMMIT)?;
        let identities = &self.repo.as_ref().expect("item consumed before initialization").identities;
        let signature = &commit.author;
        let author = identities
            .id_of(&signature.email)
            .or_else(|| identities.id_of(&signature.name))
            .unwrap_or(AuthorId::MISSING);
        debug_assert!(author.0 <= AuthorId::MISSING.0, "resolver id out of range");
        Ok(vec![output(DEP_AUTHOR, author)])
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
