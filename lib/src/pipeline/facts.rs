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

//! Configuration fact map shared by the pipeline and its items.
//!
//! Facts written by one item's `configure` are visible to every item
//! configured after it.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use crate::backend::Commit;

pub const DUMP_PATH: &str = "Pipeline.DumpPath";
pub const DRY_RUN: &str = "Pipeline.DryRun";
pub const DUMP_PLAN: &str = "Pipeline.DumpPlan";
pub const HIBERNATION_DISTANCE: &str = "Pipeline.HibernationDistance";
pub const PRINT_ACTIONS: &str = "Pipeline.PrintActions";
pub const COMMITS: &str = "Pipeline.Commits";
pub const LINE_HISTORY_HIBERNATION_THRESHOLD: &str = "LineHistory.HibernationThreshold";
pub const LINE_HISTORY_HIBERNATION_ON_DISK: &str = "LineHistory.HibernationOnDisk";
pub const LINE_HISTORY_HIBERNATION_DIRECTORY: &str = "LineHistory.HibernationDirectory";
pub const LINE_HISTORY_DEBUG: &str = "LineHistory.Debug";
pub const CHANGES_FAIL_ON_ERRORS: &str = "Changes.FailOnErrors";

/// A single configuration value.
#[derive(Clone, Debug)]
pub enum FactValue {
    Bool(bool),
    Int(i64),
    String(String),
    Path(PathBuf),
    Commits(Vec<Rc<Commit>>),
}

/// String-keyed configuration map.
#[derive(Clone, Debug, Default)]
pub struct Facts {
    values: BTreeMap<String, FactValue>,
}

impl Facts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: FactValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&FactValue> {
        self.values.get(key)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(FactValue::Bool(value)) => *value,
            _ => default,
        }
    }

    pub fn int_or(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(FactValue::Int(value)) => *value,
            _ => default,
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(FactValue::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn path(&self, key: &str) -> Option<&Path> {
        match self.values.get(key) {
            Some(FactValue::Path(value)) => Some(value),
            _ => None,
        }
    }

    pub fn commits(&self, key: &str) -> Option<&[Rc<Commit>]> {
        match self.values.get(key) {
            Some(FactValue::Commits(value)) => Some(value),
            _ => None,
        }
    }

    /// Whether the feature tag `name` is enabled (`Features.<name>` fact).
    pub fn feature_enabled(&self, name: &str) -> bool {
        self.bool_or(&format!("Features.{name}"), false)
    }

    pub fn enable_feature(&mut self, name: &str) {
        self.set(format!("Features.{name}"), FactValue::Bool(true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let mut facts = Facts::new();
        facts.set(DRY_RUN, FactValue::Bool(true));
        facts.set(HIBERNATION_DISTANCE, FactValue::Int(4));
        facts.set(DUMP_PATH, FactValue::Path(PathBuf::from("/tmp/x.dot")));
        assert!(facts.bool_or(DRY_RUN, false));
        assert_eq!(facts.int_or(HIBERNATION_DISTANCE, 0), 4);
        assert_eq!(facts.path(DUMP_PATH), Some(Path::new("/tmp/x.dot")));
        // Mistyped or absent keys fall back to the default.
        assert!(!facts.bool_or(HIBERNATION_DISTANCE, false));
        assert_eq!(facts.int_or("absent", 7), 7);
    }

    #[test]
    fn test_features() {
        let mut facts = Facts::new();
        assert!(!facts.feature_enabled("uast"));
        facts.enable_feature("uast");
        assert!(facts.feature_enabled("uast"));
    }
}
