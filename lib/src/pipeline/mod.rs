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

//! The pipeline runtime.
//!
//! Resolves a user-selected set of items into a dependency-ordered list,
//! then executes the scheduler's action plan over them, maintaining one
//! item-state vector per live virtual branch. Items fork and merge in
//! lockstep with the plan; on every commit action the items run in
//! topological order over a keyed dependency bus.

pub mod facts;
mod item;
mod registry;

pub use facts::FactValue;
pub use facts::Facts;
pub use item::DEP_COMMIT;
pub use item::DEP_INDEX;
pub use item::DEP_IS_MERGE;
pub use item::Deps;
pub use item::LeafItem;
pub use item::Outputs;
pub use item::PipelineItem;
pub use item::output;
pub use registry::ItemConstructor;
pub use registry::Registry;
pub use registry::default_registry;

use std::any::Any;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use itertools::Itertools as _;
use thiserror::Error;

use crate::backend::Commit;
use crate::backend::Repository;
use crate::backend::SourceError;
use crate::backend::Tick;
use crate::graph::Graph;
use crate::items::tick_of;
use crate::line_history::HistoryError;
use crate::rbtree::HibernateError;
use crate::scheduler;
use crate::scheduler::ActionKind;
use crate::scheduler::BranchIndex;
use crate::scheduler::Plan;

/// Error raised while resolving, configuring or initializing items.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unsatisfied dependency: no enabled item provides {key} required by {item}")]
    UnsatisfiedDependency { item: String, key: String },
    #[error("ambiguous item graph: cycle through {cycle:?}")]
    AmbiguousGraph { cycle: Vec<String> },
    #[error("duplicate authoritative providers for {key}: {first} and {second}")]
    DuplicateProvider {
        key: String,
        first: String,
        second: String,
    },
    #[error("I/O error writing the dependency graph dump")]
    DumpIo {
        #[source]
        source: std::io::Error,
    },
}

/// Error raised while executing the plan.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("missing dependency {key}")]
    MissingDependency { key: &'static str },
    #[error("dependency {key} has an unexpected type")]
    MistypedDependency { key: &'static str },
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Hibernate(#[from] HibernateError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Statistics of one pipeline run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub begin_tick: Tick,
    pub end_tick: Tick,
    pub commit_count: usize,
    pub elapsed: Duration,
}

/// The summary plus the finalized results of every leaf item, keyed by
/// item name.
pub struct RunOutcome {
    pub summary: RunSummary,
    pub results: Vec<(&'static str, Box<dyn Any>)>,
}

impl std::fmt::Debug for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.results.iter().map(|(name, _)| *name).collect();
        f.debug_struct("RunOutcome")
            .field("summary", &self.summary)
            .field("results", &names)
            .finish()
    }
}

struct BranchState {
    items: Vec<Box<dyn PipelineItem>>,
    disposed: Vec<bool>,
}

/// Drives a resolved item set over the replay plan of a repository.
///
/// A pipeline value drives a single run: select items with
/// [`Self::deploy`], call [`Self::initialize`], then [`Self::run`].
pub struct Pipeline {
    repo: Arc<Repository>,
    items: Vec<Box<dyn PipelineItem>>,
    facts: Facts,
    initialized: bool,
    dry_run: bool,
    dump_plan: bool,
    print_actions: bool,
    dump_path: Option<PathBuf>,
    hibernation_distance: usize,
}

impl Pipeline {
    pub fn new(repo: Repository) -> Self {
        Self {
            repo: Arc::new(repo),
            items: Vec::new(),
            facts: Facts::new(),
            initialized: false,
            dry_run: false,
            dump_plan: false,
            print_actions: false,
            dump_path: None,
            hibernation_distance: 0,
        }
    }

    pub fn facts(&self) -> &Facts {
        &self.facts
    }

    pub fn set_fact(&mut self, key: impl Into<String>, value: FactValue) {
        self.facts.set(key, value);
    }

    /// Adds a concrete item instance to the selection.
    pub fn add_item(&mut self, item: Box<dyn PipelineItem>) {
        self.items.push(item);
    }

    /// Summons an item by name or provided key and adds the instances to
    /// the selection. Returns false when the registry knows neither.
    pub fn deploy(&mut self, registry: &Registry, name_or_key: &str) -> bool {
        let summoned = registry.summon(name_or_key);
        if summoned.is_empty() {
            return false;
        }
        for item in summoned {
            if !self.items.iter().any(|existing| existing.name() == item.name()) {
                self.items.push(item);
            }
        }
        true
    }

    /// Names of the resolved items, in execution order. Meaningful after
    /// [`Self::initialize`].
    pub fn item_names(&self) -> Vec<&'static str> {
        self.items.iter().map(|item| item.name()).collect()
    }

    /// Resolves dependencies, then configures and initializes every item in
    /// dependency order. With `Pipeline.DryRun` set, resolution and graph
    /// dumping still happen but items are neither configured nor
    /// initialized.
    pub fn initialize(&mut self, registry: &Registry) -> Result<(), ResolveError> {
        self.dry_run = self.facts.bool_or(facts::DRY_RUN, false);
        self.dump_plan = self.facts.bool_or(facts::DUMP_PLAN, false);
        self.print_actions = self.facts.bool_or(facts::PRINT_ACTIONS, false);
        self.hibernation_distance =
            self.facts.int_or(facts::HIBERNATION_DISTANCE, 0).max(0) as usize;
        self.dump_path = self.facts.path(facts::DUMP_PATH).map(Path::to_owned);

        self.resolve(registry)?;
        if self.dry_run {
            return Ok(());
        }
        for item in &mut self.items {
            item.configure(&mut self.facts)?;
        }
        for item in &mut self.items {
            item.initialize(&self.repo)?;
        }
        self.initialized = true;
        Ok(())
    }

    /// Pulls in transitive dependencies, breaks duplicate-provider cycles,
    /// topologically sorts the item set and writes the Graphviz dump when
    /// configured.
    fn resolve(&mut self, registry: &Registry) -> Result<(), ResolveError> {
        // Transitively summon providers for unsatisfied required keys.
        let mut scan = 0;
        while scan < self.items.len() {
            let required: Vec<&'static str> = self.items[scan].requires().to_vec();
            let item_name = self.items[scan].name();
            for key in required {
                let satisfied = self
                    .items
                    .iter()
                    .any(|item| item.provides().contains(&key));
                if satisfied {
                    continue;
                }
                let candidate = registry
                    .summon(key)
                    .into_iter()
                    .find(|item| {
                        item.features()
                            .iter()
                            .all(|feature| self.facts.feature_enabled(feature))
                            && !self.items.iter().any(|i| i.name() == item.name())
                    })
                    .ok_or_else(|| ResolveError::UnsatisfiedDependency {
                        item: item_name.to_owned(),
                        key: key.to_owned(),
                    })?;
                self.items.push(candidate);
            }
            scan += 1;
        }

        // Bipartite graph of items and provided keys.
        let key_node = |key: &str| format!("[{key}]");
        let mut graph = Graph::new();
        let mut providers: BTreeMap<&'static str, Vec<&'static str>> = BTreeMap::new();
        for item in &self.items {
            graph.add_node(item.name());
            for &key in item.provides() {
                graph.add_edge(item.name(), &key_node(key));
                providers.entry(key).or_default().push(item.name());
            }
            for &key in item.requires() {
                graph.add_edge(&key_node(key), item.name());
            }
        }
        let order = match graph.topo_sort() {
            Ok(order) => order,
            Err(_) => {
                // Duplicate providers can close a cycle through their key;
                // cut the key from every provider in a later BFS layer.
                let (depths, _) = graph.breadth_layers();
                let depth_of =
                    |name: &str| depths.get(name).copied().unwrap_or(u32::MAX);
                for (key, names) in &providers {
                    if names.len() < 2 {
                        continue;
                    }
                    let ranked: Vec<&'static str> = names
                        .iter()
                        .copied()
                        .sorted_by_key(|name| (depth_of(name), *name))
                        .collect();
                    if depth_of(ranked[0]) == depth_of(ranked[1]) {
                        return Err(ResolveError::DuplicateProvider {
                            key: (*key).to_owned(),
                            first: ranked[0].to_owned(),
                            second: ranked[1].to_owned(),
                        });
                    }
                    for late in &ranked[1..] {
                        graph.remove_edge(late, &key_node(key));
                    }
                }
                graph.topo_sort().map_err(|_| {
                    let seed = self
                        .items
                        .first()
                        .map(|item| item.name().to_owned())
                        .unwrap_or_default();
                    ResolveError::AmbiguousGraph {
                        cycle: graph.find_cycle(&seed),
                    }
                })?
            }
        };
        if let Some(path) = &self.dump_path {
            std::fs::write(path, graph.graphviz(&order))
                .map_err(|source| ResolveError::DumpIo { source })?;
        }
        let position: BTreeMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(index, name)| (name.as_str(), index))
            .collect();
        self.items.sort_by_key(|item| position[item.name()]);
        tracing::debug!(items = ?self.item_names(), "resolved pipeline");
        Ok(())
    }

    /// Schedules and executes the plan over the commits of the repository
    /// (or the `Pipeline.Commits` fact when set).
    pub fn run(&mut self) -> Result<RunOutcome, RunError> {
        let started = Instant::now();
        let commits: Vec<Rc<Commit>> = match self.facts.commits(facts::COMMITS) {
            Some(list) => list.to_vec(),
            None => self
                .repo
                .source
                .commits()?
                .into_iter()
                .map(Rc::new)
                .collect(),
        };
        let plan = scheduler::schedule(&commits, self.hibernation_distance);
        if self.dump_plan {
            eprint!("{plan}");
        }
        let timestamps = commits.iter().map(|commit| commit.author.timestamp);
        let end_tick = match timestamps.minmax().into_option() {
            Some((first, last)) => tick_of(first, last),
            None => 0,
        };
        let mut summary = RunSummary {
            begin_tick: 0,
            end_tick,
            commit_count: commits.len(),
            elapsed: Duration::ZERO,
        };
        if self.dry_run {
            summary.elapsed = started.elapsed();
            return Ok(RunOutcome {
                summary,
                results: Vec::new(),
            });
        }
        assert!(self.initialized, "pipeline run before initialization");
        let mut branches = self.execute(&plan)?;
        let mut results = Vec::new();
        if let Some((_, mut state)) = branches.pop_first() {
            for item in &mut state.items {
                let name = item.name();
                if let Some(leaf) = item.as_leaf() {
                    results.push((name, leaf.finalize()));
                }
            }
        }
        summary.elapsed = started.elapsed();
        Ok(RunOutcome { summary, results })
    }

    fn execute(&mut self, plan: &Plan) -> Result<BTreeMap<BranchIndex, BranchState>, RunError> {
        // Additional roots get pristine clones, split off before any state
        // can diverge.
        let emerge_slots: usize = plan
            .iter()
            .filter(|action| action.kind == ActionKind::Emerge)
            .map(|action| action.branches.len())
            .sum();
        let mut spares: Vec<Vec<Box<dyn PipelineItem>>> = if emerge_slots > 1 {
            fork_items(&mut self.items, emerge_slots - 1)
        } else {
            Vec::new()
        };
        let mut template = Some(std::mem::take(&mut self.items));
        let mut branches: BTreeMap<BranchIndex, BranchState> = BTreeMap::new();
        let mut merged: HashSet<BranchIndex> = HashSet::new();

        for (index, action) in plan.iter().enumerate() {
            if self.print_actions {
                eprintln!("{action}");
            }
            match action.kind {
                ActionKind::Emerge => {
                    for &branch in &action.branches {
                        assert!(
                            !branches.contains_key(&branch),
                            "branch {branch} emerged twice",
                        );
                        let items = template
                            .take()
                            .or_else(|| spares.pop())
                            .expect("more emerges than planned");
                        let disposed = vec![false; items.len()];
                        branches.insert(branch, BranchState { items, disposed });
                    }
                }
                ActionKind::Commit => {
                    let branch = action.branch();
                    let commit = action
                        .commit
                        .clone()
                        .expect("commit action without a commit");
                    let state = branches
                        .get_mut(&branch)
                        .unwrap_or_else(|| panic!("branch {branch} used before it emerged"));
                    let mut deps = Deps::new();
                    deps.insert_rc(DEP_COMMIT, commit);
                    deps.insert(DEP_INDEX, index);
                    deps.insert(DEP_IS_MERGE, merged.remove(&branch));
                    for (i, item) in state.items.iter_mut().enumerate() {
                        if state.disposed[i] {
                            continue;
                        }
                        let outputs = item.consume(&deps)?;
                        for (key, value) in outputs {
                            deps.insert_rc(key, value);
                        }
                        if item.one_shot() {
                            item.dispose();
                            state.disposed[i] = true;
                        }
                    }
                }
                ActionKind::Fork => {
                    let source = action.branch();
                    let mut state = branches
                        .remove(&source)
                        .unwrap_or_else(|| panic!("branch {source} forked before it emerged"));
                    let clones = fork_items(&mut state.items, action.branches.len() - 1);
                    for (&branch, items) in action.branches[1..].iter().zip(clones) {
                        assert!(
                            !branches.contains_key(&branch),
                            "branch {branch} forked twice",
                        );
                        let disposed = state.disposed.clone();
                        branches.insert(branch, BranchState { items, disposed });
                    }
                    branches.insert(source, state);
                }
                ActionKind::Merge => {
                    let primary = action.branch();
                    let mut primary_state = branches
                        .remove(&primary)
                        .unwrap_or_else(|| panic!("merge into unknown branch {primary}"));
                    let mut siblings: Vec<(BranchIndex, BranchState)> = action.branches[1..]
                        .iter()
                        .map(|&branch| {
                            let state = branches
                                .remove(&branch)
                                .unwrap_or_else(|| panic!("merge of unknown branch {branch}"));
                            (branch, state)
                        })
                        .collect();
                    for i in 0..primary_state.items.len() {
                        let mut refs: Vec<&mut dyn PipelineItem> = siblings
                            .iter_mut()
                            .map(|(_, state)| state.items[i].as_mut())
                            .collect();
                        primary_state.items[i].merge(&mut refs);
                    }
                    branches.insert(primary, primary_state);
                    for (branch, state) in siblings {
                        branches.insert(branch, state);
                    }
                    merged.insert(primary);
                }
                ActionKind::Delete => {
                    for &branch in &action.branches {
                        let mut state = branches
                            .remove(&branch)
                            .unwrap_or_else(|| panic!("deleting unknown branch {branch}"));
                        for (i, item) in state.items.iter_mut().enumerate() {
                            if !state.disposed[i] {
                                item.dispose();
                            }
                        }
                    }
                }
                ActionKind::Hibernate => {
                    for &branch in &action.branches {
                        let state = branches
                            .get_mut(&branch)
                            .unwrap_or_else(|| panic!("hibernating unknown branch {branch}"));
                        for item in &mut state.items {
                            item.hibernate()?;
                        }
                    }
                }
                ActionKind::Boot => {
                    for &branch in &action.branches {
                        let state = branches
                            .get_mut(&branch)
                            .unwrap_or_else(|| panic!("booting unknown branch {branch}"));
                        for item in &mut state.items {
                            item.boot()?;
                        }
                    }
                }
            }
        }
        if let Some(template) = template {
            // Empty plan: nothing ran, keep the item set.
            self.items = template;
        }
        Ok(branches)
    }
}

fn fork_items(items: &mut [Box<dyn PipelineItem>], n: usize) -> Vec<Vec<Box<dyn PipelineItem>>> {
    let mut per_child: Vec<Vec<Box<dyn PipelineItem>>> =
        (0..n).map(|_| Vec::with_capacity(items.len())).collect();
    for item in items {
        let clones = item.fork(n);
        assert_eq!(
            clones.len(),
            n,
            "item {} forked {} instances instead of {n}",
            item.name(),
            clones.len(),
        );
        for (child, clone) in per_child.iter_mut().zip(clones) {
            child.push(clone);
        }
    }
    per_child
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::backend::CommitSource;
    use crate::backend::DiffProvider;
    use crate::backend::FileDiffData;
    use crate::backend::IdentityResolver;
    use crate::backend::SourceResult;
    use crate::backend::TreeChange;

    struct EmptySource;

    impl CommitSource for EmptySource {
        fn commits(&self) -> SourceResult<Vec<Commit>> {
            Ok(vec![])
        }

        fn head_commit(&self) -> SourceResult<Commit> {
            unimplemented!("no commits")
        }

        fn load_commits_from_path(&self, _path: &Path) -> SourceResult<Vec<Commit>> {
            Ok(vec![])
        }
    }

    struct NoDiffs;

    impl DiffProvider for NoDiffs {
        fn line_diff(&self, _change: &TreeChange) -> SourceResult<Option<FileDiffData>> {
            Ok(None)
        }
    }

    struct NoIdentities;

    impl IdentityResolver for NoIdentities {
        fn count(&self) -> usize {
            0
        }

        fn name_of(&self, _id: crate::backend::AuthorId) -> Option<&str> {
            None
        }

        fn id_of(&self, _name: &str) -> Option<crate::backend::AuthorId> {
            None
        }

        fn for_each(&self, _cb: &mut dyn FnMut(crate::backend::AuthorId, &str)) {}
    }

    fn empty_repo() -> Repository {
        Repository {
            source: Box::new(EmptySource),
            diffs: Box::new(NoDiffs),
            identities: Box::new(NoIdentities),
        }
    }

    struct StubItem {
        name: &'static str,
        provides: &'static [&'static str],
        requires: &'static [&'static str],
    }

    impl PipelineItem for StubItem {
        fn name(&self) -> &'static str {
            self.name
        }

        fn provides(&self) -> &'static [&'static str] {
            self.provides
        }

        fn requires(&self) -> &'static [&'static str] {
            self.requires
        }

        fn consume(&mut self, _deps: &Deps) -> Result<Outputs, RunError> {
            Ok(Vec::new())
        }

        fn fork(&mut self, n: usize) -> Vec<Box<dyn PipelineItem>> {
            (0..n)
                .map(|_| {
                    Box::new(StubItem {
                        name: self.name,
                        provides: self.provides,
                        requires: self.requires,
                    }) as Box<dyn PipelineItem>
                })
                .collect()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn stub(
        name: &'static str,
        provides: &'static [&'static str],
        requires: &'static [&'static str],
    ) -> Box<dyn PipelineItem> {
        Box::new(StubItem {
            name,
            provides,
            requires,
        })
    }

    #[test]
    fn test_resolution_order_satisfies_dependencies() {
        let mut pipeline = Pipeline::new(empty_repo());
        pipeline.add_item(stub("sink", &[], &["b"]));
        pipeline.add_item(stub("mid", &["b"], &["a"]));
        pipeline.add_item(stub("root", &["a"], &[]));
        pipeline.initialize(&Registry::new()).unwrap();
        assert_eq!(pipeline.item_names(), ["root", "mid", "sink"]);
    }

    #[test]
    fn test_resolution_pulls_transitive_dependencies() {
        let mut pipeline = Pipeline::new(empty_repo());
        let registry = Registry::builtin();
        pipeline.deploy(&registry, "LineChurn");
        pipeline.initialize(&registry).unwrap();
        let names = pipeline.item_names();
        // The engine and its own upstream items were pulled in.
        assert!(names.contains(&"LineHistory"));
        assert!(names.contains(&"TicksSinceStart"));
        assert!(names.contains(&"IdentityDetector"));
        assert!(names.contains(&"TreeChanges"));
        let pos =
            |name: &str| names.iter().position(|n| *n == name).unwrap();
        assert!(pos("LineHistory") < pos("LineChurn"));
        assert!(pos("TicksSinceStart") < pos("LineHistory"));
        assert!(pos("TreeChanges") < pos("LineHistory"));
    }

    #[test]
    fn test_unsatisfied_dependency() {
        let mut pipeline = Pipeline::new(empty_repo());
        pipeline.add_item(stub("sink", &[], &["nonexistent"]));
        let err = pipeline.initialize(&Registry::new()).unwrap_err();
        assert_matches!(err, ResolveError::UnsatisfiedDependency { item, key }
            if item == "sink" && key == "nonexistent");
    }

    #[test]
    fn test_duplicate_providers_at_same_layer_rejected() {
        let mut pipeline = Pipeline::new(empty_repo());
        pipeline.add_item(stub("one", &["k"], &["k"]));
        pipeline.add_item(stub("two", &["k"], &["k"]));
        let err = pipeline.initialize(&Registry::new()).unwrap_err();
        assert_matches!(
            err,
            ResolveError::DuplicateProvider { .. } | ResolveError::AmbiguousGraph { .. }
        );
    }

    #[test]
    fn test_feature_gated_item_needs_feature() {
        let mut registry = Registry::new();
        registry.register(|| {
            struct Gated;
            impl PipelineItem for Gated {
                fn name(&self) -> &'static str {
                    "Gated"
                }
                fn provides(&self) -> &'static [&'static str] {
                    &["gated_key"]
                }
                fn requires(&self) -> &'static [&'static str] {
                    &[]
                }
                fn features(&self) -> &'static [&'static str] {
                    &["exotic"]
                }
                fn consume(&mut self, _deps: &Deps) -> Result<Outputs, RunError> {
                    Ok(Vec::new())
                }
                fn fork(&mut self, n: usize) -> Vec<Box<dyn PipelineItem>> {
                    (0..n).map(|_| Box::new(Gated) as Box<dyn PipelineItem>).collect()
                }
                fn as_any(&self) -> &dyn Any {
                    self
                }
                fn as_any_mut(&mut self) -> &mut dyn Any {
                    self
                }
            }
            Box::new(Gated)
        });
        let mut pipeline = Pipeline::new(empty_repo());
        pipeline.add_item(stub("sink", &[], &["gated_key"]));
        let err = pipeline.initialize(&registry).unwrap_err();
        assert_matches!(err, ResolveError::UnsatisfiedDependency { .. });

        let mut pipeline = Pipeline::new(empty_repo());
        pipeline.facts.enable_feature("exotic");
        pipeline.add_item(stub("sink", &[], &["gated_key"]));
        pipeline.initialize(&registry).unwrap();
        assert_eq!(pipeline.item_names(), ["Gated", "sink"]);
    }

    #[test]
    fn test_dry_run_returns_summary_only() {
        let mut pipeline = Pipeline::new(empty_repo());
        pipeline.set_fact(facts::DRY_RUN, FactValue::Bool(true));
        pipeline.deploy(&Registry::builtin(), "LineChurn");
        pipeline.initialize(&Registry::builtin()).unwrap();
        let outcome = pipeline.run().unwrap();
        assert_eq!(outcome.summary.commit_count, 0);
        assert!(outcome.results.is_empty());
    }

    #[test]
    fn test_graphviz_dump_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.dot");
        let mut pipeline = Pipeline::new(empty_repo());
        pipeline.set_fact(facts::DUMP_PATH, FactValue::Path(path.clone()));
        pipeline.add_item(stub("mid", &["b"], &[]));
        pipeline.add_item(stub("sink", &[], &["b"]));
        pipeline.initialize(&Registry::new()).unwrap();
        let dump = std::fs::read_to_string(&path).unwrap();
        assert!(dump.starts_with("digraph Strata {"), "dump: {dump}");
        assert!(dump.contains("[b]"), "dump: {dump}");
    }
}
