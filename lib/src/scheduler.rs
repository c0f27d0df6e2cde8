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

//! Converts a commit DAG into a linear action plan over virtual branches.
//!
//! The scheduler keeps only the root component of the graph, collapses
//! straight chains into single nodes, removes fast-forward edges, assigns
//! branch indices in a stable topological walk, garbage-collects dead
//! branches and finally interleaves hibernate/boot actions for branches
//! that stay unused longer than the configured distance.
//!
//! All tie-breaking is lexicographic over commit hashes, so plans are
//! bit-identical for inputs that differ only in ordering.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use itertools::Itertools as _;
use smallvec::SmallVec;
use smallvec::smallvec;

use crate::backend::Commit;
use crate::graph::Graph;
use crate::object_id::ObjectId as _;

/// Index of a virtual branch. Index 0 is reserved and never assigned.
pub type BranchIndex = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Emerge,
    Commit,
    Fork,
    Merge,
    Delete,
    Hibernate,
    Boot,
}

/// One step of the linearized plan.
#[derive(Clone, Debug, PartialEq)]
pub struct RunAction {
    pub kind: ActionKind,
    pub commit: Option<Rc<Commit>>,
    pub branches: SmallVec<[BranchIndex; 2]>,
}

impl RunAction {
    fn with_branches(kind: ActionKind, branches: impl IntoIterator<Item = BranchIndex>) -> Self {
        let branches: SmallVec<[BranchIndex; 2]> = branches.into_iter().collect();
        assert!(!branches.is_empty(), "action without branches");
        assert!(
            branches.iter().all(|&b| b >= 1),
            "action references the reserved branch 0",
        );
        Self {
            kind,
            commit: None,
            branches,
        }
    }

    pub fn emerge(branches: impl IntoIterator<Item = BranchIndex>) -> Self {
        Self::with_branches(ActionKind::Emerge, branches)
    }

    pub fn commit(branch: BranchIndex, commit: Rc<Commit>) -> Self {
        let mut action = Self::with_branches(ActionKind::Commit, [branch]);
        action.commit = Some(commit);
        action
    }

    pub fn fork(branches: impl IntoIterator<Item = BranchIndex>) -> Self {
        Self::with_branches(ActionKind::Fork, branches)
    }

    pub fn merge(branches: impl IntoIterator<Item = BranchIndex>) -> Self {
        Self::with_branches(ActionKind::Merge, branches)
    }

    pub fn delete(branches: impl IntoIterator<Item = BranchIndex>) -> Self {
        Self::with_branches(ActionKind::Delete, branches)
    }

    pub fn hibernate(branches: impl IntoIterator<Item = BranchIndex>) -> Self {
        Self::with_branches(ActionKind::Hibernate, branches)
    }

    pub fn boot(branches: impl IntoIterator<Item = BranchIndex>) -> Self {
        Self::with_branches(ActionKind::Boot, branches)
    }

    /// The first (for `Commit`/`Emerge`: the only) branch of the action.
    pub fn branch(&self) -> BranchIndex {
        self.branches[0]
    }
}

impl fmt::Display for RunAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = self.branches.iter().join(", ");
        match self.kind {
            ActionKind::Emerge => write!(f, "E [{list}]"),
            ActionKind::Commit => {
                let commit = self.commit.as_ref().expect("commit action without commit");
                write!(f, "C {} {}", self.branch(), commit.id.short_hex(7))
            }
            ActionKind::Fork => write!(f, "F [{list}]"),
            ActionKind::Merge => write!(f, "M [{list}]"),
            ActionKind::Delete => write!(f, "D [{list}]"),
            ActionKind::Hibernate => write!(f, "H [{list}]"),
            ActionKind::Boot => write!(f, "B [{list}]"),
        }
    }
}

/// The linearized action sequence executed by the pipeline runtime.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<RunAction>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RunAction> {
        self.actions.iter()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for action in &self.actions {
            writeln!(f, "{action}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Plan {
    type Item = &'a RunAction;
    type IntoIter = std::slice::Iter<'a, RunAction>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.iter()
    }
}

/// Builds the deterministic action plan for the given commits.
///
/// `hibernation_distance` of 0 disables hibernation insertion.
///
/// Panics if the commit graph contains a cycle.
pub fn schedule(commits: &[Rc<Commit>], hibernation_distance: usize) -> Plan {
    if commits.is_empty() {
        return Plan::default();
    }
    let mut dag = CommitDag::build(commits);
    dag.keep_root_component();
    dag.merge_chains();
    dag.collapse_fast_forwards();
    let mut plan = dag.assign_branches();
    plan = insert_deletes(plan);
    if hibernation_distance > 0 {
        plan = insert_hibernation(plan, hibernation_distance);
    }
    plan
}

struct CommitDag {
    /// Kept commits by hex hash.
    commits: BTreeMap<String, Rc<Commit>>,
    /// The merged DAG over chain keys (the last commit of each chain).
    graph: Graph,
    /// Chain payloads by key, in ancestor-to-descendant order.
    chains: BTreeMap<String, Vec<String>>,
}

impl CommitDag {
    fn build(commits: &[Rc<Commit>]) -> Self {
        let commits: BTreeMap<String, Rc<Commit>> = commits
            .iter()
            .map(|commit| (commit.id.hex(), commit.clone()))
            .collect();
        Self {
            commits,
            graph: Graph::new(),
            chains: BTreeMap::new(),
        }
    }

    /// Unique parents of `hash` that are themselves in the input set, in
    /// commit order.
    fn parents_of(&self, hash: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.commits[hash]
            .parents
            .iter()
            .map(|parent| parent.hex())
            .filter(|parent| self.commits.contains_key(parent))
            .filter(|parent| seen.insert(parent.clone()))
            .collect()
    }

    /// Drops every commit outside the largest weakly connected component.
    fn keep_root_component(&mut self) {
        let mut undirected: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for hash in self.commits.keys() {
            undirected.entry(hash).or_default();
        }
        let parent_lists: Vec<(String, Vec<String>)> = self
            .commits
            .keys()
            .map(|hash| (hash.clone(), self.parents_of(hash)))
            .collect();
        for (hash, parents) in &parent_lists {
            for parent in parents {
                undirected.get_mut(hash.as_str()).unwrap().push(parent.clone());
                undirected.get_mut(parent.as_str()).unwrap().push(hash.clone());
            }
        }
        let mut visited: HashSet<String> = HashSet::new();
        let mut root_component: BTreeSet<String> = BTreeSet::new();
        for start in self.commits.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut queue = VecDeque::from([start.clone()]);
            visited.insert(start.clone());
            while let Some(hash) = queue.pop_front() {
                for neighbor in &undirected[hash.as_str()] {
                    if visited.insert(neighbor.clone()) {
                        queue.push_back(neighbor.clone());
                    }
                }
                component.insert(hash);
            }
            // Largest component wins; the iteration order makes ties go to
            // the one holding the smallest hash.
            if component.len() > root_component.len() {
                root_component = component;
            }
        }
        let dropped: Vec<String> = self
            .commits
            .keys()
            .filter(|hash| !root_component.contains(*hash))
            .cloned()
            .collect();
        for hash in dropped {
            tracing::warn!(%hash, "commit outside the root component, dropped");
            self.commits.remove(&hash);
        }
    }

    /// Collapses maximal straight chains into single DAG nodes keyed by the
    /// chain's last commit.
    fn merge_chains(&mut self) {
        let mut children: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for hash in self.commits.keys() {
            children.entry(hash.clone()).or_default();
        }
        let all_parents: BTreeMap<String, Vec<String>> = self
            .commits
            .keys()
            .map(|hash| (hash.clone(), self.parents_of(hash)))
            .collect();
        for (hash, parents) in &all_parents {
            for parent in parents {
                children.get_mut(parent).unwrap().insert(hash.clone());
            }
        }
        // `child` extends its parent's chain when the link is the parent's
        // only outgoing and the child's only incoming edge.
        let chains_to = |child: &str| -> Option<String> {
            let parents = &all_parents[child];
            let [parent] = parents.as_slice() else {
                return None;
            };
            (children[parent].len() == 1).then(|| parent.clone())
        };
        let mut chain_of: HashMap<String, String> = HashMap::new();
        for hash in self.commits.keys() {
            if chains_to(hash).is_some() {
                continue;
            }
            // `hash` starts a chain; walk it forward.
            let mut chain = vec![hash.clone()];
            let mut cursor = hash.clone();
            loop {
                let kids = &children[&cursor];
                let next = match kids.iter().exactly_one() {
                    Ok(next) if chains_to(next).is_some() => next.clone(),
                    _ => break,
                };
                chain.push(next.clone());
                cursor = next;
            }
            let key = chain.last().unwrap().clone();
            for link in &chain {
                chain_of.insert(link.clone(), key.clone());
            }
            self.chains.insert(key, chain);
        }
        for (key, chain) in &self.chains {
            self.graph.add_node(key);
            for parent in &all_parents[&chain[0]] {
                self.graph.add_edge(&chain_of[parent], key);
            }
        }
    }

    /// Stable topological order of the merged DAG; panics on a cycle.
    fn stable_topo(&self) -> Vec<String> {
        self.graph.topo_sort().unwrap_or_else(|_| {
            let seed = self
                .graph
                .nodes()
                .next()
                .expect("cycle in an empty graph")
                .to_owned();
            panic!("cycle in commit graph: {:?}", self.graph.find_cycle(&seed));
        })
    }

    /// Whether `to` is reachable from `from` following child edges.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut visited: HashSet<String> = HashSet::from([from.to_owned()]);
        let mut queue = VecDeque::from([from.to_owned()]);
        while let Some(node) = queue.pop_front() {
            if node == to {
                return true;
            }
            for child in self.graph.children(&node) {
                if visited.insert(child.to_owned()) {
                    queue.push_back(child.to_owned());
                }
            }
        }
        false
    }

    /// Absorbs `parent` (a single-child node) into `child`'s chain. The
    /// child's key survives, so downstream bookkeeping stays keyed by chain
    /// heads.
    fn absorb(&mut self, parent: &str, child: &str) {
        let mut merged = self.chains.remove(parent).expect("absorbing unknown parent");
        merged.extend(self.chains.remove(child).expect("absorbing unknown child"));
        self.chains.insert(child.to_owned(), merged);
        let grandparents: Vec<String> = self.graph.parents(parent).map(str::to_owned).collect();
        self.graph.remove_node(parent);
        for grandparent in grandparents {
            self.graph.add_edge(&grandparent, child);
        }
    }

    /// Removes edges made redundant by fast-forward merges and reabsorbs
    /// the straight chains this exposes.
    fn collapse_fast_forwards(&mut self) {
        let order = self.stable_topo();
        for node in &order {
            loop {
                if !self.graph.contains(node) {
                    break;
                }
                let mut changed = false;
                let kids: Vec<String> = self.graph.children(node).map(str::to_owned).collect();
                if kids.len() >= 2 {
                    for (a, b) in kids.iter().cartesian_product(&kids) {
                        if a != b
                            && self.graph.contains(a)
                            && self.graph.children(node).any(|k| k == b.as_str())
                            && self.reaches(a, b)
                        {
                            self.graph.remove_edge(node, b);
                            changed = true;
                        }
                    }
                }
                let kids: Vec<String> = self.graph.children(node).map(str::to_owned).collect();
                for kid in kids {
                    let parents: Vec<String> =
                        self.graph.parents(&kid).map(str::to_owned).collect();
                    let [parent] = parents.as_slice() else {
                        continue;
                    };
                    if self.graph.children(parent).count() == 1 {
                        let parent = parent.clone();
                        self.absorb(&parent, &kid);
                        changed = true;
                    }
                }
                if !changed {
                    break;
                }
            }
        }
    }

    /// Walks the merged DAG in stable topological order, assigning branch
    /// indices and emitting the raw action sequence.
    fn assign_branches(&self) -> Plan {
        let order = self.stable_topo();
        let chain_of: HashMap<&str, &str> = self
            .chains
            .iter()
            .flat_map(|(key, chain)| chain.iter().map(move |hash| (hash.as_str(), key.as_str())))
            .collect();
        // Branch carrying each parent-to-child edge of the merged DAG,
        // assigned when the parent node is processed.
        let mut edge_branch: HashMap<(String, String), BranchIndex> = HashMap::new();
        let mut counter: BranchIndex = 0;
        let mut actions = Vec::new();
        for key in &order {
            let chain = &self.chains[key];
            let head = &self.commits[&chain[0]];
            let parent_keys: Vec<&str> = self
                .parents_of(&chain[0])
                .iter()
                .map(|parent| chain_of[parent.as_str()])
                .collect();
            let branch = match parent_keys.as_slice() {
                [] => {
                    counter += 1;
                    actions.push(RunAction::emerge([counter]));
                    counter
                }
                [parent] => *edge_branch
                    .get(&((*parent).to_owned(), key.clone()))
                    .expect("branch used before its introducing fork"),
                parents => {
                    let branches: BTreeSet<BranchIndex> = parents
                        .iter()
                        .map(|parent| {
                            *edge_branch
                                .get(&((*parent).to_owned(), key.clone()))
                                .expect("branch used before its introducing fork")
                        })
                        .collect();
                    let continuing = *branches.first().unwrap();
                    if branches.len() >= 2 {
                        // Force the sibling branches to incorporate the
                        // pre-merge tip before the states are merged.
                        for &sibling in branches.iter().skip(1) {
                            actions.push(RunAction::commit(sibling, head.clone()));
                        }
                        actions.push(RunAction::merge(branches.iter().copied()));
                    }
                    continuing
                }
            };
            for hash in chain {
                actions.push(RunAction::commit(branch, self.commits[hash].clone()));
            }
            let kids: Vec<String> = self.graph.children(key).map(str::to_owned).collect();
            match kids.as_slice() {
                [] => {}
                [kid] => {
                    edge_branch.insert((key.clone(), kid.clone()), branch);
                }
                kids => {
                    let mut fork_branches: SmallVec<[BranchIndex; 2]> = smallvec![branch];
                    for (i, kid) in kids.iter().enumerate() {
                        let kid_branch = if i == 0 {
                            branch
                        } else {
                            counter += 1;
                            fork_branches.push(counter);
                            counter
                        };
                        edge_branch.insert((key.clone(), kid.clone()), kid_branch);
                    }
                    actions.push(RunAction::fork(fork_branches));
                }
            }
        }
        Plan { actions }
    }
}

/// Inserts a `Delete` right after the last action mentioning each branch,
/// except for branches mentioned by the final action of the plan.
fn insert_deletes(plan: Plan) -> Plan {
    if plan.is_empty() {
        return plan;
    }
    let mut last_use: BTreeMap<BranchIndex, usize> = BTreeMap::new();
    for (index, action) in plan.iter().enumerate() {
        for &branch in &action.branches {
            last_use.insert(branch, index);
        }
    }
    let final_pos = plan.len() - 1;
    let mut deletes_after: BTreeMap<usize, Vec<BranchIndex>> = BTreeMap::new();
    for (&branch, &position) in &last_use {
        if position != final_pos {
            deletes_after.entry(position).or_default().push(branch);
        }
    }
    let mut actions = Vec::with_capacity(plan.len() + deletes_after.len());
    for (index, action) in plan.actions.into_iter().enumerate() {
        actions.push(action);
        if let Some(branches) = deletes_after.get(&index) {
            actions.push(RunAction::delete(branches.iter().copied()));
        }
    }
    Plan { actions }
}

/// Inserts `Hibernate`/`Boot` pairs around gaps where a branch stays unused
/// for more than `distance` intervening actions. A `Delete` is not a use of
/// its branch. Actions landing on the same position are coalesced.
pub fn insert_hibernation(plan: Plan, distance: usize) -> Plan {
    let mut uses: BTreeMap<BranchIndex, Vec<usize>> = BTreeMap::new();
    for (index, action) in plan.iter().enumerate() {
        if action.kind == ActionKind::Delete {
            continue;
        }
        for &branch in &action.branches {
            uses.entry(branch).or_default().push(index);
        }
    }
    let mut hibernate_after: BTreeMap<usize, BTreeSet<BranchIndex>> = BTreeMap::new();
    let mut boot_before: BTreeMap<usize, BTreeSet<BranchIndex>> = BTreeMap::new();
    for (branch, positions) in uses {
        for (&prev, &next) in positions.iter().tuple_windows() {
            if next - prev - 1 > distance {
                hibernate_after.entry(prev).or_default().insert(branch);
                boot_before.entry(next).or_default().insert(branch);
            }
        }
    }
    let mut actions = Vec::with_capacity(plan.len());
    for (index, action) in plan.actions.into_iter().enumerate() {
        if let Some(branches) = boot_before.get(&index) {
            actions.push(RunAction::boot(branches.iter().copied()));
        }
        actions.push(action);
        if let Some(branches) = hibernate_after.get(&index) {
            actions.push(RunAction::hibernate(branches.iter().copied()));
        }
    }
    Plan { actions }
}
