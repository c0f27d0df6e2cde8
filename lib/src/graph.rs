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

//! Ordered directed acyclic graph over string-named nodes.
//!
//! Backs both the commit DAG of the scheduler and the item dependency graph
//! of the pipeline. All orderings are deterministic: ties are broken
//! lexicographically, or by insertion index when the graph was created in
//! insertion-ordered mode.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt::Write as _;

use indexmap::IndexMap;
use thiserror::Error;

/// Error returned by [`Graph::topo_sort`] when the graph contains a cycle.
///
/// The graph is left unchanged; call [`Graph::find_cycle`] to extract the
/// offending path.
#[derive(Debug, Error)]
#[error("graph contains a cycle")]
pub struct GraphCycleError;

#[derive(Clone, Debug, Default)]
struct Node {
    parents: BTreeSet<String>,
    children: BTreeSet<String>,
    // Incoming-edge reference count. Kept in sync by the edge operations;
    // `reindex` recomputes it from the parent set.
    in_count: u32,
}

/// Directed graph of string-named nodes with deterministic orderings.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: IndexMap<String, Node>,
    insertion_ordered: bool,
}

impl Graph {
    /// Creates a graph whose tie-breaking order is lexicographic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a graph whose tie-breaking order is the node insertion order.
    pub fn insertion_ordered() -> Self {
        Self {
            nodes: IndexMap::new(),
            insertion_ordered: true,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Node names in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Adds a node without edges. Idempotent.
    pub fn add_node(&mut self, name: &str) {
        if !self.nodes.contains_key(name) {
            self.nodes.insert(name.to_owned(), Node::default());
        }
    }

    /// Removes a node and all edges touching it. Idempotent.
    pub fn remove_node(&mut self, name: &str) {
        let Some(node) = self.nodes.shift_remove(name) else {
            return;
        };
        for parent in &node.parents {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.remove(name);
            }
        }
        for child in &node.children {
            if let Some(c) = self.nodes.get_mut(child) {
                if c.parents.remove(name) {
                    c.in_count -= 1;
                }
            }
        }
    }

    /// Adds an edge, creating missing endpoints. Idempotent.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.add_node(from);
        self.add_node(to);
        self.nodes
            .get_mut(from)
            .unwrap()
            .children
            .insert(to.to_owned());
        let child = self.nodes.get_mut(to).unwrap();
        if child.parents.insert(from.to_owned()) {
            child.in_count += 1;
        }
    }

    /// Removes an edge if present. Idempotent.
    pub fn remove_edge(&mut self, from: &str, to: &str) {
        if let Some(node) = self.nodes.get_mut(from) {
            node.children.remove(to);
        }
        if let Some(node) = self.nodes.get_mut(to) {
            if node.parents.remove(from) {
                node.in_count -= 1;
            }
        }
    }

    /// Recomputes the incoming-edge count of `name` from its parent set.
    pub fn reindex(&mut self, name: &str) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.in_count = node.parents.len() as u32;
        }
    }

    pub fn parents(&self, name: &str) -> impl Iterator<Item = &str> {
        self.nodes
            .get(name)
            .into_iter()
            .flat_map(|node| node.parents.iter().map(String::as_str))
    }

    pub fn children(&self, name: &str) -> impl Iterator<Item = &str> {
        self.nodes
            .get(name)
            .into_iter()
            .flat_map(|node| node.children.iter().map(String::as_str))
    }

    fn order_key(&self, name: &str) -> (usize, String) {
        let index = if self.insertion_ordered {
            self.nodes.get_index_of(name).unwrap_or(usize::MAX)
        } else {
            0
        };
        (index, name.to_owned())
    }

    /// Topological sort with stable tie-breaking.
    ///
    /// Roots are visited first; among ready nodes the lexicographically (or
    /// insertion-order) smallest is picked. On a cycle the graph is left
    /// untouched and an error is returned.
    pub fn topo_sort(&self) -> Result<Vec<String>, GraphCycleError> {
        let mut in_counts: HashMap<&str, u32> = self
            .nodes
            .iter()
            .map(|(name, node)| (name.as_str(), node.in_count))
            .collect();
        let mut ready: BTreeSet<(usize, String)> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.in_count == 0)
            .map(|(name, _)| self.order_key(name))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some((_, name)) = ready.pop_first() {
            for child in self.children(&name) {
                let count = in_counts.get_mut(child).unwrap();
                *count -= 1;
                if *count == 0 {
                    ready.insert(self.order_key(child));
                }
            }
            order.push(name);
        }
        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err(GraphCycleError)
        }
    }

    /// Breadth-first layering from the root nodes.
    ///
    /// Returns the depth of every reachable node and the visit order.
    pub fn breadth_layers(&self) -> (HashMap<String, u32>, Vec<String>) {
        let mut roots: Vec<_> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.in_count == 0)
            .map(|(name, _)| self.order_key(name))
            .collect();
        roots.sort();
        let mut depths = HashMap::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        for (_, name) in roots {
            depths.insert(name.clone(), 0);
            queue.push_back(name);
        }
        while let Some(name) = queue.pop_front() {
            let depth = depths[&name];
            order.push(name.clone());
            for child in self.children(&name) {
                if !depths.contains_key(child) {
                    depths.insert(child.to_owned(), depth + 1);
                    queue.push_back(child.to_owned());
                }
            }
        }
        (depths, order)
    }

    /// Extracts a cycle reachable from `seed`, or an empty vector if none.
    pub fn find_cycle(&self, seed: &str) -> Vec<String> {
        let mut path: Vec<String> = Vec::new();
        let mut on_path: HashSet<String> = HashSet::new();
        let mut visited: HashSet<String> = HashSet::new();
        // Iterative DFS; the stack holds (node, entered) pairs so path
        // maintenance stays explicit.
        let mut stack: Vec<(String, bool)> = vec![(seed.to_owned(), false)];
        while let Some((name, entered)) = stack.pop() {
            if entered {
                on_path.remove(&name);
                path.pop();
                continue;
            }
            if visited.contains(&name) {
                continue;
            }
            visited.insert(name.clone());
            on_path.insert(name.clone());
            path.push(name.clone());
            stack.push((name.clone(), true));
            for child in self.children(&name) {
                if on_path.contains(child) {
                    let start = path.iter().position(|n| n == child).unwrap();
                    return path[start..].to_vec();
                }
                if !visited.contains(child) {
                    stack.push((child.to_owned(), false));
                }
            }
        }
        Vec::new()
    }

    /// Emits the graph in Graphviz format with nodes labeled by their
    /// position in the given precomputed order.
    pub fn graphviz(&self, order: &[String]) -> String {
        let index: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let mut out = String::from("digraph Strata {\n");
        for name in order {
            let Some(&i) = index.get(name.as_str()) else {
                continue;
            };
            for child in self.children(name) {
                if let Some(&j) = index.get(child) {
                    writeln!(out, "  \"{i} {name}\" -> \"{j} {child}\";").unwrap();
                }
            }
        }
        out.push_str("}\n");
        out
    }

    /// Debug dump of all nodes and edges.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (name, node) in &self.nodes {
            writeln!(
                out,
                "{name} (in {}): -> [{}]",
                node.in_count,
                node.children.iter().map(String::as_str).collect::<Vec<_>>().join(", "),
            )
            .unwrap();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Graph {
        let mut graph = Graph::new();
        graph.add_edge("a", "b");
        graph.add_edge("a", "c");
        graph.add_edge("b", "d");
        graph.add_edge("c", "d");
        graph
    }

    #[test]
    fn test_topo_sort_lexicographic() {
        let graph = diamond();
        assert_eq!(graph.topo_sort().unwrap(), ["a", "b", "c", "d"]);
    }

    #[test]
    fn test_topo_sort_insertion_order() {
        let mut graph = Graph::insertion_ordered();
        graph.add_node("z");
        graph.add_node("a");
        graph.add_edge("z", "m");
        graph.add_edge("a", "m");
        assert_eq!(graph.topo_sort().unwrap(), ["z", "a", "m"]);
    }

    #[test]
    fn test_topo_sort_is_deterministic() {
        let graph = diamond();
        assert_eq!(graph.topo_sort().unwrap(), graph.topo_sort().unwrap());
    }

    #[test]
    fn test_topo_sort_cycle() {
        let mut graph = diamond();
        graph.add_edge("d", "a");
        assert!(graph.topo_sort().is_err());
        // The graph is intact and the cycle can be extracted.
        assert_eq!(graph.len(), 4);
        let cycle = graph.find_cycle("a");
        assert_eq!(cycle.len(), 3);
        assert_eq!(cycle[0], "a");
    }

    #[test]
    fn test_find_cycle_none() {
        assert_eq!(diamond().find_cycle("a"), Vec::<String>::new());
    }

    #[test]
    fn test_edges_idempotent() {
        let mut graph = Graph::new();
        graph.add_edge("a", "b");
        graph.add_edge("a", "b");
        assert_eq!(graph.children("a").count(), 1);
        graph.remove_edge("a", "b");
        graph.remove_edge("a", "b");
        assert_eq!(graph.children("a").count(), 0);
        assert_eq!(graph.topo_sort().unwrap(), ["a", "b"]);
    }

    #[test]
    fn test_remove_node_detaches_edges() {
        let mut graph = diamond();
        graph.remove_node("b");
        assert_eq!(graph.topo_sort().unwrap(), ["a", "c", "d"]);
        assert_eq!(graph.parents("d").collect::<Vec<_>>(), ["c"]);
    }

    #[test]
    fn test_breadth_layers() {
        let (depths, order) = diamond().breadth_layers();
        assert_eq!(depths["a"], 0);
        assert_eq!(depths["b"], 1);
        assert_eq!(depths["c"], 1);
        assert_eq!(depths["d"], 2);
        assert_eq!(order, ["a", "b", "c", "d"]);
    }

    #[test]
    fn test_graphviz() {
        let mut graph = Graph::new();
        graph.add_edge("a", "b");
        let order = graph.topo_sort().unwrap();
        assert_eq!(
            graph.graphviz(&order),
            "digraph Strata {\n  \"0 a\" -> \"1 b\";\n}\n"
        );
    }

    #[test]
    fn test_clone_is_deep() {
        let mut graph = diamond();
        let snapshot = graph.clone();
        graph.remove_node("a");
        assert_eq!(snapshot.len(), 4);
        assert!(snapshot.contains("a"));
    }

    #[test]
    fn test_reindex() {
        let mut graph = diamond();
        graph.reindex("d");
        assert_eq!(graph.topo_sort().unwrap(), ["a", "b", "c", "d"]);
    }
}
