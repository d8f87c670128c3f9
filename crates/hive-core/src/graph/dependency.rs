//! Dependency graph for managing task dependencies.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync
//! - Nodes remember insertion order so every traversal is reproducible

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use serde::Serialize;

use crate::domain::{HiveError, TaskSpec};

/// Dependency graph over any node type (batch keys, task ids).
#[derive(Debug, Clone)]
pub struct DependencyGraph<N> {
    /// Nodes in insertion order.
    nodes: Vec<N>,

    /// Forward edges: task -> tasks it depends on (waits for)
    edges: HashMap<N, Vec<N>>,

    /// Reverse edges: task -> tasks that depend on it (waiting tasks)
    reverse_edges: HashMap<N, Vec<N>>,
}

impl<N: Clone + Eq + Hash> DependencyGraph<N> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: HashMap::new(),
            reverse_edges: HashMap::new(),
        }
    }

    /// Returns false if the node already exists.
    pub fn add_node(&mut self, node: N) -> bool {
        if self.edges.contains_key(&node) {
            return false;
        }
        self.edges.insert(node.clone(), Vec::new());
        self.reverse_edges.insert(node.clone(), Vec::new());
        self.nodes.push(node);
        true
    }

    pub fn contains(&self, node: &N) -> bool {
        self.edges.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a dependency: `task` depends on `depends_on` ("task waits for
    /// depends_on"). Both nodes are added if missing.
    pub fn add_dependency(&mut self, task: N, depends_on: N) {
        self.add_node(task.clone());
        self.add_node(depends_on.clone());
        let forward = self.edges.entry(task.clone()).or_default();
        if !forward.contains(&depends_on) {
            forward.push(depends_on.clone());
            self.reverse_edges.entry(depends_on).or_default().push(task);
        }
    }

    /// Tasks waiting for `task`, whether or not they have other dependencies.
    pub fn get_waiting_tasks(&self, task: &N) -> &[N] {
        self.reverse_edges.get(task).map_or(&[], Vec::as_slice)
    }

    pub fn get_dependencies(&self, task: &N) -> &[N] {
        self.edges.get(task).map_or(&[], Vec::as_slice)
    }

    pub fn has_dependencies(&self, task: &N) -> bool {
        !self.get_dependencies(task).is_empty()
    }

    /// Kahn's algorithm.
    ///
    /// Returns every node such that each dependency precedes its dependents;
    /// zero in-degree nodes are taken in insertion order. Otherwise returns
    /// the nodes left unresolved, in insertion order.
    pub fn topological_order(&self) -> Result<Vec<N>, Vec<N>> {
        let mut in_degree: HashMap<&N, usize> = self
            .nodes
            .iter()
            .map(|n| (n, self.get_dependencies(n).len()))
            .collect();

        let mut ready: VecDeque<&N> = self
            .nodes
            .iter()
            .filter(|n| in_degree.get(n).copied() == Some(0))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop_front() {
            order.push(node.clone());
            for dependent in self.get_waiting_tasks(node) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let resolved: HashSet<&N> = order.iter().collect();
            Err(self
                .nodes
                .iter()
                .filter(|n| !resolved.contains(n))
                .cloned()
                .collect())
        }
    }
}

impl<N: Clone + Eq + Hash> Default for DependencyGraph<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-fatal summary of a batch's dependency structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DependencyReport {
    pub has_tasks: bool,
    pub all_dependencies_exist: bool,
    pub no_cycles: bool,
}

impl DependencyReport {
    pub fn is_valid(&self) -> bool {
        self.has_tasks && self.all_dependencies_exist && self.no_cycles
    }
}

fn build_graph(tasks: &[TaskSpec]) -> Result<DependencyGraph<String>, HiveError> {
    let mut graph = DependencyGraph::new();
    for task in tasks {
        if !graph.add_node(task.key.clone()) {
            return Err(HiveError::DuplicateTask(task.key.clone()));
        }
    }
    for task in tasks {
        for dep in &task.depends_on {
            if !graph.contains(dep) {
                return Err(HiveError::Dependency {
                    task: task.key.clone(),
                    missing: dep.clone(),
                });
            }
            graph.add_dependency(task.key.clone(), dep.clone());
        }
    }
    Ok(graph)
}

/// Keys of `tasks` ordered so every dependency precedes its dependents.
///
/// Fails with `DuplicateTask` or `Dependency` for malformed batches and with
/// `CyclicDependency` (listing the unresolved keys) if the graph has a cycle;
/// a task depending on itself is a cycle.
pub fn resolve_order(tasks: &[TaskSpec]) -> Result<Vec<String>, HiveError> {
    build_graph(tasks)?
        .topological_order()
        .map_err(HiveError::CyclicDependency)
}

/// Same checks as [`resolve_order`], reported instead of raised.
pub fn validate_dependencies(tasks: &[TaskSpec]) -> DependencyReport {
    let keys: HashSet<&str> = tasks.iter().map(|t| t.key.as_str()).collect();
    let all_dependencies_exist = tasks
        .iter()
        .flat_map(|t| &t.depends_on)
        .all(|dep| keys.contains(dep.as_str()));

    let no_cycles = match build_graph(tasks) {
        Ok(graph) => graph.topological_order().is_ok(),
        // Missing deps or duplicate keys: check the part that can be built.
        Err(_) => {
            let mut graph = DependencyGraph::new();
            for task in tasks {
                graph.add_node(task.key.clone());
                for dep in task.depends_on.iter().filter(|d| keys.contains(d.as_str())) {
                    graph.add_dependency(task.key.clone(), dep.clone());
                }
            }
            graph.topological_order().is_ok()
        }
    };

    DependencyReport {
        has_tasks: !tasks.is_empty(),
        all_dependencies_exist,
        no_cycles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CommandSpec, TaskPayload};

    fn spec(key: &str, deps: &[&str]) -> TaskSpec {
        let mut spec = TaskSpec::new(key, key, TaskPayload::Command(CommandSpec::new("true")));
        spec.depends_on = deps.iter().map(|d| d.to_string()).collect();
        spec
    }

    fn position(order: &[String], key: &str) -> usize {
        order.iter().position(|k| k == key).unwrap()
    }

    #[test]
    fn add_dependency_keeps_both_edge_sets_in_sync() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("b", "a");
        graph.add_dependency("b", "a");

        assert!(graph.has_dependencies(&"b"));
        assert!(!graph.has_dependencies(&"a"));
        assert_eq!(graph.get_dependencies(&"b"), &["a"]);
        assert_eq!(graph.get_waiting_tasks(&"a"), &["b"]);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn order_honors_every_edge() {
        //     a
        //    / \
        //   b   c
        //   |\ /|
        //   | X |
        //   |/ \|
        //   d   e
        let tasks = vec![
            spec("e", &["b", "c"]),
            spec("d", &["b", "c"]),
            spec("c", &["a"]),
            spec("b", &["a"]),
            spec("a", &[]),
        ];
        let order = resolve_order(&tasks).unwrap();
        assert_eq!(order.len(), tasks.len());
        for task in &tasks {
            for dep in &task.depends_on {
                assert!(position(&order, dep) < position(&order, &task.key));
            }
        }
    }

    #[test]
    fn independent_tasks_keep_submission_order() {
        let tasks = vec![spec("x", &[]), spec("y", &[]), spec("z", &[])];
        assert_eq!(resolve_order(&tasks).unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn cycle_is_rejected_with_members() {
        let tasks = vec![
            spec("a", &[]),
            spec("b", &["a", "d"]),
            spec("c", &["b"]),
            spec("d", &["c"]),
        ];
        match resolve_order(&tasks) {
            Err(HiveError::CyclicDependency(nodes)) => assert_eq!(nodes, vec!["b", "c", "d"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let tasks = vec![spec("a", &["a"])];
        assert!(matches!(
            resolve_order(&tasks),
            Err(HiveError::CyclicDependency(_))
        ));
    }

    #[test]
    fn missing_dependency_is_rejected() {
        let tasks = vec![spec("a", &["ghost"])];
        match resolve_order(&tasks) {
            Err(HiveError::Dependency { task, missing }) => {
                assert_eq!(task, "a");
                assert_eq!(missing, "ghost");
            }
            other => panic!("expected dependency error, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let tasks = vec![spec("a", &[]), spec("a", &[])];
        assert!(matches!(
            resolve_order(&tasks),
            Err(HiveError::DuplicateTask(key)) if key == "a"
        ));
    }

    #[test]
    fn report_flags_each_problem() {
        assert_eq!(
            validate_dependencies(&[]),
            DependencyReport {
                has_tasks: false,
                all_dependencies_exist: true,
                no_cycles: true,
            }
        );

        let report = validate_dependencies(&[spec("a", &["b"]), spec("b", &["a", "ghost"])]);
        assert!(report.has_tasks);
        assert!(!report.all_dependencies_exist);
        assert!(!report.no_cycles);
        assert!(!report.is_valid());

        assert!(validate_dependencies(&[spec("a", &[]), spec("b", &["a"])]).is_valid());
    }
}
