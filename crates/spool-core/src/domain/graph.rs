//! Dependency graph for the tasks of one job.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync
//! - Invariant: the graph is acyclic. Edges are only added after `would_close_cycle` said no.

use std::collections::{HashMap, HashSet, VecDeque};

use super::ids::TaskId;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on (waits for)
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it.
    /// Enables O(1) lookup: "who is waiting for this task?"
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Example: add_dependency(task_b, task_a) means "B waits for A"
    /// - edges: B -> {A}
    /// - reverse_edges: A -> {B}
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    pub fn dependencies(&self, task: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Tasks directly waiting for `task`.
    pub fn dependents(&self, task: TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&task)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Is `target` reachable from `from` by following dependency edges?
    pub fn reaches(&self, from: TaskId, target: TaskId) -> bool {
        let mut stack = vec![from];
        let mut visited = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(deps) = self.edges.get(&node) {
                stack.extend(deps.iter().copied());
            }
        }
        false
    }

    /// Would adding `task -> deps` close a cycle?
    ///
    /// A cycle appears iff `task` is itself in `deps` or is reachable from one of them
    /// through the existing edges.
    pub fn would_close_cycle(&self, task: TaskId, deps: &[TaskId]) -> bool {
        deps.iter().any(|&dep| self.reaches(dep, task))
    }

    /// Every task that transitively depends on `task`, nearest first.
    pub fn downstream(&self, task: TaskId) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<TaskId> = self.dependents(task).into();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            out.push(next);
            queue.extend(self.dependents(next));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids<const N: usize>() -> [TaskId; N] {
        std::array::from_fn(|i| TaskId::from_u128(i as u128 + 1))
    }

    #[test]
    fn new_graph_is_empty() {
        let graph = DependencyGraph::new();
        let [a] = ids();
        assert!(graph.dependencies(a).is_empty());
        assert!(graph.dependents(a).is_empty());
    }

    #[test]
    fn add_dependency_creates_both_edges() {
        let mut graph = DependencyGraph::new();
        let [a, b] = ids();

        graph.add_dependency(b, a); // B depends on A

        assert_eq!(graph.dependencies(b), vec![a]);
        assert_eq!(graph.dependents(a), vec![b]);
        assert!(graph.dependencies(a).is_empty());
    }

    #[test]
    fn self_dependency_closes_a_cycle() {
        let graph = DependencyGraph::new();
        let [a] = ids();
        assert!(graph.would_close_cycle(a, &[a]));
    }

    #[test]
    fn back_edge_closes_a_cycle() {
        let mut graph = DependencyGraph::new();
        let [a, b, c] = ids();

        // C -> B -> A
        graph.add_dependency(b, a);
        graph.add_dependency(c, b);

        // A -> C closes A -> C -> B -> A
        assert!(graph.would_close_cycle(a, &[c]));
        assert!(!graph.would_close_cycle(c, &[a]));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        let [a, b, c, d] = ids();

        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        graph.add_dependency(b, a);
        graph.add_dependency(c, a);
        graph.add_dependency(d, b);

        assert!(!graph.would_close_cycle(d, &[c]));
        graph.add_dependency(d, c);
        assert!(graph.reaches(d, a));
        assert!(!graph.reaches(a, d));
    }

    #[test]
    fn downstream_is_transitive_and_nearest_first() {
        let mut graph = DependencyGraph::new();
        let [a, b, c, d] = ids();

        // B -> A, C -> B, D independent
        graph.add_dependency(b, a);
        graph.add_dependency(c, b);

        assert_eq!(graph.downstream(a), vec![b, c]);
        assert!(graph.downstream(d).is_empty());
        assert!(graph.downstream(c).is_empty());
    }

    #[test]
    fn downstream_visits_shared_descendants_once() {
        let mut graph = DependencyGraph::new();
        let [a, b, c, d] = ids();

        graph.add_dependency(b, a);
        graph.add_dependency(c, a);
        graph.add_dependency(d, b);
        graph.add_dependency(d, c);

        let down = graph.downstream(a);
        assert_eq!(down.len(), 3);
        assert_eq!(down.iter().filter(|&&t| t == d).count(), 1);
    }
}
