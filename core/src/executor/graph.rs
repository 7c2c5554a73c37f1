use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::DependencyGraphError;
use crate::task::TaskSet;

use super::plan::{ExecutionPlan, NodeId};

/// Dependency graph over run and output-only nodes.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Dependency edges: node -> nodes that depend on it
    dependents: HashMap<NodeId, Vec<NodeId>>,

    /// Original insertion order (for stable batching)
    insertion_order: Vec<NodeId>,
}

impl DependencyGraph {
    /// Builds the graph for `selected`, resolving dependencies against `universe`.
    ///
    /// A dependency outside the selection is not run; an output-only node stands in
    /// for it. Reverse-mode tasks (those carrying `original_deps`) additionally get
    /// their original dependencies' outputs fetched first.
    pub fn build(selected: &TaskSet, universe: &TaskSet) -> Result<Self, DependencyGraphError> {
        let mut graph = Self::default();
        let exists = |id: &str| selected.contains(id) || universe.contains(id);

        for task in selected.iter() {
            let node = NodeId::Run(task.id.clone());
            graph.ensure(&node);

            for dep in &task.all_discovered_deps {
                if !exists(dep) {
                    return Err(missing(&task.id, dep));
                }
                if selected.contains(dep) {
                    graph.add_edge(NodeId::Run(dep.clone()), node.clone());
                } else {
                    graph.add_edge(NodeId::OutputOnly(dep.clone()), node.clone());
                }
            }

            if let Some(original_deps) = &task.original_deps {
                let own_output = NodeId::OutputOnly(task.id.clone());
                graph.ensure(&own_output);
                for dep in original_deps {
                    if !exists(dep) {
                        return Err(missing(&task.id, dep));
                    }
                    let dep_output = NodeId::OutputOnly(dep.clone());
                    graph.add_edge(dep_output.clone(), node.clone());
                    graph.add_edge(dep_output, own_output.clone());
                }
            }
        }

        // An output fetch needs its own dependencies' outputs first (one level).
        let output_nodes: Vec<NodeId> = graph
            .insertion_order
            .iter()
            .filter(|n| n.is_output_only())
            .cloned()
            .collect();
        for node in &output_nodes {
            let Some(task) = universe.get(node.task_id()) else {
                continue;
            };
            for dep in &task.all_discovered_deps {
                if !universe.contains(dep) {
                    return Err(missing(&task.id, dep));
                }
                graph.add_edge(NodeId::OutputOnly(dep.clone()), node.clone());
            }
        }

        graph.prune_unconsumed_outputs();
        Ok(graph)
    }

    fn ensure(&mut self, node: &NodeId) {
        if !self.dependents.contains_key(node) {
            self.dependents.insert(node.clone(), Vec::new());
            self.insertion_order.push(node.clone());
        }
    }

    fn add_edge(&mut self, from: NodeId, to: NodeId) {
        self.ensure(&from);
        self.ensure(&to);
        if let Some(list) = self.dependents.get_mut(&from) {
            if !list.contains(&to) {
                list.push(to);
            }
        }
    }

    /// Removes output-only nodes nobody consumes, until no more can be removed.
    fn prune_unconsumed_outputs(&mut self) {
        let mut worklist: VecDeque<NodeId> = self
            .insertion_order
            .iter()
            .filter(|n| n.is_output_only())
            .cloned()
            .collect();

        while let Some(node) = worklist.pop_front() {
            let unconsumed = self
                .dependents
                .get(&node)
                .is_some_and(|consumers| consumers.is_empty());
            if !unconsumed {
                continue;
            }

            self.dependents.remove(&node);
            self.insertion_order.retain(|n| n != &node);
            for (other, consumers) in self.dependents.iter_mut() {
                let before = consumers.len();
                consumers.retain(|n| n != &node);
                if consumers.len() != before && consumers.is_empty() && other.is_output_only() {
                    worklist.push_back(other.clone());
                }
            }
            tracing::trace!(node = %node, "pruned unconsumed output node");
        }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.dependents.contains_key(node)
    }

    pub fn dependents(&self, node: &NodeId) -> &[NodeId] {
        self.dependents
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.dependents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }

    /// Topological sort using Kahn's algorithm
    ///
    /// Returns batches where every node's dependencies lie in strictly earlier
    /// batches. Within a batch, insertion order is kept.
    ///
    /// # Time Complexity
    ///
    /// O(V log V + E)
    pub fn batches(&self) -> Result<Vec<Vec<NodeId>>, DependencyGraphError> {
        let position: HashMap<&NodeId, usize> = self
            .insertion_order
            .iter()
            .enumerate()
            .map(|(i, n)| (n, i))
            .collect();
        let by_insertion = |batch: &mut Vec<NodeId>| {
            batch.sort_by_key(|n| position.get(n).copied().unwrap_or(usize::MAX))
        };

        let mut in_degree: HashMap<&NodeId, usize> =
            self.dependents.keys().map(|n| (n, 0)).collect();
        for consumers in self.dependents.values() {
            for consumer in consumers {
                if let Some(degree) = in_degree.get_mut(consumer) {
                    *degree += 1;
                }
            }
        }

        let mut current: Vec<NodeId> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(n, _)| (*n).clone())
            .collect();
        by_insertion(&mut current);

        let mut batches = Vec::new();
        let mut processed = 0;

        while !current.is_empty() {
            processed += current.len();

            let mut next = Vec::new();
            for node in &current {
                for consumer in self.dependents(node) {
                    if let Some(degree) = in_degree.get_mut(consumer) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(consumer.clone());
                        }
                    }
                }
            }
            by_insertion(&mut next);

            batches.push(std::mem::replace(&mut current, next));
        }

        if processed != self.dependents.len() {
            let cycle = self
                .detect_cycle()
                .unwrap_or_else(|| "unable to complete topological sort".to_string());
            return Err(DependencyGraphError::CircularDependency(cycle));
        }

        Ok(batches)
    }

    /// Batches plus per-node predecessors, ready for the execution queue.
    pub fn into_plan(self) -> Result<ExecutionPlan, DependencyGraphError> {
        let batches = self.batches()?;
        let mut predecessors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in &self.insertion_order {
            for consumer in self.dependents(node) {
                predecessors
                    .entry(consumer.clone())
                    .or_default()
                    .push(node.clone());
            }
        }
        Ok(ExecutionPlan::new(batches, predecessors))
    }

    /// Detect circular dependencies using DFS
    fn detect_cycle(&self) -> Option<String> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for node in &self.insertion_order {
            if !visited.contains(node) && self.dfs_cycle(node, &mut visited, &mut stack) {
                return Some(format_cycle_path(&stack));
            }
        }

        None
    }

    fn dfs_cycle(
        &self,
        node: &NodeId,
        visited: &mut HashSet<NodeId>,
        stack: &mut Vec<NodeId>,
    ) -> bool {
        visited.insert(node.clone());
        stack.push(node.clone());

        for next in self.dependents(node) {
            // Check if the node is already on the current path (cycle detected)
            if let Some(pos) = stack.iter().position(|x| x == next) {
                stack.push(next.clone());
                *stack = stack[pos..].to_vec();
                return true;
            }

            if !visited.contains(next) && self.dfs_cycle(next, visited, stack) {
                return true;
            }
        }

        stack.pop();
        false
    }
}

fn missing(task_id: &str, dep: &str) -> DependencyGraphError {
    DependencyGraphError::MissingDependency {
        task_id: task_id.to_string(),
        missing_dep: dep.to_string(),
    }
}

fn format_cycle_path(stack: &[NodeId]) -> String {
    stack
        .iter()
        .map(NodeId::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Plans a run of `selected`, with `universe` holding every loaded task in its original direction.
pub fn plan_run(selected: &TaskSet, universe: &TaskSet) -> Result<ExecutionPlan, DependencyGraphError> {
    DependencyGraph::build(selected, universe)?.into_plan()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::fixtures::task;
    use crate::task::{filter_by_tags, reverse_dependencies, Task};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn set(tasks: Vec<Task>) -> TaskSet {
        tasks.into_iter().map(Arc::new).collect()
    }

    fn run(id: &str) -> NodeId {
        NodeId::Run(id.into())
    }

    fn out(id: &str) -> NodeId {
        NodeId::OutputOnly(id.into())
    }

    fn assert_edges_point_backwards(graph: &DependencyGraph, plan: &ExecutionPlan) {
        for batch in plan.batches() {
            for node in batch {
                for consumer in graph.dependents(node) {
                    assert!(
                        plan.batch_of(node).unwrap() < plan.batch_of(consumer).unwrap(),
                        "{node} must come before {consumer}"
                    );
                }
            }
        }
    }

    #[test]
    fn batches_are_maximal_waves() {
        let tasks = set(vec![
            task("a", &[]),
            task("b", &[]),
            task("c", &["a", "b"]),
            task("d", &["a"]),
            task("e", &["c", "d"]),
        ]);
        let graph = DependencyGraph::build(&tasks, &tasks).unwrap();
        let plan = graph.clone().into_plan().unwrap();

        assert_eq!(
            plan.batches(),
            &[
                vec![run("a"), run("b")],
                vec![run("c"), run("d")],
                vec![run("e")]
            ]
        );
        assert_edges_point_backwards(&graph, &plan);
        assert_eq!(plan.predecessors(&run("c")), &[run("a"), run("b")]);
    }

    #[test]
    fn cycles_are_rejected() {
        let tasks = set(vec![task("a", &["c"]), task("b", &["a"]), task("c", &["b"])]);
        let err = plan_run(&tasks, &tasks).unwrap_err();
        match err {
            DependencyGraphError::CircularDependency(path) => {
                assert!(path.contains("a") && path.contains("b") && path.contains("c"));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_is_an_error() {
        let tasks = set(vec![task("a", &["ghost"])]);
        assert_eq!(
            plan_run(&tasks, &tasks).unwrap_err(),
            DependencyGraphError::MissingDependency {
                task_id: "a".into(),
                missing_dep: "ghost".into()
            }
        );
    }

    #[test]
    fn unselected_dependencies_become_output_fetches() {
        let mut b = task("b", &["a"]);
        b.tags = vec!["deploy".into()];
        let universe = set(vec![task("root", &[]), task("a", &["root"]), b]);
        let selected = filter_by_tags(&universe, &["deploy".to_string()]);

        let plan = plan_run(&selected, &universe).unwrap();
        assert_eq!(
            plan.batches(),
            &[vec![out("root")], vec![out("a")], vec![run("b")]]
        );
        assert_eq!(plan.predecessors(&run("b")), &[out("a")]);
    }

    #[test]
    fn reverse_chain_runs_backwards_after_fetching_outputs() {
        // c depends on b depends on a
        let universe = set(vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])]);
        let reversed = reverse_dependencies(&universe);

        let graph = DependencyGraph::build(&reversed, &universe).unwrap();
        assert!(!graph.contains(&out("c")));
        let plan = graph.clone().into_plan().unwrap();

        assert_eq!(
            plan.batches(),
            &[
                vec![out("a")],
                vec![out("b")],
                vec![run("c")],
                vec![run("b")],
                vec![run("a")]
            ]
        );
        assert_edges_point_backwards(&graph, &plan);
    }

    #[test]
    fn pruning_reaches_fixpoint() {
        let mut graph = DependencyGraph::default();
        graph.add_edge(out("x"), out("y"));
        graph.add_edge(out("y"), out("z"));
        graph.add_edge(run("a"), run("b"));
        graph.ensure(&out("w"));

        graph.prune_unconsumed_outputs();

        assert_eq!(graph.len(), 2);
        assert!(graph.contains(&run("a")) && graph.contains(&run("b")));
    }

    #[test]
    fn empty_selection_plans_nothing() {
        let plan = plan_run(&TaskSet::default(), &TaskSet::default()).unwrap();
        assert!(plan.is_empty());
    }
}
