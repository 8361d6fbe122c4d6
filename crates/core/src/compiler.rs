//! Workflow compilation
//!
//! Turns a workflow definition into a layered execution plan. Compilation is
//! a pure function: the same definition always produces the same plan, byte
//! for byte. Candidate selection is keyed by ascending task id so no output
//! depends on hash-map iteration order.

use flowlane_common::error::{Error, Result};
use flowlane_common::types::{TaskId, WorkflowSpec};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::{debug, instrument};

/// Output of the compiler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Tasks grouped by dependency depth; every dependency of a task in
    /// layer k lives in a layer strictly before k. Ids within a layer are
    /// sorted ascending.
    pub layers: Vec<Vec<TaskId>>,
    /// Deterministic total order consistent with the dependency relation
    pub order: Vec<TaskId>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.order.len()
    }
}

/// Compile a workflow into an execution plan
#[instrument(skip(workflow), fields(workflow_id = %workflow.id))]
pub fn compile(workflow: &WorkflowSpec) -> Result<ExecutionPlan> {
    let mut seen = HashSet::new();
    for task in &workflow.tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(Error::DuplicateTaskId(task.id.clone()));
        }
    }

    for task in &workflow.tasks {
        for dep in &task.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(Error::DependencyNotFound {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let graph = build_graph(workflow);

    // Kahn traversal; the ready-heap pops the smallest id first so the
    // emitted order is deterministic for equal inputs.
    let mut indegree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    let mut ready: BinaryHeap<Reverse<(TaskId, NodeIndex)>> = indegree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&n, _)| Reverse((graph[n].clone(), n)))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    let mut depth: HashMap<NodeIndex, usize> = HashMap::new();

    while let Some(Reverse((id, node))) = ready.pop() {
        let layer = graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|dep| depth[&dep] + 1)
            .max()
            .unwrap_or(0);
        depth.insert(node, layer);
        order.push(id);

        for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
            let remaining = indegree
                .get_mut(&dependent)
                .expect("dependent present in indegree map");
            *remaining -= 1;
            if *remaining == 0 {
                ready.push(Reverse((graph[dependent].clone(), dependent)));
            }
        }
    }

    if order.len() != graph.node_count() {
        let mut stuck: Vec<&str> = graph
            .node_indices()
            .filter(|n| !depth.contains_key(n))
            .map(|n| graph[n].as_str())
            .collect();
        stuck.sort_unstable();
        return Err(Error::CyclicDependency(stuck.join(", ")));
    }

    let layer_count = depth.values().map(|d| d + 1).max().unwrap_or(0);
    let mut layers: Vec<Vec<TaskId>> = vec![Vec::new(); layer_count];
    for (&node, &layer) in &depth {
        layers[layer].push(graph[node].clone());
    }
    for layer in &mut layers {
        layer.sort_unstable();
    }

    debug!(
        tasks = order.len(),
        layers = layers.len(),
        "compiled workflow"
    );
    Ok(ExecutionPlan { layers, order })
}

/// Build the dependency graph; edges point from dependency to dependent
fn build_graph(workflow: &WorkflowSpec) -> DiGraph<TaskId, ()> {
    let mut graph = DiGraph::new();
    let mut node_map = HashMap::new();

    for task in &workflow.tasks {
        let idx = graph.add_node(task.id.clone());
        node_map.insert(task.id.as_str(), idx);
    }

    for task in &workflow.tasks {
        let to = node_map[task.id.as_str()];
        // Duplicate dependency declarations collapse to one edge so the
        // in-degree accounting stays exact.
        let mut edged = HashSet::new();
        for dep in &task.dependencies {
            if edged.insert(dep.as_str()) {
                graph.add_edge(node_map[dep.as_str()], to, ());
            }
        }
    }

    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlane_common::types::TaskSpec;
    use proptest::prelude::*;

    fn wf(tasks: Vec<TaskSpec>) -> WorkflowSpec {
        let mut w = WorkflowSpec::new("wf");
        w.tasks = tasks;
        w
    }

    #[test]
    fn empty_workflow_yields_zero_layers() {
        let plan = compile(&wf(vec![])).unwrap();
        assert!(plan.layers.is_empty());
        assert!(plan.order.is_empty());
    }

    #[test]
    fn isolated_task_yields_single_layer() {
        let plan = compile(&wf(vec![TaskSpec::new("a")])).unwrap();
        assert_eq!(plan.layers, vec![vec!["a".to_string()]]);
        assert_eq!(plan.order, vec!["a".to_string()]);
    }

    #[test]
    fn fan_out_layers() {
        let plan = compile(&wf(vec![
            TaskSpec::new("a"),
            TaskSpec::new("b").depends_on("a"),
            TaskSpec::new("c").depends_on("a"),
        ]))
        .unwrap();
        assert_eq!(
            plan.layers,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()]
            ]
        );
    }

    #[test]
    fn layer_is_one_past_deepest_dependency() {
        // d depends on both a root and a depth-1 task
        let plan = compile(&wf(vec![
            TaskSpec::new("a"),
            TaskSpec::new("b").depends_on("a"),
            TaskSpec::new("c"),
            TaskSpec::new("d").depends_on("b").depends_on("c"),
        ]))
        .unwrap();
        assert_eq!(plan.layers[2], vec!["d".to_string()]);
    }

    #[test]
    fn order_prefers_smallest_ready_id() {
        let plan = compile(&wf(vec![
            TaskSpec::new("z"),
            TaskSpec::new("a").depends_on("z"),
            TaskSpec::new("m"),
        ]))
        .unwrap();
        // m and z are ready first; a becomes ready once z is emitted
        assert_eq!(
            plan.order,
            vec!["m".to_string(), "z".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn duplicate_id_rejected() {
        let err = compile(&wf(vec![TaskSpec::new("a"), TaskSpec::new("a")])).unwrap_err();
        assert!(matches!(err, Error::DuplicateTaskId(id) if id == "a"));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = compile(&wf(vec![TaskSpec::new("a").depends_on("ghost")])).unwrap_err();
        match err {
            Error::DependencyNotFound { task, dependency } => {
                assert_eq!(task, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cycle_rejected_with_members() {
        let err = compile(&wf(vec![
            TaskSpec::new("a").depends_on("b"),
            TaskSpec::new("b").depends_on("a"),
            TaskSpec::new("c"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::CyclicDependency(ids) if ids == "a, b"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = compile(&wf(vec![TaskSpec::new("a").depends_on("a")])).unwrap_err();
        assert!(matches!(err, Error::CyclicDependency(_)));
    }

    #[test]
    fn duplicate_dependency_declarations_are_collapsed() {
        let plan = compile(&wf(vec![
            TaskSpec::new("a"),
            TaskSpec::new("b").depends_on("a").depends_on("a"),
        ]))
        .unwrap();
        assert_eq!(plan.layers.len(), 2);
    }

    // Random DAGs: ids pick from a small pool, dependencies only point at
    // earlier tasks so the graph is acyclic by construction.
    fn arb_workflow() -> impl Strategy<Value = WorkflowSpec> {
        prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..4), 0..12)
            .prop_map(|deps_per_task| {
                let mut w = WorkflowSpec::new("prop");
                for (i, deps) in deps_per_task.iter().enumerate() {
                    let mut task = TaskSpec::new(format!("t{i:02}"));
                    if i > 0 {
                        let mut chosen: Vec<usize> =
                            deps.iter().map(|d| d.index(i)).collect();
                        chosen.sort_unstable();
                        chosen.dedup();
                        for d in chosen {
                            task = task.depends_on(format!("t{d:02}"));
                        }
                    }
                    w.tasks.push(task);
                }
                w
            })
    }

    proptest! {
        #[test]
        fn dependencies_always_land_in_earlier_layers(w in arb_workflow()) {
            let plan = compile(&w).unwrap();
            let layer_of: HashMap<&str, usize> = plan
                .layers
                .iter()
                .enumerate()
                .flat_map(|(i, l)| l.iter().map(move |id| (id.as_str(), i)))
                .collect();
            for task in &w.tasks {
                for dep in &task.dependencies {
                    prop_assert!(layer_of[dep.as_str()] < layer_of[task.id.as_str()]);
                }
            }
        }

        #[test]
        fn compilation_is_deterministic(w in arb_workflow()) {
            let first = compile(&w).unwrap();
            let second = compile(&w).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn order_is_topological(w in arb_workflow()) {
            let plan = compile(&w).unwrap();
            let pos: HashMap<&str, usize> = plan
                .order
                .iter()
                .enumerate()
                .map(|(i, id)| (id.as_str(), i))
                .collect();
            for task in &w.tasks {
                for dep in &task.dependencies {
                    prop_assert!(pos[dep.as_str()] < pos[task.id.as_str()]);
                }
            }
        }
    }
}
