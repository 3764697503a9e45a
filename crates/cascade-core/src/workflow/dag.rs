//! DAG validation, cycle reporting, and deterministic topological order.
//!
//! Uses `petgraph` to model task dependencies as a directed graph with edges
//! from dependency to dependent. Topological sort detects cycles; when one is
//! found the offending strongly connected component is walked to report the
//! full cycle path.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use cascade_types::workflow::TaskSpec;
use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use super::definition::GraphError;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate that tasks form a DAG and return their topological order.
///
/// Every dependency must name a task in `tasks`. Among tasks that are ready at
/// the same time, the order is lexical by task ID, so the result is stable
/// regardless of declaration order.
pub fn validate_dag(tasks: &[TaskSpec]) -> Result<Vec<String>, GraphError> {
    let id_to_idx: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = tasks.iter().map(|t| graph.add_node(t.id.as_str())).collect();

    for task in tasks {
        let to_idx = id_to_idx[task.id.as_str()];
        for dep in &task.dependencies {
            let from_idx = id_to_idx
                .get(dep.as_str())
                .ok_or_else(|| GraphError::MissingDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    if let Err(cycle) = toposort(&graph, None) {
        return Err(GraphError::Cycle {
            path: cycle_path(&graph, cycle.node_id()),
        });
    }

    Ok(lexical_order(tasks))
}

/// Kahn's algorithm with a sorted ready set. Assumes the graph is acyclic.
fn lexical_order(tasks: &[TaskSpec]) -> Vec<String> {
    let mut remaining: BTreeMap<&str, usize> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.dependencies.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(n) = remaining.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    order
}

// ---------------------------------------------------------------------------
// Cycle path extraction
// ---------------------------------------------------------------------------

/// Report a concrete cycle, starting and ending at the same task.
fn cycle_path(graph: &DiGraph<&str, ()>, hint: NodeIndex) -> Vec<String> {
    let components = kosaraju_scc(graph);
    let is_cyclic = |scc: &Vec<NodeIndex>| {
        scc.len() > 1 || graph.neighbors(scc[0]).any(|n| n == scc[0])
    };
    let component = components
        .iter()
        .find(|scc| scc.contains(&hint) && is_cyclic(scc))
        .or_else(|| components.iter().find(|scc| is_cyclic(scc)));

    let Some(component) = component else {
        return vec![graph[hint].to_string()];
    };

    let members: HashSet<NodeIndex> = component.iter().copied().collect();
    let start = component
        .iter()
        .copied()
        .min_by_key(|n| graph[*n])
        .unwrap_or(hint);

    let mut path = vec![start];
    let mut visited = HashSet::from([start]);
    walk_back_to(graph, start, start, &members, &mut visited, &mut path);

    let mut names: Vec<String> = path.iter().map(|n| graph[*n].to_string()).collect();
    names.push(graph[start].to_string());
    names
}

fn walk_back_to(
    graph: &DiGraph<&str, ()>,
    current: NodeIndex,
    start: NodeIndex,
    members: &HashSet<NodeIndex>,
    visited: &mut HashSet<NodeIndex>,
    path: &mut Vec<NodeIndex>,
) -> bool {
    let mut next: Vec<NodeIndex> = graph
        .neighbors(current)
        .filter(|n| members.contains(n))
        .collect();
    next.sort_by_key(|n| graph[*n]);

    if next.contains(&start) {
        return true;
    }
    for n in next {
        if visited.insert(n) {
            path.push(n);
            if walk_back_to(graph, n, start, members, visited, path) {
                return true;
            }
            path.pop();
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Transitive dependency closure
// ---------------------------------------------------------------------------

/// Returns the transitive closure of all dependencies for a given task.
///
/// If `task_id` is not found, returns an empty set.
pub fn upstream_closure<'a>(task_id: &str, tasks: &'a [TaskSpec]) -> BTreeSet<&'a str> {
    let by_id: HashMap<&str, &TaskSpec> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut visited = BTreeSet::new();
    let mut stack: Vec<&str> = by_id
        .get(task_id)
        .map(|t| t.dependencies.iter().map(String::as_str).collect())
        .unwrap_or_default();

    while let Some(current) = stack.pop() {
        let Some(task) = by_id.get(current) else {
            continue;
        };
        if visited.insert(task.id.as_str()) {
            stack.extend(task.dependencies.iter().map(String::as_str));
        }
    }

    visited
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Helper: build a task spec with given ID and dependencies.
    fn task(id: &str, deps: Vec<&str>) -> TaskSpec {
        TaskSpec::new(id).depends_on(deps)
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    #[test]
    fn test_independent_tasks_sorted_lexically() {
        let tasks = vec![task("c", vec![]), task("a", vec![]), task("b", vec![])];
        assert_eq!(validate_dag(&tasks).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_linear_chain() {
        // c -> b -> a
        let tasks = vec![task("a", vec!["b"]), task("b", vec!["c"]), task("c", vec![])];
        assert_eq!(validate_dag(&tasks).unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_diamond() {
        // a -> {b, c} -> d
        let tasks = vec![
            task("d", vec!["c", "b"]),
            task("c", vec!["a"]),
            task("b", vec!["a"]),
            task("a", vec![]),
        ];
        assert_eq!(validate_dag(&tasks).unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_empty() {
        assert!(validate_dag(&[]).unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    #[test]
    fn test_two_node_cycle_reports_path() {
        let tasks = vec![task("a", vec!["b"]), task("b", vec!["a"])];
        let err = validate_dag(&tasks).unwrap_err();
        match &err {
            GraphError::Cycle { path } => assert_eq!(path, &vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert_eq!(err.to_string(), "cycle detected: a -> b -> a");
    }

    #[test]
    fn test_three_node_cycle_with_tail() {
        // root -> x, and x -> y -> z -> x
        let tasks = vec![
            task("root", vec![]),
            task("x", vec!["root", "z"]),
            task("y", vec!["x"]),
            task("z", vec!["y"]),
        ];
        let err = validate_dag(&tasks).unwrap_err();
        match err {
            GraphError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
                assert!(!path.contains(&"root".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop() {
        let tasks = vec![task("a", vec!["a"])];
        match validate_dag(&tasks).unwrap_err() {
            GraphError::Cycle { path } => assert_eq!(path, vec!["a", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_dependency() {
        let tasks = vec![task("a", vec!["missing"])];
        let err = validate_dag(&tasks).unwrap_err();
        assert!(matches!(
            err,
            GraphError::MissingDependency { ref task, ref dependency } if task == "a" && dependency == "missing"
        ));
    }

    // -----------------------------------------------------------------------
    // Transitive dependencies
    // -----------------------------------------------------------------------

    #[test]
    fn test_upstream_closure() {
        let tasks = vec![
            task("a", vec![]),
            task("b", vec!["a"]),
            task("c", vec!["b"]),
            task("d", vec!["c"]),
        ];
        let deps: Vec<&str> = upstream_closure("d", &tasks).into_iter().collect();
        assert_eq!(deps, vec!["a", "b", "c"]);
        assert!(upstream_closure("a", &tasks).is_empty());
        assert!(upstream_closure("nonexistent", &tasks).is_empty());
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    /// Random DAG: task `tN` may only depend on tasks with a smaller index.
    fn arb_dag() -> impl Strategy<Value = Vec<TaskSpec>> {
        (1usize..12).prop_flat_map(|n| {
            proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n).prop_map(
                move |matrix| {
                    (0..n)
                        .map(|i| {
                            let deps: Vec<String> =
                                (0..i).filter(|j| matrix[i][*j]).map(|j| format!("t{j:02}")).collect();
                            TaskSpec::new(format!("t{i:02}")).depends_on(deps)
                        })
                        .collect()
                },
            )
        })
    }

    proptest! {
        #[test]
        fn prop_order_respects_dependencies(tasks in arb_dag()) {
            let order = validate_dag(&tasks).unwrap();
            prop_assert_eq!(order.len(), tasks.len());
            let pos: HashMap<&str, usize> =
                order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
            for t in &tasks {
                for dep in &t.dependencies {
                    prop_assert!(pos[dep.as_str()] < pos[t.id.as_str()]);
                }
            }
        }

        #[test]
        fn prop_order_independent_of_declaration_order(tasks in arb_dag()) {
            let mut reversed = tasks.clone();
            reversed.reverse();
            prop_assert_eq!(validate_dag(&tasks).unwrap(), validate_dag(&reversed).unwrap());
        }
    }
}
