use mcoda_core::{McodaError, Task, TaskFilter, TaskStatus, WorkspaceStore};
use std::collections::{HashMap, HashSet, VecDeque};

/// Output of `TaskSelector::select`, per spec.md §4.3.
#[derive(Debug, Clone, Default)]
pub struct SelectionResult {
    pub ordered: Vec<Task>,
    pub blocked: Vec<Task>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct DependencyImpact {
    direct: usize,
    total: usize,
}

/// Dependency-aware task ordering: cycle detection (Tarjan), blocked
/// classification, and priority-weighted topological sort (Kahn).
pub struct TaskSelector<'a> {
    store: &'a dyn WorkspaceStore,
}

impl<'a> TaskSelector<'a> {
    pub fn new(store: &'a dyn WorkspaceStore) -> Self {
        Self { store }
    }

    pub async fn select(&self, filter: &TaskFilter) -> Result<SelectionResult, McodaError> {
        let candidates: Vec<Task> = self
            .store
            .list_tasks(filter)
            .await?
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect();

        if candidates.is_empty() {
            return Ok(SelectionResult::default());
        }

        let candidate_ids: HashSet<i64> = candidates.iter().map(|t| t.id).collect();
        let all_deps = self
            .store
            .list_dependencies(&candidates.iter().map(|t| t.id).collect::<Vec<_>>())
            .await?;

        // Dependents (from -> to, "from depends on to") restricted to candidates
        // form the DAG used for cycle detection, impact, and ordering.
        let mut dag_edges: Vec<(i64, i64)> = all_deps
            .iter()
            .filter(|d| candidate_ids.contains(&d.from_task_id) && candidate_ids.contains(&d.to_task_id))
            .map(|d| (d.from_task_id, d.to_task_id))
            .collect();

        let by_id: HashMap<i64, &Task> = candidates.iter().map(|t| (t.id, t)).collect();
        let mut warnings = Vec::new();

        break_cycles(&mut dag_edges, &by_id, &mut warnings);

        let impact = compute_dependency_impact(&candidate_ids, &dag_edges);

        // Blocked: any prerequisite outside the candidate set that is not completed.
        let mut blocked_ids: HashSet<i64> = HashSet::new();
        for dep in &all_deps {
            if !candidate_ids.contains(&dep.from_task_id) {
                continue;
            }
            if candidate_ids.contains(&dep.to_task_id) {
                continue; // prerequisite will be processed in this same selection
            }
            let prereq_status = self.store.get_task(dep.to_task_id).await?.status;
            if prereq_status != TaskStatus::Completed {
                blocked_ids.insert(dep.from_task_id);
            }
        }

        let runnable_ids: HashSet<i64> = candidate_ids
            .iter()
            .copied()
            .filter(|id| !blocked_ids.contains(id))
            .collect();

        let ordered_ids = kahn_sort(&runnable_ids, &dag_edges, &by_id, &impact);

        let mut ordered: Vec<Task> = ordered_ids
            .into_iter()
            .map(|id| by_id[&id].clone())
            .collect();
        if let Some(limit) = filter.limit {
            ordered.truncate(limit as usize);
        }

        let blocked: Vec<Task> = blocked_ids
            .into_iter()
            .map(|id| by_id[&id].clone())
            .collect();

        Ok(SelectionResult {
            ordered,
            blocked,
            warnings,
        })
    }
}

/// Tarjan SCC over `edges`; for every non-trivial SCC, drops the edge inside
/// it whose target key is lexicographically greatest and emits a warning.
fn break_cycles(edges: &mut Vec<(i64, i64)>, by_id: &HashMap<i64, &Task>, warnings: &mut Vec<String>) {
    loop {
        let sccs = tarjan_sccs(edges, by_id.keys().copied().collect());
        let Some(cycle) = sccs.into_iter().find(|scc| scc.len() > 1) else {
            break;
        };
        let cycle_set: HashSet<i64> = cycle.iter().copied().collect();
        let worst_edge = edges
            .iter()
            .filter(|(from, to)| cycle_set.contains(from) && cycle_set.contains(to))
            .max_by(|a, b| by_id[&a.1].key.cmp(&by_id[&b.1].key))
            .copied();

        let Some(worst_edge) = worst_edge else { break };
        edges.retain(|e| *e != worst_edge);

        let mut keys: Vec<&str> = cycle.iter().map(|id| by_id[id].key.as_str()).collect();
        keys.sort();
        warnings.push(format!(
            "dependency cycle detected among tasks {} (edge {} -> {} dropped)",
            keys.join(", "),
            by_id[&worst_edge.0].key,
            by_id[&worst_edge.1].key
        ));
    }
}

fn tarjan_sccs(edges: &[(i64, i64)], nodes: Vec<i64>) -> Vec<Vec<i64>> {
    struct State {
        index: HashMap<i64, usize>,
        lowlink: HashMap<i64, usize>,
        on_stack: HashSet<i64>,
        stack: Vec<i64>,
        counter: usize,
        sccs: Vec<Vec<i64>>,
    }

    let mut adjacency: HashMap<i64, Vec<i64>> = HashMap::new();
    for (from, to) in edges {
        adjacency.entry(*from).or_default().push(*to);
    }

    let mut state = State {
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        counter: 0,
        sccs: Vec::new(),
    };

    fn strongconnect(
        v: i64,
        adjacency: &HashMap<i64, Vec<i64>>,
        state: &mut State,
    ) {
        state.index.insert(v, state.counter);
        state.lowlink.insert(v, state.counter);
        state.counter += 1;
        state.stack.push(v);
        state.on_stack.insert(v);

        if let Some(neighbors) = adjacency.get(&v) {
            for &w in neighbors {
                if !state.index.contains_key(&w) {
                    strongconnect(w, adjacency, state);
                    let w_low = state.lowlink[&w];
                    let v_low = state.lowlink[&v];
                    state.lowlink.insert(v, v_low.min(w_low));
                } else if state.on_stack.contains(&w) {
                    let w_idx = state.index[&w];
                    let v_low = state.lowlink[&v];
                    state.lowlink.insert(v, v_low.min(w_idx));
                }
            }
        }

        if state.lowlink[&v] == state.index[&v] {
            let mut component = Vec::new();
            loop {
                let w = state.stack.pop().unwrap();
                state.on_stack.remove(&w);
                component.push(w);
                if w == v {
                    break;
                }
            }
            state.sccs.push(component);
        }
    }

    for node in nodes {
        if !state.index.contains_key(&node) {
            strongconnect(node, &adjacency, &mut state);
        }
    }
    state.sccs
}

fn compute_dependency_impact(
    candidate_ids: &HashSet<i64>,
    edges: &[(i64, i64)],
) -> HashMap<i64, DependencyImpact> {
    // dependents[v] = tasks that directly depend on v (edges u -> v)
    let mut dependents: HashMap<i64, Vec<i64>> = HashMap::new();
    for (from, to) in edges {
        dependents.entry(*to).or_default().push(*from);
    }

    let mut impact = HashMap::new();
    for &id in candidate_ids {
        let direct_list = dependents.get(&id).cloned().unwrap_or_default();
        let direct = direct_list.len();

        // Reverse BFS: every task transitively depending on `id`.
        let mut visited: HashSet<i64> = HashSet::new();
        let mut queue: VecDeque<i64> = direct_list.into_iter().collect();
        while let Some(next) = queue.pop_front() {
            if visited.insert(next) {
                if let Some(more) = dependents.get(&next) {
                    queue.extend(more.iter().copied());
                }
            }
        }
        impact.insert(id, DependencyImpact { direct, total: visited.len() });
    }
    impact
}

/// Kahn's algorithm over "depends-on" edges `u -> v`, selecting nodes with no
/// unresolved dependency first (i.e. processing prerequisites before
/// dependents), tie-broken per spec.md §4.3 step 5.
fn kahn_sort(
    runnable: &HashSet<i64>,
    edges: &[(i64, i64)],
    by_id: &HashMap<i64, &Task>,
    impact: &HashMap<i64, DependencyImpact>,
) -> Vec<i64> {
    let mut remaining_deps: HashMap<i64, HashSet<i64>> = HashMap::new();
    let mut dependents: HashMap<i64, Vec<i64>> = HashMap::new();
    for &id in runnable {
        remaining_deps.entry(id).or_default();
    }
    for (from, to) in edges {
        if runnable.contains(from) && runnable.contains(to) {
            remaining_deps.entry(*from).or_default().insert(*to);
            dependents.entry(*to).or_default().push(*from);
        }
    }

    let mut ready: Vec<i64> = remaining_deps
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(id, _)| *id)
        .collect();
    let mut ordered = Vec::with_capacity(runnable.len());
    let mut in_ready: HashSet<i64> = ready.iter().copied().collect();

    while !ready.is_empty() {
        ready.sort_by(|a, b| tie_break(*a, *b, by_id, impact));
        let next = ready.remove(0);
        in_ready.remove(&next);
        ordered.push(next);
        remaining_deps.remove(&next);

        if let Some(deps) = dependents.get(&next) {
            for &dependent in deps {
                if let Some(set) = remaining_deps.get_mut(&dependent) {
                    set.remove(&next);
                    if set.is_empty() && in_ready.insert(dependent) {
                        ready.push(dependent);
                    }
                }
            }
        }
    }

    ordered
}

fn tie_break(
    a: i64,
    b: i64,
    by_id: &HashMap<i64, &Task>,
    impact: &HashMap<i64, DependencyImpact>,
) -> std::cmp::Ordering {
    let ta = by_id[&a];
    let tb = by_id[&b];
    tb.priority
        .partial_cmp(&ta.priority)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| impact[&b].total.cmp(&impact[&a].total))
        .then_with(|| {
            ta.story_points
                .unwrap_or(i32::MAX)
                .cmp(&tb.story_points.unwrap_or(i32::MAX))
        })
        .then_with(|| ta.key.cmp(&tb.key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcoda_mocks::MockWorkspaceStore;
    use mcoda_core::{NewTask, TaskDependency};

    async fn make_task(store: &MockWorkspaceStore, key: &str, priority: f64) -> Task {
        store
            .create_task(NewTask {
                project_id: 1,
                epic_id: 1,
                story_id: 1,
                key: key.to_string(),
                name: key.to_string(),
                description: "d".to_string(),
                priority,
                story_points: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn orders_respect_dependency_edges() {
        let store = MockWorkspaceStore::new();
        let t1 = make_task(&store, "T01", 5.0).await;
        let t2 = make_task(&store, "T02", 5.0).await;
        // T02 depends on T01: T01 must come first.
        store
            .add_dependency(TaskDependency {
                from_task_id: t2.id,
                to_task_id: t1.id,
            })
            .await
            .unwrap();

        let selector = TaskSelector::new(&store);
        let result = selector.select(&TaskFilter::default()).await.unwrap();
        let positions: HashMap<&str, usize> = result
            .ordered
            .iter()
            .enumerate()
            .map(|(i, t)| (t.key.as_str(), i))
            .collect();
        assert!(positions["T01"] < positions["T02"]);
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn cycle_emits_warning_and_keeps_both_tasks() {
        let store = MockWorkspaceStore::new();
        let t1 = make_task(&store, "T01", 5.0).await;
        let t2 = make_task(&store, "T02", 5.0).await;
        store
            .add_dependency(TaskDependency {
                from_task_id: t1.id,
                to_task_id: t2.id,
            })
            .await
            .unwrap();
        store
            .add_dependency(TaskDependency {
                from_task_id: t2.id,
                to_task_id: t1.id,
            })
            .await
            .unwrap();

        let selector = TaskSelector::new(&store);
        let result = selector.select(&TaskFilter::default()).await.unwrap();
        assert_eq!(result.ordered.len(), 2);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("T01"));
        assert!(result.warnings[0].contains("T02"));
    }

    #[tokio::test]
    async fn blocked_task_excluded_from_ordering() {
        let store = MockWorkspaceStore::new();
        let prereq = make_task(&store, "T01", 5.0).await; // stays not_started
        let dependent = make_task(&store, "T02", 5.0).await;
        store
            .add_dependency(TaskDependency {
                from_task_id: dependent.id,
                to_task_id: prereq.id,
            })
            .await
            .unwrap();

        let selector = TaskSelector::new(&store);
        let filter = TaskFilter {
            task_keys: Some(vec!["T02".to_string()]),
            ..Default::default()
        };
        let result = selector.select(&filter).await.unwrap();
        assert_eq!(result.blocked.len(), 1);
        assert_eq!(result.blocked[0].key, "T02");
        assert!(result.ordered.is_empty());
    }
}
