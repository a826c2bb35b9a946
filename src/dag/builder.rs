//! Dependency graph construction over tasks.
//!
//! An edge `a -> b` means task `b` is blocked by task `a`, so `a` must
//! complete first. Blockers that are not part of the task set are ignored:
//! they are either finished already or tracked outside this workflow.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use anyhow::anyhow;

use crate::errors::{CycleError, WorkflowError};

/// Index into the task list.
pub type TaskIndex = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct TaskNode {
    pub id: String,
    pub title: String,
    pub blocked_by: Vec<String>,
}

impl TaskNode {
    pub fn new(id: &str, title: &str, blocked_by: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            blocked_by: blocked_by.iter().map(|b| b.to_string()).collect(),
        }
    }
}

/// A validated, acyclic graph of tasks.
#[derive(Debug)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    index_map: HashMap<String, TaskIndex>,
    /// index -> tasks blocked by it
    forward_edges: Vec<Vec<TaskIndex>>,
    /// index -> tasks it is blocked by
    reverse_edges: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: TaskIndex) -> Option<&TaskNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn get_index(&self, id: &str) -> Option<TaskIndex> {
        self.index_map.get(id).copied()
    }

    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks with no in-set blockers.
    pub fn root_nodes(&self) -> Vec<TaskIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Kahn's algorithm. Among ready tasks the earliest in input order wins,
    /// so the result is deterministic.
    pub fn topological_order(&self) -> Vec<TaskIndex> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(|d| d.len()).collect();
        let mut ready: BTreeSet<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }

    /// Strongly connected components, via an iterative Tarjan pass.
    fn strongly_connected(&self) -> Vec<Vec<TaskIndex>> {
        const UNVISITED: usize = usize::MAX;
        let n = self.len();
        let mut index = vec![UNVISITED; n];
        let mut lowlink = vec![0; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<TaskIndex> = Vec::new();
        let mut next_index = 0;
        let mut components = Vec::new();

        for start in 0..n {
            if index[start] != UNVISITED {
                continue;
            }
            index[start] = next_index;
            lowlink[start] = next_index;
            next_index += 1;
            stack.push(start);
            on_stack[start] = true;
            // (node, position of the next outgoing edge to explore)
            let mut call: Vec<(TaskIndex, usize)> = vec![(start, 0)];

            while let Some(frame) = call.last_mut() {
                let node = frame.0;
                let edges = &self.forward_edges[node];
                if frame.1 < edges.len() {
                    let next = edges[frame.1];
                    frame.1 += 1;
                    if index[next] == UNVISITED {
                        index[next] = next_index;
                        lowlink[next] = next_index;
                        next_index += 1;
                        stack.push(next);
                        on_stack[next] = true;
                        call.push((next, 0));
                    } else if on_stack[next] {
                        lowlink[node] = lowlink[node].min(index[next]);
                    }
                    continue;
                }

                call.pop();
                if let Some(&(parent, _)) = call.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[node]);
                }
                if lowlink[node] == index[node] {
                    let mut component = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack[member] = false;
                        component.push(member);
                        if member == node {
                            break;
                        }
                    }
                    components.push(component);
                }
            }
        }
        components
    }

    /// One closed path through a cyclic component, starting at its
    /// earliest member and following edge direction.
    fn cycle_path(&self, component: &[TaskIndex]) -> Vec<TaskIndex> {
        let members: HashSet<TaskIndex> = component.iter().copied().collect();
        let Some(&start) = component.iter().min() else {
            return Vec::new();
        };

        let mut parent: HashMap<TaskIndex, TaskIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut seen = HashSet::from([start]);
        while let Some(node) = queue.pop_front() {
            for &next in self.dependents(node) {
                if !members.contains(&next) {
                    continue;
                }
                if next == start {
                    let mut path = vec![node];
                    let mut cursor = node;
                    while let Some(&prev) = parent.get(&cursor) {
                        path.push(prev);
                        cursor = prev;
                    }
                    path.reverse();
                    return path;
                }
                if seen.insert(next) {
                    parent.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        // Unreachable for a real component; keep its members rather than nothing.
        let mut sorted = component.to_vec();
        sorted.sort_unstable();
        sorted
    }

    fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut cycles: Vec<Vec<TaskIndex>> = self
            .strongly_connected()
            .into_iter()
            .filter(|c| c.len() > 1 || self.dependents(c[0]).contains(&c[0]))
            .map(|c| self.cycle_path(&c))
            .collect();
        cycles.sort();
        cycles
            .into_iter()
            .map(|path| path.into_iter().map(|i| self.nodes[i].id.clone()).collect())
            .collect()
    }
}

/// Builder for task graphs.
pub struct DagBuilder {
    nodes: Vec<TaskNode>,
}

impl DagBuilder {
    pub fn new(nodes: Vec<TaskNode>) -> Self {
        Self { nodes }
    }

    /// Build and validate the graph: ids must be unique and there must be
    /// no dependency cycles.
    pub fn build(self) -> Result<TaskGraph, WorkflowError> {
        let mut index_map = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if index_map.insert(node.id.clone(), i).is_some() {
                return Err(anyhow!("Duplicate task id: {}", node.id).into());
            }
        }

        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.nodes.len()];
        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.nodes.len()];
        for (to_idx, node) in self.nodes.iter().enumerate() {
            for blocker in &node.blocked_by {
                let Some(&from_idx) = index_map.get(blocker) else {
                    tracing::debug!(task = %node.id, blocker = %blocker, "Ignoring blocker outside the task set");
                    continue;
                };
                if reverse_edges[to_idx].contains(&from_idx) {
                    continue;
                }
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = TaskGraph {
            nodes: self.nodes,
            index_map,
            forward_edges,
            reverse_edges,
        };

        let cycles = graph.find_cycles();
        if !cycles.is_empty() {
            return Err(CycleError { cycles }.into());
        }
        Ok(graph)
    }
}
