//! Turning a workflow source into task nodes, and a graph into steps.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use super::builder::{TaskGraph, TaskNode};
use crate::errors::WorkflowError;
use crate::models::{StepStatus, WorkflowSource, WorkflowStep};
use crate::tasks::{TaskInfo, TaskStore};

/// Collect the tasks a source refers to.
///
/// - explicit list: exactly those tasks, duplicates collapsed
/// - root task: the root plus everything transitively blocked by it
/// - goal: nothing up front
pub async fn resolve_source(
    source: &WorkflowSource,
    tasks: &dyn TaskStore,
) -> Result<Vec<TaskNode>, WorkflowError> {
    match source {
        WorkflowSource::Tasks { task_ids } => {
            let mut seen = HashSet::new();
            let mut nodes = Vec::new();
            for id in task_ids {
                if !seen.insert(id.as_str()) {
                    continue;
                }
                nodes.push(fetch(tasks, id).await?);
            }
            Ok(nodes)
        }
        WorkflowSource::RootTask { task_id } => {
            let mut seen = HashSet::from([task_id.clone()]);
            let mut queue = VecDeque::from([task_id.clone()]);
            let mut nodes = Vec::new();
            while let Some(id) = queue.pop_front() {
                nodes.push(fetch(tasks, &id).await?);
                for dependent in tasks.dependents(&id).await? {
                    if seen.insert(dependent.clone()) {
                        queue.push_back(dependent);
                    }
                }
            }
            Ok(nodes)
        }
        WorkflowSource::Goal { .. } => Ok(Vec::new()),
    }
}

async fn fetch(tasks: &dyn TaskStore, id: &str) -> Result<TaskNode, WorkflowError> {
    let task = tasks
        .get_task(id)
        .await?
        .ok_or_else(|| WorkflowError::TaskNotFound { id: id.to_string() })?;
    Ok(task_node(task))
}

pub fn task_node(task: TaskInfo) -> TaskNode {
    TaskNode {
        id: task.id,
        title: task.title,
        blocked_by: task.blocked_by,
    }
}

/// One pending step per task, in dependency order.
pub fn plan_steps(workflow_id: &str, graph: &TaskGraph) -> Vec<WorkflowStep> {
    let step_ids: HashMap<usize, String> = (0..graph.len())
        .map(|i| (i, Uuid::new_v4().to_string()))
        .collect();

    graph
        .topological_order()
        .into_iter()
        .enumerate()
        .filter_map(|(position, index)| {
            let node = graph.node(index)?;
            Some(WorkflowStep {
                id: step_ids[&index].clone(),
                workflow_id: workflow_id.to_string(),
                position: position as i64,
                task_id: node.id.clone(),
                title: node.title.clone(),
                status: StepStatus::Pending,
                execution_id: None,
                depends_on: graph
                    .dependencies(index)
                    .iter()
                    .map(|dep| step_ids[dep].clone())
                    .collect(),
                error: None,
                started_at: None,
                completed_at: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DagBuilder;
    use crate::tasks::MemoryTaskStore;

    fn store() -> MemoryTaskStore {
        MemoryTaskStore::new([
            TaskInfo::new("root", "Root", &[]),
            TaskInfo::new("mid", "Mid", &["root"]),
            TaskInfo::new("leaf", "Leaf", &["mid", "root"]),
            TaskInfo::new("unrelated", "Unrelated", &[]),
        ])
    }

    #[tokio::test]
    async fn test_root_task_collects_transitive_dependents() {
        let tasks = store();
        let nodes = resolve_source(
            &WorkflowSource::RootTask {
                task_id: "root".into(),
            },
            &tasks,
        )
        .await
        .unwrap();
        let ids: Vec<_> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["root", "mid", "leaf"]);
    }

    #[tokio::test]
    async fn test_explicit_list_dedupes_and_reports_missing() {
        let tasks = store();
        let nodes = resolve_source(
            &WorkflowSource::Tasks {
                task_ids: vec!["mid".into(), "root".into(), "mid".into()],
            },
            &tasks,
        )
        .await
        .unwrap();
        assert_eq!(nodes.len(), 2);

        let err = resolve_source(
            &WorkflowSource::Tasks {
                task_ids: vec!["ghost".into()],
            },
            &tasks,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WorkflowError::TaskNotFound { id } if id == "ghost"));
    }

    #[tokio::test]
    async fn test_goal_starts_empty() {
        let tasks = store();
        let nodes = resolve_source(
            &WorkflowSource::Goal {
                goal: "make it fast".into(),
            },
            &tasks,
        )
        .await
        .unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_planned_steps_reference_earlier_steps() {
        let tasks = store();
        let nodes = resolve_source(
            &WorkflowSource::Tasks {
                task_ids: vec!["leaf".into(), "mid".into(), "root".into()],
            },
            &tasks,
        )
        .await
        .unwrap();
        let graph = DagBuilder::new(nodes).build().unwrap();
        let steps = plan_steps("wf", &graph);

        let order: Vec<_> = steps.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(order, vec!["root", "mid", "leaf"]);
        for (i, step) in steps.iter().enumerate() {
            assert_eq!(step.position, i as i64);
            for dep in &step.depends_on {
                let dep_pos = steps.iter().position(|s| &s.id == dep).unwrap();
                assert!(dep_pos < i, "dependency must come first");
            }
        }
        assert_eq!(steps[2].depends_on.len(), 2);
    }
}
