//! The controlling agent's control surface.
//!
//! Actions arrive as JSON on a channel bound to one workflow, are decoded
//! once into [`ControlAction`], and come back as an [`ActionResult`]. Any
//! action naming an execution or task of another workflow is rejected.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WorkflowEngine;
use crate::errors::WorkflowError;
use crate::models::{
    DiffStats, Execution, MergeStrategy, StepStatus, Workflow, WorkflowEvent, WorkflowStatus, WorkflowStep,
};
use crate::notify::NotifyLevel;
use crate::promote::PromoteRequest;
use crate::tracker::GitTracker;

use WorkflowStatus::{Paused, Running};

/// Control channel of one workflow's controlling agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlChannel {
    pub workflow_id: String,
}

impl ControlChannel {
    pub fn for_workflow(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    GetStatus,
    ExecuteTask {
        task_id: String,
        #[serde(default)]
        instructions: Option<String>,
    },
    AddTask {
        task_id: String,
        #[serde(default)]
        depends_on: Vec<String>,
    },
    CancelExecution {
        execution_id: String,
    },
    InspectExecution {
        execution_id: String,
    },
    GetExecutionDiff {
        execution_id: String,
    },
    SkipStep {
        task_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    CompleteWorkflow {
        success: bool,
        #[serde(default)]
        summary: Option<String>,
    },
    Escalate {
        message: String,
    },
    Notify {
        message: String,
        #[serde(default)]
        level: NotifyLevel,
    },
    RequestMerge {
        task_id: String,
        #[serde(default)]
        strategy: Option<MergeStrategy>,
        #[serde(default)]
        force: bool,
    },
    AwaitEvents {
        event_types: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

impl FromStr for ControlAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).context("Invalid control action")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub workflow: Workflow,
    /// Task ids of steps that can be executed now.
    pub ready_steps: Vec<String>,
    pub pending_events: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionResult {
    Status(WorkflowSnapshot),
    ExecutionStarted {
        execution_id: String,
        step_id: String,
    },
    TaskAdded {
        step_id: String,
        status: StepStatus,
    },
    ExecutionCancelled {
        execution_id: String,
    },
    Execution(Execution),
    Diff {
        execution_id: String,
        stats: DiffStats,
        diff: String,
    },
    StepSkipped {
        step_id: String,
    },
    WorkflowCompleted {
        status: WorkflowStatus,
    },
    Escalated {
        escalation_id: String,
    },
    Notified,
    Merged {
        merge_commit: String,
        target_branch: String,
        stats: DiffStats,
    },
    Waiting {
        event_types: Vec<String>,
        deadline: Option<DateTime<Utc>>,
    },
}

impl WorkflowEngine {
    pub async fn apply_action(
        &self,
        channel: &ControlChannel,
        action: ControlAction,
    ) -> Result<ActionResult, WorkflowError> {
        let workflow_id = channel.workflow_id.as_str();
        let _guard = self.locks.lock(workflow_id).await;
        let workflow = self.get_workflow(workflow_id).await?;
        tracing::debug!(workflow_id = %workflow_id, ?action, "Control action");

        match action {
            ControlAction::GetStatus => {
                let pending_events = self.wakeups.unprocessed_events(workflow_id).await?.len();
                let ready_steps = workflow
                    .steps
                    .iter()
                    .filter(|s| s.status == StepStatus::Ready)
                    .map(|s| s.task_id.clone())
                    .collect();
                Ok(ActionResult::Status(WorkflowSnapshot {
                    workflow,
                    ready_steps,
                    pending_events,
                }))
            }
            ControlAction::ExecuteTask {
                task_id,
                instructions,
            } => {
                let step_id = step_for_task(&workflow, &task_id)?.id.clone();
                let execution = self
                    .execute_step_locked(&workflow, &step_id, instructions.as_deref())
                    .await?;
                Ok(ActionResult::ExecutionStarted {
                    execution_id: execution.id,
                    step_id,
                })
            }
            ControlAction::AddTask {
                task_id,
                depends_on,
            } => self.add_task_locked(&workflow, &task_id, &depends_on).await,
            ControlAction::CancelExecution { execution_id } => {
                self.owned_execution(&workflow, &execution_id).await?;
                let execution = self.cancel_execution_locked(&workflow, &execution_id).await?;
                Ok(ActionResult::ExecutionCancelled {
                    execution_id: execution.id,
                })
            }
            ControlAction::InspectExecution { execution_id } => {
                let execution = self.owned_execution(&workflow, &execution_id).await?;
                Ok(ActionResult::Execution(execution))
            }
            ControlAction::GetExecutionDiff { execution_id } => {
                let execution = self.owned_execution(&workflow, &execution_id).await?;
                let (stats, diff) = self.execution_diff(&execution).await?;
                Ok(ActionResult::Diff {
                    execution_id,
                    stats,
                    diff,
                })
            }
            ControlAction::SkipStep { task_id, reason } => {
                Self::require_status(&workflow, "skip steps in", &[Running, Paused])?;
                let step = step_for_task(&workflow, &task_id)?;
                if !step.status.is_startable() {
                    return Err(WorkflowError::StepNotRunnable {
                        step_id: step.id.clone(),
                        status: step.status,
                    });
                }
                let sid = step.id.clone();
                self.db
                    .call(move |db| db.update_step_status(&sid, StepStatus::Skipped, reason.as_deref()))
                    .await?;
                self.refresh_readiness(workflow_id).await?;
                tracing::info!(workflow_id = %workflow_id, step_id = %step.id, "Step skipped");
                Ok(ActionResult::StepSkipped {
                    step_id: step.id.clone(),
                })
            }
            ControlAction::CompleteWorkflow { success, summary } => {
                let status = self
                    .complete_locked(&workflow, success, summary.as_deref())
                    .await?;
                Ok(ActionResult::WorkflowCompleted { status })
            }
            ControlAction::Escalate { message } => {
                Self::require_status(&workflow, "escalate in", &[Running, Paused])?;
                let escalation_id = Uuid::new_v4().to_string();
                self.wakeups
                    .record_event(
                        workflow_id,
                        WorkflowEvent::EscalationRaised {
                            escalation_id: escalation_id.clone(),
                            message: message.clone(),
                        },
                    )
                    .await?;
                self.notify(
                    workflow_id,
                    NotifyLevel::Warning,
                    format!("Workflow \"{}\" needs attention ({}): {}", workflow.title, escalation_id, message),
                )
                .await;
                Ok(ActionResult::Escalated { escalation_id })
            }
            ControlAction::Notify { message, level } => {
                self.notify(workflow_id, level, message).await;
                Ok(ActionResult::Notified)
            }
            ControlAction::RequestMerge {
                task_id,
                strategy,
                force,
            } => {
                step_for_task(&workflow, &task_id).map_err(|_| WorkflowError::ForeignTarget {
                    workflow_id: workflow_id.to_string(),
                    kind: "task",
                    id: task_id.clone(),
                })?;
                let promotion = self
                    .promote
                    .promote(
                        &task_id,
                        PromoteRequest {
                            strategy: strategy.unwrap_or_default(),
                            target_branch: workflow.integration_branch().map(String::from),
                            force,
                            message: None,
                        },
                    )
                    .await?;
                Ok(ActionResult::Merged {
                    merge_commit: promotion.merge_commit,
                    target_branch: promotion.target_branch,
                    stats: promotion.stats,
                })
            }
            ControlAction::AwaitEvents {
                event_types,
                timeout_secs,
            } => {
                Self::require_status(&workflow, "wait in", &[Running, Paused])?;
                self.wakeups.register_wait(
                    workflow_id,
                    event_types,
                    timeout_secs.map(Duration::from_secs),
                );
                let wait = self.wakeups.current_wait(workflow_id).unwrap_or_default();
                Ok(ActionResult::Waiting {
                    event_types: wait.event_types,
                    deadline: wait.deadline,
                })
            }
        }
    }

    /// Append a step for `task_id` to a workflow. Dependencies name tasks
    /// already in the workflow, so the graph stays acyclic.
    async fn add_task_locked(
        &self,
        workflow: &Workflow,
        task_id: &str,
        depends_on: &[String],
    ) -> Result<ActionResult, WorkflowError> {
        Self::require_status(workflow, "add tasks to", &[Running, Paused])?;
        if let Some(existing) = workflow.step_by_task(task_id) {
            return Ok(ActionResult::TaskAdded {
                step_id: existing.id.clone(),
                status: existing.status,
            });
        }
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| WorkflowError::TaskNotFound {
                id: task_id.to_string(),
            })?;
        let mut dep_steps = Vec::new();
        for dep in depends_on {
            let step = workflow
                .step_by_task(dep)
                .ok_or_else(|| WorkflowError::TaskNotFound { id: dep.clone() })?;
            dep_steps.push(step.id.clone());
        }

        let mut step = WorkflowStep {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            position: 0,
            task_id: task.id,
            title: task.title,
            status: StepStatus::Pending,
            execution_id: None,
            depends_on: dep_steps,
            error: None,
            started_at: None,
            completed_at: None,
        };
        if workflow.unmet_dependencies(&step).is_empty() {
            step.status = StepStatus::Ready;
        }
        let record = step.clone();
        let wf = workflow.id.clone();
        self.db
            .call(move |db| {
                let mut record = record;
                record.position = db.next_step_position(&wf)?;
                db.add_step(&record)
            })
            .await?;
        tracing::info!(workflow_id = %workflow.id, step_id = %step.id, task_id = %task_id, "Task added to workflow");
        Ok(ActionResult::TaskAdded {
            step_id: step.id,
            status: step.status,
        })
    }

    async fn owned_execution(&self, workflow: &Workflow, execution_id: &str) -> Result<Execution, WorkflowError> {
        let execution = self.get_execution(execution_id).await?;
        if execution.workflow_id.as_deref() != Some(workflow.id.as_str()) {
            return Err(WorkflowError::ForeignTarget {
                workflow_id: workflow.id.clone(),
                kind: "execution",
                id: execution_id.to_string(),
            });
        }
        Ok(execution)
    }

    async fn execution_diff(&self, execution: &Execution) -> Result<(DiffStats, String), WorkflowError> {
        let head = self.worktrees.current_head(execution).await;
        let (Some(before), Some(head)) = (execution.before_commit.clone(), head) else {
            return Ok((DiffStats::default(), String::new()));
        };
        let repo = PathBuf::from(&execution.repo_path);
        let diff = tokio::task::spawn_blocking(move || -> anyhow::Result<(DiffStats, String)> {
            let tracker = GitTracker::new(&repo)?;
            Ok((tracker.diff_stats(&before, &head)?, tracker.diff_text(&before, &head)?))
        })
        .await
        .context("Diff task panicked")??;
        Ok(diff)
    }
}

fn step_for_task<'a>(workflow: &'a Workflow, task_id: &str) -> Result<&'a WorkflowStep, WorkflowError> {
    workflow
        .step_by_task(task_id)
        .ok_or_else(|| WorkflowError::StepNotFound {
            workflow_id: workflow.id.clone(),
            step_id: task_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actions_decode_from_tagged_json() {
        let action: ControlAction = r#"{"action":"execute_task","task_id":"t1"}"#.parse().unwrap();
        assert_eq!(
            action,
            ControlAction::ExecuteTask {
                task_id: "t1".into(),
                instructions: None
            }
        );

        let action: ControlAction = r#"{"action":"notify","message":"hi","level":"warning"}"#
            .parse()
            .unwrap();
        assert_eq!(
            action,
            ControlAction::Notify {
                message: "hi".into(),
                level: NotifyLevel::Warning
            }
        );

        let action: ControlAction = r#"{"action":"get_status"}"#.parse().unwrap();
        assert_eq!(action, ControlAction::GetStatus);
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let err = r#"{"action":"rm_rf"}"#.parse::<ControlAction>().unwrap_err();
        assert!(err.to_string().contains("Invalid control action"));
    }
}
