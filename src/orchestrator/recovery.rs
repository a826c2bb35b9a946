use serde::Serialize;

use super::WorkflowEngine;
use crate::db::ExecutionPatch;
use crate::errors::WorkflowError;
use crate::models::{ExecutionStatus, StepStatus, WakeupReason, WorkflowEvent, WorkflowStatus};

const INTERRUPTED: &str = "execution interrupted by restart";

#[derive(Debug, Default, Serialize)]
pub struct RecoveryReport {
    pub interrupted_executions: Vec<String>,
    pub failed_steps: Vec<String>,
    pub woken_workflows: Vec<String>,
}

impl WorkflowEngine {
    /// Reconcile persisted state after a restart.
    ///
    /// No agent survives a restart, so every execution still recorded as
    /// running or preparing is failed first, along with the step it drove.
    /// Then each running workflow without an active controlling agent is
    /// woken exactly once.
    pub async fn recover(&self) -> Result<RecoveryReport, WorkflowError> {
        let mut report = RecoveryReport::default();

        let stale = self
            .db
            .call(|db| db.executions_with_status(&[ExecutionStatus::Running, ExecutionStatus::Preparing]))
            .await?;
        for execution in stale {
            let _guard = match execution.workflow_id.as_deref() {
                Some(wf) => Some(self.locks.lock(wf).await),
                None => None,
            };
            self.patch_execution(
                &execution.id,
                ExecutionPatch::status(ExecutionStatus::Failed).with_error(INTERRUPTED),
            )
            .await?;
            report.interrupted_executions.push(execution.id.clone());

            let Some(workflow_id) = execution.workflow_id.as_deref() else {
                continue;
            };
            let workflow = self.get_workflow(workflow_id).await?;
            let Some(step) = workflow.step_by_execution(&execution.id) else {
                continue;
            };
            if step.status != StepStatus::Running {
                continue;
            }
            let sid = step.id.clone();
            self.db
                .call(move |db| db.update_step_status(&sid, StepStatus::Failed, Some(INTERRUPTED)))
                .await?;
            // The wakeup below picks this up; recording must not wake twice.
            self.wakeups
                .record_event(
                    workflow_id,
                    WorkflowEvent::StepFailed {
                        step_id: step.id.clone(),
                        execution_id: Some(execution.id.clone()),
                        task_id: step.task_id.clone(),
                        error: Some(INTERRUPTED.to_string()),
                    },
                )
                .await?;
            report.failed_steps.push(step.id.clone());
        }

        let running = self
            .db
            .call(|db| db.list_workflows(Some(WorkflowStatus::Running)))
            .await?;
        for workflow in running {
            let _guard = self.locks.lock(&workflow.id).await;
            if self.orchestrator_active(&workflow).await? {
                continue;
            }
            self.wakeups
                .record_event(
                    &workflow.id,
                    WorkflowEvent::OrchestratorWakeup {
                        reason: WakeupReason::Recovery,
                    },
                )
                .await?;
            self.wakeups
                .request_wakeup(&workflow.id, WakeupReason::Recovery);
            report.woken_workflows.push(workflow.id.clone());
        }

        tracing::info!(
            interrupted = report.interrupted_executions.len(),
            failed_steps = report.failed_steps.len(),
            woken = report.woken_workflows.len(),
            "Recovery complete"
        );
        Ok(report)
    }
}
