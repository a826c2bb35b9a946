use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use uuid::Uuid;

use super::WorkflowEngine;
use crate::dag::{DagBuilder, plan_steps, resolve_source};
use crate::db::ExecutionPatch;
use crate::errors::WorkflowError;
use crate::models::{
    Execution, ExecutionStatus, StepStatus, Stream, WakeupReason, Workflow, WorkflowConfig, WorkflowEvent,
    WorkflowSource, WorkflowStatus,
};
use crate::notify::NotifyLevel;
use crate::worktree::{git, naming};

use WorkflowStatus::{Paused, Pending, Running};

#[derive(Debug, Default, Serialize)]
pub struct CancelReport {
    pub cancelled_executions: Vec<String>,
    pub failed_steps: Vec<String>,
    /// Executions whose agent could not be stopped or whose worktree could
    /// not be removed. Details are in the supervisor's failure log.
    pub cleanup_failures: Vec<String>,
}

impl WorkflowEngine {
    /// Resolve the source into a checked task graph and persist the
    /// workflow with its steps, all pending. Nothing is written on error.
    pub async fn create_workflow(
        &self,
        title: &str,
        source: WorkflowSource,
        config: WorkflowConfig,
    ) -> Result<Workflow, WorkflowError> {
        let nodes = resolve_source(&source, self.tasks.as_ref()).await?;
        let graph = DagBuilder::new(nodes).build()?;

        let id = Uuid::new_v4().to_string();
        let steps = plan_steps(&id, &graph);
        let base_branch = match config
            .base_branch
            .clone()
            .or_else(|| self.settings.default_base_branch.clone())
        {
            Some(branch) => Some(branch),
            None => git::current_branch(self.worktrees.repo_path()).await?,
        };

        let now = Utc::now();
        let workflow = Workflow {
            id: id.clone(),
            title: title.to_string(),
            source,
            status: Pending,
            steps,
            worktree_path: None,
            branch_name: None,
            base_branch,
            current_step_index: 0,
            orchestrator_execution_id: None,
            orchestrator_session_id: None,
            root_stream_id: None,
            config,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        let record = workflow.clone();
        self.db.call(move |db| db.insert_workflow(&record)).await?;
        tracing::info!(
            workflow_id = %id,
            steps = workflow.steps.len(),
            source = %workflow.source.describe(),
            "Workflow created"
        );
        Ok(workflow)
    }

    /// Move a pending workflow to running and start its controlling agent.
    pub async fn start_workflow(&self, workflow_id: &str) -> Result<Workflow, WorkflowError> {
        let _guard = self.locks.lock(workflow_id).await;
        let workflow = self.get_workflow(workflow_id).await?;
        Self::require_status(&workflow, "start", &[Pending])?;
        Self::check_transition(&workflow, Running)?;

        let branch = if workflow.config.workflow_branch {
            Some(self.create_workflow_branch(&workflow).await?)
        } else {
            None
        };

        let stream = Stream {
            id: Uuid::new_v4().to_string(),
            parent_stream: None,
            name: format!("workflow/{}", naming::short_id(&workflow.id)),
            created_at: Utc::now(),
        };
        let (wf, root) = (workflow.id.clone(), stream.clone());
        self.db
            .call(move |db| {
                db.insert_stream(&root, Some(&wf))?;
                db.set_workflow_branch(&wf, branch.as_deref(), None, &root.id)?;
                db.update_workflow_status(&wf, Running)
            })
            .await?;
        tracing::info!(workflow_id = %workflow_id, root_stream = %stream.id, "Workflow started");

        self.refresh_readiness(workflow_id).await?;
        let workflow = self.get_workflow(workflow_id).await?;
        self.launch_orchestrator(&workflow, WakeupReason::Start, Vec::new())
            .await?;
        self.get_workflow(workflow_id).await
    }

    async fn create_workflow_branch(&self, workflow: &Workflow) -> Result<String, WorkflowError> {
        let repo = self.worktrees.repo_path();
        let prefix = self.worktrees.settings().branch_prefix.trim_end_matches('/');
        let branch = format!("{}/workflow-{}", prefix, naming::short_id(&workflow.id));
        let base = match workflow.base_branch.as_deref() {
            Some(base) => base.to_string(),
            None => "HEAD".to_string(),
        };
        if !git::branch_exists(repo, &branch).await? {
            git::git(repo, &["branch", &branch, &base]).await?;
        }
        tracing::info!(workflow_id = %workflow.id, branch = %branch, base = %base, "Created workflow branch");
        Ok(branch)
    }

    /// Pause a running workflow. The controlling agent keeps running, but
    /// wakeups wait until the workflow resumes.
    pub async fn pause_workflow(&self, workflow_id: &str, reason: Option<String>) -> Result<Workflow, WorkflowError> {
        let _guard = self.locks.lock(workflow_id).await;
        let workflow = self.get_workflow(workflow_id).await?;
        Self::require_status(&workflow, "pause", &[Running])?;
        self.set_workflow_status(&workflow, Paused).await?;
        self.wakeups
            .record_event(workflow_id, WorkflowEvent::WorkflowPaused { reason })
            .await?;
        self.get_workflow(workflow_id).await
    }

    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<Workflow, WorkflowError> {
        let _guard = self.locks.lock(workflow_id).await;
        let workflow = self.get_workflow(workflow_id).await?;
        Self::require_status(&workflow, "resume", &[Paused])?;
        self.set_workflow_status(&workflow, Running).await?;
        self.wakeups
            .record_event(workflow_id, WorkflowEvent::WorkflowResumed)
            .await?;
        self.wakeups.request_wakeup(workflow_id, WakeupReason::Resume);
        self.get_workflow(workflow_id).await
    }

    /// Stop everything a workflow has in flight and mark it cancelled.
    ///
    /// Each execution is cancelled independently; a failure to stop one
    /// agent or remove one worktree is recorded and does not stop the rest.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<CancelReport, WorkflowError> {
        let guard = self.locks.lock(workflow_id).await;
        let workflow = self.get_workflow(workflow_id).await?;
        Self::require_status(&workflow, "cancel", &[Pending, Running, Paused])?;

        let report = self
            .stop_everything_locked(&workflow, "workflow cancelled", None)
            .await?;
        self.set_workflow_status(&workflow, WorkflowStatus::Cancelled)
            .await?;
        self.notify(
            workflow_id,
            NotifyLevel::Warning,
            format!("Workflow \"{}\" cancelled", workflow.title),
        )
        .await;
        drop(guard);
        self.locks.release(workflow_id);
        Ok(report)
    }

    /// Finish a running workflow on the controlling agent's say-so.
    pub(super) async fn complete_locked(
        &self,
        workflow: &Workflow,
        success: bool,
        summary: Option<&str>,
    ) -> Result<WorkflowStatus, WorkflowError> {
        Self::require_status(workflow, "complete", &[Running])?;
        let reason = if success {
            "workflow completed"
        } else {
            "workflow failed"
        };
        // The controlling agent asked for this and exits on its own.
        self.stop_everything_locked(workflow, reason, workflow.orchestrator_execution_id.as_deref())
            .await?;
        let status = if success {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        self.set_workflow_status(workflow, status).await?;
        let level = if success {
            NotifyLevel::Info
        } else {
            NotifyLevel::Error
        };
        let message = match summary {
            Some(summary) => format!("Workflow \"{}\" {}: {}", workflow.title, status, summary),
            None => format!("Workflow \"{}\" {}", workflow.title, status),
        };
        self.notify(&workflow.id, level, message).await;
        Ok(status)
    }

    /// Cancel active executions except `spare`, fail running steps and
    /// drop the workflow's timers and waits.
    async fn stop_everything_locked(
        &self,
        workflow: &Workflow,
        reason: &str,
        spare: Option<&str>,
    ) -> Result<CancelReport, WorkflowError> {
        let wf = workflow.id.clone();
        let executions = self.db.call(move |db| db.executions_for_workflow(&wf)).await?;
        let active: Vec<Execution> = executions
            .into_iter()
            .filter(|e| e.status.is_active() && Some(e.id.as_str()) != spare)
            .collect();

        let results = join_all(active.iter().map(|exec| self.stop_execution(exec, reason))).await;
        let mut report = CancelReport::default();
        for (exec, clean) in active.iter().zip(results) {
            report.cancelled_executions.push(exec.id.clone());
            if !clean {
                report.cleanup_failures.push(exec.id.clone());
            }
        }

        let ids: Vec<String> = active.iter().map(|e| e.id.clone()).collect();
        self.wakeups.cancel_all_for_workflow(&workflow.id, &ids);

        for step in workflow.steps.iter().filter(|s| s.status == StepStatus::Running) {
            let (step_id, error) = (step.id.clone(), reason.to_string());
            self.db
                .call(move |db| db.update_step_status(&step_id, StepStatus::Failed, Some(&error)))
                .await?;
            report.failed_steps.push(step.id.clone());
        }
        tracing::info!(
            workflow_id = %workflow.id,
            cancelled = report.cancelled_executions.len(),
            failed_steps = report.failed_steps.len(),
            "Stopped workflow executions"
        );
        Ok(report)
    }

    /// Stop one execution: kill the agent, mark it cancelled, remove its
    /// worktree. Returns false when any best-effort part failed.
    pub(super) async fn stop_execution(&self, execution: &Execution, reason: &str) -> bool {
        let mut clean = true;
        let label = format!("cancel agent {}", execution.id);
        if self
            .supervisor
            .best_effort(&label, self.runner.cancel(&execution.id))
            .await
            .is_none()
        {
            clean = false;
        }
        self.wakeups.cancel_execution_timeout(&execution.id);

        let patch = ExecutionPatch::status(ExecutionStatus::Cancelled).with_error(reason);
        let label = format!("mark {} cancelled", execution.id);
        if self
            .supervisor
            .best_effort(&label, self.patch_execution(&execution.id, patch))
            .await
            .is_none()
        {
            clean = false;
        }

        if execution.worktree_path.is_some() {
            let label = format!("cleanup worktree of {}", execution.id);
            if self
                .supervisor
                .best_effort(&label, self.worktrees.cleanup_for(execution))
                .await
                .is_none()
            {
                clean = false;
            }
        }
        clean
    }

    /// Ask the controlling agent to retry a step. Only records intent.
    pub async fn retry_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        feedback: Option<String>,
    ) -> Result<(), WorkflowError> {
        self.record_intent(
            workflow_id,
            step_id,
            WorkflowEvent::RetryRequested {
                step_id: step_id.to_string(),
                feedback,
            },
        )
        .await
    }

    /// Ask the controlling agent to skip a step. Only records intent.
    pub async fn skip_step(&self, workflow_id: &str, step_id: &str, reason: Option<String>) -> Result<(), WorkflowError> {
        self.record_intent(
            workflow_id,
            step_id,
            WorkflowEvent::SkipRequested {
                step_id: step_id.to_string(),
                reason,
            },
        )
        .await
    }

    async fn record_intent(&self, workflow_id: &str, step_id: &str, event: WorkflowEvent) -> Result<(), WorkflowError> {
        let _guard = self.locks.lock(workflow_id).await;
        let workflow = self.get_workflow(workflow_id).await?;
        Self::require_status(&workflow, "request step changes in", &[Running, Paused])?;
        if workflow.step(step_id).is_none() {
            return Err(WorkflowError::StepNotFound {
                workflow_id: workflow_id.to_string(),
                step_id: step_id.to_string(),
            });
        }
        self.wakeups.record_and_wake(workflow_id, event).await?;
        Ok(())
    }

    /// Deliver a user message to the controlling agent.
    pub async fn respond(&self, workflow_id: &str, message: &str) -> Result<(), WorkflowError> {
        self.record_for_agent(
            workflow_id,
            WorkflowEvent::UserResponse {
                message: message.to_string(),
            },
        )
        .await
    }

    pub async fn resolve_escalation(
        &self,
        workflow_id: &str,
        escalation_id: &str,
        response: &str,
    ) -> Result<(), WorkflowError> {
        self.record_for_agent(
            workflow_id,
            WorkflowEvent::EscalationResolved {
                escalation_id: escalation_id.to_string(),
                response: response.to_string(),
            },
        )
        .await
    }

    async fn record_for_agent(&self, workflow_id: &str, event: WorkflowEvent) -> Result<(), WorkflowError> {
        let _guard = self.locks.lock(workflow_id).await;
        let workflow = self.get_workflow(workflow_id).await?;
        Self::require_status(&workflow, "message", &[Running, Paused])?;
        self.wakeups.record_and_wake(workflow_id, event).await?;
        Ok(())
    }
}
