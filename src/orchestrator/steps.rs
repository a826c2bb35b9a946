use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::WorkflowEngine;
use super::prompt::step_prompt;
use crate::db::ExecutionPatch;
use crate::errors::WorkflowError;
use crate::lineage::{AncestryMap, ConcurrentEdit, OverlayOrder, concurrent_edits, overlay_order};
use crate::models::{
    Checkpoint, DiffStats, Execution, ExecutionMode, ExecutionStatus, ReviewStatus, StepStatus, Stream,
    WakeupReason, Workflow, WorkflowEvent, WorkflowStatus,
};
use crate::notify::NotifyLevel;
use crate::runner::{ExecutionUpdate, ExitOutcome, LaunchRequest};
use crate::tracker::GitTracker;
use crate::worktree::{NewExecution, naming};

/// Error recorded on an execution whose agent session vanished.
pub(super) const SESSION_LOST: &str = "agent session lost";

/// Order in which a workflow's checkpoints should be overlaid, plus the
/// files touched by unrelated streams.
#[derive(Debug, Clone, Serialize)]
pub struct OverlayPlan {
    pub order: OverlayOrder,
    pub concurrent_edits: Vec<ConcurrentEdit>,
}

impl WorkflowEngine {
    /// Start (or restart) the execution of one step.
    pub async fn execute_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        instructions: Option<&str>,
    ) -> Result<Execution, WorkflowError> {
        let _guard = self.locks.lock(workflow_id).await;
        let workflow = self.get_workflow(workflow_id).await?;
        self.execute_step_locked(&workflow, step_id, instructions).await
    }

    pub(super) async fn execute_step_locked(
        &self,
        workflow: &Workflow,
        step_id: &str,
        instructions: Option<&str>,
    ) -> Result<Execution, WorkflowError> {
        Self::require_status(workflow, "execute steps in", &[WorkflowStatus::Running])?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| WorkflowError::StepNotFound {
                workflow_id: workflow.id.clone(),
                step_id: step_id.to_string(),
            })?;
        if !step.status.is_startable() {
            return Err(WorkflowError::StepNotRunnable {
                step_id: step.id.clone(),
                status: step.status,
            });
        }
        let waiting_on = workflow.unmet_dependencies(step);
        if !waiting_on.is_empty() {
            return Err(WorkflowError::DependenciesNotMet {
                step_id: step.id.clone(),
                waiting_on,
            });
        }

        // A step that ran before continues where its last attempt stopped.
        let previous = match &step.execution_id {
            Some(id) => Some(self.get_execution(id).await?),
            None => None,
        };
        let parent = previous.filter(|p| p.status.is_terminal() && p.status != ExecutionStatus::Completed);
        let retry = parent.is_some();

        let stream_id = match parent.as_ref().and_then(|p| p.stream_id.clone()) {
            Some(id) => id,
            None => self.fork_step_stream(workflow, &step.depends_on, &step.task_id).await?,
        };

        let config = &workflow.config;
        let agent_type = config
            .step_agent
            .clone()
            .unwrap_or_else(|| self.settings.step_agent.clone());
        let model = config.step_model.clone().or_else(|| self.settings.step_model.clone());
        let execution = self
            .worktrees
            .create_execution_with_worktree(NewExecution {
                task_id: Some(step.task_id.clone()),
                title: Some(step.title.clone()),
                workflow_id: Some(workflow.id.clone()),
                agent_type: agent_type.clone(),
                mode: config.mode,
                target_branch: workflow.integration_branch().map(String::from),
                create_target_branch: false,
                isolation_branch: config.isolation_branches,
                parent_execution_id: parent.as_ref().map(|p| p.id.clone()),
                stream_id: Some(stream_id),
                cleanup_mode: config.cleanup_mode,
                model: model.clone(),
            })
            .await?;

        let (wf, sid, eid, position) = (
            workflow.id.clone(),
            step.id.clone(),
            execution.id.clone(),
            step.position,
        );
        self.db
            .call(move |db| {
                db.bind_step_execution(&sid, &eid)?;
                db.update_step_status(&sid, StepStatus::Running, None)?;
                db.set_current_step_index(&wf, position)
            })
            .await?;

        let resume_session = parent
            .as_ref()
            .filter(|p| p.error.as_deref() != Some(SESSION_LOST))
            .and_then(|p| p.session_id.clone());
        let request = LaunchRequest {
            execution_id: execution.id.clone(),
            working_dir: PathBuf::from(execution.working_dir()),
            agent_type,
            model,
            prompt: step_prompt(workflow, step, instructions, retry),
            resume_session,
            auto_approve: config.auto_approve.tools,
            env: vec![
                ("FOREMAN_WORKFLOW_ID".into(), workflow.id.clone()),
                ("FOREMAN_EXECUTION_ID".into(), execution.id.clone()),
                ("FOREMAN_TASK_ID".into(), step.task_id.clone()),
            ],
        };

        if let Err(e) = self.runner.launch(request).await {
            let error = e.to_string();
            tracing::error!(workflow_id = %workflow.id, step_id = %step.id, error = %error, "Step agent failed to launch");
            self.fail_execution(&execution.id, &error).await?;
            let (sid, err) = (step.id.clone(), error.clone());
            self.db
                .call(move |db| db.update_step_status(&sid, StepStatus::Failed, Some(&err)))
                .await?;
            self.wakeups
                .record_and_wake(
                    &workflow.id,
                    WorkflowEvent::StepFailed {
                        step_id: step.id.clone(),
                        execution_id: Some(execution.id.clone()),
                        task_id: step.task_id.clone(),
                        error: Some(error),
                    },
                )
                .await?;
            return Err(e.into());
        }

        self.patch_execution(&execution.id, ExecutionPatch::status(ExecutionStatus::Running))
            .await?;
        let timeout = config
            .step_timeout_secs
            .map(Duration::from_secs)
            .or(self.settings.step_timeout);
        if let Some(after) = timeout {
            self.wakeups
                .register_execution_timeout(&workflow.id, &execution.id, Some(&step.id), after);
        }
        tracing::info!(
            workflow_id = %workflow.id,
            step_id = %step.id,
            task_id = %step.task_id,
            execution_id = %execution.id,
            retry,
            "Step started"
        );
        self.get_execution(&execution.id).await
    }

    /// New stream for a step, forked from the stream of its first
    /// dependency that produced one, else from the workflow's root stream.
    async fn fork_step_stream(
        &self,
        workflow: &Workflow,
        depends_on: &[String],
        task_id: &str,
    ) -> Result<String, WorkflowError> {
        let mut parent_stream = None;
        for dep in depends_on {
            if let Some(exec_id) = workflow.step(dep).and_then(|d| d.execution_id.as_deref())
                && let Some(stream) = self.get_execution(exec_id).await?.stream_id
            {
                parent_stream = Some(stream);
                break;
            }
        }
        let stream = Stream {
            id: Uuid::new_v4().to_string(),
            parent_stream: parent_stream.or_else(|| workflow.root_stream_id.clone()),
            name: format!("{}/{}", naming::short_id(&workflow.id), task_id),
            created_at: Utc::now(),
        };
        let (record, wf) = (stream.clone(), workflow.id.clone());
        self.db
            .call(move |db| db.insert_stream(&record, Some(&wf)))
            .await?;
        Ok(stream.id)
    }

    /// Apply one report from the agent runner.
    pub async fn handle_execution_update(&self, update: ExecutionUpdate) -> Result<(), WorkflowError> {
        let execution = self.get_execution(update.execution_id()).await?;
        match update {
            ExecutionUpdate::Started { .. } => {
                if matches!(execution.status, ExecutionStatus::Pending | ExecutionStatus::Preparing) {
                    self.patch_execution(&execution.id, ExecutionPatch::status(ExecutionStatus::Running))
                        .await?;
                }
                Ok(())
            }
            ExecutionUpdate::Session { session_id, .. } => {
                let patch = ExecutionPatch {
                    session_id: Some(session_id.clone()),
                    ..Default::default()
                };
                match execution.workflow_id.as_deref() {
                    Some(wf) if execution.is_orchestrator() => {
                        let _guard = self.locks.lock(wf).await;
                        self.patch_execution(&execution.id, patch).await?;
                        let wf = wf.to_string();
                        self.db
                            .call(move |db| db.set_orchestrator_session(&wf, Some(&session_id)))
                            .await?;
                    }
                    _ => self.patch_execution(&execution.id, patch).await?,
                }
                Ok(())
            }
            ExecutionUpdate::Finished {
                outcome, session_id, ..
            } => {
                let Some(workflow_id) = execution.workflow_id.clone() else {
                    let patch = outcome_patch(&outcome, None, session_id);
                    return self.patch_execution(&execution.id, patch).await;
                };
                let _guard = self.locks.lock(&workflow_id).await;
                // Re-read under the lock: a cancel may have won the race.
                let execution = self.get_execution(&execution.id).await?;
                if execution.status.is_terminal() {
                    tracing::debug!(execution_id = %execution.id, status = %execution.status, "Ignoring exit of finished execution");
                    return Ok(());
                }
                let workflow = self.get_workflow(&workflow_id).await?;
                if execution.is_orchestrator() {
                    self.finish_orchestrator_locked(&workflow, &execution, outcome, session_id)
                        .await
                } else {
                    self.finish_step_locked(&workflow, &execution, outcome, session_id)
                        .await
                }
            }
        }
    }

    async fn finish_step_locked(
        &self,
        workflow: &Workflow,
        execution: &Execution,
        outcome: ExitOutcome,
        session_id: Option<String>,
    ) -> Result<(), WorkflowError> {
        self.wakeups.cancel_execution_timeout(&execution.id);
        let label = format!("capture changes of {}", execution.id);
        let changes = self
            .supervisor
            .best_effort(&label, capture_changes(execution))
            .await
            .flatten();

        let head = changes.as_ref().map(|(head, _)| head.clone());
        self.patch_execution(&execution.id, outcome_patch(&outcome, head, session_id))
            .await?;

        if let (ExitOutcome::Completed { .. }, Some((head, stats))) = (&outcome, changes)
            && !stats.is_empty()
        {
            self.record_checkpoint(workflow, execution, head, stats).await?;
        }

        let Some(step) = workflow.step_by_execution(&execution.id) else {
            return Ok(());
        };
        if step.status != StepStatus::Running || workflow.status.is_terminal() {
            return Ok(());
        }

        match outcome {
            ExitOutcome::Completed { .. } => {
                let sid = step.id.clone();
                self.db
                    .call(move |db| db.update_step_status(&sid, StepStatus::Completed, None))
                    .await?;
                let ready = self.refresh_readiness(&workflow.id).await?;
                tracing::info!(
                    workflow_id = %workflow.id,
                    step_id = %step.id,
                    newly_ready = ready.len(),
                    "Step completed"
                );
                self.wakeups
                    .record_and_wake(
                        &workflow.id,
                        WorkflowEvent::StepCompleted {
                            step_id: step.id.clone(),
                            execution_id: execution.id.clone(),
                            task_id: step.task_id.clone(),
                        },
                    )
                    .await?;
            }
            other => {
                let error = failure_message(&other);
                let (sid, err) = (step.id.clone(), error.clone());
                self.db
                    .call(move |db| db.update_step_status(&sid, StepStatus::Failed, Some(&err)))
                    .await?;
                tracing::warn!(workflow_id = %workflow.id, step_id = %step.id, error = %error, "Step failed");
                self.wakeups
                    .record_and_wake(
                        &workflow.id,
                        WorkflowEvent::StepFailed {
                            step_id: step.id.clone(),
                            execution_id: Some(execution.id.clone()),
                            task_id: step.task_id.clone(),
                            error: Some(error.clone()),
                        },
                    )
                    .await?;
                self.notify(
                    &workflow.id,
                    NotifyLevel::Warning,
                    format!("Step {} ({}) failed: {}", step.task_id, step.title, error),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn record_checkpoint(
        &self,
        workflow: &Workflow,
        execution: &Execution,
        head: String,
        stats: DiffStats,
    ) -> Result<(), WorkflowError> {
        let Some(stream_id) = execution.stream_id.clone() else {
            return Ok(());
        };
        let auto = workflow.config.auto_approve.checkpoints;
        let now = Utc::now();
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            stream_id,
            execution_id: Some(execution.id.clone()),
            task_id: execution.task_id.clone(),
            commit_sha: head,
            parent_commit: execution.before_commit.clone(),
            stats,
            checkpointed_at: now,
            review_status: if auto {
                ReviewStatus::Approved
            } else {
                ReviewStatus::Pending
            },
            reviewed_by: auto.then(|| "auto".to_string()),
            reviewed_at: auto.then_some(now),
            review_notes: None,
        };
        tracing::info!(
            execution_id = %execution.id,
            checkpoint_id = %checkpoint.id,
            commit = %checkpoint.commit_sha,
            files = checkpoint.stats.files_changed,
            "Checkpoint recorded"
        );
        self.db
            .call(move |db| db.insert_checkpoint(&checkpoint))
            .await?;
        Ok(())
    }

    async fn finish_orchestrator_locked(
        &self,
        workflow: &Workflow,
        execution: &Execution,
        outcome: ExitOutcome,
        session_id: Option<String>,
    ) -> Result<(), WorkflowError> {
        if let Some(session) = session_id.as_deref()
            && !matches!(outcome, ExitOutcome::SessionLost)
        {
            let (wf, session) = (workflow.id.clone(), session.to_string());
            self.db
                .call(move |db| db.set_orchestrator_session(&wf, Some(&session)))
                .await?;
        }
        let session_id = session_id.filter(|_| !matches!(outcome, ExitOutcome::SessionLost));
        self.patch_execution(&execution.id, outcome_patch(&outcome, None, session_id))
            .await?;
        if workflow.status.is_terminal() {
            return Ok(());
        }

        match outcome {
            ExitOutcome::SessionLost => {
                tracing::warn!(workflow_id = %workflow.id, "Controlling agent session lost; starting a fresh one");
                let wf = workflow.id.clone();
                self.db
                    .call(move |db| db.set_orchestrator_session(&wf, None))
                    .await?;
                self.wakeups
                    .record_event(
                        &workflow.id,
                        WorkflowEvent::OrchestratorWakeup {
                            reason: WakeupReason::SessionReset,
                        },
                    )
                    .await?;
                self.wakeups.take_queued(&workflow.id);
                self.wakeups
                    .request_wakeup(&workflow.id, WakeupReason::SessionReset);
            }
            other => {
                if let ExitOutcome::Failed { error } = &other {
                    self.notify(
                        &workflow.id,
                        NotifyLevel::Warning,
                        format!("Controlling agent exited with an error: {}", error),
                    )
                    .await;
                }
                if self.wakeups.take_queued(&workflow.id) && workflow.status == WorkflowStatus::Running {
                    self.wakeups.request_wakeup(&workflow.id, WakeupReason::Event);
                }
            }
        }
        Ok(())
    }

    /// Cancel a single execution. Cancelling a finished execution is a no-op.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<Execution, WorkflowError> {
        let execution = self.get_execution(execution_id).await?;
        let Some(workflow_id) = execution.workflow_id.clone() else {
            if execution.status.is_active() {
                self.stop_execution(&execution, "execution cancelled").await;
            }
            return self.get_execution(execution_id).await;
        };
        let _guard = self.locks.lock(&workflow_id).await;
        let workflow = self.get_workflow(&workflow_id).await?;
        self.cancel_execution_locked(&workflow, execution_id).await
    }

    pub(super) async fn cancel_execution_locked(
        &self,
        workflow: &Workflow,
        execution_id: &str,
    ) -> Result<Execution, WorkflowError> {
        let execution = self.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(execution);
        }
        self.stop_execution(&execution, "execution cancelled").await;

        if let Some(step) = workflow.step_by_execution(execution_id)
            && step.status == StepStatus::Running
        {
            let sid = step.id.clone();
            self.db
                .call(move |db| db.update_step_status(&sid, StepStatus::Failed, Some("execution cancelled")))
                .await?;
            self.wakeups
                .record_and_wake(
                    &workflow.id,
                    WorkflowEvent::StepFailed {
                        step_id: step.id.clone(),
                        execution_id: Some(execution_id.to_string()),
                        task_id: step.task_id.clone(),
                        error: Some("execution cancelled".to_string()),
                    },
                )
                .await?;
        }
        tracing::info!(workflow_id = %workflow.id, execution_id = %execution_id, "Execution cancelled");
        self.get_execution(execution_id).await
    }

    /// Mark pending steps whose dependencies are all satisfied as ready.
    pub(super) async fn refresh_readiness(&self, workflow_id: &str) -> Result<Vec<String>, WorkflowError> {
        let workflow = self.get_workflow(workflow_id).await?;
        let ready = workflow.newly_ready_steps();
        if !ready.is_empty() {
            let ids = ready.clone();
            self.db
                .call(move |db| {
                    for id in &ids {
                        db.update_step_status(id, StepStatus::Ready, None)?;
                    }
                    Ok(())
                })
                .await?;
        }
        Ok(ready)
    }

    pub async fn overlay_plan(&self, workflow_id: &str) -> Result<OverlayPlan, WorkflowError> {
        self.get_workflow(workflow_id).await?;
        let wf = workflow_id.to_string();
        let (checkpoints, streams) = self
            .db
            .call(move |db| Ok((db.checkpoints_for_workflow(&wf)?, db.streams_for_workflow(&wf)?)))
            .await?;
        let edits = match AncestryMap::build(&streams) {
            Ok(ancestry) => concurrent_edits(&checkpoints, &ancestry),
            Err(e) => {
                tracing::warn!(workflow_id = %workflow_id, error = %e, "Skipping concurrent edit detection");
                Vec::new()
            }
        };
        Ok(OverlayPlan {
            concurrent_edits: edits,
            order: overlay_order(&checkpoints, &streams),
        })
    }
}

/// Commit whatever the agent left in its worktree and measure the change
/// against the execution's base commit.
async fn capture_changes(execution: &Execution) -> anyhow::Result<Option<(String, DiffStats)>> {
    if execution.mode != ExecutionMode::Worktree {
        return Ok(None);
    }
    let Some(dir) = execution.worktree_path.clone().map(PathBuf::from) else {
        return Ok(None);
    };
    if !dir.exists() {
        return Ok(None);
    }
    let before = execution.before_commit.clone();
    let message = format!("foreman: work from execution {}", execution.id);
    tokio::task::spawn_blocking(move || -> anyhow::Result<Option<(String, DiffStats)>> {
        let tracker = GitTracker::new(&dir)?;
        tracker.commit_all(&message)?;
        let Some(head) = tracker.head_sha() else {
            return Ok(None);
        };
        let stats = match before.as_deref() {
            Some(before) if before != head => tracker.diff_stats(before, &head)?,
            _ => DiffStats::default(),
        };
        Ok(Some((head, stats)))
    })
    .await
    .context("Change capture task panicked")?
}

fn failure_message(outcome: &ExitOutcome) -> String {
    match outcome {
        ExitOutcome::Completed { .. } => String::new(),
        ExitOutcome::Failed { error } => error.clone(),
        ExitOutcome::Stopped => "agent stopped".to_string(),
        ExitOutcome::SessionLost => SESSION_LOST.to_string(),
    }
}

fn outcome_patch(outcome: &ExitOutcome, after_commit: Option<String>, session_id: Option<String>) -> ExecutionPatch {
    let status = match outcome {
        ExitOutcome::Completed { .. } => ExecutionStatus::Completed,
        ExitOutcome::Failed { .. } | ExitOutcome::SessionLost => ExecutionStatus::Failed,
        ExitOutcome::Stopped => ExecutionStatus::Stopped,
    };
    let error = match outcome {
        ExitOutcome::Completed { .. } => None,
        other => Some(failure_message(other)),
    };
    ExecutionPatch {
        status: Some(status),
        after_commit,
        session_id,
        error,
    }
}
