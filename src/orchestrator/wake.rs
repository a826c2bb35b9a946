use std::path::PathBuf;

use serde::Serialize;

use super::WorkflowEngine;
use super::prompt::{OrchestratorBriefing, orchestrator_prompt};
use crate::db::ExecutionPatch;
use crate::errors::WorkflowError;
use crate::models::{EventRecord, Execution, ExecutionMode, ExecutionStatus, WakeupReason, Workflow, WorkflowStatus};
use crate::runner::LaunchRequest;
use crate::worktree::NewExecution;

/// What a wakeup request turned into.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WakeupOutcome {
    /// The workflow is finished.
    Skipped,
    /// The workflow is paused; events wait for the resume.
    Deferred,
    /// The controlling agent is busy; it is woken again when it exits.
    Queued,
    NothingPending,
    Spawned { execution_id: String },
}

impl WorkflowEngine {
    /// Wake a workflow's controlling agent if there is anything for it.
    pub async fn trigger_wakeup(&self, workflow_id: &str, reason: WakeupReason) -> Result<WakeupOutcome, WorkflowError> {
        let _guard = self.locks.lock(workflow_id).await;
        let workflow = self.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Ok(WakeupOutcome::Skipped);
        }
        if workflow.status == WorkflowStatus::Paused {
            tracing::debug!(workflow_id = %workflow_id, %reason, "Workflow paused; wakeup deferred");
            return Ok(WakeupOutcome::Deferred);
        }
        if self.orchestrator_active(&workflow).await? {
            self.wakeups.queue(workflow_id);
            tracing::debug!(workflow_id = %workflow_id, %reason, "Controlling agent busy; wakeup queued");
            return Ok(WakeupOutcome::Queued);
        }

        let events = self.wakeups.unprocessed_events(workflow_id).await?;
        if events.is_empty() {
            return Ok(WakeupOutcome::NothingPending);
        }
        self.wakeups.clear_wait(workflow_id);
        let execution = self.launch_orchestrator(&workflow, reason, events).await?;
        Ok(WakeupOutcome::Spawned {
            execution_id: execution.id,
        })
    }

    pub(super) async fn orchestrator_active(&self, workflow: &Workflow) -> Result<bool, WorkflowError> {
        let Some(id) = workflow.orchestrator_execution_id.as_deref() else {
            return Ok(false);
        };
        let id = id.to_string();
        let execution = self.db.call(move |db| db.get_execution(&id)).await?;
        Ok(execution.is_some_and(|e| e.status.is_active()))
    }

    /// Start a controlling agent run that consumes `events`.
    ///
    /// The previous session is resumed when there is one, except after the
    /// session was lost; a fresh session is briefed with the full event log.
    pub(super) async fn launch_orchestrator(
        &self,
        workflow: &Workflow,
        reason: WakeupReason,
        events: Vec<EventRecord>,
    ) -> Result<Execution, WorkflowError> {
        let config = &workflow.config;
        let agent_type = config
            .orchestrator_agent
            .clone()
            .unwrap_or_else(|| self.settings.orchestrator_agent.clone());
        let model = config
            .orchestrator_model
            .clone()
            .or_else(|| self.settings.orchestrator_model.clone());

        let execution = self
            .worktrees
            .create_execution_with_worktree(NewExecution {
                task_id: None,
                title: Some(workflow.title.clone()),
                workflow_id: Some(workflow.id.clone()),
                agent_type: agent_type.clone(),
                mode: ExecutionMode::Local,
                target_branch: workflow.integration_branch().map(String::from),
                parent_execution_id: workflow.orchestrator_execution_id.clone(),
                model: model.clone(),
                ..Default::default()
            })
            .await?;

        let resume_session = match reason {
            WakeupReason::SessionReset => None,
            _ => workflow.orchestrator_session_id.clone(),
        };
        let full_log;
        let briefing = match (reason, resume_session.is_some()) {
            (WakeupReason::Start, _) => OrchestratorBriefing::Initial,
            (_, true) => OrchestratorBriefing::Events(&events),
            (_, false) => {
                let wf = workflow.id.clone();
                full_log = self.db.call(move |db| db.events_for_workflow(&wf)).await?;
                OrchestratorBriefing::FullLog(&full_log)
            }
        };
        let prompt = orchestrator_prompt(workflow, briefing, &self.settings.control_command);

        let (wf, eid, session) = (
            workflow.id.clone(),
            execution.id.clone(),
            resume_session.clone(),
        );
        self.db
            .call(move |db| db.set_orchestrator(&wf, Some(&eid), session.as_deref()))
            .await?;

        let mut env = vec![
            ("FOREMAN_WORKFLOW_ID".to_string(), workflow.id.clone()),
            ("FOREMAN_EXECUTION_ID".to_string(), execution.id.clone()),
        ];
        if let Some(socket) = &self.settings.control_socket {
            env.push((
                "FOREMAN_CONTROL_SOCKET".to_string(),
                socket.to_string_lossy().into_owned(),
            ));
        }
        let request = LaunchRequest {
            execution_id: execution.id.clone(),
            working_dir: PathBuf::from(execution.working_dir()),
            agent_type,
            model,
            prompt,
            resume_session: resume_session.clone(),
            auto_approve: config.auto_approve.tools,
            env,
        };
        if let Err(e) = self.runner.launch(request).await {
            tracing::error!(workflow_id = %workflow.id, error = %e, "Controlling agent failed to launch");
            self.fail_execution(&execution.id, &e.to_string()).await?;
            return Err(e.into());
        }

        self.patch_execution(&execution.id, ExecutionPatch::status(ExecutionStatus::Running))
            .await?;
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        let marked = self.wakeups.mark_processed(ids, &execution.id).await?;
        tracing::info!(
            workflow_id = %workflow.id,
            execution_id = %execution.id,
            %reason,
            events = marked,
            resumed = resume_session.is_some(),
            "Controlling agent launched"
        );
        self.get_execution(&execution.id).await
    }
}
