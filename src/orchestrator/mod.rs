//! The workflow state machine.
//!
//! `WorkflowEngine` owns workflow lifecycle, step reconciliation and the
//! controlling agent of each workflow. Agents run out of process; the engine
//! learns about them only through [`ExecutionUpdate`]s and acts on wakeup
//! requests, both consumed by [`WorkflowEngine::run`].
//!
//! Every public operation that mutates a workflow takes that workflow's
//! lock first. Methods suffixed `_locked` expect the caller to hold it.

mod actions;
mod lifecycle;
mod prompt;
mod recovery;
mod steps;
mod wake;


use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::db::{DbHandle, ExecutionPatch};
use crate::errors::WorkflowError;
use crate::locks::KeyedLocks;
use crate::models::{Execution, ExecutionStatus, Workflow, WorkflowStatus};
use crate::notify::{Notification, Notifier, NotifyLevel};
use crate::promote::PromoteService;
use crate::runner::{AgentRunner, ExecutionUpdate};
use crate::supervisor::Supervisor;
use crate::tasks::TaskStore;
use crate::wakeup::{WakeupRequest, WakeupService};
use crate::worktree::WorktreeManager;

pub use actions::{ActionResult, ControlAction, ControlChannel, WorkflowSnapshot};
pub use lifecycle::CancelReport;
pub use recovery::RecoveryReport;
pub use steps::OverlayPlan;
pub use wake::WakeupOutcome;

/// Engine-wide defaults, overridable per workflow through `WorkflowConfig`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub orchestrator_agent: String,
    pub orchestrator_model: Option<String>,
    pub step_agent: String,
    pub step_model: Option<String>,
    pub default_base_branch: Option<String>,
    pub step_timeout: Option<Duration>,
    /// Command the controlling agent runs to send control actions.
    pub control_command: String,
    /// Socket the hosting process serves control actions on, passed to the
    /// controlling agent as `FOREMAN_CONTROL_SOCKET`.
    pub control_socket: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            orchestrator_agent: "claude".to_string(),
            orchestrator_model: None,
            step_agent: "claude".to_string(),
            step_model: None,
            default_base_branch: None,
            step_timeout: Some(Duration::from_secs(30 * 60)),
            control_command: "foreman act".to_string(),
            control_socket: None,
        }
    }
}

/// Collaborators the engine is built from.
pub struct EngineDeps {
    pub db: DbHandle,
    pub tasks: Arc<dyn TaskStore>,
    pub runner: Arc<dyn AgentRunner>,
    pub worktrees: Arc<WorktreeManager>,
    pub wakeups: WakeupService,
    pub notifier: Arc<dyn Notifier>,
    pub promote: Arc<PromoteService>,
    pub supervisor: Supervisor,
}

pub struct WorkflowEngine {
    db: DbHandle,
    tasks: Arc<dyn TaskStore>,
    runner: Arc<dyn AgentRunner>,
    worktrees: Arc<WorktreeManager>,
    wakeups: WakeupService,
    notifier: Arc<dyn Notifier>,
    promote: Arc<PromoteService>,
    supervisor: Supervisor,
    locks: KeyedLocks,
    settings: EngineSettings,
}

impl WorkflowEngine {
    pub fn new(deps: EngineDeps, settings: EngineSettings) -> Self {
        Self {
            db: deps.db,
            tasks: deps.tasks,
            runner: deps.runner,
            worktrees: deps.worktrees,
            wakeups: deps.wakeups,
            notifier: deps.notifier,
            promote: deps.promote,
            supervisor: deps.supervisor,
            locks: KeyedLocks::default(),
            settings,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn wakeups(&self) -> &WakeupService {
        &self.wakeups
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, WorkflowError> {
        let id = workflow_id.to_string();
        self.db
            .call(move |db| db.get_workflow(&id))
            .await?
            .ok_or_else(|| WorkflowError::WorkflowNotFound {
                id: workflow_id.to_string(),
            })
    }

    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>, WorkflowError> {
        Ok(self.db.call(move |db| db.list_workflows(status)).await?)
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution, WorkflowError> {
        let id = execution_id.to_string();
        self.db
            .call(move |db| db.get_execution(&id))
            .await?
            .ok_or_else(|| WorkflowError::ExecutionNotFound {
                id: execution_id.to_string(),
            })
    }

    /// Consume runner updates and wakeup requests until `shutdown` resolves
    /// or both channels close. A failing handler is recorded, never fatal.
    pub async fn run(
        self: Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<ExecutionUpdate>,
        mut wakeups: mpsc::UnboundedReceiver<WakeupRequest>,
        shutdown: impl Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);
        let (mut updates_open, mut wakeups_open) = (true, true);
        tracing::info!("Workflow engine started");
        while updates_open || wakeups_open {
            tokio::select! {
                _ = &mut shutdown => break,
                update = updates.recv(), if updates_open => match update {
                    Some(update) => {
                        let label = format!("execution update {}", update.execution_id());
                        self.supervisor
                            .best_effort(&label, self.handle_execution_update(update))
                            .await;
                    }
                    None => updates_open = false,
                },
                request = wakeups.recv(), if wakeups_open => match request {
                    Some(request) => {
                        let label = format!("wakeup {}", request.workflow_id);
                        self.supervisor
                            .best_effort(&label, self.trigger_wakeup(&request.workflow_id, request.reason))
                            .await;
                    }
                    None => wakeups_open = false,
                },
            }
        }
        tracing::info!("Workflow engine stopped");
    }

    fn require_status(
        workflow: &Workflow,
        action: &'static str,
        required: &[WorkflowStatus],
    ) -> Result<(), WorkflowError> {
        if required.contains(&workflow.status) {
            return Ok(());
        }
        Err(WorkflowError::InvalidState {
            id: workflow.id.clone(),
            action,
            current: workflow.status,
            required: required.to_vec(),
        })
    }

    /// Statuses only move along `WorkflowStatus::can_transition_to`,
    /// whatever the calling operation already checked.
    fn check_transition(workflow: &Workflow, next: WorkflowStatus) -> Result<(), WorkflowError> {
        if workflow.status.can_transition_to(next) {
            return Ok(());
        }
        Err(WorkflowError::InvalidTransition {
            id: workflow.id.clone(),
            from: workflow.status,
            to: next,
        })
    }

    async fn set_workflow_status(&self, workflow: &Workflow, status: WorkflowStatus) -> Result<(), WorkflowError> {
        Self::check_transition(workflow, status)?;
        let id = workflow.id.clone();
        self.db
            .call(move |db| db.update_workflow_status(&id, status))
            .await?;
        tracing::info!(workflow_id = %workflow.id, from = %workflow.status, to = %status, "Workflow status changed");
        Ok(())
    }

    async fn patch_execution(&self, execution_id: &str, patch: ExecutionPatch) -> Result<(), WorkflowError> {
        let id = execution_id.to_string();
        self.db
            .call(move |db| db.update_execution(&id, &patch))
            .await?;
        Ok(())
    }

    async fn fail_execution(&self, execution_id: &str, error: &str) -> Result<(), WorkflowError> {
        self.patch_execution(
            execution_id,
            ExecutionPatch::status(ExecutionStatus::Failed).with_error(error),
        )
        .await
    }

    async fn notify(&self, workflow_id: &str, level: NotifyLevel, message: String) {
        let notification = Notification {
            workflow_id: workflow_id.to_string(),
            level,
            message,
        };
        self.supervisor
            .best_effort("notify", self.notifier.notify(notification))
            .await;
    }
}
