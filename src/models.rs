//! Persistent record types shared by every subsystem.
//!
//! Status enums follow one shape: `as_str` for storage, `FromStr` for
//! reading rows back, `Display` for messages, serde in `snake_case`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", $label, s)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ── Workflow ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

string_enum!(WorkflowStatus, "workflow status", {
    Pending => "pending",
    Running => "running",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Only paused and running may alternate; everything else moves forward.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }
}

/// Where a workflow's steps come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowSource {
    /// An explicit set of task ids.
    Tasks { task_ids: Vec<String> },
    /// A root task plus everything that transitively depends on it.
    RootTask { task_id: String },
    /// A free-form goal; steps are added by the controlling agent.
    Goal { goal: String },
}

impl WorkflowSource {
    pub fn describe(&self) -> String {
        match self {
            Self::Tasks { task_ids } => format!("tasks: {}", task_ids.join(", ")),
            Self::RootTask { task_id } => format!("root task {} and its dependents", task_id),
            Self::Goal { goal } => format!("goal: {}", goal),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AutoApprovePolicy {
    /// Let agents run tools without prompting.
    #[serde(default)]
    pub tools: bool,
    /// Record step checkpoints as approved instead of pending review.
    #[serde(default)]
    pub checkpoints: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub auto_approve: AutoApprovePolicy,
    #[serde(default)]
    pub orchestrator_agent: Option<String>,
    #[serde(default)]
    pub orchestrator_model: Option<String>,
    #[serde(default)]
    pub step_agent: Option<String>,
    #[serde(default)]
    pub step_model: Option<String>,
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    #[serde(default)]
    pub cleanup_mode: Option<CleanupMode>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub base_branch: Option<String>,
    /// One branch per step execution instead of a detached worktree.
    #[serde(default = "default_true")]
    pub isolation_branches: bool,
    /// Create a dedicated integration branch when the workflow starts.
    #[serde(default)]
    pub workflow_branch: bool,
}

fn default_true() -> bool {
    true
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            auto_approve: AutoApprovePolicy::default(),
            orchestrator_agent: None,
            orchestrator_model: None,
            step_agent: None,
            step_model: None,
            step_timeout_secs: None,
            cleanup_mode: None,
            mode: ExecutionMode::default(),
            base_branch: None,
            isolation_branches: true,
            workflow_branch: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub title: String,
    pub source: WorkflowSource,
    pub status: WorkflowStatus,
    pub steps: Vec<WorkflowStep>,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub current_step_index: i64,
    pub orchestrator_execution_id: Option<String>,
    pub orchestrator_session_id: Option<String>,
    pub root_stream_id: Option<String>,
    pub config: WorkflowConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_by_task(&self, task_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.task_id == task_id)
    }

    pub fn step_by_execution(&self, execution_id: &str) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .find(|s| s.execution_id.as_deref() == Some(execution_id))
    }

    /// Ids of dependencies of `step` that are not yet completed or skipped.
    pub fn unmet_dependencies(&self, step: &WorkflowStep) -> Vec<String> {
        step.depends_on
            .iter()
            .filter(|dep| {
                self.step(dep)
                    .map(|d| !d.status.satisfies_dependents())
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Pending steps whose dependencies are all satisfied, in step order.
    pub fn newly_ready_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending && self.unmet_dependencies(s).is_empty())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Branch new step executions fork from.
    pub fn integration_branch(&self) -> Option<&str> {
        self.branch_name.as_deref().or(self.base_branch.as_deref())
    }
}

// ── Steps ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

string_enum!(StepStatus, "step status", {
    Pending => "pending",
    Ready => "ready",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

impl StepStatus {
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Whether an execution may be started for a step in this status.
    pub fn is_startable(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub workflow_id: String,
    pub position: i64,
    pub task_id: String,
    pub title: String,
    pub status: StepStatus,
    pub execution_id: Option<String>,
    pub depends_on: Vec<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Executions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Preparing,
    Running,
    Completed,
    Failed,
    Stopped,
    Cancelled,
}

string_enum!(ExecutionStatus, "execution status", {
    Pending => "pending",
    Preparing => "preparing",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Stopped => "stopped",
    Cancelled => "cancelled",
});

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Worktree,
    Local,
}

string_enum!(ExecutionMode, "execution mode", {
    Worktree => "worktree",
    Local => "local",
});

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    #[default]
    Auto,
    Manual,
    Never,
}

string_enum!(CleanupMode, "cleanup mode", {
    Auto => "auto",
    Manual => "manual",
    Never => "never",
});

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub cleanup_mode: CleanupMode,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub task_id: Option<String>,
    pub workflow_id: Option<String>,
    pub agent_type: String,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub repo_path: String,
    pub before_commit: Option<String>,
    pub after_commit: Option<String>,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub target_branch: Option<String>,
    pub parent_execution_id: Option<String>,
    pub stream_id: Option<String>,
    pub session_id: Option<String>,
    pub config: ExecutionConfig,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// The controlling agent of a workflow carries no task.
    pub fn is_orchestrator(&self) -> bool {
        self.task_id.is_none() && self.workflow_id.is_some()
    }

    /// Directory the agent process runs in.
    pub fn working_dir(&self) -> &str {
        self.worktree_path.as_deref().unwrap_or(&self.repo_path)
    }
}

// ── Lineage ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stream {
    pub id: String,
    pub parent_stream: Option<String>,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiffStats {
    pub files_changed: i64,
    pub insertions: i64,
    pub deletions: i64,
    #[serde(default)]
    pub files: Vec<String>,
}

impl DiffStats {
    pub fn is_empty(&self) -> bool {
        self.files_changed == 0 && self.insertions == 0 && self.deletions == 0
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Approved,
    ChangesRequested,
}

string_enum!(ReviewStatus, "review status", {
    Pending => "pending",
    Approved => "approved",
    ChangesRequested => "changes_requested",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub stream_id: String,
    pub execution_id: Option<String>,
    pub task_id: Option<String>,
    pub commit_sha: String,
    pub parent_commit: Option<String>,
    pub stats: DiffStats,
    pub checkpointed_at: DateTime<Utc>,
    pub review_status: ReviewStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Squash,
    Merge,
}

string_enum!(MergeStrategy, "merge strategy", {
    Squash => "squash",
    Merge => "merge",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promotion {
    pub id: String,
    pub task_id: String,
    pub checkpoint_id: String,
    pub target_branch: String,
    pub strategy: MergeStrategy,
    pub merge_commit: String,
    pub stats: DiffStats,
    pub promoted_at: DateTime<Utc>,
}

// ── Events ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WakeupReason {
    Start,
    Event,
    Resume,
    Recovery,
    SessionReset,
    Manual,
}

string_enum!(WakeupReason, "wakeup reason", {
    Start => "start",
    Event => "event",
    Resume => "resume",
    Recovery => "recovery",
    SessionReset => "session_reset",
    Manual => "manual",
});

/// Everything that can wake a workflow's controlling agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StepCompleted {
        step_id: String,
        execution_id: String,
        task_id: String,
    },
    StepFailed {
        step_id: String,
        execution_id: Option<String>,
        task_id: String,
        error: Option<String>,
    },
    WorkflowPaused {
        reason: Option<String>,
    },
    WorkflowResumed,
    UserResponse {
        message: String,
    },
    EscalationRaised {
        escalation_id: String,
        message: String,
    },
    EscalationResolved {
        escalation_id: String,
        response: String,
    },
    Timeout {
        execution_id: Option<String>,
        step_id: Option<String>,
        after_secs: u64,
    },
    OrchestratorWakeup {
        reason: WakeupReason,
    },
    RetryRequested {
        step_id: String,
        feedback: Option<String>,
    },
    SkipRequested {
        step_id: String,
        reason: Option<String>,
    },
}

impl WorkflowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::WorkflowPaused { .. } => "workflow_paused",
            Self::WorkflowResumed => "workflow_resumed",
            Self::UserResponse { .. } => "user_response",
            Self::EscalationRaised { .. } => "escalation_raised",
            Self::EscalationResolved { .. } => "escalation_resolved",
            Self::Timeout { .. } => "timeout",
            Self::OrchestratorWakeup { .. } => "orchestrator_wakeup",
            Self::RetryRequested { .. } => "retry_requested",
            Self::SkipRequested { .. } => "skip_requested",
        }
    }

    /// One line for prompts and logs.
    pub fn summary(&self) -> String {
        match self {
            Self::StepCompleted { step_id, task_id, .. } => {
                format!("step {} (task {}) completed", step_id, task_id)
            }
            Self::StepFailed { step_id, task_id, error, .. } => format!(
                "step {} (task {}) failed: {}",
                step_id,
                task_id,
                error.as_deref().unwrap_or("no error recorded")
            ),
            Self::WorkflowPaused { reason } => format!(
                "workflow paused{}",
                reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default()
            ),
            Self::WorkflowResumed => "workflow resumed".to_string(),
            Self::UserResponse { message } => format!("user says: {}", message),
            Self::EscalationRaised { escalation_id, message } => {
                format!("escalation {} raised: {}", escalation_id, message)
            }
            Self::EscalationResolved { escalation_id, response } => {
                format!("escalation {} resolved: {}", escalation_id, response)
            }
            Self::Timeout { execution_id, after_secs, .. } => format!(
                "execution {} still running after {}s",
                execution_id.as_deref().unwrap_or("-"),
                after_secs
            ),
            Self::OrchestratorWakeup { reason } => format!("wakeup ({})", reason),
            Self::RetryRequested { step_id, feedback } => format!(
                "retry requested for step {}{}",
                step_id,
                feedback.as_deref().map(|f| format!(": {}", f)).unwrap_or_default()
            ),
            Self::SkipRequested { step_id, reason } => format!(
                "skip requested for step {}{}",
                step_id,
                reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default()
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub workflow_id: String,
    pub event: WorkflowEvent,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_status_roundtrip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Paused,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
        ] {
            assert_eq!(WorkflowStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(WorkflowStatus::from_str("bogus").is_err());
    }

    #[test]
    fn test_workflow_transitions() {
        use WorkflowStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Paused));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn test_step_status_dependency_semantics() {
        assert!(StepStatus::Completed.satisfies_dependents());
        assert!(StepStatus::Skipped.satisfies_dependents());
        assert!(!StepStatus::Failed.satisfies_dependents());
        assert!(!StepStatus::Running.satisfies_dependents());
        assert!(StepStatus::Failed.is_startable());
        assert!(!StepStatus::Running.is_startable());
    }

    #[test]
    fn test_execution_status_terminal() {
        assert!(ExecutionStatus::Stopped.is_terminal());
        assert!(ExecutionStatus::Preparing.is_active());
        assert_eq!(
            ExecutionStatus::from_str("cancelled").unwrap(),
            ExecutionStatus::Cancelled
        );
    }

    #[test]
    fn test_source_serializes_tagged() {
        let source = WorkflowSource::RootTask {
            task_id: "t-1".into(),
        };
        let json = serde_json::to_string(&source).unwrap();
        assert_eq!(json, r#"{"kind":"root_task","task_id":"t-1"}"#);
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let event = WorkflowEvent::SkipRequested {
            step_id: "s".into(),
            reason: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.event_type());
        assert_eq!(
            serde_json::to_value(WorkflowEvent::WorkflowResumed).unwrap()["type"],
            "workflow_resumed"
        );
    }

    #[test]
    fn test_workflow_config_defaults() {
        let config: WorkflowConfig = serde_json::from_str("{}").unwrap();
        assert!(config.isolation_branches);
        assert!(!config.workflow_branch);
        assert_eq!(config.mode, ExecutionMode::Worktree);
    }
}
