//! Typed error hierarchy for foreman.
//!
//! - `WorkflowError`: workflow lifecycle and control-action failures
//! - `WorktreeError`: execution creation and worktree management
//! - `PromoteError`: checkpoint review and promotion rejections
//! - `LineageError`: corrupted stream ancestry
//! - `LaunchError`: agent process startup

use std::path::PathBuf;

use thiserror::Error;

use crate::models::{ReviewStatus, StepStatus, WorkflowStatus};

/// The task graph contains at least one dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Dependency cycle detected: {}", format_cycles(.cycles))]
pub struct CycleError {
    /// One ordered id path per strongly connected component.
    pub cycles: Vec<Vec<String>>,
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|c| {
            let mut path = c.join(" -> ");
            if let Some(first) = c.first() {
                path.push_str(" -> ");
                path.push_str(first);
            }
            path
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_statuses(statuses: &[WorkflowStatus]) -> String {
    statuses
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" or ")
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("Workflow {id} not found")]
    WorkflowNotFound { id: String },

    #[error("Step {step_id} not found in workflow {workflow_id}")]
    StepNotFound {
        workflow_id: String,
        step_id: String,
    },

    #[error("Execution {id} not found")]
    ExecutionNotFound { id: String },

    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error(
        "Cannot {action} workflow {id}: status is {current}, requires {}",
        format_statuses(.required)
    )]
    InvalidState {
        id: String,
        action: &'static str,
        current: WorkflowStatus,
        required: Vec<WorkflowStatus>,
    },

    #[error("Workflow {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("Step {step_id} is waiting on unfinished dependencies: {}", .waiting_on.join(", "))]
    DependenciesNotMet {
        step_id: String,
        waiting_on: Vec<String>,
    },

    #[error("Step {step_id} cannot be started while {status}")]
    StepNotRunnable { step_id: String, status: StepStatus },

    #[error("{kind} {id} does not belong to workflow {workflow_id}")]
    ForeignTarget {
        workflow_id: String,
        kind: &'static str,
        id: String,
    },

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Promote(#[from] PromoteError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Task {task_id} already has an active execution ({execution_id})")]
    TaskAlreadyActive {
        task_id: String,
        execution_id: String,
    },

    #[error("{} is not a git repository", .path.display())]
    NotARepository { path: PathBuf },

    #[error("Branch '{branch}' does not exist")]
    BranchNotFound { branch: String },

    #[error("Execution {id} not found")]
    ExecutionNotFound { id: String },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PromoteError {
    #[error("Task {task_id} has no executions")]
    NoExecution { task_id: String },

    #[error("Task {task_id} has no checkpoint to promote")]
    NoCheckpoint { task_id: String },

    #[error("Checkpoint {id} not found")]
    CheckpointNotFound { id: String },

    #[error("Checkpoint review cannot move from {from} to {to}")]
    InvalidReviewTransition {
        from: ReviewStatus,
        to: ReviewStatus,
    },

    #[error("Checkpoint {checkpoint_id} is {review_status}; approval required")]
    RequiresApproval {
        checkpoint_id: String,
        review_status: ReviewStatus,
    },

    #[error("Blocked by unmerged dependencies: {}", .blockers.join(", "))]
    BlockedBy { blockers: Vec<String> },

    #[error("Merge conflicts in {} file(s): {message}", .files.len())]
    Conflicts { files: Vec<String>, message: String },

    #[error("Task {task_id} has no changes relative to its base")]
    NothingToPromote { task_id: String },

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PromoteError {
    /// What a caller can do to get past this rejection.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::NoExecution { .. } | Self::NoCheckpoint { .. } => {
                "run the task so it produces a checkpoint first"
            }
            Self::CheckpointNotFound { .. } => "check the checkpoint id",
            Self::InvalidReviewTransition { .. } => "reset the review to pending first",
            Self::RequiresApproval { .. } => "approve the checkpoint or promote with force",
            Self::BlockedBy { .. } => "promote or close the blocking tasks first",
            Self::Conflicts { .. } => {
                "rebase the task branch onto the target or resolve the listed files"
            }
            Self::NothingToPromote { .. } => "nothing to do",
            Self::Worktree(_) | Self::Other(_) => "inspect the repository state and retry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineageError {
    #[error("Stream {stream_id} is its own ancestor")]
    Cycle { stream_id: String },

    #[error("Stream {stream_id} exceeds the maximum lineage depth of {max_depth}")]
    DepthExceeded { stream_id: String, max_depth: usize },
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to spawn agent '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_lists_closed_paths() {
        let err = CycleError {
            cycles: vec![vec!["a".into(), "b".into()]],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn invalid_state_names_current_and_required() {
        let err = WorkflowError::InvalidState {
            id: "wf".into(),
            action: "resume",
            current: WorkflowStatus::Running,
            required: vec![WorkflowStatus::Paused],
        };
        let msg = err.to_string();
        assert!(msg.contains("status is running"));
        assert!(msg.contains("requires paused"));
    }

    #[test]
    fn cycle_converts_into_workflow_error() {
        let err: WorkflowError = CycleError { cycles: vec![] }.into();
        assert!(matches!(err, WorkflowError::Cycle(_)));
    }

    #[test]
    fn promote_rejections_are_distinct_and_explained() {
        let blocked = PromoteError::BlockedBy {
            blockers: vec!["t-1".into(), "t-2".into()],
        };
        assert!(blocked.to_string().contains("t-1, t-2"));
        assert!(blocked.remediation().contains("blocking"));

        let approval = PromoteError::RequiresApproval {
            checkpoint_id: "cp".into(),
            review_status: ReviewStatus::ChangesRequested,
        };
        assert!(approval.to_string().contains("changes_requested"));
        assert_ne!(approval.remediation(), blocked.remediation());
    }

    #[test]
    fn worktree_git_error_carries_stderr() {
        let err = WorktreeError::Git {
            command: "worktree add".into(),
            stderr: "fatal: bad revision".into(),
        };
        match &err {
            WorktreeError::Git { stderr, .. } => assert!(stderr.contains("bad revision")),
            _ => panic!("Expected Git variant"),
        }
    }
}
