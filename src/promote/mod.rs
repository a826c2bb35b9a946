//! Two-tier promotion: a human (or policy) reviews a task's checkpoint,
//! then the task's accumulated changes land on a target branch.

mod merge;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::DbHandle;
use crate::errors::PromoteError;
use crate::models::{Checkpoint, DiffStats, Execution, MergeStrategy, Promotion, ReviewStatus};
use crate::tasks::TaskStore;
use crate::tracker::GitTracker;
use crate::worktree::git;

/// Longest `parent_execution_id` chain followed to find a task's first
/// execution.
const MAX_EXECUTION_CHAIN: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    RequestChanges,
    Reset,
}

impl ReviewAction {
    fn target(self) -> ReviewStatus {
        match self {
            Self::Approve => ReviewStatus::Approved,
            Self::RequestChanges => ReviewStatus::ChangesRequested,
            Self::Reset => ReviewStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromoteRequest {
    #[serde(default)]
    pub strategy: MergeStrategy,
    #[serde(default)]
    pub target_branch: Option<String>,
    /// Promote without an approved review. Blockers still apply.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub message: Option<String>,
}

pub struct PromoteService {
    db: DbHandle,
    tasks: Arc<dyn TaskStore>,
    repo_path: PathBuf,
    scratch_dir: PathBuf,
}

impl PromoteService {
    pub fn new(db: DbHandle, tasks: Arc<dyn TaskStore>, repo_path: PathBuf) -> Self {
        let scratch_dir = repo_path.join(".foreman").join("promote");
        Self {
            db,
            tasks,
            repo_path,
            scratch_dir,
        }
    }

    pub async fn review_checkpoint(
        &self,
        checkpoint_id: &str,
        action: ReviewAction,
        reviewer: Option<&str>,
        notes: Option<&str>,
    ) -> Result<Checkpoint, PromoteError> {
        let checkpoint = self.checkpoint(checkpoint_id).await?;
        let to = action.target();
        if action != ReviewAction::Reset && checkpoint.review_status != ReviewStatus::Pending {
            return Err(PromoteError::InvalidReviewTransition {
                from: checkpoint.review_status,
                to,
            });
        }

        let (reviewer, notes, at) = match action {
            ReviewAction::Reset => (None, None, None),
            _ => (
                reviewer.map(String::from),
                notes.map(String::from),
                Some(Utc::now()),
            ),
        };
        let id = checkpoint_id.to_string();
        self.db
            .call(move |db| {
                db.set_checkpoint_review(&id, to, reviewer.as_deref(), notes.as_deref(), at)
            })
            .await?;
        tracing::info!(checkpoint_id = %checkpoint_id, from = %checkpoint.review_status, to = %to, "Checkpoint reviewed");
        self.checkpoint(checkpoint_id).await
    }

    async fn checkpoint(&self, id: &str) -> Result<Checkpoint, PromoteError> {
        let lookup = id.to_string();
        self.db
            .call(move |db| db.get_checkpoint(&lookup))
            .await?
            .ok_or_else(|| PromoteError::CheckpointNotFound { id: id.to_string() })
    }

    /// Land a task's work on its target branch.
    pub async fn promote(&self, task_id: &str, request: PromoteRequest) -> Result<Promotion, PromoteError> {
        let task = task_id.to_string();
        let (execution, checkpoint) = self
            .db
            .call(move |db| {
                Ok((
                    db.latest_execution_for_task(&task)?,
                    db.latest_checkpoint_for_task(&task)?,
                ))
            })
            .await?;
        let execution = execution.ok_or_else(|| PromoteError::NoExecution {
            task_id: task_id.to_string(),
        })?;
        let checkpoint = checkpoint.ok_or_else(|| PromoteError::NoCheckpoint {
            task_id: task_id.to_string(),
        })?;

        if !request.force && checkpoint.review_status != ReviewStatus::Approved {
            return Err(PromoteError::RequiresApproval {
                checkpoint_id: checkpoint.id,
                review_status: checkpoint.review_status,
            });
        }

        let blockers = self.unmerged_blockers(task_id).await?;
        if !blockers.is_empty() {
            return Err(PromoteError::BlockedBy { blockers });
        }

        let root = self.root_execution(&execution).await?;
        let base = root
            .before_commit
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Execution {} has no recorded base commit", root.id))?;
        let head = match execution.branch_name.as_deref() {
            Some(branch) => git::rev_parse(&self.repo_path, branch).await?,
            None => checkpoint.commit_sha.clone(),
        };
        let target = self.target_branch(&request, &execution).await?;

        let stats = self.range_stats(&base, &head).await?;
        if stats.is_empty() {
            return Err(PromoteError::NothingToPromote {
                task_id: task_id.to_string(),
            });
        }

        let message = request
            .message
            .clone()
            .unwrap_or_else(|| format!("Promote task {} ({} files)", task_id, stats.files_changed));
        let landing = merge::Landing {
            repo: &self.repo_path,
            scratch_dir: &self.scratch_dir,
            target: &target,
            base: &base,
            head: &head,
            strategy: request.strategy,
            message: &message,
        };
        let merge_commit = landing.land().await?.ok_or_else(|| PromoteError::NothingToPromote {
            task_id: task_id.to_string(),
        })?;

        let promotion = Promotion {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            checkpoint_id: checkpoint.id.clone(),
            target_branch: target,
            strategy: request.strategy,
            merge_commit,
            stats,
            promoted_at: Utc::now(),
        };
        let record = promotion.clone();
        self.db.call(move |db| db.insert_promotion(&record)).await?;
        tracing::info!(
            task_id = %task_id,
            target = %promotion.target_branch,
            strategy = %promotion.strategy,
            commit = %promotion.merge_commit,
            files = promotion.stats.files_changed,
            "Promoted task"
        );
        Ok(promotion)
    }

    /// Declared blockers that are neither closed nor promoted.
    async fn unmerged_blockers(&self, task_id: &str) -> Result<Vec<String>, PromoteError> {
        let Some(task) = self.tasks.get_task(task_id).await? else {
            return Ok(Vec::new());
        };
        let mut blockers = Vec::new();
        for blocker in task.blocked_by {
            let closed = self
                .tasks
                .get_task(&blocker)
                .await?
                .is_some_and(|t| t.closed);
            if closed {
                continue;
            }
            let id = blocker.clone();
            if !self.db.call(move |db| db.is_task_promoted(&id)).await? {
                blockers.push(blocker);
            }
        }
        Ok(blockers)
    }

    async fn root_execution(&self, execution: &Execution) -> Result<Execution, PromoteError> {
        let mut current = execution.clone();
        for _ in 0..MAX_EXECUTION_CHAIN {
            let Some(parent_id) = current.parent_execution_id.clone() else {
                return Ok(current);
            };
            match self.db.call(move |db| db.get_execution(&parent_id)).await? {
                Some(parent) => current = parent,
                None => return Ok(current),
            }
        }
        Err(anyhow::anyhow!(
            "Execution chain of {} exceeds {} links",
            execution.id,
            MAX_EXECUTION_CHAIN
        )
        .into())
    }

    async fn target_branch(&self, request: &PromoteRequest, execution: &Execution) -> Result<String, PromoteError> {
        if let Some(branch) = &request.target_branch {
            return Ok(branch.clone());
        }
        if let Some(workflow_id) = execution.workflow_id.clone() {
            let workflow = self.db.call(move |db| db.get_workflow(&workflow_id)).await?;
            if let Some(base) = workflow.and_then(|w| w.base_branch) {
                return Ok(base);
            }
        }
        execution.target_branch.clone().ok_or_else(|| {
            anyhow::anyhow!("No target branch for execution {}", execution.id).into()
        })
    }

    async fn range_stats(&self, base: &str, head: &str) -> Result<DiffStats, PromoteError> {
        let repo = self.repo_path.clone();
        let (base, head) = (base.to_string(), head.to_string());
        let stats = tokio::task::spawn_blocking(move || GitTracker::new(&repo)?.diff_stats(&base, &head))
            .await
            .map_err(|e| anyhow::anyhow!("Diff task panicked: {}", e))??;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests;
