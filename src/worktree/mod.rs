//! Execution records and the git worktrees they run in.
//!
//! Each worktree-mode execution gets its own directory under the managed
//! worktree dir, named after the execution id, and optionally its own
//! branch. Follow-up executions continue in their parent's worktree and
//! branch. The record and the worktree are created together: a failed
//! worktree leaves no record, and a failed record write removes the
//! worktree again.

mod cleanup;
pub mod git;
pub mod naming;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use uuid::Uuid;

use crate::db::DbHandle;
use crate::errors::WorktreeError;
use crate::locks::KeyedLocks;
use crate::models::{CleanupMode, Execution, ExecutionConfig, ExecutionMode, ExecutionStatus};

pub use cleanup::{CleanupOutcome, SweepReport};

#[derive(Debug, Clone)]
pub struct WorktreeSettings {
    pub repo_path: PathBuf,
    pub worktree_dir: PathBuf,
    pub branch_prefix: String,
    pub default_cleanup_mode: CleanupMode,
    /// Unknown worktrees younger than this are left alone by the sweep.
    pub orphan_grace: Duration,
}

impl WorktreeSettings {
    pub fn for_repo(repo_path: &Path) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            worktree_dir: repo_path.join(".foreman").join("worktrees"),
            branch_prefix: "foreman".to_string(),
            default_cleanup_mode: CleanupMode::Auto,
            orphan_grace: Duration::from_secs(120),
        }
    }
}

/// Parameters for a new execution.
#[derive(Debug, Clone, Default)]
pub struct NewExecution {
    pub task_id: Option<String>,
    /// Used for the branch slug.
    pub title: Option<String>,
    pub workflow_id: Option<String>,
    pub agent_type: String,
    pub mode: ExecutionMode,
    /// Defaults to the branch checked out in the repository.
    pub target_branch: Option<String>,
    pub create_target_branch: bool,
    pub isolation_branch: bool,
    pub parent_execution_id: Option<String>,
    pub stream_id: Option<String>,
    pub cleanup_mode: Option<CleanupMode>,
    pub model: Option<String>,
}

pub struct WorktreeManager {
    db: DbHandle,
    settings: WorktreeSettings,
    task_locks: KeyedLocks,
}

impl WorktreeManager {
    pub fn new(db: DbHandle, settings: WorktreeSettings) -> Self {
        Self {
            db,
            settings,
            task_locks: KeyedLocks::default(),
        }
    }

    pub fn settings(&self) -> &WorktreeSettings {
        &self.settings
    }

    pub fn repo_path(&self) -> &Path {
        &self.settings.repo_path
    }

    pub async fn get(&self, execution_id: &str) -> Result<Execution, WorktreeError> {
        let id = execution_id.to_string();
        self.db
            .call(move |db| db.get_execution(&id))
            .await?
            .ok_or_else(|| WorktreeError::ExecutionNotFound {
                id: execution_id.to_string(),
            })
    }

    /// Validate, prepare a worktree (in worktree mode) and persist a new
    /// execution in `preparing`.
    ///
    /// A task has at most one active execution. Callers in this process
    /// queue on the task's lock; another process sharing the database loses
    /// at the record write and gets its worktree rolled back.
    pub async fn create_execution_with_worktree(
        &self,
        request: NewExecution,
    ) -> Result<Execution, WorktreeError> {
        let repo = self.settings.repo_path.clone();
        let _task_guard = match request.task_id.as_deref() {
            Some(task_id) => Some(self.task_locks.lock(task_id).await),
            None => None,
        };

        if let Some(task_id) = request.task_id.clone() {
            let active = self
                .db
                .call(move |db| db.active_execution_for_task(&task_id))
                .await?;
            if let Some(active) = active {
                return Err(WorktreeError::TaskAlreadyActive {
                    task_id: active.task_id.unwrap_or_default(),
                    execution_id: active.id,
                });
            }
        }

        if !git::is_repository(&repo).await {
            return Err(WorktreeError::NotARepository { path: repo });
        }

        let parent = match &request.parent_execution_id {
            Some(parent_id) => Some(self.get(parent_id).await?),
            None => None,
        };

        let target_branch = match request.target_branch.clone() {
            Some(branch) => branch,
            None => git::current_branch(&repo).await?.ok_or_else(|| {
                anyhow!("Repository HEAD is detached; a target branch is required")
            })?,
        };
        if !git::branch_exists(&repo, &target_branch).await? {
            if !request.create_target_branch {
                return Err(WorktreeError::BranchNotFound {
                    branch: target_branch,
                });
            }
            git::git(&repo, &["branch", &target_branch]).await?;
            tracing::info!(branch = %target_branch, "Created target branch from HEAD");
        }

        let id = Uuid::new_v4().to_string();
        let base_rev = match (&request.mode, &parent) {
            (ExecutionMode::Local, _) => "HEAD".to_string(),
            (ExecutionMode::Worktree, Some(p)) => p
                .branch_name
                .clone()
                .or_else(|| p.after_commit.clone())
                .or_else(|| p.before_commit.clone())
                .unwrap_or_else(|| target_branch.clone()),
            (ExecutionMode::Worktree, None) => target_branch.clone(),
        };
        let before_commit = match git::rev_parse(&repo, &base_rev).await {
            Ok(sha) => Some(sha),
            Err(e) => {
                tracing::warn!(execution_id = %id, rev = %base_rev, error = %e, "Could not capture base commit");
                None
            }
        };

        let prepared = match request.mode {
            ExecutionMode::Local => Prepared::default(),
            ExecutionMode::Worktree => match parent
                .as_ref()
                .and_then(|p| p.worktree_path.as_ref().map(|path| (p, PathBuf::from(path))))
            {
                Some((parent, path)) => {
                    let start = before_commit.clone().unwrap_or_else(|| base_rev.clone());
                    let created = self
                        .ensure_worktree(&path, parent.branch_name.as_deref(), &start)
                        .await?;
                    Prepared {
                        branch: parent.branch_name.clone(),
                        path: Some(path),
                        created_branch: false,
                        created_worktree: created,
                    }
                }
                None => {
                    self.add_fresh_worktree(&id, &request, &target_branch)
                        .await?
                }
            },
        };

        let now = Utc::now();
        let execution = Execution {
            id: id.clone(),
            task_id: request.task_id.clone(),
            workflow_id: request.workflow_id.clone(),
            agent_type: request.agent_type.clone(),
            mode: request.mode,
            status: ExecutionStatus::Preparing,
            repo_path: repo.to_string_lossy().into_owned(),
            before_commit,
            after_commit: None,
            worktree_path: prepared
                .path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            branch_name: prepared.branch.clone(),
            target_branch: Some(target_branch),
            parent_execution_id: request.parent_execution_id.clone(),
            stream_id: request.stream_id.clone(),
            session_id: None,
            config: ExecutionConfig {
                cleanup_mode: request
                    .cleanup_mode
                    .unwrap_or(self.settings.default_cleanup_mode),
                model: request.model.clone(),
            },
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let record = execution.clone();
        match self
            .db
            .call(move |db| db.insert_execution_if_task_idle(&record))
            .await
        {
            Ok(None) => {}
            Ok(Some(active)) => {
                tracing::warn!(execution_id = %id, active = %active.id, "Task became active elsewhere; rolling back worktree");
                self.rollback(&prepared).await;
                return Err(WorktreeError::TaskAlreadyActive {
                    task_id: active.task_id.unwrap_or_default(),
                    execution_id: active.id,
                });
            }
            Err(e) => {
                tracing::error!(execution_id = %id, error = %e, "Failed to persist execution; rolling back worktree");
                self.rollback(&prepared).await;
                return Err(e.into());
            }
        }

        tracing::info!(
            execution_id = %execution.id,
            task_id = ?execution.task_id,
            mode = %execution.mode,
            worktree = ?execution.worktree_path,
            branch = ?execution.branch_name,
            "Execution prepared"
        );
        Ok(execution)
    }

    async fn add_fresh_worktree(
        &self,
        id: &str,
        request: &NewExecution,
        target_branch: &str,
    ) -> Result<Prepared, WorktreeError> {
        let repo = &self.settings.repo_path;
        let path = naming::worktree_path(&self.settings.worktree_dir, id);
        tokio::fs::create_dir_all(&self.settings.worktree_dir)
            .await
            .map_err(|e| anyhow!("Failed to create worktree dir: {}", e))?;
        let path_str = path.to_string_lossy().into_owned();

        if request.isolation_branch {
            let branch = naming::branch_name(&self.settings.branch_prefix, id, request.title.as_deref());
            git::git(
                repo,
                &["worktree", "add", "-b", &branch, &path_str, target_branch],
            )
            .await?;
            Ok(Prepared {
                branch: Some(branch),
                path: Some(path),
                created_branch: true,
                created_worktree: true,
            })
        } else {
            git::git(
                repo,
                &["worktree", "add", "--detach", &path_str, target_branch],
            )
            .await?;
            Ok(Prepared {
                branch: None,
                path: Some(path),
                created_branch: false,
                created_worktree: true,
            })
        }
    }

    /// Reuse a live worktree at `path` or recreate it. Returns whether a new
    /// worktree was created.
    async fn ensure_worktree(
        &self,
        path: &Path,
        branch: Option<&str>,
        start: &str,
    ) -> Result<bool, WorktreeError> {
        let repo = &self.settings.repo_path;
        if path.exists() && git::is_repository(path).await {
            return Ok(false);
        }
        if path.exists() {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| anyhow!("Failed to clear stale worktree {}: {}", path.display(), e))?;
        }
        git::git(repo, &["worktree", "prune"]).await?;
        let path_str = path.to_string_lossy().into_owned();
        match branch {
            Some(branch) => git::git(repo, &["worktree", "add", &path_str, branch]).await?,
            None => git::git(repo, &["worktree", "add", "--detach", &path_str, start]).await?,
        };
        tracing::info!(path = %path.display(), "Recreated worktree for follow-up execution");
        Ok(true)
    }

    async fn rollback(&self, prepared: &Prepared) {
        let repo = &self.settings.repo_path;
        if let (true, Some(path)) = (prepared.created_worktree, &prepared.path)
            && let Err(e) = git::remove_worktree(repo, path).await
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove worktree during rollback");
        }
        if let (true, Some(branch)) = (prepared.created_branch, &prepared.branch)
            && let Err(e) = git::delete_branch(repo, branch).await
        {
            tracing::warn!(branch = %branch, error = %e, "Failed to delete branch during rollback");
        }
    }

    /// Best-effort current head of an execution: its worktree HEAD if the
    /// worktree is still there, otherwise its branch.
    pub async fn current_head(&self, execution: &Execution) -> Option<String> {
        if let Some(path) = execution.worktree_path.as_deref().map(Path::new)
            && path.exists()
            && let Ok(sha) = git::rev_parse(path, "HEAD").await
        {
            return Some(sha);
        }
        if let Some(branch) = execution.branch_name.as_deref() {
            return git::rev_parse(&self.settings.repo_path, branch).await.ok();
        }
        if execution.mode == ExecutionMode::Local {
            return git::rev_parse(&self.settings.repo_path, "HEAD").await.ok();
        }
        None
    }
}

#[derive(Debug, Default)]
struct Prepared {
    branch: Option<String>,
    path: Option<PathBuf>,
    created_branch: bool,
    created_worktree: bool,
}
