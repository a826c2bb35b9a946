use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use super::{WorktreeManager, git, naming};
use crate::errors::WorktreeError;
use crate::models::{CleanupMode, Execution};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOutcome {
    Removed,
    /// The directory was already gone; the registration was pruned.
    AlreadyGone,
    /// The execution's cleanup mode keeps the worktree.
    Retained(CleanupMode),
    /// A later execution is still running in the same worktree.
    InUse { execution_id: String },
    NoWorktree,
}

#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub retained: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl WorktreeManager {
    /// Remove an execution's worktree according to its cleanup mode.
    ///
    /// The record keeps its `worktree_path` so follow-ups can recreate it.
    pub async fn cleanup_execution(&self, execution_id: &str) -> Result<CleanupOutcome, WorktreeError> {
        let execution = self.get(execution_id).await?;
        self.cleanup_for(&execution).await
    }

    pub(crate) async fn cleanup_for(&self, execution: &Execution) -> Result<CleanupOutcome, WorktreeError> {
        if execution.config.cleanup_mode != CleanupMode::Auto {
            return Ok(CleanupOutcome::Retained(execution.config.cleanup_mode));
        }
        let Some(path) = execution.worktree_path.clone() else {
            return Ok(CleanupOutcome::NoWorktree);
        };
        let path = PathBuf::from(path);
        if path == self.settings.repo_path {
            return Ok(CleanupOutcome::NoWorktree);
        }

        let lookup = path.to_string_lossy().into_owned();
        let latest = self
            .db
            .call(move |db| db.find_execution_by_worktree(&lookup))
            .await?;
        if let Some(latest) = latest
            && latest.id != execution.id
            && latest.status.is_active()
        {
            return Ok(CleanupOutcome::InUse {
                execution_id: latest.id,
            });
        }

        let existed = path.exists();
        git::remove_worktree(&self.settings.repo_path, &path).await?;
        tracing::info!(execution_id = %execution.id, path = %path.display(), existed, "Cleaned up worktree");
        Ok(if existed {
            CleanupOutcome::Removed
        } else {
            CleanupOutcome::AlreadyGone
        })
    }

    /// Reconcile git's worktree list with execution records.
    ///
    /// Only entries under the managed worktree dir are considered. Entries
    /// with no record, or whose execution is finished and auto-cleaned, are
    /// removed. Failures are collected per entry and do not stop the sweep.
    pub async fn cleanup_orphaned_worktrees(&self) -> Result<SweepReport, WorktreeError> {
        let repo = &self.settings.repo_path;
        let mut report = SweepReport::default();
        if !self.settings.worktree_dir.exists() {
            return Ok(report);
        }
        let managed_dir = tokio::fs::canonicalize(&self.settings.worktree_dir)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to resolve worktree dir: {}", e))?;
        let main_worktree = tokio::fs::canonicalize(repo).await.ok();

        git::git(repo, &["worktree", "prune"]).await?;
        let entries = git::list_worktrees(repo).await?;

        for entry in entries {
            if Some(&entry.path) == main_worktree.as_ref() || !entry.path.starts_with(&managed_dir) {
                continue;
            }
            let Some(name) = entry.path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let stored = naming::worktree_path(&self.settings.worktree_dir, &name);
            let execution = self.execution_for(&stored, &name).await?;

            let remove = match &execution {
                None => !is_recent(&entry.path, self.settings.orphan_grace).await,
                Some(exec) => {
                    exec.status.is_terminal() && exec.config.cleanup_mode == CleanupMode::Auto
                }
            };
            if !remove {
                report.retained.push(stored);
                continue;
            }

            match git::remove_worktree(repo, &entry.path).await {
                Ok(()) => {
                    tracing::info!(path = %entry.path.display(), known = execution.is_some(), "Swept worktree");
                    report.removed.push(stored);
                }
                Err(e) => {
                    tracing::warn!(path = %entry.path.display(), error = %e, "Failed to sweep worktree");
                    report.failed.push((stored, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    async fn execution_for(&self, stored: &Path, name: &str) -> Result<Option<Execution>, WorktreeError> {
        let lookup = stored.to_string_lossy().into_owned();
        let id = name.to_string();
        let found = self
            .db
            .call(move |db| match db.find_execution_by_worktree(&lookup)? {
                Some(exec) => Ok(Some(exec)),
                None => db.get_execution(&id),
            })
            .await?;
        Ok(found)
    }
}

/// Whether `path` was modified within `grace`. Unknown ages count as old.
async fn is_recent(path: &Path, grace: std::time::Duration) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .is_some_and(|age| age < grace)
}
