//! Landing a commit range on a target branch without touching the main
//! working copy.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::errors::{PromoteError, WorktreeError};
use crate::models::MergeStrategy;
use crate::worktree::git;

const IDENTITY: [(&str, &str); 4] = [
    ("GIT_AUTHOR_NAME", "foreman"),
    ("GIT_AUTHOR_EMAIL", "foreman@localhost"),
    ("GIT_COMMITTER_NAME", "foreman"),
    ("GIT_COMMITTER_EMAIL", "foreman@localhost"),
];

pub(super) struct Landing<'a> {
    pub repo: &'a Path,
    pub scratch_dir: &'a Path,
    pub target: &'a str,
    pub base: &'a str,
    pub head: &'a str,
    pub strategy: MergeStrategy,
    pub message: &'a str,
}

impl Landing<'_> {
    /// Apply `base..head` onto `target`. Returns the new target commit, or
    /// `None` when the target already has every change.
    pub async fn land(&self) -> Result<Option<String>, PromoteError> {
        if !git::branch_exists(self.repo, self.target).await? {
            return Err(WorktreeError::BranchNotFound {
                branch: self.target.to_string(),
            }
            .into());
        }
        let old = git::rev_parse(self.repo, self.target).await?;

        tokio::fs::create_dir_all(self.scratch_dir)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", self.scratch_dir.display(), e))?;
        let short = uuid::Uuid::new_v4().simple().to_string();
        let scratch = self.scratch_dir.join(format!("promote-{}", &short[..8]));
        let scratch_str = scratch.to_string_lossy().into_owned();
        git::git(self.repo, &["worktree", "add", "--detach", &scratch_str, &old]).await?;

        let result = self.combine(&scratch).await;
        if let Err(e) = git::remove_worktree(self.repo, &scratch).await {
            tracing::warn!(path = %scratch.display(), error = %e, "Failed to remove promote worktree");
        }
        let Some(new) = result? else {
            return Ok(None);
        };

        self.advance_target(&old, &new).await?;
        Ok(Some(new))
    }

    async fn combine(&self, dir: &Path) -> Result<Option<String>, PromoteError> {
        match self.strategy {
            MergeStrategy::Squash => self.squash(dir).await,
            MergeStrategy::Merge => self.merge(dir).await,
        }
    }

    async fn squash(&self, dir: &Path) -> Result<Option<String>, PromoteError> {
        let patch = patch_path(dir);
        let output_arg = format!("--output={}", patch.to_string_lossy());
        git::git(dir, &["diff", "--binary", &output_arg, self.base, self.head]).await?;
        let patch_str = patch.to_string_lossy().into_owned();
        let applied = git::git_output(dir, &["apply", "--3way", "--index", &patch_str]).await?;
        let _ = tokio::fs::remove_file(&patch).await;
        if !applied.success {
            let files = conflicted_files(dir, &applied.stderr).await;
            return Err(PromoteError::Conflicts {
                files,
                message: applied.stderr,
            });
        }

        let staged = git::git_output(dir, &["diff", "--cached", "--quiet"]).await?;
        if staged.success {
            return Ok(None);
        }
        commit_as_foreman(dir, &["commit", "-q", "--no-verify", "-m", self.message]).await?;
        Ok(Some(git::rev_parse(dir, "HEAD").await?))
    }

    async fn merge(&self, dir: &Path) -> Result<Option<String>, PromoteError> {
        let before = git::rev_parse(dir, "HEAD").await?;
        let merged = commit_as_foreman_output(
            dir,
            &["merge", "--no-ff", "--no-verify", "-m", self.message, self.head],
        )
        .await?;
        if !merged.success {
            let files = conflicted_files(dir, &merged.stderr).await;
            let _ = git::git_output(dir, &["merge", "--abort"]).await;
            let message = if merged.stderr.is_empty() {
                merged.stdout
            } else {
                merged.stderr
            };
            return Err(PromoteError::Conflicts { files, message });
        }
        let after = git::rev_parse(dir, "HEAD").await?;
        Ok((after != before).then_some(after))
    }

    /// Move the target ref. A target checked out in the main working copy
    /// is fast-forwarded there so its files follow.
    async fn advance_target(&self, old: &str, new: &str) -> Result<(), PromoteError> {
        let checked_out = git::current_branch(self.repo).await?;
        if checked_out.as_deref() == Some(self.target) {
            git::git(self.repo, &["merge", "--ff-only", "-q", new]).await?;
        } else {
            let reference = format!("refs/heads/{}", self.target);
            git::git(self.repo, &["update-ref", &reference, new, old]).await?;
        }
        tracing::info!(target = %self.target, from = %old, to = %new, "Advanced target branch");
        Ok(())
    }
}

fn patch_path(dir: &Path) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "promote".into());
    dir.with_file_name(format!("{}.patch", name))
}

/// Unmerged paths in `dir`, plus any file named in apply/merge errors.
async fn conflicted_files(dir: &Path, stderr: &str) -> Vec<String> {
    let mut files: Vec<String> = match git::git(dir, &["diff", "--name-only", "--diff-filter=U"]).await {
        Ok(out) => out.lines().map(String::from).collect(),
        Err(_) => Vec::new(),
    };
    for line in stderr.lines() {
        let named = line
            .strip_prefix("error: patch failed: ")
            .and_then(|rest| rest.rsplit_once(':').map(|(file, _)| file))
            .or_else(|| line.strip_prefix("U "))
            .or_else(|| {
                line.strip_prefix("CONFLICT")
                    .and_then(|rest| rest.rsplit_once(" in "))
                    .map(|(_, file)| file)
            });
        if let Some(file) = named {
            let file = file.trim().to_string();
            if !file.is_empty() && !files.contains(&file) {
                files.push(file);
            }
        }
    }
    files
}

async fn commit_as_foreman_output(dir: &Path, args: &[&str]) -> Result<git::GitOutput, WorktreeError> {
    let output = Command::new("git")
        .args(["-c", "commit.gpgsign=false"])
        .args(args)
        .envs(IDENTITY)
        .env("GIT_TERMINAL_PROMPT", "0")
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run git {}: {}", args.join(" "), e))?;
    Ok(git::GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

async fn commit_as_foreman(dir: &Path, args: &[&str]) -> Result<(), WorktreeError> {
    let output = commit_as_foreman_output(dir, args).await?;
    if !output.success {
        return Err(WorktreeError::Git {
            command: args.join(" "),
            stderr: output.stderr,
        });
    }
    Ok(())
}
