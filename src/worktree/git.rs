//! Thin async wrappers over the git CLI for worktree plumbing.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::process::Command;

use crate::errors::WorktreeError;

/// Output of a git invocation that exited, successfully or not.
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run git in `dir` and capture its output without judging the exit code.
pub async fn git_output(dir: &Path, args: &[&str]) -> Result<GitOutput, WorktreeError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Run git in `dir`, returning trimmed stdout or a `Git` error with stderr.
pub async fn git(dir: &Path, args: &[&str]) -> Result<String, WorktreeError> {
    let output = git_output(dir, args).await?;
    if !output.success {
        return Err(WorktreeError::Git {
            command: args.join(" "),
            stderr: output.stderr,
        });
    }
    Ok(output.stdout)
}

pub async fn is_repository(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    matches!(
        git_output(path, &["rev-parse", "--git-dir"]).await,
        Ok(GitOutput { success: true, .. })
    )
}

pub async fn branch_exists(repo: &Path, branch: &str) -> Result<bool, WorktreeError> {
    let reference = format!("refs/heads/{}", branch);
    let output = git_output(repo, &["show-ref", "--verify", "--quiet", &reference]).await?;
    Ok(output.success)
}

pub async fn rev_parse(dir: &Path, rev: &str) -> Result<String, WorktreeError> {
    let spec = format!("{}^{{commit}}", rev);
    git(dir, &["rev-parse", "--verify", &spec]).await
}

/// Branch checked out in `dir`, or `None` when HEAD is detached.
pub async fn current_branch(dir: &Path) -> Result<Option<String>, WorktreeError> {
    let output = git_output(dir, &["symbolic-ref", "--short", "-q", "HEAD"]).await?;
    Ok(output
        .success
        .then_some(output.stdout)
        .filter(|b| !b.is_empty()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<String>,
    pub prunable: bool,
}

/// Parse `git worktree list --porcelain`.
pub fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(done) = current.take() {
                entries.push(done);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                prunable: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(branch.trim_start_matches("refs/heads/").to_string());
        } else if line.starts_with("prunable") {
            entry.prunable = true;
        }
    }
    if let Some(done) = current {
        entries.push(done);
    }
    entries
}

pub async fn list_worktrees(repo: &Path) -> Result<Vec<WorktreeEntry>, WorktreeError> {
    let porcelain = git(repo, &["worktree", "list", "--porcelain"]).await?;
    Ok(parse_worktree_list(&porcelain))
}

/// Remove a worktree directory and its registration.
///
/// Falls back to deleting the directory and pruning when git refuses, and
/// treats an already-missing worktree as success.
pub async fn remove_worktree(repo: &Path, path: &Path) -> Result<(), WorktreeError> {
    let path_str = path.to_string_lossy();
    let output = git_output(repo, &["worktree", "remove", "--force", &path_str]).await?;
    if !output.success {
        tracing::debug!(path = %path.display(), stderr = %output.stderr, "git worktree remove failed, deleting directory");
        if path.exists() {
            tokio::fs::remove_dir_all(path)
                .await
                .with_context(|| format!("Failed to delete worktree directory {}", path.display()))?;
        }
    }
    git(repo, &["worktree", "prune"]).await?;
    Ok(())
}

pub async fn delete_branch(repo: &Path, branch: &str) -> Result<(), WorktreeError> {
    git(repo, &["branch", "-D", branch]).await.map(|_| ())
}
