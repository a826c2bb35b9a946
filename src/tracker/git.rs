use std::path::Path;

use anyhow::{Context, Result};
use git2::{DiffOptions, Oid, Repository, Signature, StatusOptions};

use crate::models::DiffStats;

/// Read-mostly git access through libgit2.
///
/// Every method is synchronous; async callers go through `spawn_blocking`.
pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)
            .with_context(|| format!("Failed to open git repository at {}", path.display()))?;
        Ok(Self { repo })
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Get current HEAD SHA (returns None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.get_head_commit().map(|c| c.id().to_string())
    }

    /// Short name of the checked-out branch, if HEAD is not detached.
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if !head.is_branch() {
            return None;
        }
        head.shorthand().map(String::from)
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo
            .find_branch(name, git2::BranchType::Local)
            .is_ok()
    }

    /// Resolve any revision (branch, tag, sha) to a commit sha.
    pub fn resolve(&self, rev: &str) -> Result<String> {
        let object = self
            .repo
            .revparse_single(rev)
            .with_context(|| format!("Unknown revision '{}'", rev))?;
        let commit = object
            .peel_to_commit()
            .with_context(|| format!("Revision '{}' is not a commit", rev))?;
        Ok(commit.id().to_string())
    }

    /// Whether the working tree has staged, unstaged or untracked changes.
    pub fn is_dirty(&self) -> Result<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .context("Failed to read working tree status")?;
        Ok(!statuses.is_empty())
    }

    /// Commit everything in the working tree onto HEAD.
    ///
    /// Returns `None` when the tree matches HEAD and there is nothing to commit.
    pub fn commit_all(&self, message: &str) -> Result<Option<String>> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = self.get_head_commit();
        if parent.as_ref().is_some_and(|p| p.tree_id() == tree_id) {
            return Ok(None);
        }
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("foreman", "foreman@localhost")?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .context("Failed to commit working tree")?;
        Ok(Some(commit_id.to_string()))
    }

    /// Line and file counts between two commits.
    pub fn diff_stats(&self, from: &str, to: &str) -> Result<DiffStats> {
        let diff = self.tree_diff(from, to)?;
        let mut stats = DiffStats::default();
        diff.foreach(
            &mut |delta, _progress| {
                let path = delta.new_file().path().or_else(|| delta.old_file().path());
                if let Some(path) = path {
                    stats.files.push(path.to_string_lossy().into_owned());
                }
                true
            },
            None,
            None,
            Some(&mut |_delta, _hunk, line| {
                match line.origin() {
                    '+' => stats.insertions += 1,
                    '-' => stats.deletions += 1,
                    _ => {}
                }
                true
            }),
        )?;
        stats.files_changed = stats.files.len() as i64;
        Ok(stats)
    }

    /// Unified diff text between two commits.
    pub fn diff_text(&self, from: &str, to: &str) -> Result<String> {
        let diff = self.tree_diff(from, to)?;
        let mut buf = Vec::new();
        diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                buf.push(line.origin() as u8);
            }
            buf.extend_from_slice(line.content());
            true
        })?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn tree_diff(&self, from: &str, to: &str) -> Result<git2::Diff<'_>> {
        let from_tree = self.commit_tree(from)?;
        let to_tree = self.commit_tree(to)?;
        let mut opts = DiffOptions::new();
        self.repo
            .diff_tree_to_tree(Some(&from_tree), Some(&to_tree), Some(&mut opts))
            .with_context(|| format!("Failed to diff {}..{}", from, to))
    }

    fn commit_tree(&self, rev: &str) -> Result<git2::Tree<'_>> {
        let oid = Oid::from_str(&self.resolve(rev)?)?;
        Ok(self.repo.find_commit(oid)?.tree()?)
    }
}
