//! Shared fixtures for unit tests: temporary repositories, an in-memory
//! database and a runner that only records what it was asked to do.

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use crate::db::{Db, DbHandle, ExecutionPatch};
use crate::errors::LaunchError;
use crate::models::{ExecutionStatus, Workflow, WorkflowConfig, WorkflowSource, WorkflowStatus};
use crate::runner::{AgentRunner, LaunchRequest};
use crate::worktree::{WorktreeManager, WorktreeSettings, git};

pub fn memory_db() -> DbHandle {
    DbHandle::new(Db::new_in_memory().unwrap())
}

/// Insert a running workflow with no steps and return its id.
pub fn insert_workflow(db: &DbHandle, title: &str) -> String {
    let now = Utc::now();
    let workflow = Workflow {
        id: uuid::Uuid::new_v4().to_string(),
        title: title.to_string(),
        source: WorkflowSource::Goal {
            goal: title.to_string(),
        },
        status: WorkflowStatus::Running,
        steps: vec![],
        worktree_path: None,
        branch_name: None,
        base_branch: Some("main".into()),
        current_step_index: 0,
        orchestrator_execution_id: None,
        orchestrator_session_id: None,
        root_stream_id: None,
        config: WorkflowConfig::default(),
        created_at: now,
        updated_at: now,
        started_at: Some(now),
        completed_at: None,
    };
    db.lock_sync().unwrap().insert_workflow(&workflow).unwrap();
    workflow.id
}

/// Commit a file in `dir` through the git CLI.
pub async fn commit_file(dir: &Path, name: &str, content: &str) -> String {
    tokio::fs::write(dir.join(name), content).await.unwrap();
    git::git(dir, &["add", "-A"]).await.unwrap();
    git::git(dir, &["commit", "-q", "-m", &format!("update {}", name)])
        .await
        .unwrap();
    git::rev_parse(dir, "HEAD").await.unwrap()
}

/// A git repository on `main` with one commit, plus a fresh database.
pub struct TestRepo {
    dir: TempDir,
    pub db: DbHandle,
}

impl TestRepo {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path();
        git::git(path, &["init", "-q"]).await.unwrap();
        git::git(path, &["symbolic-ref", "HEAD", "refs/heads/main"])
            .await
            .unwrap();
        git::git(path, &["config", "user.name", "test"]).await.unwrap();
        git::git(path, &["config", "user.email", "test@test.com"])
            .await
            .unwrap();
        git::git(path, &["config", "commit.gpgsign", "false"])
            .await
            .unwrap();
        tokio::fs::write(path.join(".gitignore"), ".foreman/\n")
            .await
            .unwrap();
        commit_file(path, "README.md", "# test\n").await;
        Self {
            dir,
            db: memory_db(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub async fn head(&self) -> String {
        git::rev_parse(self.path(), "HEAD").await.unwrap()
    }

    pub fn worktree_settings(&self) -> WorktreeSettings {
        let mut settings = WorktreeSettings::for_repo(self.path());
        settings.orphan_grace = std::time::Duration::ZERO;
        settings
    }

    pub fn worktree_manager(&self) -> WorktreeManager {
        WorktreeManager::new(self.db.clone(), self.worktree_settings())
    }

    pub async fn set_status(&self, execution_id: &str, status: ExecutionStatus) {
        let id = execution_id.to_string();
        self.db
            .call(move |db| db.update_execution(&id, &ExecutionPatch::status(status)))
            .await
            .unwrap();
    }
}

/// Records launches and cancels without starting anything.
#[derive(Default)]
pub struct RecordingRunner {
    launches: Mutex<Vec<LaunchRequest>>,
    cancels: Mutex<Vec<String>>,
    fail_launches: AtomicBool,
}

impl RecordingRunner {
    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().unwrap().clone()
    }

    pub fn last_launch(&self) -> LaunchRequest {
        self.launches().pop().expect("no launches recorded")
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentRunner for RecordingRunner {
    async fn launch(&self, request: LaunchRequest) -> Result<(), LaunchError> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(LaunchError::Other(anyhow::anyhow!("launch refused")));
        }
        self.launches.lock().unwrap().push(request);
        Ok(())
    }

    async fn cancel(&self, execution_id: &str) -> anyhow::Result<bool> {
        self.cancels.lock().unwrap().push(execution_id.to_string());
        Ok(true)
    }
}
