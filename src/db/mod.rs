//! SQLite persistence for workflows, executions, lineage and events.

mod events;
mod executions;
mod lineage;
mod workflows;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

pub use executions::ExecutionPatch;

/// Async-safe handle to the foreman database.
///
/// Wraps `Db` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Db>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflows (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    source TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    worktree_path TEXT,
                    branch_name TEXT,
                    base_branch TEXT,
                    current_step_index INTEGER NOT NULL DEFAULT 0,
                    orchestrator_execution_id TEXT,
                    orchestrator_session_id TEXT,
                    root_stream_id TEXT,
                    config TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS workflow_steps (
                    id TEXT PRIMARY KEY,
                    workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    task_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    execution_id TEXT,
                    depends_on TEXT NOT NULL DEFAULT '[]',
                    error TEXT,
                    started_at TEXT,
                    completed_at TEXT,
                    UNIQUE(workflow_id, task_id)
                );

                CREATE TABLE IF NOT EXISTS executions (
                    id TEXT PRIMARY KEY,
                    task_id TEXT,
                    workflow_id TEXT,
                    agent_type TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    repo_path TEXT NOT NULL,
                    before_commit TEXT,
                    after_commit TEXT,
                    worktree_path TEXT,
                    branch_name TEXT,
                    target_branch TEXT,
                    parent_execution_id TEXT,
                    stream_id TEXT,
                    session_id TEXT,
                    config TEXT NOT NULL DEFAULT '{}',
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS streams (
                    id TEXT PRIMARY KEY,
                    parent_stream TEXT,
                    workflow_id TEXT,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS checkpoints (
                    id TEXT PRIMARY KEY,
                    stream_id TEXT NOT NULL REFERENCES streams(id),
                    execution_id TEXT,
                    task_id TEXT,
                    commit_sha TEXT NOT NULL,
                    parent_commit TEXT,
                    files_changed INTEGER NOT NULL DEFAULT 0,
                    insertions INTEGER NOT NULL DEFAULT 0,
                    deletions INTEGER NOT NULL DEFAULT 0,
                    files TEXT NOT NULL DEFAULT '[]',
                    checkpointed_at TEXT NOT NULL,
                    review_status TEXT NOT NULL DEFAULT 'pending',
                    reviewed_by TEXT,
                    reviewed_at TEXT,
                    review_notes TEXT
                );

                CREATE TABLE IF NOT EXISTS promotions (
                    id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL,
                    checkpoint_id TEXT NOT NULL,
                    target_branch TEXT NOT NULL,
                    strategy TEXT NOT NULL,
                    merge_commit TEXT NOT NULL,
                    files_changed INTEGER NOT NULL DEFAULT 0,
                    insertions INTEGER NOT NULL DEFAULT 0,
                    deletions INTEGER NOT NULL DEFAULT 0,
                    files TEXT NOT NULL DEFAULT '[]',
                    promoted_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    processed_at TEXT,
                    processed_by TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_steps_workflow ON workflow_steps(workflow_id, position);
                CREATE INDEX IF NOT EXISTS idx_executions_task ON executions(task_id, status);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_one_active_per_task ON executions(task_id)
                    WHERE task_id IS NOT NULL AND status IN ('pending', 'preparing', 'running');
                CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id);
                CREATE INDEX IF NOT EXISTS idx_checkpoints_stream ON checkpoints(stream_id, checkpointed_at);
                CREATE INDEX IF NOT EXISTS idx_checkpoints_task ON checkpoints(task_id, checkpointed_at);
                CREATE INDEX IF NOT EXISTS idx_promotions_task ON promotions(task_id);
                CREATE INDEX IF NOT EXISTS idx_events_pending ON workflow_events(workflow_id, processed_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Timestamps are stored with fixed precision so text order is time order.
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", raw))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

pub(crate) fn parse_enum<T>(raw: &str, what: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    T::from_str(raw)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}
