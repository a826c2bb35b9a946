use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{ErrorCode, OptionalExtension, Row, params};

use super::{Db, parse_enum, parse_opt_ts, parse_ts, ts};
use crate::models::*;

const EXECUTION_COLUMNS: &str = "id, task_id, workflow_id, agent_type, mode, status, repo_path,
    before_commit, after_commit, worktree_path, branch_name, target_branch, parent_execution_id,
    stream_id, session_id, config, error, created_at, updated_at, completed_at";

/// Partial update of an execution. `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub after_commit: Option<String>,
    pub session_id: Option<String>,
    pub error: Option<String>,
}

impl ExecutionPatch {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

impl Db {
    pub fn insert_execution(&self, execution: &Execution) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO executions ({}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                    EXECUTION_COLUMNS
                ),
                params![
                    execution.id,
                    execution.task_id,
                    execution.workflow_id,
                    execution.agent_type,
                    execution.mode.as_str(),
                    execution.status.as_str(),
                    execution.repo_path,
                    execution.before_commit,
                    execution.after_commit,
                    execution.worktree_path,
                    execution.branch_name,
                    execution.target_branch,
                    execution.parent_execution_id,
                    execution.stream_id,
                    execution.session_id,
                    serde_json::to_string(&execution.config)?,
                    execution.error,
                    ts(&execution.created_at),
                    ts(&execution.updated_at),
                    execution.completed_at.as_ref().map(ts),
                ],
            )
            .context("Failed to insert execution")?;
        Ok(())
    }

    pub fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                params![id],
                ExecutionRow::read,
            )
            .optional()
            .context("Failed to query execution")?
            .map(ExecutionRow::into_execution)
            .transpose()
    }

    /// Apply a patch. Terminal statuses also stamp `completed_at`.
    /// `worktree_path` is write-once and never touched here.
    pub fn update_execution(&self, id: &str, patch: &ExecutionPatch) -> Result<()> {
        let now = ts(&Utc::now());
        let completed = patch
            .status
            .filter(|s| s.is_terminal())
            .map(|_| now.clone());
        self.conn
            .execute(
                "UPDATE executions SET
                    status = COALESCE(?1, status),
                    after_commit = COALESCE(?2, after_commit),
                    session_id = COALESCE(?3, session_id),
                    error = COALESCE(?4, error),
                    completed_at = COALESCE(completed_at, ?5),
                    updated_at = ?6
                 WHERE id = ?7",
                params![
                    patch.status.map(|s| s.as_str()),
                    patch.after_commit,
                    patch.session_id,
                    patch.error,
                    completed,
                    now,
                    id
                ],
            )
            .context("Failed to update execution")?;
        Ok(())
    }

    /// The execution currently claiming `task_id`, if any.
    /// Insert `execution` unless its task already has an active execution.
    /// The check and the insert are one transaction; the conflicting
    /// execution is returned instead of inserting.
    pub fn insert_execution_if_task_idle(&self, execution: &Execution) -> Result<Option<Execution>> {
        let Some(task_id) = execution.task_id.as_deref() else {
            self.insert_execution(execution)?;
            return Ok(None);
        };
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin execution insert")?;
        if let Some(active) = self.active_execution_for_task(task_id)? {
            return Ok(Some(active));
        }
        match self.insert_execution(execution) {
            Ok(()) => {}
            // Another connection won between the check and the insert.
            Err(e) if is_constraint_violation(&e) => {
                drop(tx);
                return match self.active_execution_for_task(task_id)? {
                    Some(active) => Ok(Some(active)),
                    None => Err(e),
                };
            }
            Err(e) => return Err(e),
        }
        tx.commit().context("Failed to commit execution insert")?;
        Ok(None)
    }

    pub fn active_execution_for_task(&self, task_id: &str) -> Result<Option<Execution>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM executions
                     WHERE task_id = ?1 AND status IN ('pending', 'preparing', 'running')
                     ORDER BY created_at DESC LIMIT 1",
                    EXECUTION_COLUMNS
                ),
                params![task_id],
                ExecutionRow::read,
            )
            .optional()
            .context("Failed to query active execution")?
            .map(ExecutionRow::into_execution)
            .transpose()
    }

    pub fn latest_execution_for_task(&self, task_id: &str) -> Result<Option<Execution>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM executions WHERE task_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    EXECUTION_COLUMNS
                ),
                params![task_id],
                ExecutionRow::read,
            )
            .optional()
            .context("Failed to query latest execution")?
            .map(ExecutionRow::into_execution)
            .transpose()
    }

    pub fn executions_with_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>> {
        let wanted: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM executions WHERE status IN (SELECT value FROM json_each(?1))
                 ORDER BY created_at",
                EXECUTION_COLUMNS
            ))
            .context("Failed to prepare executions_with_status")?;
        let rows = stmt
            .query_map(params![serde_json::to_string(&wanted)?], ExecutionRow::read)
            .context("Failed to query executions")?;
        collect_executions(rows)
    }

    pub fn executions_for_workflow(&self, workflow_id: &str) -> Result<Vec<Execution>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM executions WHERE workflow_id = ?1 ORDER BY created_at",
                EXECUTION_COLUMNS
            ))
            .context("Failed to prepare executions_for_workflow")?;
        let rows = stmt
            .query_map(params![workflow_id], ExecutionRow::read)
            .context("Failed to query workflow executions")?;
        collect_executions(rows)
    }

    pub fn find_execution_by_worktree(&self, worktree_path: &str) -> Result<Option<Execution>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM executions WHERE worktree_path = ?1
                     ORDER BY created_at DESC LIMIT 1",
                    EXECUTION_COLUMNS
                ),
                params![worktree_path],
                ExecutionRow::read,
            )
            .optional()
            .context("Failed to query execution by worktree")?
            .map(ExecutionRow::into_execution)
            .transpose()
    }
}

fn collect_executions(
    rows: impl Iterator<Item = rusqlite::Result<ExecutionRow>>,
) -> Result<Vec<Execution>> {
    let mut executions = Vec::new();
    for row in rows {
        executions.push(row.context("Failed to read execution row")?.into_execution()?);
    }
    Ok(executions)
}

/// Intermediate row struct for executions.
struct ExecutionRow {
    id: String,
    task_id: Option<String>,
    workflow_id: Option<String>,
    agent_type: String,
    mode: String,
    status: String,
    repo_path: String,
    before_commit: Option<String>,
    after_commit: Option<String>,
    worktree_path: Option<String>,
    branch_name: Option<String>,
    target_branch: Option<String>,
    parent_execution_id: Option<String>,
    stream_id: Option<String>,
    session_id: Option<String>,
    config: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            workflow_id: row.get(2)?,
            agent_type: row.get(3)?,
            mode: row.get(4)?,
            status: row.get(5)?,
            repo_path: row.get(6)?,
            before_commit: row.get(7)?,
            after_commit: row.get(8)?,
            worktree_path: row.get(9)?,
            branch_name: row.get(10)?,
            target_branch: row.get(11)?,
            parent_execution_id: row.get(12)?,
            stream_id: row.get(13)?,
            session_id: row.get(14)?,
            config: row.get(15)?,
            error: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
            completed_at: row.get(19)?,
        })
    }

    fn into_execution(self) -> Result<Execution> {
        let config: ExecutionConfig =
            serde_json::from_str(&self.config).context("Failed to parse execution config JSON")?;
        Ok(Execution {
            mode: parse_enum(&self.mode, "execution mode")?,
            status: parse_enum(&self.status, "execution status")?,
            id: self.id,
            task_id: self.task_id,
            workflow_id: self.workflow_id,
            agent_type: self.agent_type,
            repo_path: self.repo_path,
            before_commit: self.before_commit,
            after_commit: self.after_commit,
            worktree_path: self.worktree_path,
            branch_name: self.branch_name,
            target_branch: self.target_branch,
            parent_execution_id: self.parent_execution_id,
            stream_id: self.stream_id,
            session_id: self.session_id,
            config,
            error: self.error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

fn is_constraint_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution(id: &str, task_id: Option<&str>, status: ExecutionStatus) -> Execution {
        let now = Utc::now();
        Execution {
            id: id.into(),
            task_id: task_id.map(String::from),
            workflow_id: None,
            agent_type: "claude".into(),
            mode: ExecutionMode::Worktree,
            status,
            repo_path: "/repo".into(),
            before_commit: Some("abc".into()),
            after_commit: None,
            worktree_path: Some(format!("/repo/.foreman/worktrees/{}", id)),
            branch_name: None,
            target_branch: Some("main".into()),
            parent_execution_id: None,
            stream_id: None,
            session_id: None,
            config: ExecutionConfig::default(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[test]
    fn test_insert_and_patch_execution() -> Result<()> {
        let db = Db::new_in_memory()?;
        db.insert_execution(&execution("e1", Some("t1"), ExecutionStatus::Running))?;

        db.update_execution(
            "e1",
            &ExecutionPatch {
                status: Some(ExecutionStatus::Completed),
                after_commit: Some("def".into()),
                session_id: Some("sess".into()),
                error: None,
            },
        )?;
        let exec = db.get_execution("e1")?.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.after_commit.as_deref(), Some("def"));
        assert_eq!(exec.session_id.as_deref(), Some("sess"));
        assert!(exec.completed_at.is_some());
        // Untouched columns survive.
        assert_eq!(exec.worktree_path.as_deref(), Some("/repo/.foreman/worktrees/e1"));
        Ok(())
    }

    #[test]
    fn test_active_execution_for_task() -> Result<()> {
        let db = Db::new_in_memory()?;
        db.insert_execution(&execution("old", Some("t1"), ExecutionStatus::Failed))?;
        assert!(db.active_execution_for_task("t1")?.is_none());

        db.insert_execution(&execution("new", Some("t1"), ExecutionStatus::Preparing))?;
        assert_eq!(db.active_execution_for_task("t1")?.unwrap().id, "new");
        assert_eq!(db.latest_execution_for_task("t1")?.unwrap().id, "new");
        Ok(())
    }

    #[test]
    fn test_executions_with_status() -> Result<()> {
        let db = Db::new_in_memory()?;
        db.insert_execution(&execution("a", None, ExecutionStatus::Running))?;
        db.insert_execution(&execution("b", None, ExecutionStatus::Preparing))?;
        db.insert_execution(&execution("c", None, ExecutionStatus::Completed))?;

        let active = db.executions_with_status(&[
            ExecutionStatus::Running,
            ExecutionStatus::Preparing,
        ])?;
        let ids: Vec<_> = active.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a") && ids.contains(&"b"));
        Ok(())
    }

    #[test]
    fn test_find_execution_by_worktree() -> Result<()> {
        let db = Db::new_in_memory()?;
        db.insert_execution(&execution("e9", None, ExecutionStatus::Completed))?;
        let found = db.find_execution_by_worktree("/repo/.foreman/worktrees/e9")?;
        assert_eq!(found.unwrap().id, "e9");
        assert!(db.find_execution_by_worktree("/elsewhere")?.is_none());
        Ok(())
    }

    #[test]
    fn test_one_active_execution_per_task() -> Result<()> {
        let db = Db::new_in_memory()?;
        assert!(
            db.insert_execution_if_task_idle(&execution("e1", Some("t1"), ExecutionStatus::Preparing))?
                .is_none()
        );
        let conflict = db.insert_execution_if_task_idle(&execution("e2", Some("t1"), ExecutionStatus::Preparing))?;
        assert_eq!(conflict.unwrap().id, "e1");
        assert!(db.get_execution("e2")?.is_none());

        // The index rejects a blind insert too.
        let err = db
            .insert_execution(&execution("e3", Some("t1"), ExecutionStatus::Running))
            .unwrap_err();
        assert!(is_constraint_violation(&err));

        // Once the first one is done, the task is free again.
        db.update_execution("e1", &ExecutionPatch::status(ExecutionStatus::Failed))?;
        assert!(
            db.insert_execution_if_task_idle(&execution("e4", Some("t1"), ExecutionStatus::Preparing))?
                .is_none()
        );
        // Executions without a task are never in conflict.
        db.insert_execution_if_task_idle(&execution("o1", None, ExecutionStatus::Running))?;
        assert!(
            db.insert_execution_if_task_idle(&execution("o2", None, ExecutionStatus::Running))?
                .is_none()
        );
        Ok(())
    }
}
