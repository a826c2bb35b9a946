use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::{Db, parse_enum, parse_opt_ts, parse_ts, ts};
use crate::models::*;

const WORKFLOW_COLUMNS: &str = "id, title, source, status, worktree_path, branch_name, base_branch,
    current_step_index, orchestrator_execution_id, orchestrator_session_id, root_stream_id,
    config, created_at, updated_at, started_at, completed_at";

const STEP_COLUMNS: &str = "id, workflow_id, position, task_id, title, status, execution_id,
    depends_on, error, started_at, completed_at";

impl Db {
    // ── Workflow CRUD ─────────────────────────────────────────────────

    /// Insert a workflow and all of its steps atomically.
    pub fn insert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO workflows (id, title, source, status, worktree_path, branch_name, base_branch,
                current_step_index, orchestrator_execution_id, orchestrator_session_id, root_stream_id,
                config, created_at, updated_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                workflow.id,
                workflow.title,
                serde_json::to_string(&workflow.source)?,
                workflow.status.as_str(),
                workflow.worktree_path,
                workflow.branch_name,
                workflow.base_branch,
                workflow.current_step_index,
                workflow.orchestrator_execution_id,
                workflow.orchestrator_session_id,
                workflow.root_stream_id,
                serde_json::to_string(&workflow.config)?,
                ts(&workflow.created_at),
                ts(&workflow.updated_at),
                workflow.started_at.as_ref().map(ts),
                workflow.completed_at.as_ref().map(ts),
            ],
        )
        .context("Failed to insert workflow")?;
        for step in &workflow.steps {
            insert_step(&tx, step)?;
        }
        tx.commit().context("Failed to commit workflow")?;
        Ok(())
    }

    pub fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM workflows WHERE id = ?1", WORKFLOW_COLUMNS),
                params![id],
                WorkflowRow::read,
            )
            .optional()
            .context("Failed to query workflow")?;
        match row {
            Some(row) => {
                let steps = self.get_steps(id)?;
                Ok(Some(row.into_workflow(steps)?))
            }
            None => Ok(None),
        }
    }

    pub fn list_workflows(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM workflows WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at",
                WORKFLOW_COLUMNS
            ))
            .context("Failed to prepare list_workflows")?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], WorkflowRow::read)
            .context("Failed to query workflows")?;
        let mut workflows = Vec::new();
        for row in rows {
            let row = row.context("Failed to read workflow row")?;
            let steps = self.get_steps(&row.id)?;
            workflows.push(row.into_workflow(steps)?);
        }
        Ok(workflows)
    }

    pub fn update_workflow_status(&self, id: &str, status: WorkflowStatus) -> Result<()> {
        let now = Utc::now();
        let started = (status == WorkflowStatus::Running).then(|| ts(&now));
        let completed = status.is_terminal().then(|| ts(&now));
        self.conn
            .execute(
                "UPDATE workflows SET status = ?1, updated_at = ?2,
                    started_at = COALESCE(started_at, ?3),
                    completed_at = COALESCE(completed_at, ?4)
                 WHERE id = ?5",
                params![status.as_str(), ts(&now), started, completed, id],
            )
            .context("Failed to update workflow status")?;
        Ok(())
    }

    /// Record the controlling agent's current execution and session.
    pub fn set_orchestrator(
        &self,
        id: &str,
        execution_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workflows SET orchestrator_execution_id = ?1, orchestrator_session_id = ?2,
                    updated_at = ?3 WHERE id = ?4",
                params![execution_id, session_id, ts(&Utc::now()), id],
            )
            .context("Failed to update workflow orchestrator")?;
        Ok(())
    }

    pub fn set_orchestrator_session(&self, id: &str, session_id: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workflows SET orchestrator_session_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![session_id, ts(&Utc::now()), id],
            )
            .context("Failed to update workflow session")?;
        Ok(())
    }

    pub fn set_workflow_branch(
        &self,
        id: &str,
        branch_name: Option<&str>,
        worktree_path: Option<&str>,
        root_stream_id: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workflows SET branch_name = ?1, worktree_path = ?2, root_stream_id = ?3,
                    updated_at = ?4 WHERE id = ?5",
                params![branch_name, worktree_path, root_stream_id, ts(&Utc::now()), id],
            )
            .context("Failed to update workflow branch")?;
        Ok(())
    }

    pub fn set_current_step_index(&self, id: &str, index: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workflows SET current_step_index = ?1, updated_at = ?2 WHERE id = ?3",
                params![index, ts(&Utc::now()), id],
            )
            .context("Failed to update current step index")?;
        Ok(())
    }

    // ── Steps ─────────────────────────────────────────────────────────

    pub fn get_steps(&self, workflow_id: &str) -> Result<Vec<WorkflowStep>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM workflow_steps WHERE workflow_id = ?1 ORDER BY position",
                STEP_COLUMNS
            ))
            .context("Failed to prepare get_steps")?;
        let rows = stmt
            .query_map(params![workflow_id], StepRow::read)
            .context("Failed to query steps")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("Failed to read step row")?.into_step()?);
        }
        Ok(steps)
    }

    pub fn add_step(&self, step: &WorkflowStep) -> Result<()> {
        insert_step(&self.conn, step)
    }

    pub fn next_step_position(&self, workflow_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) + 1 FROM workflow_steps WHERE workflow_id = ?1",
                params![workflow_id],
                |row| row.get(0),
            )
            .context("Failed to get next step position")
    }

    /// Move a step to `status`, stamping start/finish times as appropriate.
    pub fn update_step_status(
        &self,
        step_id: &str,
        status: StepStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = ts(&Utc::now());
        let started = (status == StepStatus::Running).then(|| now.clone());
        let finished = matches!(
            status,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
        .then(|| now.clone());
        self.conn
            .execute(
                "UPDATE workflow_steps SET status = ?1, error = ?2,
                    started_at = CASE WHEN ?3 IS NULL THEN started_at ELSE ?3 END,
                    completed_at = ?4
                 WHERE id = ?5",
                params![status.as_str(), error, started, finished, step_id],
            )
            .context("Failed to update step status")?;
        Ok(())
    }

    pub fn bind_step_execution(&self, step_id: &str, execution_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workflow_steps SET execution_id = ?1 WHERE id = ?2",
                params![execution_id, step_id],
            )
            .context("Failed to bind step execution")?;
        Ok(())
    }
}

fn insert_step(conn: &rusqlite::Connection, step: &WorkflowStep) -> Result<()> {
    conn.execute(
        "INSERT INTO workflow_steps (id, workflow_id, position, task_id, title, status,
            execution_id, depends_on, error, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            step.id,
            step.workflow_id,
            step.position,
            step.task_id,
            step.title,
            step.status.as_str(),
            step.execution_id,
            serde_json::to_string(&step.depends_on)?,
            step.error,
            step.started_at.as_ref().map(ts),
            step.completed_at.as_ref().map(ts),
        ],
    )
    .with_context(|| format!("Failed to insert step for task {}", step.task_id))?;
    Ok(())
}

/// Intermediate row struct for workflows before typed parsing.
struct WorkflowRow {
    id: String,
    title: String,
    source: String,
    status: String,
    worktree_path: Option<String>,
    branch_name: Option<String>,
    base_branch: Option<String>,
    current_step_index: i64,
    orchestrator_execution_id: Option<String>,
    orchestrator_session_id: Option<String>,
    root_stream_id: Option<String>,
    config: String,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl WorkflowRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            source: row.get(2)?,
            status: row.get(3)?,
            worktree_path: row.get(4)?,
            branch_name: row.get(5)?,
            base_branch: row.get(6)?,
            current_step_index: row.get(7)?,
            orchestrator_execution_id: row.get(8)?,
            orchestrator_session_id: row.get(9)?,
            root_stream_id: row.get(10)?,
            config: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            started_at: row.get(14)?,
            completed_at: row.get(15)?,
        })
    }

    fn into_workflow(self, steps: Vec<WorkflowStep>) -> Result<Workflow> {
        let source: WorkflowSource =
            serde_json::from_str(&self.source).context("Failed to parse workflow source JSON")?;
        let config: WorkflowConfig =
            serde_json::from_str(&self.config).context("Failed to parse workflow config JSON")?;
        Ok(Workflow {
            status: parse_enum(&self.status, "workflow status")?,
            id: self.id,
            title: self.title,
            source,
            steps,
            worktree_path: self.worktree_path,
            branch_name: self.branch_name,
            base_branch: self.base_branch,
            current_step_index: self.current_step_index,
            orchestrator_execution_id: self.orchestrator_execution_id,
            orchestrator_session_id: self.orchestrator_session_id,
            root_stream_id: self.root_stream_id,
            config,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

struct StepRow {
    id: String,
    workflow_id: String,
    position: i64,
    task_id: String,
    title: String,
    status: String,
    execution_id: Option<String>,
    depends_on: String,
    error: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl StepRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            position: row.get(2)?,
            task_id: row.get(3)?,
            title: row.get(4)?,
            status: row.get(5)?,
            execution_id: row.get(6)?,
            depends_on: row.get(7)?,
            error: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
        })
    }

    fn into_step(self) -> Result<WorkflowStep> {
        let depends_on: Vec<String> =
            serde_json::from_str(&self.depends_on).context("Failed to parse depends_on JSON")?;
        let started_at: Option<DateTime<Utc>> = parse_opt_ts(self.started_at)?;
        Ok(WorkflowStep {
            status: parse_enum(&self.status, "step status")?,
            id: self.id,
            workflow_id: self.workflow_id,
            position: self.position,
            task_id: self.task_id,
            title: self.title,
            execution_id: self.execution_id,
            depends_on,
            error: self.error,
            started_at,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}
