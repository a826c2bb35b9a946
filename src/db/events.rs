use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Row, params};

use super::{Db, parse_opt_ts, parse_ts, ts};
use crate::models::{EventRecord, WorkflowEvent};

impl Db {
    /// Append an event to the workflow's log. Events are never rewritten,
    /// only marked processed.
    pub fn append_event(&self, workflow_id: &str, event: &WorkflowEvent) -> Result<EventRecord> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO workflow_events (workflow_id, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    workflow_id,
                    event.event_type(),
                    serde_json::to_string(event)?,
                    ts(&now)
                ],
            )
            .with_context(|| format!("Failed to append {} event", event.event_type()))?;
        Ok(EventRecord {
            id: self.conn.last_insert_rowid(),
            workflow_id: workflow_id.to_string(),
            event: event.clone(),
            created_at: now,
            processed_at: None,
            processed_by: None,
        })
    }

    pub fn unprocessed_events(&self, workflow_id: &str) -> Result<Vec<EventRecord>> {
        self.query_events(
            "SELECT id, workflow_id, payload, created_at, processed_at, processed_by
             FROM workflow_events WHERE workflow_id = ?1 AND processed_at IS NULL ORDER BY id",
            workflow_id,
        )
    }

    pub fn events_for_workflow(&self, workflow_id: &str) -> Result<Vec<EventRecord>> {
        self.query_events(
            "SELECT id, workflow_id, payload, created_at, processed_at, processed_by
             FROM workflow_events WHERE workflow_id = ?1 ORDER BY id",
            workflow_id,
        )
    }

    /// Mark events consumed by the wakeup that ran as `execution_id`.
    pub fn mark_events_processed(&self, ids: &[i64], execution_id: &str) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let updated = self
            .conn
            .execute(
                "UPDATE workflow_events SET processed_at = ?1, processed_by = ?2
                 WHERE processed_at IS NULL AND id IN (SELECT value FROM json_each(?3))",
                params![ts(&Utc::now()), execution_id, serde_json::to_string(ids)?],
            )
            .context("Failed to mark events processed")?;
        Ok(updated)
    }

    fn query_events(&self, sql: &str, workflow_id: &str) -> Result<Vec<EventRecord>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare event query")?;
        let rows = stmt
            .query_map(params![workflow_id], read_event)
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            let (id, workflow_id, payload, created_at, processed_at, processed_by) =
                row.context("Failed to read event row")?;
            let event: WorkflowEvent = serde_json::from_str(&payload)
                .with_context(|| format!("Failed to parse event {} payload", id))?;
            events.push(EventRecord {
                id,
                workflow_id,
                event,
                created_at: parse_ts(&created_at)?,
                processed_at: parse_opt_ts(processed_at)?,
                processed_by,
            });
        }
        Ok(events)
    }
}

type EventTuple = (
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn read_event(row: &Row<'_>) -> rusqlite::Result<EventTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;

    fn db_with_workflow() -> Result<Db> {
        let db = Db::new_in_memory()?;
        let now = Utc::now();
        db.insert_workflow(&Workflow {
            id: "wf".into(),
            title: "events".into(),
            source: WorkflowSource::Goal { goal: "g".into() },
            status: WorkflowStatus::Running,
            steps: vec![],
            worktree_path: None,
            branch_name: None,
            base_branch: None,
            current_step_index: 0,
            orchestrator_execution_id: None,
            orchestrator_session_id: None,
            root_stream_id: None,
            config: WorkflowConfig::default(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })?;
        Ok(db)
    }

    #[test]
    fn test_events_append_in_order_and_mark_processed() -> Result<()> {
        let db = db_with_workflow()?;
        let first = db.append_event("wf", &WorkflowEvent::WorkflowResumed)?;
        let second = db.append_event(
            "wf",
            &WorkflowEvent::UserResponse {
                message: "ship it".into(),
            },
        )?;
        assert!(second.id > first.id);

        let pending = db.unprocessed_events("wf")?;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].event.event_type(), "user_response");

        assert_eq!(db.mark_events_processed(&[first.id], "exec-1")?, 1);
        let pending = db.unprocessed_events("wf")?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);

        // Processed events stay in the log.
        let all = db.events_for_workflow("wf")?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].processed_by.as_deref(), Some("exec-1"));
        Ok(())
    }

    #[test]
    fn test_marking_twice_is_a_noop() -> Result<()> {
        let db = db_with_workflow()?;
        let event = db.append_event("wf", &WorkflowEvent::WorkflowResumed)?;
        assert_eq!(db.mark_events_processed(&[event.id], "a")?, 1);
        assert_eq!(db.mark_events_processed(&[event.id], "b")?, 0);
        assert_eq!(db.mark_events_processed(&[], "c")?, 0);
        Ok(())
    }
}
