use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::{Db, parse_enum, parse_opt_ts, parse_ts, ts};
use crate::models::*;

const CHECKPOINT_COLUMNS: &str = "id, stream_id, execution_id, task_id, commit_sha, parent_commit,
    files_changed, insertions, deletions, files, checkpointed_at, review_status, reviewed_by,
    reviewed_at, review_notes";

impl Db {
    // ── Streams ───────────────────────────────────────────────────────

    pub fn insert_stream(&self, stream: &Stream, workflow_id: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO streams (id, parent_stream, workflow_id, name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    stream.id,
                    stream.parent_stream,
                    workflow_id,
                    stream.name,
                    ts(&stream.created_at)
                ],
            )
            .context("Failed to insert stream")?;
        Ok(())
    }

    pub fn get_stream(&self, id: &str) -> Result<Option<Stream>> {
        self.conn
            .query_row(
                "SELECT id, parent_stream, name, created_at FROM streams WHERE id = ?1",
                params![id],
                read_stream,
            )
            .optional()
            .context("Failed to query stream")?
            .map(into_stream)
            .transpose()
    }

    pub fn streams_for_workflow(&self, workflow_id: &str) -> Result<Vec<Stream>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, parent_stream, name, created_at FROM streams
                 WHERE workflow_id = ?1 ORDER BY created_at, id",
            )
            .context("Failed to prepare streams_for_workflow")?;
        let rows = stmt
            .query_map(params![workflow_id], read_stream)
            .context("Failed to query streams")?;
        let mut streams = Vec::new();
        for row in rows {
            streams.push(into_stream(row.context("Failed to read stream row")?)?);
        }
        Ok(streams)
    }

    pub fn list_streams(&self) -> Result<Vec<Stream>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, parent_stream, name, created_at FROM streams ORDER BY created_at, id")
            .context("Failed to prepare list_streams")?;
        let rows = stmt
            .query_map([], read_stream)
            .context("Failed to query streams")?;
        let mut streams = Vec::new();
        for row in rows {
            streams.push(into_stream(row.context("Failed to read stream row")?)?);
        }
        Ok(streams)
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    pub fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO checkpoints ({}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    CHECKPOINT_COLUMNS
                ),
                params![
                    checkpoint.id,
                    checkpoint.stream_id,
                    checkpoint.execution_id,
                    checkpoint.task_id,
                    checkpoint.commit_sha,
                    checkpoint.parent_commit,
                    checkpoint.stats.files_changed,
                    checkpoint.stats.insertions,
                    checkpoint.stats.deletions,
                    serde_json::to_string(&checkpoint.stats.files)?,
                    ts(&checkpoint.checkpointed_at),
                    checkpoint.review_status.as_str(),
                    checkpoint.reviewed_by,
                    checkpoint.reviewed_at.as_ref().map(ts),
                    checkpoint.review_notes,
                ],
            )
            .context("Failed to insert checkpoint")?;
        Ok(())
    }

    pub fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM checkpoints WHERE id = ?1", CHECKPOINT_COLUMNS),
                params![id],
                CheckpointRow::read,
            )
            .optional()
            .context("Failed to query checkpoint")?
            .map(CheckpointRow::into_checkpoint)
            .transpose()
    }

    pub fn latest_checkpoint_for_task(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM checkpoints WHERE task_id = ?1
                     ORDER BY checkpointed_at DESC, rowid DESC LIMIT 1",
                    CHECKPOINT_COLUMNS
                ),
                params![task_id],
                CheckpointRow::read,
            )
            .optional()
            .context("Failed to query latest checkpoint")?
            .map(CheckpointRow::into_checkpoint)
            .transpose()
    }

    pub fn checkpoints_for_workflow(&self, workflow_id: &str) -> Result<Vec<Checkpoint>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM checkpoints
                 WHERE stream_id IN (SELECT id FROM streams WHERE workflow_id = ?1)
                 ORDER BY checkpointed_at",
                CHECKPOINT_COLUMNS
            ))
            .context("Failed to prepare checkpoints_for_workflow")?;
        let rows = stmt
            .query_map(params![workflow_id], CheckpointRow::read)
            .context("Failed to query checkpoints")?;
        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row.context("Failed to read checkpoint row")?.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    pub fn set_checkpoint_review(
        &self,
        id: &str,
        status: ReviewStatus,
        reviewer: Option<&str>,
        notes: Option<&str>,
        at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE checkpoints SET review_status = ?1, reviewed_by = ?2, review_notes = ?3,
                    reviewed_at = ?4 WHERE id = ?5",
                params![status.as_str(), reviewer, notes, at.as_ref().map(ts), id],
            )
            .context("Failed to update checkpoint review")?;
        Ok(())
    }

    // ── Promotions ────────────────────────────────────────────────────

    pub fn insert_promotion(&self, promotion: &Promotion) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO promotions (id, task_id, checkpoint_id, target_branch, strategy,
                    merge_commit, files_changed, insertions, deletions, files, promoted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    promotion.id,
                    promotion.task_id,
                    promotion.checkpoint_id,
                    promotion.target_branch,
                    promotion.strategy.as_str(),
                    promotion.merge_commit,
                    promotion.stats.files_changed,
                    promotion.stats.insertions,
                    promotion.stats.deletions,
                    serde_json::to_string(&promotion.stats.files)?,
                    ts(&promotion.promoted_at),
                ],
            )
            .context("Failed to insert promotion")?;
        Ok(())
    }

    pub fn is_task_promoted(&self, task_id: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM promotions WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .context("Failed to query promotions")?;
        Ok(count > 0)
    }

    pub fn promotions_for_task(&self, task_id: &str) -> Result<Vec<Promotion>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, checkpoint_id, target_branch, strategy, merge_commit,
                    files_changed, insertions, deletions, files, promoted_at
                 FROM promotions WHERE task_id = ?1 ORDER BY promoted_at",
            )
            .context("Failed to prepare promotions_for_task")?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    (
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, String>(9)?,
                    ),
                    row.get::<_, String>(10)?,
                ))
            })
            .context("Failed to query promotions")?;
        let mut promotions = Vec::new();
        for row in rows {
            let (id, task_id, checkpoint_id, target_branch, strategy, merge_commit, stats, at) =
                row.context("Failed to read promotion row")?;
            promotions.push(Promotion {
                id,
                task_id,
                checkpoint_id,
                target_branch,
                strategy: parse_enum(&strategy, "merge strategy")?,
                merge_commit,
                stats: DiffStats {
                    files_changed: stats.0,
                    insertions: stats.1,
                    deletions: stats.2,
                    files: serde_json::from_str(&stats.3)
                        .context("Failed to parse promotion files JSON")?,
                },
                promoted_at: parse_ts(&at)?,
            });
        }
        Ok(promotions)
    }
}

fn read_stream(row: &Row<'_>) -> rusqlite::Result<(String, Option<String>, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_stream(
    (id, parent_stream, name, created_at): (String, Option<String>, String, String),
) -> Result<Stream> {
    Ok(Stream {
        id,
        parent_stream,
        name,
        created_at: parse_ts(&created_at)?,
    })
}

struct CheckpointRow {
    id: String,
    stream_id: String,
    execution_id: Option<String>,
    task_id: Option<String>,
    commit_sha: String,
    parent_commit: Option<String>,
    files_changed: i64,
    insertions: i64,
    deletions: i64,
    files: String,
    checkpointed_at: String,
    review_status: String,
    reviewed_by: Option<String>,
    reviewed_at: Option<String>,
    review_notes: Option<String>,
}

impl CheckpointRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            stream_id: row.get(1)?,
            execution_id: row.get(2)?,
            task_id: row.get(3)?,
            commit_sha: row.get(4)?,
            parent_commit: row.get(5)?,
            files_changed: row.get(6)?,
            insertions: row.get(7)?,
            deletions: row.get(8)?,
            files: row.get(9)?,
            checkpointed_at: row.get(10)?,
            review_status: row.get(11)?,
            reviewed_by: row.get(12)?,
            reviewed_at: row.get(13)?,
            review_notes: row.get(14)?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint> {
        let files: Vec<String> =
            serde_json::from_str(&self.files).context("Failed to parse checkpoint files JSON")?;
        Ok(Checkpoint {
            review_status: parse_enum(&self.review_status, "review status")?,
            id: self.id,
            stream_id: self.stream_id,
            execution_id: self.execution_id,
            task_id: self.task_id,
            commit_sha: self.commit_sha,
            parent_commit: self.parent_commit,
            stats: DiffStats {
                files_changed: self.files_changed,
                insertions: self.insertions,
                deletions: self.deletions,
                files,
            },
            checkpointed_at: parse_ts(&self.checkpointed_at)?,
            reviewed_by: self.reviewed_by,
            reviewed_at: parse_opt_ts(self.reviewed_at)?,
            review_notes: self.review_notes,
        })
    }
}
