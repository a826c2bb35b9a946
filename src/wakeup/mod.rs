//! Durable workflow events and the wakeups they cause.
//!
//! Events are appended to the per-workflow log and stay unprocessed until a
//! wakeup of the controlling agent consumes them. Wakeup requests travel to
//! the engine loop over an unbounded channel. A request that arrives while
//! the controlling agent is still busy is remembered and replayed when it
//! finishes, so nothing recorded is ever lost.

mod timers;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::db::DbHandle;
use crate::models::{EventRecord, WakeupReason, WorkflowEvent};

use timers::{TimerKey, TimerSlot};

#[derive(Debug, Clone, PartialEq)]
pub struct WakeupRequest {
    pub workflow_id: String,
    pub reason: WakeupReason,
}

/// Event types the controlling agent is waiting for.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WaitSpec {
    pub event_types: Vec<String>,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct WakeupService {
    db: DbHandle,
    requests: mpsc::UnboundedSender<WakeupRequest>,
    timers: Arc<Mutex<HashMap<TimerKey, TimerSlot>>>,
    timer_seq: Arc<AtomicU64>,
    waits: Arc<Mutex<HashMap<String, WaitSpec>>>,
    queued: Arc<Mutex<HashSet<String>>>,
}

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WakeupService {
    pub fn new(db: DbHandle) -> (Self, mpsc::UnboundedReceiver<WakeupRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            db,
            requests: tx,
            timers: Arc::default(),
            timer_seq: Arc::default(),
            waits: Arc::default(),
            queued: Arc::default(),
        };
        (service, rx)
    }

    pub async fn record_event(&self, workflow_id: &str, event: WorkflowEvent) -> Result<EventRecord> {
        let wf = workflow_id.to_string();
        let record = self
            .db
            .call(move |db| db.append_event(&wf, &event))
            .await?;
        tracing::debug!(
            workflow_id = %workflow_id,
            event_id = record.id,
            event_type = record.event.event_type(),
            "Recorded workflow event"
        );
        Ok(record)
    }

    /// Record an event and wake the workflow unless a wait filters it out.
    pub async fn record_and_wake(&self, workflow_id: &str, event: WorkflowEvent) -> Result<EventRecord> {
        let record = self.record_event(workflow_id, event).await?;
        if self.should_wake(workflow_id, record.event.event_type()) {
            self.request_wakeup(workflow_id, WakeupReason::Event);
        }
        Ok(record)
    }

    pub fn request_wakeup(&self, workflow_id: &str, reason: WakeupReason) {
        let request = WakeupRequest {
            workflow_id: workflow_id.to_string(),
            reason,
        };
        if self.requests.send(request).is_err() {
            tracing::warn!(workflow_id = %workflow_id, %reason, "Wakeup channel closed; request stays in the event log");
        }
    }

    pub async fn unprocessed_events(&self, workflow_id: &str) -> Result<Vec<EventRecord>> {
        let wf = workflow_id.to_string();
        self.db.call(move |db| db.unprocessed_events(&wf)).await
    }

    pub async fn mark_processed(&self, event_ids: Vec<i64>, execution_id: &str) -> Result<usize> {
        let exec = execution_id.to_string();
        self.db
            .call(move |db| db.mark_events_processed(&event_ids, &exec))
            .await
    }

    /// Whether an event of `event_type` should wake the workflow now.
    pub fn should_wake(&self, workflow_id: &str, event_type: &str) -> bool {
        match guard(&self.waits).get(workflow_id) {
            Some(wait) => wait.event_types.iter().any(|t| t == event_type),
            None => true,
        }
    }

    pub fn current_wait(&self, workflow_id: &str) -> Option<WaitSpec> {
        guard(&self.waits).get(workflow_id).cloned()
    }

    /// Remember a wakeup that could not run yet.
    pub fn queue(&self, workflow_id: &str) {
        guard(&self.queued).insert(workflow_id.to_string());
    }

    /// Take a remembered wakeup, if any.
    pub fn take_queued(&self, workflow_id: &str) -> bool {
        guard(&self.queued).remove(workflow_id)
    }

    /// Drop every timer, wait and queued wakeup belonging to a workflow.
    pub fn cancel_all_for_workflow(&self, workflow_id: &str, execution_ids: &[String]) {
        self.clear_wait(workflow_id);
        for id in execution_ids {
            self.cancel_execution_timeout(id);
        }
        guard(&self.queued).remove(workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WakeupReason;

    fn service() -> (WakeupService, mpsc::UnboundedReceiver<WakeupRequest>, String) {
        let db = crate::test_support::memory_db();
        let workflow_id = crate::test_support::insert_workflow(&db, "wf");
        let (svc, rx) = WakeupService::new(db);
        (svc, rx, workflow_id)
    }

    #[tokio::test]
    async fn test_record_and_wake_enqueues_request() {
        let (svc, mut rx, wf) = service();
        svc.record_and_wake(&wf, WorkflowEvent::WorkflowResumed).await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            WakeupRequest {
                workflow_id: wf.clone(),
                reason: WakeupReason::Event
            }
        );
        let pending = svc.unprocessed_events(&wf).await.unwrap();
        assert_eq!(pending.len(), 1);

        assert_eq!(svc.mark_processed(vec![pending[0].id], "exec-1").await.unwrap(), 1);
        assert!(svc.unprocessed_events(&wf).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_filters_wakeups_but_keeps_events() {
        let (svc, mut rx, wf) = service();
        svc.register_wait(&wf, vec!["step_completed".into()], None);
        svc.record_and_wake(
            &wf,
            WorkflowEvent::UserResponse {
                message: "hi".into(),
            },
        )
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(svc.unprocessed_events(&wf).await.unwrap().len(), 1);

        svc.record_and_wake(
            &wf,
            WorkflowEvent::StepCompleted {
                step_id: "s".into(),
                execution_id: "e".into(),
                task_id: "t".into(),
            },
        )
        .await
        .unwrap();
        assert!(rx.try_recv().is_ok());

        svc.clear_wait(&wf);
        assert!(svc.should_wake(&wf, "user_response"));
    }

    #[tokio::test]
    async fn test_queued_wakeups_are_taken_once() {
        let (svc, _rx, wf) = service();
        assert!(!svc.take_queued(&wf));
        svc.queue(&wf);
        svc.queue(&wf);
        assert!(svc.take_queued(&wf));
        assert!(!svc.take_queued(&wf));
    }
}
