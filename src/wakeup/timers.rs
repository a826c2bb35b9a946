use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::task::AbortHandle;

use super::{WaitSpec, WakeupService, guard};
use crate::models::{WakeupReason, WorkflowEvent};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(super) enum TimerKey {
    Execution(String),
    Wait(String),
}

pub(super) struct TimerSlot {
    seq: u64,
    handle: AbortHandle,
}

impl WakeupService {
    /// Record a `timeout` event and wake the workflow if the execution is
    /// still registered after `after`. Firing does not stop the agent.
    pub fn register_execution_timeout(
        &self,
        workflow_id: &str,
        execution_id: &str,
        step_id: Option<&str>,
        after: Duration,
    ) {
        let workflow_id = workflow_id.to_string();
        let event = WorkflowEvent::Timeout {
            execution_id: Some(execution_id.to_string()),
            step_id: step_id.map(String::from),
            after_secs: after.as_secs(),
        };
        self.arm(TimerKey::Execution(execution_id.to_string()), after, move |svc| async move {
            if let Err(e) = svc.record_and_wake(&workflow_id, event).await {
                tracing::warn!(workflow_id = %workflow_id, error = %e, "Failed to record execution timeout");
            }
        });
    }

    pub fn cancel_execution_timeout(&self, execution_id: &str) -> bool {
        self.disarm(&TimerKey::Execution(execution_id.to_string()))
    }

    /// Only wake for `event_types` until the next wakeup, or until `timeout`
    /// passes.
    pub fn register_wait(&self, workflow_id: &str, event_types: Vec<String>, timeout: Option<Duration>) {
        let deadline = timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| Utc::now() + t);
        guard(&self.waits).insert(
            workflow_id.to_string(),
            WaitSpec {
                event_types,
                deadline,
            },
        );
        self.disarm(&TimerKey::Wait(workflow_id.to_string()));

        let Some(after) = timeout else {
            return;
        };
        let wf = workflow_id.to_string();
        self.arm(TimerKey::Wait(wf.clone()), after, move |svc| async move {
            guard(&svc.waits).remove(&wf);
            let event = WorkflowEvent::Timeout {
                execution_id: None,
                step_id: None,
                after_secs: after.as_secs(),
            };
            match svc.record_event(&wf, event).await {
                Ok(_) => svc.request_wakeup(&wf, WakeupReason::Event),
                Err(e) => tracing::warn!(workflow_id = %wf, error = %e, "Failed to record wait timeout"),
            }
        });
    }

    pub fn clear_wait(&self, workflow_id: &str) {
        guard(&self.waits).remove(workflow_id);
        self.disarm(&TimerKey::Wait(workflow_id.to_string()));
    }

    pub fn active_timers(&self) -> usize {
        guard(&self.timers).len()
    }

    fn arm<F, Fut>(&self, key: TimerKey, after: Duration, on_fire: F)
    where
        F: FnOnce(WakeupService) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let seq = self.timer_seq.fetch_add(1, Ordering::Relaxed);
        let svc = self.clone();
        let fire_key = key.clone();
        // Hold the map lock across spawn so the timer cannot fire and look
        // for its slot before it is inserted.
        let mut timers = guard(&self.timers);
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            {
                let mut timers = guard(&svc.timers);
                match timers.get(&fire_key) {
                    Some(slot) if slot.seq == seq => {
                        timers.remove(&fire_key);
                    }
                    _ => return,
                }
            }
            on_fire(svc).await;
        });
        if let Some(old) = timers.insert(
            key,
            TimerSlot {
                seq,
                handle: task.abort_handle(),
            },
        ) {
            old.handle.abort();
        }
    }

    fn disarm(&self, key: &TimerKey) -> bool {
        match guard(&self.timers).remove(key) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }
}
