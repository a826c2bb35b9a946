//! Tracking for work that must not fail the caller but must not vanish either.

use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Most recent failures kept in memory.
const MAX_FAILURES: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundFailure {
    pub label: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Runs best-effort and detached work, logging and recording every failure.
#[derive(Clone, Default)]
pub struct Supervisor {
    failures: Arc<Mutex<Vec<BackgroundFailure>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await `fut`; on error log and record it, then carry on.
    pub async fn best_effort<T, E, F>(&self, label: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match fut.await {
            Ok(value) => Some(value),
            Err(e) => {
                self.record(label, &e);
                None
            }
        }
    }

    /// Run `fut` on its own task with the same failure handling.
    pub fn spawn<E, F>(&self, label: impl Into<String>, fut: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let this = self.clone();
        let label = label.into();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                this.record(&label, &e);
            }
        })
    }

    pub fn record(&self, label: &str, error: &dyn std::fmt::Display) {
        tracing::warn!(task = %label, error = %error, "Background work failed");
        let Ok(mut failures) = self.failures.lock() else {
            return;
        };
        if failures.len() >= MAX_FAILURES {
            failures.remove(0);
        }
        failures.push(BackgroundFailure {
            label: label.to_string(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    pub fn failures(&self) -> Vec<BackgroundFailure> {
        self.failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_best_effort_records_failures() {
        let supervisor = Supervisor::new();
        let ok = supervisor
            .best_effort("ok", async { Ok::<_, anyhow::Error>(5) })
            .await;
        assert_eq!(ok, Some(5));

        let failed = supervisor
            .best_effort("cleanup", async { Err::<(), _>(anyhow::anyhow!("disk full")) })
            .await;
        assert!(failed.is_none());
        let failures = supervisor.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].label, "cleanup");
        assert_eq!(failures[0].error, "disk full");
    }

    #[tokio::test]
    async fn test_spawned_failures_are_kept_and_bounded() {
        let supervisor = Supervisor::new();
        supervisor
            .spawn("detached", async { Err::<(), _>("nope".to_string()) })
            .await
            .unwrap();
        assert_eq!(supervisor.failures()[0].label, "detached");

        for i in 0..(MAX_FAILURES + 10) {
            supervisor.record(&format!("f{}", i), &"x");
        }
        let failures = supervisor.failures();
        assert_eq!(failures.len(), MAX_FAILURES);
        assert_eq!(failures.last().unwrap().label, format!("f{}", MAX_FAILURES + 9));
    }
}
