use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifyLevel {
    #[default]
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub workflow_id: String,
    pub level: NotifyLevel,
    pub message: String,
}

/// User-facing notifications. Delivery is best-effort: callers log failures
/// and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, n: Notification) -> anyhow::Result<()> {
        match n.level {
            NotifyLevel::Info => tracing::info!(workflow_id = %n.workflow_id, "{}", n.message),
            NotifyLevel::Warning => tracing::warn!(workflow_id = %n.workflow_id, "{}", n.message),
            NotifyLevel::Error => tracing::error!(workflow_id = %n.workflow_id, "{}", n.message),
        }
        Ok(())
    }
}

/// Keeps notifications in memory for inspection.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()> {
        self.sent
            .lock()
            .map_err(|e| anyhow::anyhow!("Notifier lock poisoned: {}", e))?
            .push(notification);
        Ok(())
    }
}
