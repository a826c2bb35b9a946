//! Read access to the external task store.
//!
//! Workflows only need a task's title, its blocking relationships and
//! whether it has been closed; issue text and sync live elsewhere.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    pub id: String,
    pub title: String,
    /// Tasks that must finish before this one.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub closed: bool,
}

impl TaskInfo {
    pub fn new(id: &str, title: &str, blocked_by: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            blocked_by: blocked_by.iter().map(|b| b.to_string()).collect(),
            closed: false,
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, id: &str) -> Result<Option<TaskInfo>>;

    /// Tasks that declare themselves blocked by `id`.
    async fn dependents(&self, id: &str) -> Result<Vec<String>>;
}

/// Task store held in memory, optionally seeded from a JSON array file.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<BTreeMap<String, TaskInfo>>,
}

impl MemoryTaskStore {
    pub fn new(tasks: impl IntoIterator<Item = TaskInfo>) -> Self {
        Self {
            tasks: RwLock::new(tasks.into_iter().map(|t| (t.id.clone(), t)).collect()),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read task file: {}", path.display()))?;
        let tasks: Vec<TaskInfo> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse task file: {}", path.display()))?;
        Ok(Self::new(tasks))
    }

    pub async fn insert(&self, task: TaskInfo) {
        self.tasks.write().await.insert(task.id.clone(), task);
    }

    pub async fn close(&self, id: &str) -> bool {
        match self.tasks.write().await.get_mut(id) {
            Some(task) => {
                task.closed = true;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get_task(&self, id: &str) -> Result<Option<TaskInfo>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn dependents(&self, id: &str) -> Result<Vec<String>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.blocked_by.iter().any(|b| b == id))
            .map(|t| t.id.clone())
            .collect())
    }
}
