//! CLI command implementations.
//!
//! | Module     | Commands handled                       |
//! |------------|----------------------------------------|
//! | `workflow` | `Create`, `List`, `Status`, `Overlay`  |
//! | `run`      | `Run`, `Recover`, `Sweep`              |
//! | `act`      | `Act`                                  |
//! | `review`   | `Review`, `Promote`                    |
//! | `config`   | `Config`                               |

pub mod act;
pub mod config;
pub mod review;
pub mod run;
pub mod workflow;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

use foreman::config::Config;
use foreman::db::{Db, DbHandle};
use foreman::notify::TracingNotifier;
use foreman::orchestrator::{EngineDeps, WorkflowEngine};
use foreman::promote::PromoteService;
use foreman::runner::{ExecutionUpdate, ProcessRunner};
use foreman::supervisor::Supervisor;
use foreman::tasks::{MemoryTaskStore, TaskStore};
use foreman::wakeup::{WakeupRequest, WakeupService};
use foreman::worktree::WorktreeManager;

pub use act::cmd_act;
pub use config::cmd_config;
pub use review::{cmd_promote, cmd_review};
pub use run::{cmd_recover, cmd_run, cmd_sweep};
pub use workflow::{CreateOptions, cmd_create, cmd_list, cmd_overlay, cmd_status, workflow_source};

/// Every service a command may need, wired against the project database.
pub struct Services {
    pub worktrees: Arc<WorktreeManager>,
    pub promote: Arc<PromoteService>,
    pub engine: Arc<WorkflowEngine>,
    pub updates: mpsc::UnboundedReceiver<ExecutionUpdate>,
    pub wakeups: mpsc::UnboundedReceiver<WakeupRequest>,
}

impl Services {
    pub fn open(config: &Config) -> Result<Self> {
        let db = DbHandle::new(Db::new(&config.db_path())?);
        let tasks: Arc<dyn TaskStore> = Arc::new(load_tasks(config)?);

        let (updates_tx, updates) = mpsc::unbounded_channel();
        let runner = ProcessRunner::new(config.agent_cmd(), updates_tx).with_log_dir(config.agent_log_dir());
        let worktrees = Arc::new(WorktreeManager::new(db.clone(), config.worktree_settings()));
        let (wakeup_service, wakeups) = WakeupService::new(db.clone());
        let promote = Arc::new(PromoteService::new(
            db.clone(),
            tasks.clone(),
            config.project_dir.clone(),
        ));

        let engine = Arc::new(WorkflowEngine::new(
            EngineDeps {
                db,
                tasks,
                runner: Arc::new(runner),
                worktrees: worktrees.clone(),
                wakeups: wakeup_service,
                notifier: Arc::new(TracingNotifier),
                promote: promote.clone(),
                supervisor: Supervisor::new(),
            },
            config.engine_settings(),
        ));

        Ok(Self {
            worktrees,
            promote,
            engine,
            updates,
            wakeups,
        })
    }
}

fn load_tasks(config: &Config) -> Result<MemoryTaskStore> {
    let path = config.tasks_file();
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No task file; starting with an empty task store");
        return Ok(MemoryTaskStore::default());
    }
    MemoryTaskStore::from_json_file(&path).context("Failed to load tasks")
}
