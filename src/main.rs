use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use foreman::config::{CliOverrides, Config};
use foreman::models::{CleanupMode, ExecutionMode, MergeStrategy, WorkflowStatus};
use foreman::promote::ReviewAction;

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Workflow orchestrator for coding agents in isolated git worktrees")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit JSON log lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Agent CLI command. Overrides foreman.toml and FOREMAN_AGENT_CMD.
    #[arg(long, global = true)]
    pub agent_cmd: Option<String>,

    /// Default base branch. Overrides foreman.toml and FOREMAN_BASE_BRANCH.
    #[arg(long, global = true)]
    pub base_branch: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a pending workflow from tasks, a root task, or a goal
    Create {
        #[arg(long)]
        title: String,
        /// Explicit task ids (repeatable)
        #[arg(long = "task", conflicts_with_all = ["root", "goal"])]
        tasks: Vec<String>,
        /// A root task plus everything that depends on it
        #[arg(long, conflicts_with = "goal")]
        root: Option<String>,
        /// Free-form goal; the controlling agent adds steps
        #[arg(long)]
        goal: Option<String>,
        #[arg(long, default_value = "worktree")]
        mode: ExecutionMode,
        #[arg(long)]
        cleanup: Option<CleanupMode>,
        /// Create a dedicated integration branch on start
        #[arg(long)]
        workflow_branch: bool,
        /// Record step checkpoints as approved
        #[arg(long)]
        auto_approve_checkpoints: bool,
    },
    /// Host the engine: recover, start the given workflows, and process
    /// agent updates and wakeups until interrupted
    Run {
        /// Workflow ids to start (repeatable)
        #[arg(long = "start")]
        start: Vec<String>,
    },
    /// Send a control action to a workflow hosted by `foreman run`
    Act {
        /// Action as JSON, e.g. '{"action":"get_status"}'
        action: String,
        #[arg(long, env = "FOREMAN_WORKFLOW_ID")]
        workflow: String,
        /// Control socket; defaults to the project's
        #[arg(long, env = "FOREMAN_CONTROL_SOCKET")]
        socket: Option<PathBuf>,
    },
    /// Fail executions left running by a previous process
    Recover,
    /// Remove orphaned and finished worktrees
    Sweep,
    /// List workflows
    List {
        #[arg(long)]
        status: Option<WorkflowStatus>,
    },
    /// Show a workflow and its steps
    Status {
        workflow_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Show the order in which a workflow's checkpoints overlay
    Overlay { workflow_id: String },
    /// Review a checkpoint
    Review {
        checkpoint_id: String,
        #[arg(value_enum)]
        action: ReviewArg,
        #[arg(long)]
        reviewer: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Merge a task's reviewed work into a target branch
    Promote {
        task_id: String,
        #[arg(long, default_value = "squash")]
        strategy: MergeStrategy,
        #[arg(long)]
        target: Option<String>,
        /// Skip the approval requirement (blockers still apply)
        #[arg(long)]
        force: bool,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate foreman.toml and report warnings
    Validate,
    /// Write a default foreman.toml
    Init,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ReviewArg {
    Approve,
    RequestChanges,
    Reset,
}

impl From<ReviewArg> for ReviewAction {
    fn from(arg: ReviewArg) -> Self {
        match arg {
            ReviewArg::Approve => ReviewAction::Approve,
            ReviewArg::RequestChanges => ReviewAction::RequestChanges,
            ReviewArg::Reset => ReviewAction::Reset,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::with_cli_args(
        project_dir,
        CliOverrides {
            verbose: cli.verbose,
            json_logs: cli.json_logs,
            agent_cmd: cli.agent_cmd.clone(),
            base_branch: cli.base_branch.clone(),
        },
    )?;

    // Config commands must work even when logging cannot be set up.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config, command.clone());
    }
    // Agents run `act` from their worktree; it must not create files there.
    if let Commands::Act {
        action,
        workflow,
        socket,
    } = &cli.command
    {
        return cmd::cmd_act(&config, workflow, action, socket.clone()).await;
    }

    config.ensure_directories()?;
    let _log_guard = foreman::logging::init(&config)?;

    match cli.command {
        Commands::Create {
            title,
            tasks,
            root,
            goal,
            mode,
            cleanup,
            workflow_branch,
            auto_approve_checkpoints,
        } => {
            let source = cmd::workflow_source(tasks, root, goal)?;
            let options = cmd::CreateOptions {
                mode,
                cleanup,
                workflow_branch,
                auto_approve_checkpoints,
            };
            cmd::cmd_create(&config, &title, source, options).await?;
        }
        Commands::Run { start } => cmd::cmd_run(&config, &start).await?,
        Commands::Act {
            action,
            workflow,
            socket,
        } => cmd::cmd_act(&config, &workflow, &action, socket).await?,
        Commands::Recover => cmd::cmd_recover(&config).await?,
        Commands::Sweep => cmd::cmd_sweep(&config).await?,
        Commands::List { status } => cmd::cmd_list(&config, status).await?,
        Commands::Status { workflow_id, json } => cmd::cmd_status(&config, &workflow_id, json).await?,
        Commands::Overlay { workflow_id } => cmd::cmd_overlay(&config, &workflow_id).await?,
        Commands::Review {
            checkpoint_id,
            action,
            reviewer,
            notes,
        } => {
            cmd::cmd_review(
                &config,
                &checkpoint_id,
                action.into(),
                reviewer.as_deref(),
                notes.as_deref(),
            )
            .await?
        }
        Commands::Promote {
            task_id,
            strategy,
            target,
            force,
            message,
        } => {
            let request = foreman::promote::PromoteRequest {
                strategy,
                target_branch: target,
                force,
                message,
            };
            cmd::cmd_promote(&config, &task_id, request).await?
        }
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }
    Ok(())
}
