//! Workflow creation and inspection: `foreman create|list|status|overlay`.

use anyhow::{Result, bail};

use foreman::config::Config;
use foreman::models::{
    AutoApprovePolicy, CleanupMode, ExecutionMode, WorkflowConfig, WorkflowSource, WorkflowStatus,
};

use super::Services;

pub struct CreateOptions {
    pub mode: ExecutionMode,
    pub cleanup: Option<CleanupMode>,
    pub workflow_branch: bool,
    pub auto_approve_checkpoints: bool,
}

pub fn workflow_source(tasks: Vec<String>, root: Option<String>, goal: Option<String>) -> Result<WorkflowSource> {
    match (tasks.is_empty(), root, goal) {
        (false, None, None) => Ok(WorkflowSource::Tasks { task_ids: tasks }),
        (true, Some(task_id), None) => Ok(WorkflowSource::RootTask { task_id }),
        (true, None, Some(goal)) => Ok(WorkflowSource::Goal { goal }),
        (true, None, None) => bail!("Specify --task, --root or --goal"),
        _ => bail!("--task, --root and --goal are mutually exclusive"),
    }
}

pub async fn cmd_create(config: &Config, title: &str, source: WorkflowSource, options: CreateOptions) -> Result<()> {
    let services = Services::open(config)?;
    let workflow_config = WorkflowConfig {
        auto_approve: AutoApprovePolicy {
            checkpoints: options.auto_approve_checkpoints,
            ..Default::default()
        },
        cleanup_mode: options.cleanup,
        mode: options.mode,
        base_branch: config.cli.base_branch.clone(),
        workflow_branch: options.workflow_branch,
        ..Default::default()
    };
    let workflow = services
        .engine
        .create_workflow(title, source, workflow_config)
        .await?;

    println!();
    println!("Created workflow {} ({})", workflow.title, workflow.id);
    println!("Source: {}", workflow.source.describe());
    if let Some(base) = &workflow.base_branch {
        println!("Base branch: {}", base);
    }
    println!("{} step(s)", workflow.steps.len());
    println!();
    println!("Start it with: foreman run --start {}", workflow.id);
    println!();
    Ok(())
}

pub async fn cmd_list(config: &Config, status: Option<WorkflowStatus>) -> Result<()> {
    let services = Services::open(config)?;
    let workflows = services.engine.list_workflows(status).await?;

    if workflows.is_empty() {
        println!("No workflows found.");
        return Ok(());
    }

    println!();
    println!("{:<38} {:<10} {:<7} Title", "ID", "Status", "Steps");
    println!("{:<38} {:<10} {:<7} -----", "-".repeat(36), "------", "-----");
    for wf in &workflows {
        let done = wf.steps.iter().filter(|s| s.status.satisfies_dependents()).count();
        println!(
            "{:<38} {:<10} {:<7} {}",
            wf.id,
            wf.status.as_str(),
            format!("{}/{}", done, wf.steps.len()),
            wf.title
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_status(config: &Config, workflow_id: &str, json: bool) -> Result<()> {
    let services = Services::open(config)?;
    let workflow = services.engine.get_workflow(workflow_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflow)?);
        return Ok(());
    }

    println!();
    println!("{} ({})", workflow.title, workflow.id);
    println!("Status: {}", workflow.status);
    println!("Source: {}", workflow.source.describe());
    if let Some(branch) = workflow.integration_branch() {
        println!("Integration branch: {}", branch);
    }
    if let Some(exec) = &workflow.orchestrator_execution_id {
        println!("Controlling execution: {}", exec);
    }
    println!();

    if workflow.steps.is_empty() {
        println!("No steps yet.");
        println!();
        return Ok(());
    }

    println!("{:<4} {:<20} {:<10} {:<24} Title", "#", "Task", "Status", "Depends on");
    for step in &workflow.steps {
        let deps: Vec<&str> = step
            .depends_on
            .iter()
            .filter_map(|id| workflow.step(id).map(|s| s.task_id.as_str()))
            .collect();
        println!(
            "{:<4} {:<20} {:<10} {:<24} {}",
            step.position,
            step.task_id,
            step.status.as_str(),
            deps.join(","),
            step.title
        );
        if let Some(error) = &step.error {
            println!("     error: {}", error);
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_overlay(config: &Config, workflow_id: &str) -> Result<()> {
    let services = Services::open(config)?;
    let plan = services.engine.overlay_plan(workflow_id).await?;

    if plan.order.checkpoints.is_empty() {
        println!("No checkpoints recorded for workflow {}.", workflow_id);
        return Ok(());
    }
    if plan.order.fell_back {
        println!("warning: stream lineage is cyclic; using creation-time order");
    }

    println!();
    println!("{:<4} {:<38} {:<10} {:<10} Task", "#", "Checkpoint", "Commit", "Review");
    for (i, cp) in plan.order.checkpoints.iter().enumerate() {
        println!(
            "{:<4} {:<38} {:<10} {:<10} {}",
            i + 1,
            cp.id,
            &cp.commit_sha[..cp.commit_sha.len().min(8)],
            cp.review_status.as_str(),
            cp.task_id.as_deref().unwrap_or("-")
        );
    }
    println!();

    if !plan.concurrent_edits.is_empty() {
        println!("Files edited on unrelated streams:");
        for edit in &plan.concurrent_edits {
            println!("  {} ({})", edit.path, edit.streams.join(", "));
        }
        println!();
    }
    Ok(())
}
