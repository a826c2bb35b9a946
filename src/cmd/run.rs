//! Engine hosting and maintenance: `foreman run|recover|sweep`.

use anyhow::Result;

use foreman::config::Config;

use super::Services;

/// Host the engine until Ctrl-C.
///
/// Agents run as children of this process, so workflows only make progress
/// while it is up. The control socket is bound first, so a second host for
/// the same project fails before touching anything. Startup always runs
/// recovery.
pub async fn cmd_run(config: &Config, start: &[String]) -> Result<()> {
    let Services {
        engine,
        updates,
        wakeups,
        ..
    } = Services::open(config)?;

    #[cfg(unix)]
    let control = {
        let server = foreman::control::ControlServer::bind(&config.control_socket()).await?;
        tokio::spawn(server.serve(engine.clone()))
    };

    let report = engine.recover().await?;
    if !report.interrupted_executions.is_empty() || !report.woken_workflows.is_empty() {
        println!(
            "Recovered: {} interrupted execution(s), {} workflow(s) woken",
            report.interrupted_executions.len(),
            report.woken_workflows.len()
        );
    }

    for id in start {
        match engine.start_workflow(id).await {
            Ok(workflow) => println!("Started workflow {} ({})", workflow.title, workflow.id),
            Err(e) => {
                tracing::error!(workflow_id = %id, error = %e, "Failed to start workflow");
                eprintln!("Failed to start workflow {}: {}", id, e);
            }
        }
    }

    println!("Engine running. Press Ctrl-C to stop.");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };
    engine.clone().run(updates, wakeups, shutdown).await;
    #[cfg(unix)]
    control.abort();

    let failures = engine.supervisor().failures();
    if !failures.is_empty() {
        println!();
        println!("{} background failure(s):", failures.len());
        for failure in &failures {
            println!("  {} {}: {}", failure.at.format("%H:%M:%S"), failure.label, failure.error);
        }
    }
    Ok(())
}

/// Reconcile records left by a previous process.
///
/// Woken workflows get their controlling agent the next time `foreman run`
/// hosts them.
pub async fn cmd_recover(config: &Config) -> Result<()> {
    let services = Services::open(config)?;
    let report = services.engine.recover().await?;

    println!();
    println!("Interrupted executions: {}", report.interrupted_executions.len());
    for id in &report.interrupted_executions {
        println!("  {}", id);
    }
    println!("Failed steps: {}", report.failed_steps.len());
    println!("Workflows to wake: {}", report.woken_workflows.len());
    for id in &report.woken_workflows {
        println!("  {}", id);
    }
    println!();
    Ok(())
}

pub async fn cmd_sweep(config: &Config) -> Result<()> {
    let services = Services::open(config)?;
    let report = services.worktrees.cleanup_orphaned_worktrees().await?;

    println!();
    println!("Removed {} worktree(s)", report.removed.len());
    for path in &report.removed {
        println!("  {}", path.display());
    }
    if !report.retained.is_empty() {
        println!("Retained {} worktree(s)", report.retained.len());
    }
    for (path, error) in &report.failed {
        println!("  failed: {}: {}", path.display(), error);
    }
    println!();
    Ok(())
}
