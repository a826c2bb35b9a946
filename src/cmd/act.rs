//! Control actions from the command line: `foreman act`.

use std::path::PathBuf;

use anyhow::Result;

use foreman::config::Config;
use foreman::orchestrator::ControlAction;

/// Send one action to the engine hosted by `foreman run` and print the
/// result as JSON.
pub async fn cmd_act(config: &Config, workflow_id: &str, action: &str, socket: Option<PathBuf>) -> Result<()> {
    let action: ControlAction = action.parse()?;
    let socket = socket.unwrap_or_else(|| config.control_socket());
    let result = send(&socket, workflow_id, action).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(unix)]
async fn send(socket: &std::path::Path, workflow_id: &str, action: ControlAction) -> Result<serde_json::Value> {
    foreman::control::send_action(socket, workflow_id, action).await
}

#[cfg(not(unix))]
async fn send(_socket: &std::path::Path, _workflow_id: &str, _action: ControlAction) -> Result<serde_json::Value> {
    anyhow::bail!("The control channel needs unix sockets")
}
