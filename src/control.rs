//! Local transport for control actions.
//!
//! `foreman run` binds a unix socket next to the database and feeds every
//! request into [`WorkflowEngine::apply_action`]. Controlling agents reach it
//! through `foreman act`, which sends one request and prints the result.
//!
//! The wire format is one JSON object per line in each direction: a
//! [`ControlRequest`] in, a [`ControlResponse`] out. A connection may carry
//! any number of requests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::orchestrator::{ControlAction, ControlChannel, WorkflowEngine};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub workflow_id: String,
    pub action: ControlAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok { result: Value },
    Error { error: String },
}

/// Listening side, owned by the process hosting the engine. The socket file
/// is removed when the server is dropped.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind `path`, replacing a stale socket file left by a dead process.
    pub async fn bind(path: &Path) -> Result<Self> {
        if UnixStream::connect(path).await.is_ok() {
            bail!("Another foreman run is already serving {}", path.display());
        }
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale control socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
        tracing::info!(socket = %path.display(), "Control channel listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the future is dropped.
    pub async fn serve(self, engine: Arc<WorkflowEngine>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, engine).await {
                            tracing::warn!(error = %e, "Control connection failed");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept control connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(stream: UnixStream, engine: Arc<WorkflowEngine>) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => dispatch(&engine, request).await,
            Err(e) => ControlResponse::Error {
                error: format!("Invalid control request: {}", e),
            },
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write.write_all(&out).await?;
    }
    Ok(())
}

async fn dispatch(engine: &WorkflowEngine, request: ControlRequest) -> ControlResponse {
    let channel = ControlChannel::for_workflow(request.workflow_id);
    match engine.apply_action(&channel, request.action).await {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(result) => ControlResponse::Ok { result },
            Err(e) => ControlResponse::Error {
                error: format!("Failed to encode result: {}", e),
            },
        },
        Err(e) => {
            tracing::debug!(workflow_id = %channel.workflow_id, error = %e, "Control action rejected");
            ControlResponse::Error { error: e.to_string() }
        }
    }
}

/// Send one action to the engine serving `socket` and return its result.
pub async fn send_action(socket: &Path, workflow_id: &str, action: ControlAction) -> Result<Value> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("No foreman run is serving {}", socket.display()))?;
    let (read, mut write) = stream.into_split();

    let request = ControlRequest {
        workflow_id: workflow_id.to_string(),
        action,
    };
    let mut out = serde_json::to_vec(&request)?;
    out.push(b'\n');
    write
        .write_all(&out)
        .await
        .context("Failed to send control request")?;

    let line = BufReader::new(read)
        .lines()
        .next_line()
        .await
        .context("Failed to read control response")?
        .context("Control channel closed without a response")?;
    match serde_json::from_str(&line).context("Invalid control response")? {
        ControlResponse::Ok { result } => Ok(result),
        ControlResponse::Error { error } => bail!(error),
    }
}
