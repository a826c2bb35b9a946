//! Launching agent processes and reporting how they end.
//!
//! A runner starts an agent for an execution and returns as soon as the
//! process is up. Everything after that arrives as [`ExecutionUpdate`]s on
//! the channel the runner was built with.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::errors::LaunchError;

/// Marker the agent CLI prints when asked to resume a session it no longer has.
const SESSION_LOST_MARKER: &str = "No conversation found";

/// Longest stderr tail kept for error messages.
const STDERR_TAIL: usize = 2000;

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub execution_id: String,
    pub working_dir: PathBuf,
    pub agent_type: String,
    pub model: Option<String>,
    pub prompt: String,
    pub resume_session: Option<String>,
    pub auto_approve: bool,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Completed { summary: Option<String> },
    Failed { error: String },
    /// Killed through [`AgentRunner::cancel`].
    Stopped,
    /// The resumed session does not exist anymore.
    SessionLost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionUpdate {
    Started {
        execution_id: String,
    },
    Session {
        execution_id: String,
        session_id: String,
    },
    Finished {
        execution_id: String,
        outcome: ExitOutcome,
        session_id: Option<String>,
    },
}

impl ExecutionUpdate {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Started { execution_id }
            | Self::Session { execution_id, .. }
            | Self::Finished { execution_id, .. } => execution_id,
        }
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Start the agent. Returns once the process is running.
    async fn launch(&self, request: LaunchRequest) -> Result<(), LaunchError>;

    /// Stop a running agent. Returns false if nothing was running.
    async fn cancel(&self, execution_id: &str) -> Result<bool>;
}

/// The subset of the agent's stream-json output the runner cares about.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        #[serde(default)]
        session_id: Option<String>,
    },
    User {},
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl StreamLine {
    fn session_id(&self) -> Option<&str> {
        match self {
            Self::System { session_id }
            | Self::Assistant { session_id }
            | Self::Result { session_id, .. } => session_id.as_deref(),
            Self::User {} => None,
        }
    }
}

/// Runs the agent CLI as a child process per execution.
pub struct ProcessRunner {
    command: String,
    base_args: Vec<String>,
    log_dir: Option<PathBuf>,
    updates: mpsc::UnboundedSender<ExecutionUpdate>,
    kill_switches: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl ProcessRunner {
    pub fn new(command: impl Into<String>, updates: mpsc::UnboundedSender<ExecutionUpdate>) -> Self {
        Self {
            command: command.into(),
            base_args: vec![
                "--print".into(),
                "--output-format".into(),
                "stream-json".into(),
                "--verbose".into(),
            ],
            log_dir: None,
            updates,
            kill_switches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    /// Write each agent's final output to `<log_dir>/<execution id>.log`.
    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = Some(log_dir);
        self
    }

    fn args_for(&self, request: &LaunchRequest) -> Vec<String> {
        let mut args = self.base_args.clone();
        if let Some(model) = &request.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(session) = &request.resume_session {
            args.extend(["--resume".to_string(), session.clone()]);
        }
        if request.auto_approve {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args
    }

    fn switches(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<()>>>> {
        self.kill_switches
            .lock()
            .map_err(|e| anyhow::anyhow!("Runner lock poisoned: {}", e))
    }
}

#[async_trait]
impl AgentRunner for ProcessRunner {
    async fn launch(&self, request: LaunchRequest) -> Result<(), LaunchError> {
        let args = self.args_for(&request);
        tracing::info!(
            execution_id = %request.execution_id,
            agent = %request.agent_type,
            dir = %request.working_dir.display(),
            resume = request.resume_session.is_some(),
            "Launching agent"
        );

        let mut child = Command::new(&self.command)
            .args(&args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .context("Failed to write prompt to agent stdin")?;
            stdin.shutdown().await.context("Failed to close agent stdin")?;
        }
        let stdout = child.stdout.take().context("Failed to capture agent stdout")?;
        let stderr = child.stderr.take().context("Failed to capture agent stderr")?;

        let (kill_tx, kill_rx) = oneshot::channel();
        self.switches()?.insert(request.execution_id.clone(), kill_tx);
        let _ = self.updates.send(ExecutionUpdate::Started {
            execution_id: request.execution_id.clone(),
        });

        let monitor = Monitor {
            execution_id: request.execution_id,
            updates: self.updates.clone(),
            kill_switches: self.kill_switches.clone(),
            log_dir: self.log_dir.clone(),
        };
        tokio::spawn(monitor.run(child, stdout, stderr, kill_rx));
        Ok(())
    }

    async fn cancel(&self, execution_id: &str) -> Result<bool> {
        let Some(switch) = self.switches()?.remove(execution_id) else {
            return Ok(false);
        };
        Ok(switch.send(()).is_ok())
    }
}

struct Monitor {
    execution_id: String,
    updates: mpsc::UnboundedSender<ExecutionUpdate>,
    kill_switches: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
    log_dir: Option<PathBuf>,
}

impl Monitor {
    async fn run(
        self,
        mut child: tokio::process::Child,
        stdout: tokio::process::ChildStdout,
        mut stderr: tokio::process::ChildStderr,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut session_id: Option<String> = None;
        let mut result: Option<(Option<String>, bool)> = None;
        let mut plain_output = String::new();
        let mut killed = false;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.observe(&line, &mut session_id, &mut result, &mut plain_output),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(execution_id = %self.execution_id, error = %e, "Failed to read agent output");
                            break;
                        }
                    }
                }
                _ = &mut kill_rx, if !killed => {
                    killed = true;
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(execution_id = %self.execution_id, error = %e, "Failed to kill agent");
                    }
                }
            }
        }

        let status = child.wait().await;
        let stderr_text = stderr_task.await.unwrap_or_default();
        if let Ok(mut switches) = self.kill_switches.lock() {
            switches.remove(&self.execution_id);
        }

        let outcome = if killed {
            ExitOutcome::Stopped
        } else if stderr_text.contains(SESSION_LOST_MARKER) || plain_output.contains(SESSION_LOST_MARKER) {
            ExitOutcome::SessionLost
        } else {
            match (&status, &result) {
                (_, Some((text, true))) => ExitOutcome::Failed {
                    error: text.clone().unwrap_or_else(|| "Agent reported an error".into()),
                },
                (Ok(s), Some((text, false))) if s.success() => ExitOutcome::Completed {
                    summary: text.clone(),
                },
                (Ok(s), None) if s.success() => ExitOutcome::Completed { summary: None },
                (Ok(s), _) => ExitOutcome::Failed {
                    error: format!(
                        "Agent exited with code {}: {}",
                        s.code().unwrap_or(-1),
                        tail(&stderr_text, STDERR_TAIL)
                    ),
                },
                (Err(e), _) => ExitOutcome::Failed {
                    error: format!("Failed to wait for agent: {}", e),
                },
            }
        };

        self.write_log(&result, &plain_output, &stderr_text).await;
        tracing::info!(execution_id = %self.execution_id, outcome = ?outcome, "Agent exited");
        let _ = self.updates.send(ExecutionUpdate::Finished {
            execution_id: self.execution_id.clone(),
            outcome,
            session_id,
        });
    }

    fn observe(
        &self,
        line: &str,
        session_id: &mut Option<String>,
        result: &mut Option<(Option<String>, bool)>,
        plain_output: &mut String,
    ) {
        if line.trim().is_empty() {
            return;
        }
        let Ok(parsed) = serde_json::from_str::<StreamLine>(line) else {
            plain_output.push_str(line);
            plain_output.push('\n');
            return;
        };
        if session_id.is_none()
            && let Some(id) = parsed.session_id()
        {
            *session_id = Some(id.to_string());
            let _ = self.updates.send(ExecutionUpdate::Session {
                execution_id: self.execution_id.clone(),
                session_id: id.to_string(),
            });
        }
        if let StreamLine::Result {
            result: text,
            is_error,
            ..
        } = parsed
        {
            *result = Some((text, is_error));
        }
    }

    async fn write_log(&self, result: &Option<(Option<String>, bool)>, plain: &str, stderr: &str) {
        let Some(dir) = &self.log_dir else {
            return;
        };
        let mut body = String::new();
        if let Some((Some(text), _)) = result {
            body.push_str(text);
            body.push('\n');
        }
        body.push_str(plain);
        if !stderr.is_empty() {
            body.push_str("\n--- stderr ---\n");
            body.push_str(stderr);
        }
        let path = dir.join(format!("{}.log", self.execution_id));
        let written = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, body).await
        };
        if let Err(e) = written.await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write agent log");
        }
    }
}

fn tail(text: &str, max: usize) -> &str {
    let text = text.trim();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
