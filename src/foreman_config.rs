//! Project configuration read from `.foreman/foreman.toml`.
//!
//! Values are layered: the file first, then environment overrides, then
//! whatever the command line sets on the runtime [`Config`](crate::config::Config).
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-project"
//! agent_cmd = "claude"
//! tasks_file = ".foreman/tasks.json"
//!
//! [worktrees]
//! dir = ".foreman/worktrees"
//! branch_prefix = "foreman"
//! cleanup_mode = "auto"
//! orphan_grace_secs = 120
//!
//! [orchestrator]
//! agent = "claude"
//! model = "opus"
//! step_agent = "claude"
//! base_branch = "main"
//! step_timeout_secs = 1800
//!
//! [logging]
//! level = "info"
//! json = false
//! file = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::CleanupMode;

pub const CONFIG_FILE: &str = "foreman.toml";

const AGENT_CMD_ENV: &str = "FOREMAN_AGENT_CMD";
const LOG_JSON_ENV: &str = "FOREMAN_LOG_JSON";
const BASE_BRANCH_ENV: &str = "FOREMAN_BASE_BRANCH";

const KNOWN_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// The complete foreman.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ForemanToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub worktrees: WorktreesSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProjectSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Agent CLI binary used for every execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_cmd: Option<String>,
    /// JSON array of tasks, relative to the project directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorktreesSection {
    /// Relative paths resolve against the project directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default)]
    pub cleanup_mode: CleanupMode,
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
}

fn default_branch_prefix() -> String {
    "foreman".to_string()
}

fn default_orphan_grace_secs() -> u64 {
    120
}

impl Default for WorktreesSection {
    fn default() -> Self {
        Self {
            dir: None,
            branch_prefix: default_branch_prefix(),
            cleanup_mode: CleanupMode::default(),
            orphan_grace_secs: default_orphan_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorSection {
    /// Agent type of the controlling agent.
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Agent type of step executions.
    #[serde(default = "default_agent")]
    pub step_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_model: Option<String>,
    /// Branch workflows integrate into when they name none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    /// 0 disables the step timeout.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

fn default_agent() -> String {
    "claude".to_string()
}

fn default_step_timeout_secs() -> u64 {
    30 * 60
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            agent: default_agent(),
            model: None,
            step_agent: default_agent(),
            step_model: None,
            base_branch: None,
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// Level for foreman's own targets when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Also write a daily-rotated log under `.foreman/logs`.
    #[serde(default = "default_true")]
    pub file: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: true,
        }
    }
}

impl ForemanToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foreman.toml")
    }

    /// Load `<foreman_dir>/foreman.toml`, or the defaults when it is absent.
    pub fn load_or_default(foreman_dir: &Path) -> Result<Self> {
        let config_path = foreman_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foreman.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Agent command (env → file → default).
    pub fn agent_cmd(&self) -> String {
        env_value(AGENT_CMD_ENV)
            .or_else(|| self.project.agent_cmd.clone())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// JSON log output (env → file).
    pub fn log_json(&self) -> bool {
        match env_value(LOG_JSON_ENV) {
            Some(v) => !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"),
            None => self.logging.json,
        }
    }

    /// Default base branch (env → file).
    pub fn base_branch(&self) -> Option<String> {
        env_value(BASE_BRANCH_ENV).or_else(|| self.orchestrator.base_branch.clone())
    }

    /// Check the configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let prefix = &self.worktrees.branch_prefix;
        if prefix.is_empty() {
            warnings.push("worktrees.branch_prefix is empty".to_string());
        } else if prefix.contains(char::is_whitespace) || prefix.starts_with('/') || prefix.ends_with('/') {
            warnings.push(format!("worktrees.branch_prefix '{prefix}' is not a valid branch prefix"));
        }

        if !KNOWN_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            warnings.push(format!(
                "logging.level '{}' is not one of {}",
                self.logging.level,
                KNOWN_LEVELS.join(", ")
            ));
        }

        if self.orchestrator.agent.trim().is_empty() {
            warnings.push("orchestrator.agent is empty".to_string());
        }
        if self.orchestrator.step_agent.trim().is_empty() {
            warnings.push("orchestrator.step_agent is empty".to_string());
        }

        if let Some(branch) = &self.orchestrator.base_branch
            && branch.trim().is_empty()
        {
            warnings.push("orchestrator.base_branch is empty".to_string());
        }

        warnings
    }
}

/// Unset and empty variables both count as absent.
fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Clears the foreman env overrides for the test's duration and restores
/// them afterwards.
#[cfg(test)]
pub(crate) struct EnvGuard {
    saved: Vec<(&'static str, Option<String>)>,
}

#[cfg(test)]
impl EnvGuard {
    pub(crate) fn clear() -> Self {
        let saved = [AGENT_CMD_ENV, LOG_JSON_ENV, BASE_BRANCH_ENV]
            .into_iter()
            .map(|k| (k, std::env::var(k).ok()))
            .collect();
        for key in [AGENT_CMD_ENV, LOG_JSON_ENV, BASE_BRANCH_ENV] {
            unsafe { std::env::remove_var(key) };
        }
        Self { saved }
    }
}

#[cfg(test)]
impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.saved {
            match value {
                Some(v) => unsafe { std::env::set_var(key, v) },
                None => unsafe { std::env::remove_var(key) },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let toml = ForemanToml::default();
        assert_eq!(toml.worktrees.branch_prefix, "foreman");
        assert_eq!(toml.worktrees.cleanup_mode, CleanupMode::Auto);
        assert_eq!(toml.worktrees.orphan_grace_secs, 120);
        assert_eq!(toml.orchestrator.agent, "claude");
        assert_eq!(toml.orchestrator.step_timeout_secs, 1800);
        assert_eq!(toml.logging.level, "info");
        assert!(toml.logging.file);
        assert!(!toml.logging.json);
    }

    #[test]
    fn test_parse_empty_matches_default() {
        assert_eq!(ForemanToml::parse("").unwrap(), ForemanToml::default());
    }

    #[test]
    fn test_parse_full() {
        let content = r#"
[project]
name = "demo"
agent_cmd = "/usr/local/bin/claude"
tasks_file = "tasks.json"

[worktrees]
dir = "/tmp/wt"
branch_prefix = "bots"
cleanup_mode = "manual"
orphan_grace_secs = 5

[orchestrator]
agent = "codex"
model = "o3"
step_agent = "claude"
step_model = "sonnet"
base_branch = "develop"
step_timeout_secs = 0

[logging]
level = "debug"
json = true
file = false
"#;
        let toml = ForemanToml::parse(content).unwrap();
        assert_eq!(toml.project.name.as_deref(), Some("demo"));
        assert_eq!(toml.project.tasks_file, Some(PathBuf::from("tasks.json")));
        assert_eq!(toml.worktrees.dir, Some(PathBuf::from("/tmp/wt")));
        assert_eq!(toml.worktrees.branch_prefix, "bots");
        assert_eq!(toml.worktrees.cleanup_mode, CleanupMode::Manual);
        assert_eq!(toml.worktrees.orphan_grace_secs, 5);
        assert_eq!(toml.orchestrator.agent, "codex");
        assert_eq!(toml.orchestrator.model.as_deref(), Some("o3"));
        assert_eq!(toml.orchestrator.step_model.as_deref(), Some("sonnet"));
        assert_eq!(toml.orchestrator.step_timeout_secs, 0);
        assert_eq!(toml.logging.level, "debug");
        assert!(toml.logging.json);
        assert!(!toml.logging.file);
    }

    #[test]
    fn test_parse_partial_section_keeps_other_defaults() {
        let toml = ForemanToml::parse("[worktrees]\nbranch_prefix = \"x\"\n").unwrap();
        assert_eq!(toml.worktrees.branch_prefix, "x");
        assert_eq!(toml.worktrees.orphan_grace_secs, 120);
        assert_eq!(toml.orchestrator, OrchestratorSection::default());
    }

    #[test]
    fn test_parse_rejects_unknown_cleanup_mode() {
        let err = ForemanToml::parse("[worktrees]\ncleanup_mode = \"sometimes\"\n").unwrap_err();
        assert!(err.to_string().contains("foreman.toml"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = ForemanToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml, ForemanToml::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut toml = ForemanToml::default();
        toml.project.name = Some("saved".into());
        toml.orchestrator.base_branch = Some("trunk".into());
        let path = dir.path().join(CONFIG_FILE);
        toml.save(&path).unwrap();

        let loaded = ForemanToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, toml);
    }

    #[test]
    fn test_agent_cmd_priority() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _env = EnvGuard::clear();

        assert_eq!(ForemanToml::default().agent_cmd(), "claude");

        let toml = ForemanToml::parse("[project]\nagent_cmd = \"file-agent\"\n").unwrap();
        assert_eq!(toml.agent_cmd(), "file-agent");

        unsafe { std::env::set_var(AGENT_CMD_ENV, "env-agent") };
        assert_eq!(toml.agent_cmd(), "env-agent");
    }

    #[test]
    fn test_log_json_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _env = EnvGuard::clear();

        let toml = ForemanToml::parse("[logging]\njson = true\n").unwrap();
        assert!(toml.log_json());

        unsafe { std::env::set_var(LOG_JSON_ENV, "false") };
        assert!(!toml.log_json());

        unsafe { std::env::set_var(LOG_JSON_ENV, "1") };
        assert!(ForemanToml::default().log_json());
    }

    #[test]
    fn test_base_branch_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _env = EnvGuard::clear();

        let toml = ForemanToml::parse("[orchestrator]\nbase_branch = \"main\"\n").unwrap();
        assert_eq!(toml.base_branch().as_deref(), Some("main"));

        unsafe { std::env::set_var(BASE_BRANCH_ENV, "release") };
        assert_eq!(toml.base_branch().as_deref(), Some("release"));

        unsafe { std::env::set_var(BASE_BRANCH_ENV, "  ") };
        assert_eq!(toml.base_branch().as_deref(), Some("main"));
    }

    #[test]
    fn test_validate_valid() {
        assert!(ForemanToml::default().validate().is_empty());
    }

    #[test]
    fn test_validate_warnings() {
        let content = r#"
[worktrees]
branch_prefix = "bad prefix"

[orchestrator]
agent = " "

[logging]
level = "loud"
"#;
        let warnings = ForemanToml::parse(content).unwrap().validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("branch_prefix")));
        assert!(warnings.iter().any(|w| w.contains("orchestrator.agent")));
        assert!(warnings.iter().any(|w| w.contains("logging.level")));
    }
}
