use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::foreman_config::ForemanToml;
use crate::orchestrator::EngineSettings;
use crate::worktree::WorktreeSettings;

pub const FOREMAN_DIR: &str = ".foreman";

/// Command-line values that override the file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub verbose: bool,
    pub json_logs: bool,
    pub agent_cmd: Option<String>,
    pub base_branch: Option<String>,
}

/// Runtime configuration for a project.
///
/// Resolves the on-disk layout under `.foreman/` and turns the layered
/// `foreman.toml` values into the settings the services are built from.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub foreman_dir: PathBuf,
    pub toml: ForemanToml,
    pub cli: CliOverrides,
}

impl Config {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_cli_args(project_dir, CliOverrides::default())
    }

    pub fn with_cli_args(project_dir: PathBuf, cli: CliOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let foreman_dir = project_dir.join(FOREMAN_DIR);
        let toml = ForemanToml::load_or_default(&foreman_dir)?;
        Ok(Self {
            project_dir,
            foreman_dir,
            toml,
            cli,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.foreman_dir.join(crate::foreman_config::CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.foreman_dir.join("foreman.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.foreman_dir.join("logs")
    }

    /// Per-execution agent output.
    pub fn agent_log_dir(&self) -> PathBuf {
        self.log_dir().join("agents")
    }

    /// Socket `foreman run` serves control actions on.
    pub fn control_socket(&self) -> PathBuf {
        self.foreman_dir.join("control.sock")
    }

    pub fn worktree_dir(&self) -> PathBuf {
        match &self.toml.worktrees.dir {
            Some(dir) => self.resolve(dir),
            None => self.foreman_dir.join("worktrees"),
        }
    }

    pub fn tasks_file(&self) -> PathBuf {
        match &self.toml.project.tasks_file {
            Some(path) => self.resolve(path),
            None => self.foreman_dir.join("tasks.json"),
        }
    }

    /// Agent command (CLI → env → file → default).
    pub fn agent_cmd(&self) -> String {
        self.cli
            .agent_cmd
            .clone()
            .unwrap_or_else(|| self.toml.agent_cmd())
    }

    /// Default base branch (CLI → env → file).
    pub fn base_branch(&self) -> Option<String> {
        self.cli.base_branch.clone().or_else(|| self.toml.base_branch())
    }

    pub fn log_json(&self) -> bool {
        self.cli.json_logs || self.toml.log_json()
    }

    /// Filter directive used when `RUST_LOG` is unset.
    pub fn log_directive(&self) -> String {
        let level = if self.cli.verbose {
            "debug"
        } else {
            self.toml.logging.level.as_str()
        };
        format!("foreman={level}")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let o = &self.toml.orchestrator;
        EngineSettings {
            orchestrator_agent: o.agent.clone(),
            orchestrator_model: o.model.clone(),
            step_agent: o.step_agent.clone(),
            step_model: o.step_model.clone(),
            default_base_branch: self.base_branch(),
            step_timeout: (o.step_timeout_secs > 0).then(|| Duration::from_secs(o.step_timeout_secs)),
            control_command: control_command(),
            control_socket: Some(self.control_socket()),
        }
    }

    pub fn worktree_settings(&self) -> WorktreeSettings {
        let w = &self.toml.worktrees;
        WorktreeSettings {
            worktree_dir: self.worktree_dir(),
            branch_prefix: w.branch_prefix.clone(),
            default_cleanup_mode: w.cleanup_mode,
            orphan_grace: Duration::from_secs(w.orphan_grace_secs),
            ..WorktreeSettings::for_repo(&self.project_dir)
        }
    }

    /// Create `.foreman/` and the directories under it.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.foreman_dir.clone(), self.log_dir(), self.worktree_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        let tasks = self.tasks_file();
        if !tasks.exists() {
            warnings.push(format!("Task file not found: {}", tasks.display()));
        }
        warnings
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}

/// `act` on the running binary, so agents do not depend on `PATH`.
fn control_command() -> String {
    match std::env::current_exe() {
        Ok(exe) => format!("\"{}\" act", exe.display()),
        Err(_) => "foreman act".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreman_config::{ENV_MUTEX, EnvGuard};
    use crate::models::CleanupMode;
    use tempfile::tempdir;

    fn write_toml(dir: &Path, content: &str) {
        let foreman_dir = dir.join(FOREMAN_DIR);
        std::fs::create_dir_all(&foreman_dir).unwrap();
        std::fs::write(foreman_dir.join("foreman.toml"), content).unwrap();
    }

    #[test]
    fn test_default_layout() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf()).unwrap();
        let root = dir.path().canonicalize().unwrap();

        assert_eq!(config.project_dir, root);
        assert_eq!(config.db_path(), root.join(".foreman/foreman.db"));
        assert_eq!(config.log_dir(), root.join(".foreman/logs"));
        assert_eq!(config.worktree_dir(), root.join(".foreman/worktrees"));
        assert_eq!(config.tasks_file(), root.join(".foreman/tasks.json"));
    }

    #[test]
    fn test_missing_project_dir_fails() {
        let dir = tempdir().unwrap();
        let err = Config::new(dir.path().join("nope")).unwrap_err();
        assert!(err.to_string().contains("Failed to resolve project directory"));
    }

    #[test]
    fn test_relative_paths_resolve_against_project() {
        let dir = tempdir().unwrap();
        write_toml(
            dir.path(),
            "[project]\ntasks_file = \"plan/tasks.json\"\n\n[worktrees]\ndir = \"../wt\"\n",
        );
        let config = Config::new(dir.path().to_path_buf()).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.tasks_file(), root.join("plan/tasks.json"));
        assert_eq!(config.worktree_dir(), root.join("../wt"));
    }

    #[test]
    fn test_engine_settings_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _env = EnvGuard::clear();

        let dir = tempdir().unwrap();
        write_toml(
            dir.path(),
            r#"
[orchestrator]
agent = "codex"
step_model = "sonnet"
base_branch = "develop"
step_timeout_secs = 0
"#,
        );
        let config = Config::new(dir.path().to_path_buf()).unwrap();
        let settings = config.engine_settings();
        assert_eq!(settings.orchestrator_agent, "codex");
        assert_eq!(settings.step_agent, "claude");
        assert_eq!(settings.step_model.as_deref(), Some("sonnet"));
        assert_eq!(settings.default_base_branch.as_deref(), Some("develop"));
        assert_eq!(settings.step_timeout, None);
        assert_eq!(settings.control_socket, Some(config.foreman_dir.join("control.sock")));
        assert!(settings.control_command.ends_with(" act"));
    }

    #[test]
    fn test_worktree_settings_from_file() {
        let dir = tempdir().unwrap();
        write_toml(
            dir.path(),
            "[worktrees]\nbranch_prefix = \"bots\"\ncleanup_mode = \"never\"\norphan_grace_secs = 7\n",
        );
        let config = Config::new(dir.path().to_path_buf()).unwrap();
        let settings = config.worktree_settings();
        assert_eq!(settings.repo_path, config.project_dir);
        assert_eq!(settings.worktree_dir, config.worktree_dir());
        assert_eq!(settings.branch_prefix, "bots");
        assert_eq!(settings.default_cleanup_mode, CleanupMode::Never);
        assert_eq!(settings.orphan_grace, Duration::from_secs(7));
    }

    #[test]
    fn test_cli_overrides_win() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _env = EnvGuard::clear();
        unsafe { std::env::set_var("FOREMAN_BASE_BRANCH", "from-env") };
        unsafe { std::env::set_var("FOREMAN_AGENT_CMD", "env-agent") };

        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.base_branch().as_deref(), Some("from-env"));
        assert_eq!(config.agent_cmd(), "env-agent");

        let config = Config::with_cli_args(
            dir.path().to_path_buf(),
            CliOverrides {
                verbose: true,
                json_logs: true,
                agent_cmd: Some("cli-agent".into()),
                base_branch: Some("from-cli".into()),
            },
        )
        .unwrap();
        assert_eq!(config.base_branch().as_deref(), Some("from-cli"));
        assert_eq!(config.agent_cmd(), "cli-agent");
        assert!(config.log_json());
        assert_eq!(config.log_directive(), "foreman=debug");
    }

    #[test]
    fn test_log_directive_uses_file_level() {
        let dir = tempdir().unwrap();
        write_toml(dir.path(), "[logging]\nlevel = \"warn\"\n");
        let config = Config::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.log_directive(), "foreman=warn");
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf()).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.foreman_dir.is_dir());
        assert!(config.log_dir().is_dir());
        assert!(config.worktree_dir().is_dir());
    }

    #[test]
    fn test_validate_reports_missing_tasks_file() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf()).unwrap();
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Task file not found"));
    }
}
