//! Configuration view and validation commands: `foreman config`.

use anyhow::{Context, Result};

use foreman::config::Config;
use foreman::foreman_config::ForemanToml;

use super::super::ConfigCommands;

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Foreman Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No foreman.toml found at {}; using defaults", config_path.display());
            }
            println!();

            let rendered = toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  agent_cmd = \"{}\"", config.agent_cmd());
            match config.base_branch() {
                Some(branch) => println!("  base_branch = \"{}\"", branch),
                None => println!("  base_branch = (current branch)"),
            }
            println!("  log_json = {}", config.log_json());
            println!();
            println!("Paths:");
            println!("  database  = {}", config.db_path().display());
            println!("  worktrees = {}", config.worktree_dir().display());
            println!("  tasks     = {}", config.tasks_file().display());
            println!("  logs      = {}", config.log_dir().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists", config_path.display());
                return Ok(());
            }
            std::fs::create_dir_all(&config.foreman_dir).with_context(|| {
                format!("Failed to create directory: {}", config.foreman_dir.display())
            })?;
            ForemanToml::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
        }
    }
    Ok(())
}
