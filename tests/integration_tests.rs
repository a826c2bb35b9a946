//! Integration tests for the foreman binary.
//!
//! Each test drives the CLI against a throwaway git repository. Nothing here
//! launches an agent; `run` is the only command that does.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use git2::{Repository, Signature};
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn foreman() -> Command {
    let mut cmd = cargo_bin_cmd!("foreman");
    cmd.env_remove("RUST_LOG")
        .env_remove("FOREMAN_AGENT_CMD")
        .env_remove("FOREMAN_BASE_BRANCH")
        .env_remove("FOREMAN_LOG_JSON")
        .env_remove("FOREMAN_WORKFLOW_ID")
        .env_remove("FOREMAN_CONTROL_SOCKET");
    cmd
}

/// A git repository on `main` with one commit.
fn create_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    repo.set_head("refs/heads/main").unwrap();
    fs::write(dir.path().join("README.md"), "# demo\n").unwrap();

    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
        .unwrap();
    dir
}

fn write_tasks(dir: &TempDir, json: &str) {
    let foreman_dir = dir.path().join(".foreman");
    fs::create_dir_all(&foreman_dir).unwrap();
    fs::write(foreman_dir.join("tasks.json"), json).unwrap();
}

const CHAIN: &str = r#"[
    {"id": "schema", "title": "Add schema"},
    {"id": "api", "title": "Expose API", "blocked_by": ["schema"]},
    {"id": "docs", "title": "Document API", "blocked_by": ["api"]}
]"#;

/// Create a workflow over `tasks` and return its id.
fn create_workflow(dir: &TempDir, tasks: &[&str]) -> String {
    let mut cmd = foreman();
    cmd.current_dir(dir.path()).args(["create", "--title", "Demo"]);
    for task in tasks {
        cmd.args(["--task", task]);
    }
    let output = cmd.assert().success().get_output().stdout.clone();
    let stdout = String::from_utf8(output).unwrap();
    let line = stdout
        .lines()
        .find(|l| l.starts_with("Created workflow"))
        .unwrap();
    let start = line.rfind('(').unwrap() + 1;
    line[start..line.len() - 1].to_string()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        foreman()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("promote"))
            .stdout(predicate::str::contains("overlay"));
    }

    #[test]
    fn test_version() {
        foreman().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        foreman().arg("frobnicate").assert().failure();
    }

    #[test]
    fn test_missing_project_dir_fails() {
        foreman()
            .args(["--project-dir", "/definitely/not/here", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to resolve project directory"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        foreman()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No foreman.toml found"))
            .stdout(predicate::str::contains("agent_cmd = \"claude\""))
            .stdout(predicate::str::contains("branch_prefix = \"foreman\""));
    }

    #[test]
    fn test_config_init_then_show() {
        let dir = TempDir::new().unwrap();
        foreman()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Wrote"));
        assert!(dir.path().join(".foreman/foreman.toml").exists());

        foreman()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_env_and_cli_overrides() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        fs::write(
            dir.path().join(".foreman/foreman.toml"),
            "[project]\nagent_cmd = \"from-file\"\n",
        )
        .unwrap();

        foreman()
            .current_dir(dir.path())
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("agent_cmd = \"from-file\""));

        foreman()
            .current_dir(dir.path())
            .env("FOREMAN_AGENT_CMD", "from-env")
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("agent_cmd = \"from-env\""));

        foreman()
            .current_dir(dir.path())
            .env("FOREMAN_AGENT_CMD", "from-env")
            .args(["--agent-cmd", "from-cli", "config"])
            .assert()
            .success()
            .stdout(predicate::str::contains("agent_cmd = \"from-cli\""));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        fs::write(
            dir.path().join(".foreman/foreman.toml"),
            "[logging]\nlevel = \"loud\"\n",
        )
        .unwrap();

        foreman()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("logging.level"))
            .stdout(predicate::str::contains("Task file not found"));
    }

    #[test]
    fn test_malformed_config_fails() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        fs::write(dir.path().join(".foreman/foreman.toml"), "[worktrees\n").unwrap();

        foreman()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse foreman.toml"));
    }
}

// =============================================================================
// Workflows
// =============================================================================

mod workflows {
    use super::*;

    #[test]
    fn test_list_empty() {
        let dir = create_repo();
        foreman()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No workflows found."));
        assert!(dir.path().join(".foreman/foreman.db").exists());
    }

    #[test]
    fn test_create_list_and_status() {
        let dir = create_repo();
        write_tasks(&dir, CHAIN);
        let id = create_workflow(&dir, &["schema", "api", "docs"]);

        foreman()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains(id.as_str()))
            .stdout(predicate::str::contains("pending"))
            .stdout(predicate::str::contains("0/3"));

        foreman()
            .current_dir(dir.path())
            .args(["status", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("Status: pending"))
            .stdout(predicate::str::contains("schema"))
            .stdout(predicate::str::contains("Document API"));

        foreman()
            .current_dir(dir.path())
            .args(["list", "--status", "running"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No workflows found."));
    }

    #[test]
    fn test_status_json() {
        let dir = create_repo();
        write_tasks(&dir, CHAIN);
        let id = create_workflow(&dir, &["schema", "api"]);

        let output = foreman()
            .current_dir(dir.path())
            .args(["status", &id, "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(value["id"], id.as_str());
        assert_eq!(value["status"], "pending");
        assert_eq!(value["base_branch"], "main");
        let steps = value["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1]["depends_on"][0], steps[0]["id"]);
    }

    #[test]
    fn test_create_from_root_task_pulls_dependents() {
        let dir = create_repo();
        write_tasks(&dir, CHAIN);
        foreman()
            .current_dir(dir.path())
            .args(["create", "--title", "Root", "--root", "schema"])
            .assert()
            .success()
            .stdout(predicate::str::contains("3 step(s)"));
    }

    #[test]
    fn test_create_rejects_cycle() {
        let dir = create_repo();
        write_tasks(
            &dir,
            r#"[
                {"id": "a", "title": "A", "blocked_by": ["b"]},
                {"id": "b", "title": "B", "blocked_by": ["a"]}
            ]"#,
        );
        foreman()
            .current_dir(dir.path())
            .args(["create", "--title", "Loop", "--task", "a", "--task", "b"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Dependency cycle detected"));

        foreman()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No workflows found."));
    }

    #[test]
    fn test_create_unknown_task_fails() {
        let dir = create_repo();
        write_tasks(&dir, CHAIN);
        foreman()
            .current_dir(dir.path())
            .args(["create", "--title", "Missing", "--task", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Task nope not found"));
    }

    #[test]
    fn test_create_requires_a_source() {
        let dir = create_repo();
        foreman()
            .current_dir(dir.path())
            .args(["create", "--title", "Nothing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Specify --task, --root or --goal"));
    }

    #[test]
    fn test_goal_workflow_has_no_steps() {
        let dir = create_repo();
        foreman()
            .current_dir(dir.path())
            .args(["create", "--title", "Goal", "--goal", "tidy the docs"])
            .assert()
            .success()
            .stdout(predicate::str::contains("0 step(s)"));
    }

    #[test]
    fn test_base_branch_flag() {
        let dir = create_repo();
        write_tasks(&dir, CHAIN);
        foreman()
            .current_dir(dir.path())
            .args([
                "--base-branch",
                "release",
                "create",
                "--title",
                "Release",
                "--task",
                "schema",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Base branch: release"));
    }

    #[test]
    fn test_status_unknown_workflow_fails() {
        let dir = create_repo();
        foreman()
            .current_dir(dir.path())
            .args(["status", "missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Workflow missing not found"));
    }

    #[test]
    fn test_overlay_without_checkpoints() {
        let dir = create_repo();
        write_tasks(&dir, CHAIN);
        let id = create_workflow(&dir, &["schema"]);
        foreman()
            .current_dir(dir.path())
            .args(["overlay", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("No checkpoints recorded"));
    }
}

// =============================================================================
// Maintenance, review and promote
// =============================================================================

mod maintenance {
    use super::*;

    #[test]
    fn test_recover_on_fresh_project() {
        let dir = create_repo();
        foreman()
            .current_dir(dir.path())
            .arg("recover")
            .assert()
            .success()
            .stdout(predicate::str::contains("Interrupted executions: 0"))
            .stdout(predicate::str::contains("Workflows to wake: 0"));
    }

    #[test]
    fn test_sweep_on_fresh_project() {
        let dir = create_repo();
        foreman()
            .current_dir(dir.path())
            .arg("sweep")
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed 0 worktree(s)"));
    }

    #[test]
    fn test_review_unknown_checkpoint_fails() {
        let dir = create_repo();
        foreman()
            .current_dir(dir.path())
            .args(["review", "cp-missing", "approve"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Checkpoint cp-missing not found"));
    }

    #[test]
    fn test_review_rejects_unknown_action() {
        let dir = create_repo();
        foreman()
            .current_dir(dir.path())
            .args(["review", "cp-1", "maybe"])
            .assert()
            .failure();
    }

    #[test]
    fn test_promote_without_executions_fails() {
        let dir = create_repo();
        write_tasks(&dir, CHAIN);
        foreman()
            .current_dir(dir.path())
            .args(["promote", "schema"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Task schema has no executions"));
    }
}

#[cfg(unix)]
mod control {
    use super::*;
    use std::process::{Child, Stdio};
    use std::time::{Duration, Instant};

    /// `foreman run` in the background; killed on drop.
    struct Host(Child);

    impl Host {
        fn start(dir: &TempDir) -> Self {
            let child = std::process::Command::new(env!("CARGO_BIN_EXE_foreman"))
                .current_dir(dir.path())
                .arg("run")
                .env_remove("RUST_LOG")
                .env_remove("FOREMAN_AGENT_CMD")
                .env_remove("FOREMAN_BASE_BRANCH")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .unwrap();
            let host = Self(child);
            let socket = dir.path().join(".foreman/control.sock");
            let deadline = Instant::now() + Duration::from_secs(20);
            while !socket.exists() {
                assert!(Instant::now() < deadline, "control socket never appeared");
                std::thread::sleep(Duration::from_millis(50));
            }
            host
        }
    }

    impl Drop for Host {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    #[test]
    fn test_act_without_host_fails() {
        let dir = create_repo();
        foreman()
            .current_dir(dir.path())
            .args(["act", "--workflow", "wf-1", r#"{"action":"get_status"}"#])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No foreman run is serving"));
        // Agents call `act` from their worktree; it leaves no files behind.
        assert!(!dir.path().join(".foreman").exists());
    }

    #[test]
    fn test_act_rejects_malformed_action() {
        let dir = create_repo();
        foreman()
            .current_dir(dir.path())
            .args(["act", "--workflow", "wf-1", r#"{"action":"rm_rf"}"#])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid control action"));
    }

    #[test]
    fn test_act_requires_a_workflow() {
        let dir = create_repo();
        foreman()
            .current_dir(dir.path())
            .args(["act", r#"{"action":"get_status"}"#])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--workflow"));
    }

    #[test]
    fn test_act_reaches_the_running_host() {
        let dir = create_repo();
        write_tasks(&dir, CHAIN);
        let id = create_workflow(&dir, &["schema", "api"]);
        let _host = Host::start(&dir);

        foreman()
            .current_dir(dir.path())
            .env("FOREMAN_WORKFLOW_ID", &id)
            .args(["act", r#"{"action":"get_status"}"#])
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""result": "status""#))
            .stdout(predicate::str::contains(id.as_str()));

        // Actions are checked against the workflow's state.
        foreman()
            .current_dir(dir.path())
            .args(["act", "--workflow", &id, r#"{"action":"execute_task","task_id":"schema"}"#])
            .assert()
            .failure()
            .stderr(predicate::str::contains("pending"));

        // A second host for the same project is refused.
        foreman()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("already serving"));
    }
}
