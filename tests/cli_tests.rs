//! Command-line tests for conductor.
//!
//! Every invocation runs with a cleared environment inside a temporary
//! directory so neither the host's variables nor a stray `.env` leak in.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn conductor(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.env_clear().current_dir(dir.path());
    cmd
}

fn with_secret(dir: &TempDir) -> Command {
    let mut cmd = conductor(dir);
    cmd.env("GITHUB_WEBHOOK_SECRET", "s3cret");
    cmd
}

// =============================================================================
// Basics
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        conductor(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        conductor(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = TempDir::new().unwrap();
        conductor(&dir).arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_missing_webhook_secret_is_fatal() {
        let dir = TempDir::new().unwrap();
        conductor(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("GITHUB_WEBHOOK_SECRET"));
    }

    #[test]
    fn test_serve_refuses_without_secret() {
        let dir = TempDir::new().unwrap();
        conductor(&dir)
            .arg("serve")
            .assert()
            .failure()
            .stderr(predicate::str::contains("GITHUB_WEBHOOK_SECRET"));
    }

    #[test]
    fn test_serve_refuses_without_app_credentials() {
        let dir = TempDir::new().unwrap();
        with_secret(&dir)
            .arg("serve")
            .assert()
            .failure()
            .stderr(predicate::str::contains("GITHUB_APP_ID"));
    }

    #[test]
    fn test_show_defaults() {
        let dir = TempDir::new().unwrap();
        with_secret(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 3000"))
            .stdout(predicate::str::contains("max_concurrent_tasks = 10"))
            .stdout(predicate::str::contains("webhook_secret = <set>"))
            .stdout(predicate::str::contains("s3cret").not());
    }

    #[test]
    fn test_environment_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        with_secret(&dir)
            .env("PORT", "8088")
            .env("CIRCUIT_BREAKER_THRESHOLD", "3")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 8088"))
            .stdout(predicate::str::contains("circuit_breaker_threshold = 3"));
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let dir = TempDir::new().unwrap();
        with_secret(&dir)
            .env("MAX_CONCURRENT_TASKS", "lots")
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("MAX_CONCURRENT_TASKS"));
    }

    #[test]
    fn test_validate_warns_about_missing_agents() {
        let dir = TempDir::new().unwrap();
        with_secret(&dir)
            .env("AGENT_SECURITY_URL", "http://security.local")
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings:"))
            .stdout(predicate::str::contains("AGENT_TESTING_URL"))
            .stdout(predicate::str::contains("AGENT_SECURITY_URL").not());
    }

    #[test]
    fn test_config_file_is_layered_under_environment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conductor.toml");
        fs::write(
            &path,
            r#"
[server]
port = 4100

[github]
webhook_secret = "from-file"

[review]
merge_strategies = ["rebase"]
stale_after_days = 7
"#,
        )
        .unwrap();

        conductor(&dir)
            .args(["--config", path.to_str().unwrap(), "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 4100"))
            .stdout(predicate::str::contains("merge_strategies = [\"rebase\"]"))
            .stdout(predicate::str::contains("stale_after_days = 7"));

        conductor(&dir)
            .env("PORT", "4200")
            .env("CONDUCTOR_CONFIG", &path)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 4200"));
    }

    #[test]
    fn test_unparseable_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conductor.toml");
        fs::write(&path, "[server\nport = ").unwrap();

        with_secret(&dir)
            .args(["--config", path.to_str().unwrap(), "config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse config file"));
    }
}

// =============================================================================
// Agents
// =============================================================================

mod agents_command {
    use super::*;

    #[test]
    fn test_no_agents() {
        let dir = TempDir::new().unwrap();
        with_secret(&dir)
            .arg("agents")
            .assert()
            .success()
            .stdout(predicate::str::contains("No agents configured"));
    }

    #[test]
    fn test_lists_file_and_env_agents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conductor.toml");
        fs::write(
            &path,
            r#"
[[agents]]
id = "docs-bot"
type = "documentation"
endpoint = "http://docs.local"
max_tasks = 2
"#,
        )
        .unwrap();

        with_secret(&dir)
            .env("AGENT_TESTING_URL", "http://tests.local/")
            .args(["--config", path.to_str().unwrap(), "agents"])
            .assert()
            .success()
            .stdout(predicate::str::contains("docs-bot"))
            .stdout(predicate::str::contains("documentation"))
            .stdout(predicate::str::contains("testing-agent"))
            .stdout(predicate::str::contains("http://tests.local"));
    }
}
