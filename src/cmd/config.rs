//! Configuration view and validation commands: `conductor config`, `conductor agents`.

use std::path::Path;

use anyhow::Result;

use conductor::config::Config;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    let config = Config::load(config_path)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();
            match &config.source {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!("Config file: none (environment and defaults)"),
            }
            println!();

            println!("[server]");
            println!("  port = {}", config.port);
            println!("  log_format = \"{}\"", config.log_format);
            println!();

            let github = &config.github;
            println!("[github]");
            println!("  api_url = \"{}\"", github.api_url);
            if let Some(id) = github.app_id {
                println!("  app_id = {}", id);
            }
            if let Some(id) = github.installation_id {
                println!("  installation_id = {}", id);
            }
            println!(
                "  private_key = {}",
                if github.private_key.is_some() { "<set>" } else { "<unset>" }
            );
            println!("  webhook_secret = <set>");
            println!();

            let d = &config.dispatch;
            println!("[dispatch]");
            println!("  max_concurrent_tasks = {}", d.max_concurrent_tasks);
            println!("  task_timeout_ms = {}", d.task_timeout.as_millis());
            println!("  retry_attempts = {}", d.retry_attempts);
            println!("  retry_backoff_ms = {}", d.retry_backoff.as_millis());
            println!("  retry_backoff_max_ms = {}", d.retry_backoff_max.as_millis());
            println!("  circuit_breaker_threshold = {}", d.circuit_breaker_threshold);
            println!(
                "  circuit_breaker_cooldown_ms = {}",
                d.circuit_breaker_cooldown.as_millis()
            );
            println!();

            let dl = &config.dead_letter;
            println!("[dead_letter]");
            println!("  sweep_interval_ms = {}", dl.sweep_interval.as_millis());
            println!("  max_attempts = {}", dl.max_attempts);
            if let Some(path) = &dl.path {
                println!("  path = \"{}\"", path.display());
            }
            println!();

            let r = &config.review;
            let strategies: Vec<&str> = r.merge_strategies.iter().map(|s| s.as_str()).collect();
            println!("[review]");
            println!("  merge_strategies = {:?}", strategies);
            println!("  aggregation_timeout_ms = {}", r.aggregation_timeout.as_millis());
            println!("  stale_after_days = {}", r.stale_after.num_days());
            println!(
                "  health_check_interval_ms = {}",
                r.health_check_interval.as_millis()
            );
            println!();
            println!("Agents: {}", config.agents.len());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }

    Ok(())
}

pub fn cmd_agents(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;

    if config.agents.is_empty() {
        println!("No agents configured. Set AGENT_<TYPE>_URL or add [[agents]] to conductor.toml.");
        return Ok(());
    }

    println!();
    println!("{:<24} {:<18} {:>9}  {}", "ID", "TYPE", "MAX TASKS", "ENDPOINT");
    for agent in &config.agents {
        println!(
            "{:<24} {:<18} {:>9}  {}",
            agent.id,
            agent.agent_type.as_str(),
            agent.max_tasks,
            agent.endpoint
        );
    }
    println!();
    Ok(())
}
