//! Webhook server command: `conductor serve`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use conductor::config::Config;
use conductor::dead_letter::{DeadLetterConfig, DeadLetterQueue};
use conductor::delegator::client::HttpAgentClient;
use conductor::engine::{self, Engine, EngineSettings};
use conductor::metrics::InMemoryMetrics;
use conductor::platform::github::GitHubClient;
use conductor::platform::retry::{RetryPolicy, RetryingPlatform};
use conductor::registry::{self, AgentRegistry};
use conductor::server::{self, AppState};
use conductor::telemetry;

pub async fn cmd_serve(config_path: Option<&Path>, port: Option<u16>, verbose: bool) -> Result<()> {
    let mut config = Config::load(config_path)?;
    if let Some(port) = port {
        config.port = port;
    }
    telemetry::init_logging(config.log_format, verbose);

    for warning in config.validate() {
        warn!("{}", warning);
    }
    let credentials = config.require_github()?;

    let metrics = Arc::new(InMemoryMetrics::new());
    let github = GitHubClient::new(credentials, metrics.clone())
        .context("Failed to create GitHub client")?;
    let platform = Arc::new(RetryingPlatform::new(
        github,
        RetryPolicy {
            attempts: config.dispatch.retry_attempts,
            base: config.dispatch.retry_backoff,
            cap: config.dispatch.retry_backoff_max,
        },
        metrics.clone(),
    ));

    let registry = Arc::new(AgentRegistry::with_agents(
        config.agents.clone(),
        engine::breaker_config(&config),
    ));
    let client = Arc::new(HttpAgentClient::new());
    let dead_letter = Arc::new(
        DeadLetterQueue::load(
            DeadLetterConfig {
                max_attempts: config.dead_letter.max_attempts,
                backoff_base: config.dispatch.retry_backoff,
                backoff_max: config.dispatch.retry_backoff_max,
                path: config.dead_letter.path.clone(),
            },
            metrics.clone(),
        )
        .context("Failed to load dead-letter queue")?,
    );

    let engine = Arc::new(Engine::new(
        EngineSettings::from_config(&config),
        platform,
        Arc::clone(&registry),
        client.clone(),
        Arc::clone(&dead_letter),
        metrics.clone(),
    ));

    let cancel = CancellationToken::new();
    let prober = registry::spawn_health_prober(
        registry,
        client,
        metrics.clone(),
        config.review.health_check_interval,
        cancel.clone(),
    );
    let sweeper = engine::spawn_dead_letter_sweeper(
        Arc::clone(&engine),
        config.dead_letter.sweep_interval,
        cancel.clone(),
    );
    server::cancel_on_ctrl_c(cancel.clone());

    info!(
        port = config.port,
        agents = config.agents.len(),
        "starting conductor"
    );
    let state = Arc::new(AppState { engine, metrics });
    let result = server::start_server(state, config.port, cancel.clone()).await;

    cancel.cancel();
    let _ = tokio::join!(prober, sweeper);
    if let Err(e) = dead_letter.flush() {
        warn!(error = %e, "failed to persist dead-letter queue");
    }
    result
}
