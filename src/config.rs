//! Layered configuration: `conductor.toml` file, then environment, then CLI.
//!
//! The file is optional and located through `CONDUCTOR_CONFIG` (or the
//! `--config` flag). Every key can be overridden from the environment,
//! after `.env` has been loaded with `dotenvy`. Resolution is written
//! against a lookup function so tests never touch the process environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::models::{Agent, MergeStrategy, TaskType};
use crate::telemetry::LogFormat;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_AGENT_MAX_TASKS: usize = 3;

// ── File representation ─────────────────────────────────────────────

/// The complete conductor.toml structure. Every value is optional; missing
/// values fall through to the environment and then to built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConductorToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub dead_letter: DeadLetterSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub agents: Vec<AgentSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerSection {
    pub port: Option<u16>,
    pub log_format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GitHubSection {
    pub app_id: Option<u64>,
    pub installation_id: Option<u64>,
    pub api_url: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DispatchSection {
    pub max_concurrent_tasks: Option<usize>,
    pub task_timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub retry_backoff_max_ms: Option<u64>,
    pub circuit_breaker_threshold: Option<u32>,
    pub circuit_breaker_cooldown_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeadLetterSection {
    pub sweep_interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReviewSection {
    pub merge_strategies: Option<Vec<MergeStrategy>>,
    pub aggregation_timeout_ms: Option<u64>,
    pub stale_after_days: Option<u32>,
    pub health_check_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub agent_type: TaskType,
    pub endpoint: String,
    pub max_tasks: Option<usize>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ConductorToml {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ── Resolved configuration ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GitHubSettings {
    pub app_id: Option<u64>,
    pub installation_id: Option<u64>,
    pub private_key: Option<String>,
    pub api_url: String,
    pub webhook_secret: String,
}

/// Credentials needed to act as a GitHub App installation.
#[derive(Debug, Clone)]
pub struct GitHubCredentials {
    pub app_id: u64,
    pub installation_id: u64,
    pub private_key: String,
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_concurrent_tasks: usize,
    pub task_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            task_timeout: Duration::from_millis(300_000),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1_000),
            retry_backoff_max: Duration::from_millis(60_000),
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetterSettings {
    pub sweep_interval: Duration,
    pub max_attempts: u32,
    pub path: Option<PathBuf>,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(30_000),
            max_attempts: 5,
            path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReviewSettings {
    pub merge_strategies: Vec<MergeStrategy>,
    pub aggregation_timeout: Duration,
    pub stale_after: chrono::Duration,
    pub health_check_interval: Duration,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            merge_strategies: vec![
                MergeStrategy::Squash,
                MergeStrategy::Rebase,
                MergeStrategy::Merge,
            ],
            aggregation_timeout: Duration::from_millis(1_800_000),
            stale_after: chrono::Duration::days(30),
            health_check_interval: Duration::from_millis(60_000),
        }
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_format: LogFormat,
    pub github: GitHubSettings,
    pub dispatch: DispatchSettings,
    pub dead_letter: DeadLetterSettings,
    pub review: ReviewSettings,
    pub agents: Vec<Agent>,
    /// File the values were layered on top of, if any.
    pub source: Option<PathBuf>,
}

impl Config {
    /// Load `.env`, the optional TOML file, and the process environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("CONDUCTOR_CONFIG").ok().map(PathBuf::from));
        let file = match &path {
            Some(p) => ConductorToml::load(p)?,
            None => ConductorToml::default(),
        };
        let mut config = Self::resolve(file, |key| std::env::var(key).ok())?;
        config.source = path;
        Ok(config)
    }

    /// Apply environment overrides from `lookup` on top of `file`.
    pub fn resolve<F>(file: ConductorToml, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = parse_var(&lookup, "PORT")?
            .or(file.server.port)
            .unwrap_or(DEFAULT_PORT);

        let log_format = match lookup("LOG_FORMAT").or(file.server.log_format) {
            Some(raw) => raw.parse::<LogFormat>().map_err(|reason| ConfigError::Invalid {
                key: "LOG_FORMAT".into(),
                value: raw.clone(),
                reason,
            })?,
            None => LogFormat::default(),
        };

        let webhook_secret = lookup("GITHUB_WEBHOOK_SECRET")
            .or_else(|| lookup("WEBHOOK_SECRET"))
            .or(file.github.webhook_secret)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::Missing {
                key: "GITHUB_WEBHOOK_SECRET".into(),
            })?;

        let private_key = match lookup("GITHUB_PRIVATE_KEY") {
            Some(inline) => Some(inline.replace("\\n", "\n")),
            None => match lookup("GITHUB_PRIVATE_KEY_PATH")
                .map(PathBuf::from)
                .or(file.github.private_key_path)
            {
                Some(path) => Some(std::fs::read_to_string(&path).map_err(|source| {
                    ConfigError::Read { path, source }
                })?),
                None => None,
            },
        };

        let github = GitHubSettings {
            app_id: parse_var(&lookup, "GITHUB_APP_ID")?.or(file.github.app_id),
            installation_id: parse_var(&lookup, "GITHUB_INSTALLATION_ID")?
                .or(file.github.installation_id),
            private_key,
            api_url: lookup("GITHUB_API_URL")
                .or(file.github.api_url)
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            webhook_secret,
        };

        let defaults = DispatchSettings::default();
        let d = &file.dispatch;
        let dispatch = DispatchSettings {
            max_concurrent_tasks: parse_var(&lookup, "MAX_CONCURRENT_TASKS")?
                .or(d.max_concurrent_tasks)
                .unwrap_or(defaults.max_concurrent_tasks),
            task_timeout: millis(&lookup, "TASK_TIMEOUT", d.task_timeout_ms)?
                .unwrap_or(defaults.task_timeout),
            retry_attempts: parse_var(&lookup, "RETRY_ATTEMPTS")?
                .or(d.retry_attempts)
                .unwrap_or(defaults.retry_attempts),
            retry_backoff: millis(&lookup, "RETRY_BACKOFF_MS", d.retry_backoff_ms)?
                .unwrap_or(defaults.retry_backoff),
            retry_backoff_max: millis(&lookup, "RETRY_BACKOFF_MAX_MS", d.retry_backoff_max_ms)?
                .unwrap_or(defaults.retry_backoff_max),
            circuit_breaker_threshold: parse_var(&lookup, "CIRCUIT_BREAKER_THRESHOLD")?
                .or(d.circuit_breaker_threshold)
                .unwrap_or(defaults.circuit_breaker_threshold),
            circuit_breaker_cooldown: millis(
                &lookup,
                "CIRCUIT_BREAKER_COOLDOWN_MS",
                d.circuit_breaker_cooldown_ms,
            )?
            .unwrap_or(defaults.circuit_breaker_cooldown),
        };
        ensure_positive("MAX_CONCURRENT_TASKS", dispatch.max_concurrent_tasks as u64)?;
        ensure_positive("RETRY_ATTEMPTS", dispatch.retry_attempts as u64)?;
        ensure_positive(
            "CIRCUIT_BREAKER_THRESHOLD",
            dispatch.circuit_breaker_threshold as u64,
        )?;

        let dl_defaults = DeadLetterSettings::default();
        let dead_letter = DeadLetterSettings {
            sweep_interval: millis(
                &lookup,
                "DEAD_LETTER_SWEEP_MS",
                file.dead_letter.sweep_interval_ms,
            )?
            .unwrap_or(dl_defaults.sweep_interval),
            max_attempts: parse_var(&lookup, "DEAD_LETTER_MAX_ATTEMPTS")?
                .or(file.dead_letter.max_attempts)
                .unwrap_or(dl_defaults.max_attempts),
            path: lookup("DEAD_LETTER_PATH")
                .map(PathBuf::from)
                .or(file.dead_letter.path),
        };

        let review_defaults = ReviewSettings::default();
        let merge_strategies = match lookup("MERGE_STRATEGIES") {
            Some(raw) => parse_strategies(&raw)?,
            None => file
                .review
                .merge_strategies
                .unwrap_or(review_defaults.merge_strategies),
        };
        let review = ReviewSettings {
            merge_strategies,
            aggregation_timeout: millis(
                &lookup,
                "AGGREGATION_TIMEOUT_MS",
                file.review.aggregation_timeout_ms,
            )?
            .unwrap_or(review_defaults.aggregation_timeout),
            stale_after: parse_var::<i64, _>(&lookup, "STALE_AFTER_DAYS")?
                .or(file.review.stale_after_days.map(i64::from))
                .map(chrono::Duration::days)
                .unwrap_or(review_defaults.stale_after),
            health_check_interval: millis(
                &lookup,
                "HEALTH_CHECK_MS",
                file.review.health_check_interval_ms,
            )?
            .unwrap_or(review_defaults.health_check_interval),
        };

        let agents = resolve_agents(file.agents, &lookup)?;

        Ok(Self {
            port,
            log_format,
            github,
            dispatch,
            dead_letter,
            review,
            agents,
            source: None,
        })
    }

    /// GitHub App credentials, required before the server talks to GitHub.
    pub fn require_github(&self) -> Result<GitHubCredentials, ConfigError> {
        let missing = |key: &str| ConfigError::Missing { key: key.into() };
        Ok(GitHubCredentials {
            app_id: self.github.app_id.ok_or_else(|| missing("GITHUB_APP_ID"))?,
            installation_id: self
                .github
                .installation_id
                .ok_or_else(|| missing("GITHUB_INSTALLATION_ID"))?,
            private_key: self
                .github
                .private_key
                .clone()
                .ok_or_else(|| missing("GITHUB_PRIVATE_KEY"))?,
            api_url: self.github.api_url.clone(),
        })
    }

    /// Non-fatal problems worth reporting at startup.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for task_type in TaskType::ALL {
            if !self.agents.iter().any(|a| a.agent_type == task_type) {
                warnings.push(format!(
                    "No agent configured for {} (set AGENT_{}_URL)",
                    task_type,
                    task_type.env_key()
                ));
            }
        }

        if self.dispatch.retry_backoff > self.dispatch.retry_backoff_max {
            warnings.push(format!(
                "RETRY_BACKOFF_MS ({:?}) exceeds RETRY_BACKOFF_MAX_MS ({:?})",
                self.dispatch.retry_backoff, self.dispatch.retry_backoff_max
            ));
        }

        if self.review.merge_strategies.is_empty() {
            warnings.push("MERGE_STRATEGIES is empty; auto-merge is disabled".to_string());
        }

        if self.require_github().is_err() {
            warnings.push(
                "GitHub App credentials incomplete (GITHUB_APP_ID, GITHUB_INSTALLATION_ID, GITHUB_PRIVATE_KEY)"
                    .to_string(),
            );
        }

        warnings
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn millis<F>(lookup: &F, key: &str, file_value: Option<u64>) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_var::<u64, _>(lookup, key)?
        .or(file_value)
        .map(Duration::from_millis))
}

fn ensure_positive(key: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: "0".into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

fn parse_strategies(raw: &str) -> Result<Vec<MergeStrategy>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<MergeStrategy>().map_err(|reason| ConfigError::Invalid {
                key: "MERGE_STRATEGIES".into(),
                value: raw.to_string(),
                reason,
            })
        })
        .collect()
}

/// File-declared agents first, then one agent per `AGENT_<TYPE>_URL`.
/// An environment agent replaces a file agent with the same id.
fn resolve_agents<F>(file_agents: Vec<AgentSection>, lookup: &F) -> Result<Vec<Agent>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut agents: Vec<Agent> = file_agents
        .into_iter()
        .map(|section| {
            let mut agent = Agent::new(section.id, section.agent_type, section.endpoint)
                .with_max_tasks(section.max_tasks.unwrap_or(DEFAULT_AGENT_MAX_TASKS));
            if let Some(name) = section.name {
                agent = agent.with_name(name);
            }
            if !section.capabilities.is_empty() {
                agent.capabilities = section.capabilities;
            }
            agent
        })
        .collect();

    for task_type in TaskType::ALL {
        let url_key = format!("AGENT_{}_URL", task_type.env_key());
        let Some(endpoint) = lookup(&url_key).filter(|u| !u.trim().is_empty()) else {
            continue;
        };
        let max_key = format!("AGENT_{}_MAX_TASKS", task_type.env_key());
        let max_tasks = parse_var(lookup, &max_key)?.unwrap_or(DEFAULT_AGENT_MAX_TASKS);
        ensure_positive(&max_key, max_tasks as u64)?;

        let id = format!("{}-agent", task_type.category());
        agents.retain(|a| a.id != id);
        agents.push(
            Agent::new(id, task_type, endpoint.trim_end_matches('/'))
                .with_max_tasks(max_tasks),
        );
    }

    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_webhook_secret_is_fatal() {
        let err = Config::resolve(ConductorToml::default(), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { ref key } if key == "GITHUB_WEBHOOK_SECRET"));
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::resolve(ConductorToml::default(), env(&[("WEBHOOK_SECRET", "s3cret")]))
                .unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.github.webhook_secret, "s3cret");
        assert_eq!(config.dispatch.max_concurrent_tasks, 10);
        assert_eq!(config.dispatch.task_timeout, Duration::from_secs(300));
        assert_eq!(config.dispatch.retry_attempts, 3);
        assert_eq!(config.dispatch.circuit_breaker_threshold, 5);
        assert_eq!(config.dead_letter.max_attempts, 5);
        assert_eq!(
            config.review.merge_strategies,
            vec![
                MergeStrategy::Squash,
                MergeStrategy::Rebase,
                MergeStrategy::Merge
            ]
        );
        assert_eq!(config.review.aggregation_timeout, Duration::from_secs(1800));
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_env_overrides_file() {
        let file: ConductorToml = toml::from_str(
            r#"
            [server]
            port = 8080

            [dispatch]
            max_concurrent_tasks = 4
            retry_attempts = 2

            [github]
            webhook_secret = "from-file"
            "#,
        )
        .unwrap();
        let config = Config::resolve(
            file,
            env(&[("MAX_CONCURRENT_TASKS", "16"), ("TASK_TIMEOUT", "2500")]),
        )
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.dispatch.max_concurrent_tasks, 16);
        assert_eq!(config.dispatch.retry_attempts, 2);
        assert_eq!(config.dispatch.task_timeout, Duration::from_millis(2500));
        assert_eq!(config.github.webhook_secret, "from-file");
    }

    #[test]
    fn test_invalid_number_is_reported_with_key() {
        let err = Config::resolve(
            ConductorToml::default(),
            env(&[("WEBHOOK_SECRET", "s"), ("RETRY_ATTEMPTS", "lots")]),
        )
        .unwrap_err();
        match err {
            ConfigError::Invalid { key, value, .. } => {
                assert_eq!(key, "RETRY_ATTEMPTS");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = Config::resolve(
            ConductorToml::default(),
            env(&[("WEBHOOK_SECRET", "s"), ("MAX_CONCURRENT_TASKS", "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_agents_from_env() {
        let config = Config::resolve(
            ConductorToml::default(),
            env(&[
                ("WEBHOOK_SECRET", "s"),
                ("AGENT_SECURITY_URL", "http://sec:9000/"),
                ("AGENT_SECURITY_MAX_TASKS", "2"),
                ("AGENT_TESTING_URL", "http://test:9000"),
            ]),
        )
        .unwrap();
        assert_eq!(config.agents.len(), 2);
        let sec = &config.agents[0];
        assert_eq!(sec.id, "security-agent");
        assert_eq!(sec.agent_type, TaskType::SecurityReview);
        assert_eq!(sec.endpoint, "http://sec:9000");
        assert_eq!(sec.max_tasks, 2);
        assert_eq!(config.agents[1].max_tasks, DEFAULT_AGENT_MAX_TASKS);
    }

    #[test]
    fn test_file_agents_and_strategies() {
        let file: ConductorToml = toml::from_str(
            r#"
            [review]
            merge_strategies = ["rebase"]
            stale_after_days = 7

            [[agents]]
            id = "docs-1"
            type = "documentation"
            endpoint = "http://docs:1"
            max_tasks = 5
            "#,
        )
        .unwrap();
        let config = Config::resolve(file, env(&[("WEBHOOK_SECRET", "s")])).unwrap();
        assert_eq!(config.review.merge_strategies, vec![MergeStrategy::Rebase]);
        assert_eq!(config.review.stale_after, chrono::Duration::days(7));
        assert_eq!(config.agents[0].id, "docs-1");
        assert_eq!(config.agents[0].max_tasks, 5);
    }

    #[test]
    fn test_merge_strategies_env() {
        let config = Config::resolve(
            ConductorToml::default(),
            env(&[("WEBHOOK_SECRET", "s"), ("MERGE_STRATEGIES", "merge, squash")]),
        )
        .unwrap();
        assert_eq!(
            config.review.merge_strategies,
            vec![MergeStrategy::Merge, MergeStrategy::Squash]
        );

        let err = Config::resolve(
            ConductorToml::default(),
            env(&[("WEBHOOK_SECRET", "s"), ("MERGE_STRATEGIES", "squash,yolo")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_require_github() {
        let config = Config::resolve(
            ConductorToml::default(),
            env(&[
                ("WEBHOOK_SECRET", "s"),
                ("GITHUB_APP_ID", "42"),
                ("GITHUB_INSTALLATION_ID", "7"),
                ("GITHUB_PRIVATE_KEY", "-----BEGIN-----\\nabc\\n-----END-----"),
            ]),
        )
        .unwrap();
        let creds = config.require_github().unwrap();
        assert_eq!(creds.app_id, 42);
        assert!(creds.private_key.contains('\n'));

        let partial = Config::resolve(
            ConductorToml::default(),
            env(&[("WEBHOOK_SECRET", "s"), ("GITHUB_APP_ID", "42")]),
        )
        .unwrap();
        assert!(partial.require_github().is_err());
    }

    #[test]
    fn test_private_key_path() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("app.pem");
        std::fs::write(&key_path, "PEM").unwrap();
        let path = key_path.to_string_lossy().to_string();
        let config = Config::resolve(
            ConductorToml::default(),
            env(&[("WEBHOOK_SECRET", "s"), ("GITHUB_PRIVATE_KEY_PATH", path.as_str())]),
        )
        .unwrap();
        assert_eq!(config.github.private_key.as_deref(), Some("PEM"));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        std::fs::write(&path, "[server]\nport = 9999\n").unwrap();
        let toml = ConductorToml::load(&path).unwrap();
        assert_eq!(toml.server.port, Some(9999));

        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(matches!(
            ConductorToml::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validate_warns_about_missing_agents() {
        let config = Config::resolve(
            ConductorToml::default(),
            env(&[("WEBHOOK_SECRET", "s"), ("AGENT_TESTING_URL", "http://t")]),
        )
        .unwrap();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("AGENT_SECURITY_URL")));
        assert!(!warnings.iter().any(|w| w.contains("AGENT_TESTING_URL")));
        assert!(warnings.iter().any(|w| w.contains("GitHub App credentials")));
    }
}
