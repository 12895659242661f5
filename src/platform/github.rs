//! GitHub REST adapter authenticated as a GitHub App installation.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::{Method, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::{PlatformClient, ReviewCommenter};
use crate::config::GitHubCredentials;
use crate::errors::PlatformError;
use crate::metrics::{SharedMetrics, names};
use crate::models::{
    ChangedFile, IssueContext, MergeStrategy, PrContext, Recommendation, WorkUnitKey,
};

const USER_AGENT: &str = concat!("conductor/", env!("CARGO_PKG_VERSION"));
const FILES_PER_PAGE: usize = 100;
/// GitHub stops listing pull request files after 3000 entries.
const MAX_FILE_PAGES: usize = 30;
/// Refresh installation tokens this long before they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct UserRef {
    login: String,
}

#[derive(Debug, Deserialize)]
struct LabelRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BranchRef {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    number: u64,
    title: String,
    body: Option<String>,
    user: UserRef,
    head: BranchRef,
    base: BranchRef,
    #[serde(default)]
    labels: Vec<LabelRef>,
    #[serde(default)]
    draft: bool,
    state: String,
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PullFileResponse {
    filename: String,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    number: u64,
    title: String,
    body: Option<String>,
    user: UserRef,
    #[serde(default)]
    labels: Vec<LabelRef>,
    state: String,
    #[serde(default)]
    comments: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PullRequestResponse {
    fn into_context(self, repository: &str, files: Vec<PullFileResponse>) -> PrContext {
        PrContext {
            repository: repository.to_string(),
            number: self.number,
            title: self.title,
            body: self.body.unwrap_or_default(),
            author: self.user.login,
            base_branch: self.base.ref_name,
            head_branch: self.head.ref_name,
            head_sha: self.head.sha,
            files: files
                .into_iter()
                .map(|f| ChangedFile {
                    path: f.filename,
                    additions: f.additions,
                    deletions: f.deletions,
                    status: f.status,
                })
                .collect(),
            additions: self.additions,
            deletions: self.deletions,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            draft: self.draft,
            open: self.state == "open",
            merged: self.merged,
            updated_at: self.updated_at,
            snapshot_at: Utc::now(),
        }
    }
}

impl IssueResponse {
    fn into_context(self, repository: &str) -> IssueContext {
        IssueContext {
            repository: repository.to_string(),
            number: self.number,
            title: self.title,
            body: self.body.unwrap_or_default(),
            author: self.user.login,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            open: self.state == "open",
            comments: self.comments,
            created_at: self.created_at,
            updated_at: self.updated_at,
            snapshot_at: Utc::now(),
        }
    }
}

/// Map a failed response onto the platform error classes.
pub fn classify_response(
    status: u16,
    remaining: Option<u64>,
    reset_epoch: Option<i64>,
    message: String,
) -> PlatformError {
    let rate_limited = status == 429 || (status == 403 && remaining == Some(0));
    if rate_limited {
        let reset_at = reset_epoch
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(60));
        return PlatformError::RateLimited { reset_at };
    }
    match status {
        404 => PlatformError::NotFound(message),
        500..=599 => PlatformError::Transient(format!("{}: {}", status, message)),
        _ => PlatformError::Client { status, message },
    }
}

fn header_value<T: std::str::FromStr>(response: &Response, name: &str) -> Option<T> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// `/repos/{repo}/issues/{n}/labels/{label}` with the label as one encoded segment.
fn label_path(key: &WorkUnitKey, label: &str) -> Result<String, PlatformError> {
    let mut url = reqwest::Url::parse("https://api.github.com/repos")
        .context("Failed to build label URL")?;
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.extend(key.repository.split('/'));
        segments.extend(["issues", &key.number.to_string(), "labels", label]);
    }
    Ok(url.path().to_string())
}

#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    credentials: GitHubCredentials,
    token_cache: Arc<RwLock<Option<(String, DateTime<Utc>)>>>,
    metrics: SharedMetrics,
}

impl GitHubClient {
    pub fn new(credentials: GitHubCredentials, metrics: SharedMetrics) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        // Fail at startup rather than on the first webhook.
        EncodingKey::from_rsa_pem(credentials.private_key.as_bytes())
            .context("Failed to parse GitHub App private key")?;
        Ok(Self {
            client,
            credentials,
            token_cache: Arc::new(RwLock::new(None)),
            metrics,
        })
    }

    fn generate_jwt(&self) -> anyhow::Result<String> {
        let now = Utc::now().timestamp();
        let claims = GitHubAppClaims {
            iss: self.credentials.app_id,
            iat: now - 60,
            exp: now + 600,
        };
        let key = EncodingKey::from_rsa_pem(self.credentials.private_key.as_bytes())
            .context("Failed to parse private key")?;
        encode(&Header::new(Algorithm::RS256), &claims, &key).context("Failed to encode JWT")
    }

    async fn installation_token(&self) -> Result<String, PlatformError> {
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.as_ref()
                && (*expires_at - Utc::now()).num_seconds() > TOKEN_REFRESH_MARGIN_SECS
            {
                return Ok(token.clone());
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.credentials.api_url, self.credentials.installation_id
        );
        info!("requesting new installation access token");

        let response = self
            .client
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| PlatformError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, %body, "installation token request failed");
            return Err(classify_response(status, None, None, body));
        }

        let token: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;
        *self.token_cache.write().await = Some((token.token.clone(), token.expires_at));
        Ok(token.token)
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response, PlatformError> {
        let token = self.installation_token().await?;
        let url = format!("{}{}", self.credentials.api_url, path);
        debug!(operation, %method, %url, "github request");

        let mut request = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            self.metrics.increment(
                names::API_CALLS,
                &[("method", method.as_str()), ("endpoint", operation), ("status", "network")],
            );
            PlatformError::Transient(e.to_string())
        })?;

        let status = response.status();
        self.metrics.increment(
            names::API_CALLS,
            &[
                ("method", method.as_str()),
                ("endpoint", operation),
                ("status", status.as_str()),
            ],
        );
        let remaining: Option<u64> = header_value(&response, "x-ratelimit-remaining");
        if let Some(remaining) = remaining {
            self.metrics
                .gauge(names::RATE_LIMIT_REMAINING, &[], remaining as f64);
        }

        if status.is_success() {
            return Ok(response);
        }
        let reset: Option<i64> = header_value(&response, "x-ratelimit-reset");
        let message = response.text().await.unwrap_or_default();
        Err(classify_response(status.as_u16(), remaining, reset, message))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
    ) -> Result<T, PlatformError> {
        let response = self.send(operation, Method::GET, path, None).await?;
        let parsed = response
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse {} response", operation))?;
        Ok(parsed)
    }
}

#[async_trait]
impl PlatformClient for GitHubClient {
    async fn pull_request(
        &self,
        repository: &str,
        number: u64,
    ) -> Result<PrContext, PlatformError> {
        let pr: PullRequestResponse = self
            .send_json("pull_request", &format!("/repos/{}/pulls/{}", repository, number))
            .await?;

        let mut files = Vec::new();
        for page in 1..=MAX_FILE_PAGES {
            let batch: Vec<PullFileResponse> = self
                .send_json(
                    "pull_request_files",
                    &format!(
                        "/repos/{}/pulls/{}/files?per_page={}&page={}",
                        repository, number, FILES_PER_PAGE, page
                    ),
                )
                .await?;
            let done = batch.len() < FILES_PER_PAGE;
            files.extend(batch);
            if done {
                break;
            }
        }

        Ok(pr.into_context(repository, files))
    }

    async fn issue(&self, repository: &str, number: u64) -> Result<IssueContext, PlatformError> {
        let issue: IssueResponse = self
            .send_json("issue", &format!("/repos/{}/issues/{}", repository, number))
            .await?;
        Ok(issue.into_context(repository))
    }

    async fn add_labels(&self, key: &WorkUnitKey, labels: &[String]) -> Result<(), PlatformError> {
        if labels.is_empty() {
            return Ok(());
        }
        self.send(
            "add_labels",
            Method::POST,
            &format!("/repos/{}/issues/{}/labels", key.repository, key.number),
            Some(json!({ "labels": labels })),
        )
        .await?;
        Ok(())
    }

    async fn remove_label(&self, key: &WorkUnitKey, label: &str) -> Result<(), PlatformError> {
        match self
            .send("remove_label", Method::DELETE, &label_path(key, label)?, None)
            .await
        {
            Ok(_) | Err(PlatformError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn post_comment(&self, key: &WorkUnitKey, body: &str) -> Result<(), PlatformError> {
        self.send(
            "post_comment",
            Method::POST,
            &format!("/repos/{}/issues/{}/comments", key.repository, key.number),
            Some(json!({ "body": body })),
        )
        .await?;
        Ok(())
    }

    async fn merge(
        &self,
        repository: &str,
        number: u64,
        strategy: MergeStrategy,
    ) -> Result<(), PlatformError> {
        self.send(
            "merge",
            Method::PUT,
            &format!("/repos/{}/pulls/{}/merge", repository, number),
            Some(json!({ "merge_method": strategy.as_str() })),
        )
        .await?;
        Ok(())
    }

    async fn close(&self, key: &WorkUnitKey) -> Result<(), PlatformError> {
        self.send(
            "close",
            Method::PATCH,
            &format!("/repos/{}/issues/{}", key.repository, key.number),
            Some(json!({ "state": "closed" })),
        )
        .await?;
        Ok(())
    }

    fn review_commenter(&self) -> Option<&dyn ReviewCommenter> {
        Some(self)
    }
}

#[async_trait]
impl ReviewCommenter for GitHubClient {
    async fn post_review(
        &self,
        repository: &str,
        number: u64,
        recommendation: Recommendation,
        body: &str,
    ) -> Result<(), PlatformError> {
        self.send(
            "post_review",
            Method::POST,
            &format!("/repos/{}/pulls/{}/reviews", repository, number),
            Some(json!({ "body": body, "event": recommendation.review_event() })),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        let err = classify_response(403, Some(0), Some(1_900_000_000), "limit".into());
        match err {
            PlatformError::RateLimited { reset_at } => {
                assert_eq!(reset_at.timestamp(), 1_900_000_000)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            classify_response(429, None, None, String::new()),
            PlatformError::RateLimited { .. }
        ));
    }

    #[test]
    fn test_classify_forbidden_with_quota_is_client_error() {
        assert!(matches!(
            classify_response(403, Some(10), None, "nope".into()),
            PlatformError::Client { status: 403, .. }
        ));
    }

    #[test]
    fn test_classify_other_statuses() {
        assert!(matches!(
            classify_response(404, None, None, "missing".into()),
            PlatformError::NotFound(_)
        ));
        assert!(matches!(
            classify_response(502, None, None, "bad gateway".into()),
            PlatformError::Transient(_)
        ));
        assert!(matches!(
            classify_response(405, None, None, "not mergeable".into()),
            PlatformError::Client { status: 405, .. }
        ));
    }

    #[test]
    fn test_pull_request_response_into_context() {
        let raw = serde_json::json!({
            "number": 42,
            "title": "Add login",
            "body": null,
            "user": {"login": "octocat"},
            "head": {"ref": "feature/login", "sha": "abc123"},
            "base": {"ref": "main", "sha": "def456"},
            "labels": [{"name": "auto-merge"}],
            "draft": false,
            "state": "open",
            "merged": false,
            "additions": 120,
            "deletions": 8,
            "updated_at": "2026-01-02T03:04:05Z"
        });
        let pr: PullRequestResponse = serde_json::from_value(raw).unwrap();
        let files = vec![PullFileResponse {
            filename: "src/auth/login.rs".into(),
            additions: 120,
            deletions: 8,
            status: "modified".into(),
        }];
        let ctx = pr.into_context("octo/repo", files);
        assert_eq!(ctx.number, 42);
        assert_eq!(ctx.body, "");
        assert_eq!(ctx.head_branch, "feature/login");
        assert_eq!(ctx.base_branch, "main");
        assert!(ctx.open);
        assert!(ctx.has_label("auto-merge"));
        assert_eq!(ctx.diff_size(), 128);
        assert_eq!(ctx.files[0].path, "src/auth/login.rs");
    }

    #[test]
    fn test_issue_response_into_context() {
        let raw = serde_json::json!({
            "number": 9,
            "title": "Crash on start",
            "body": "panic at main.rs",
            "user": {"login": "someone"},
            "labels": [],
            "state": "closed",
            "comments": 3,
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-02T00:00:00Z"
        });
        let issue: IssueResponse = serde_json::from_value(raw).unwrap();
        let ctx = issue.into_context("octo/repo");
        assert!(!ctx.open);
        assert_eq!(ctx.comments, 3);
    }

    #[test]
    fn test_label_path_encodes_the_label_segment() {
        let key = WorkUnitKey::pull_request("octo/repo", 5);
        assert_eq!(
            label_path(&key, "risk:low").unwrap(),
            "/repos/octo/repo/issues/5/labels/risk:low"
        );
        assert_eq!(
            label_path(&key, "good first/issue").unwrap(),
            "/repos/octo/repo/issues/5/labels/good%20first%2Fissue"
        );
    }

    #[test]
    fn test_new_rejects_bad_key() {
        let creds = GitHubCredentials {
            app_id: 1,
            installation_id: 2,
            private_key: "not a pem".into(),
            api_url: "https://api.github.com".into(),
        };
        let metrics: SharedMetrics = Arc::new(crate::metrics::NoopMetrics);
        assert!(GitHubClient::new(creds, metrics).is_err());
    }
}
