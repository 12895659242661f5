//! The slice of GitHub webhook payloads the router reads.

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub full_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct User {
    pub login: String,
    #[serde(rename = "type", default)]
    pub user_type: Option<String>,
}

impl User {
    pub fn is_bot(&self) -> bool {
        self.user_type.as_deref() == Some("Bot") || self.login.ends_with("[bot]")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub merged: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestEvent {
    pub action: String,
    pub pull_request: PullRequest,
    pub repository: Repository,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestLink {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Issue {
    pub number: u64,
    /// Present when the "issue" is a pull request.
    #[serde(default)]
    pub pull_request: Option<PullRequestLink>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IssuesEvent {
    pub action: String,
    pub issue: Issue,
    pub repository: Repository,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Comment {
    pub body: String,
    pub user: User,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IssueCommentEvent {
    pub action: String,
    pub issue: Issue,
    pub comment: Comment,
    pub repository: Repository,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReviewCommentEvent {
    pub action: String,
    pub pull_request: PullRequest,
    pub comment: Comment,
    pub repository: Repository,
}
