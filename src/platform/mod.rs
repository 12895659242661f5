//! Hosting platform boundary.
//!
//! The engine only talks to the platform through [`PlatformClient`]. The
//! GitHub REST adapter lives in [`github`]; [`retry::RetryingPlatform`]
//! wraps any client with backoff and a shared rate-limit pause.

pub mod github;
pub mod retry;

use async_trait::async_trait;

use crate::errors::PlatformError;
use crate::models::{IssueContext, MergeStrategy, PrContext, Recommendation, WorkUnitKey};

/// Operations the engine needs from the hosting platform.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn pull_request(&self, repository: &str, number: u64)
    -> Result<PrContext, PlatformError>;

    async fn issue(&self, repository: &str, number: u64) -> Result<IssueContext, PlatformError>;

    async fn add_labels(&self, key: &WorkUnitKey, labels: &[String]) -> Result<(), PlatformError>;

    /// Remove one label. A label that is already gone is not an error.
    async fn remove_label(&self, key: &WorkUnitKey, label: &str) -> Result<(), PlatformError>;

    async fn post_comment(&self, key: &WorkUnitKey, body: &str) -> Result<(), PlatformError>;

    async fn merge(
        &self,
        repository: &str,
        number: u64,
        strategy: MergeStrategy,
    ) -> Result<(), PlatformError>;

    async fn close(&self, key: &WorkUnitKey) -> Result<(), PlatformError>;

    /// Structured review support, when the platform has it.
    fn review_commenter(&self) -> Option<&dyn ReviewCommenter> {
        None
    }
}

/// Capability to post a review carrying a verdict rather than a plain comment.
#[async_trait]
pub trait ReviewCommenter: Send + Sync {
    async fn post_review(
        &self,
        repository: &str,
        number: u64,
        recommendation: Recommendation,
        body: &str,
    ) -> Result<(), PlatformError>;
}
