//! PR/Issue analyzer.
//!
//! Takes a fresh platform snapshot of a work unit and derives what review it
//! needs. Requests for the same work unit that arrive while an analysis is
//! running join that analysis instead of starting a second one.

pub mod heuristics;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, info};

use crate::errors::PlatformError;
use crate::models::{EntityKind, IssueContext, PrContext, WorkUnitKey};
use crate::platform::PlatformClient;

pub use heuristics::{IssueAnalysis, IssueType, PrAnalysis, analyze_issue, analyze_pr};

#[derive(Debug)]
pub struct PrAnalyzed {
    /// Identifies one analyzer run; joined callers see the same id.
    pub id: u64,
    pub context: PrContext,
    pub analysis: PrAnalysis,
}

#[derive(Debug)]
pub struct IssueAnalyzed {
    pub id: u64,
    pub context: IssueContext,
    pub analysis: IssueAnalysis,
}

#[derive(Debug, Clone)]
pub enum Analyzed {
    PullRequest(Arc<PrAnalyzed>),
    Issue(Arc<IssueAnalyzed>),
}

impl Analyzed {
    pub fn id(&self) -> u64 {
        match self {
            Self::PullRequest(pr) => pr.id,
            Self::Issue(issue) => issue.id,
        }
    }
}

type AnalysisResult = Result<Analyzed, Arc<PlatformError>>;
type InFlight = Shared<BoxFuture<'static, AnalysisResult>>;

pub struct Analyzer {
    platform: Arc<dyn PlatformClient>,
    stale_after: chrono::Duration,
    in_flight: Mutex<HashMap<WorkUnitKey, (u64, InFlight)>>,
    next_id: AtomicU64,
}

impl Analyzer {
    pub fn new(platform: Arc<dyn PlatformClient>, stale_after: chrono::Duration) -> Self {
        Self {
            platform,
            stale_after,
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Analyzer runs started so far.
    pub fn invocations(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }

    /// Snapshot and analyze `key`, joining a run already in flight for it.
    pub async fn analyze(&self, key: &WorkUnitKey) -> AnalysisResult {
        let (id, future) = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(key) {
                Some((id, future)) => {
                    debug!(work_unit = %key, analysis = id, "joining in-flight analysis");
                    (*id, future.clone())
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = run(
                        Arc::clone(&self.platform),
                        key.clone(),
                        self.stale_after,
                        id,
                    )
                    .boxed()
                    .shared();
                    in_flight.insert(key.clone(), (id, future.clone()));
                    (id, future)
                }
            }
        };

        let outcome = future.await;

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.get(key).is_some_and(|(current, _)| *current == id) {
            in_flight.remove(key);
        }
        outcome
    }
}

async fn run(
    platform: Arc<dyn PlatformClient>,
    key: WorkUnitKey,
    stale_after: chrono::Duration,
    id: u64,
) -> AnalysisResult {
    match key.kind {
        EntityKind::PullRequest => {
            let context = platform
                .pull_request(&key.repository, key.number)
                .await
                .map_err(Arc::new)?;
            let analysis = analyze_pr(&context, stale_after);
            info!(
                work_unit = %key,
                analysis = id,
                required = ?analysis.required(),
                risk = analysis.risk_level.as_str(),
                "pull request analyzed"
            );
            Ok(Analyzed::PullRequest(Arc::new(PrAnalyzed {
                id,
                context,
                analysis,
            })))
        }
        EntityKind::Issue => {
            let context = platform
                .issue(&key.repository, key.number)
                .await
                .map_err(Arc::new)?;
            let analysis = analyze_issue(&context);
            info!(
                work_unit = %key,
                analysis = id,
                issue_type = analysis.issue_type.as_str(),
                priority = analysis.priority.as_str(),
                "issue analyzed"
            );
            Ok(Analyzed::Issue(Arc::new(IssueAnalyzed {
                id,
                context,
                analysis,
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePlatform, issue_context, pr_context};
    use std::time::Duration;

    fn analyzer(fake: Arc<FakePlatform>) -> Analyzer {
        Analyzer::new(fake, chrono::Duration::days(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_run() {
        let fake = Arc::new(FakePlatform::new().with_fetch_delay(Duration::from_millis(500)));
        fake.insert_pull_request(pr_context("octo/repo", 1));
        let analyzer = analyzer(fake.clone());
        let key = WorkUnitKey::pull_request("octo/repo", 1);

        let (a, b) = tokio::join!(analyzer.analyze(&key), analyzer.analyze(&key));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id(), b.id());
        assert_eq!(fake.fetches("pull_request"), 1);
        assert_eq!(analyzer.invocations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_requests_take_fresh_snapshots() {
        let fake = Arc::new(FakePlatform::new());
        fake.insert_pull_request(pr_context("octo/repo", 1));
        let analyzer = analyzer(fake.clone());
        let key = WorkUnitKey::pull_request("octo/repo", 1);

        let first = analyzer.analyze(&key).await.unwrap();
        let second = analyzer.analyze(&key).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(fake.fetches("pull_request"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_units_run_independently() {
        let fake = Arc::new(FakePlatform::new().with_fetch_delay(Duration::from_millis(100)));
        fake.insert_pull_request(pr_context("octo/repo", 1));
        fake.insert_pull_request(pr_context("octo/repo", 2));
        let analyzer = analyzer(fake.clone());
        let first = WorkUnitKey::pull_request("octo/repo", 1);
        let second = WorkUnitKey::pull_request("octo/repo", 2);

        let (a, b) = tokio::join!(analyzer.analyze(&first), analyzer.analyze(&second));
        assert_ne!(a.unwrap().id(), b.unwrap().id());
        assert_eq!(fake.fetches("pull_request"), 2);
    }

    #[tokio::test]
    async fn test_issue_analysis() {
        let fake = Arc::new(FakePlatform::new());
        let mut issue = issue_context("octo/repo", 9);
        issue.title = "Docs for webhook setup".into();
        fake.insert_issue(issue);
        let analyzer = analyzer(fake);

        match analyzer.analyze(&WorkUnitKey::issue("octo/repo", 9)).await.unwrap() {
            Analyzed::Issue(issue) => {
                assert_eq!(issue.analysis.issue_type, IssueType::Documentation)
            }
            other => panic!("expected issue analysis, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_platform_error_is_shared_and_cleared() {
        let fake = Arc::new(FakePlatform::new());
        fake.insert_pull_request(pr_context("octo/repo", 1));
        fake.fail_next(
            "pull_request",
            vec![PlatformError::Transient("502 bad gateway".into())],
        );
        let analyzer = analyzer(fake);
        let key = WorkUnitKey::pull_request("octo/repo", 1);

        let err = analyzer.analyze(&key).await.unwrap_err();
        assert!(err.is_retryable());
        // the failed run is not cached
        assert!(analyzer.analyze(&key).await.is_ok());
    }
}
