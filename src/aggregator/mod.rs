//! Result aggregation and reporting.
//!
//! [`Aggregator::collect`] waits for one review cycle's dispatches, bounded
//! by the aggregation horizon. Once a work unit has no outstanding tasks,
//! [`report::build`] turns its latest tasks into a [`FinalReport`] and the
//! [`Reporter`] publishes it.

pub mod report;
pub mod reporter;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::metrics::{SharedMetrics, names};
use crate::models::{FailureReason, WorkUnitKey};
use crate::tasks::WorkUnitStore;

pub use report::{CategoryResult, FinalReport, Outcome, ReportMetrics, render, render_status};
pub use reporter::{Published, Reporter};

pub struct Aggregator {
    store: Arc<WorkUnitStore>,
    horizon: Duration,
    metrics: SharedMetrics,
}

impl Aggregator {
    pub fn new(store: Arc<WorkUnitStore>, horizon: Duration, metrics: SharedMetrics) -> Self {
        Self {
            store,
            horizon,
            metrics,
        }
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Drive `runs` to completion or until the horizon elapses. On timeout
    /// the outstanding tasks among `task_ids` fail with
    /// `aggregation_timeout`. Returns whether the horizon was hit.
    pub async fn collect<F>(&self, key: &WorkUnitKey, task_ids: &[Uuid], runs: F) -> bool
    where
        F: Future<Output = ()>,
    {
        if tokio::time::timeout(self.horizon, runs).await.is_ok() {
            return false;
        }
        let cancelled = self
            .store
            .cancel_tasks(key, task_ids, FailureReason::AggregationTimeout);
        warn!(
            work_unit = %key,
            cancelled = cancelled.len(),
            horizon = ?self.horizon,
            "aggregation horizon elapsed"
        );
        self.metrics.increment(
            names::ERRORS,
            &[("type", "aggregation_timeout"), ("component", "aggregator")],
        );
        true
    }

    /// The unit's report, once nothing is outstanding.
    pub fn ready_report(&self, key: &WorkUnitKey) -> Option<FinalReport> {
        let unit = self.store.get(key)?;
        if unit.retired {
            return None;
        }
        report::build(&unit)
    }
}
