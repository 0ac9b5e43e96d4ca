use crate::storage::{
    RequestLogStore, RequestOutcome, RequestRecord, Upstream, UpstreamRepository, UpstreamStatus,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Records request outcomes to the request log and the upstream counters.
///
/// Recording is fire-and-forget from the engine's point of view: `record`
/// spawns the writes and returns immediately, and store errors are logged
/// but never surface to the client response.
#[derive(Clone)]
pub struct UsageTracker {
    repo: Arc<dyn UpstreamRepository>,
    request_log: Arc<dyn RequestLogStore>,
}

impl UsageTracker {
    pub fn new(repo: Arc<dyn UpstreamRepository>, request_log: Arc<dyn RequestLogStore>) -> Self {
        Self { repo, request_log }
    }

    pub fn record(&self, upstream: &Upstream, outcome: RequestOutcome) {
        let tracker = self.clone();
        let upstream_id = upstream.id;
        let was_failed = upstream.status == UpstreamStatus::Failed;
        tokio::spawn(async move {
            tracker.record_now(upstream_id, was_failed, outcome).await;
        });
    }

    /// Synchronous variant for callers already running in a background task.
    /// `was_failed` is the upstream's status as seen at selection time.
    pub async fn record_now(&self, upstream_id: i64, was_failed: bool, outcome: RequestOutcome) {
        metrics::counter!(
            "proxy_upstream_results_total",
            "result" => if outcome.success { "success" } else { "failure" },
        )
        .increment(1);

        let record = RequestRecord {
            upstream_id,
            success: outcome.success,
            response_time_ms: outcome.latency_ms,
            status_code: outcome.status_code,
        };
        if let Err(e) = self.request_log.append(&record).await {
            warn!(
                "tracker: request log append failed, upstream_id={}, error={}",
                upstream_id, e
            );
        }

        if let Err(e) = self
            .repo
            .increment_counters(upstream_id, outcome.success, outcome.latency_ms)
            .await
        {
            warn!(
                "tracker: counter update failed, upstream_id={}, error={}",
                upstream_id, e
            );
        }

        // A succeeding upstream that the health subsystem had written off is
        // promoted back; every other status transition belongs to that
        // subsystem.
        if outcome.success && was_failed {
            match self
                .repo
                .set_status(upstream_id, UpstreamStatus::Active, None)
                .await
            {
                Ok(()) => debug!("tracker: promoted upstream {} back to active", upstream_id),
                Err(e) => warn!(
                    "tracker: promote to active failed, upstream_id={}, error={}",
                    upstream_id, e
                ),
            }
        }

        if let Some(err) = outcome.error {
            debug!(
                "tracker: recorded failure, upstream_id={}, error={}",
                upstream_id, err
            );
        }
    }
}
