use super::CandidatePool;
use crate::error::ProxyError;
use crate::storage::{RequestLogStore, Upstream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// Internal budget for the usage-count query so that selection can never
/// monopolise a request's deadline.
const STORE_QUERY_BUDGET: Duration = Duration::from_secs(10);

/// Selection state guarded by one lock: the cached under-limit subset, its
/// expiry, and the round-robin cursor over it. Holding the lock across the
/// store query also collapses concurrent cache misses into a single query.
struct WindowState {
    available: Arc<Vec<Upstream>>,
    expires_at: Instant,
    cursor: u64,
}

/// Excludes any upstream whose successful-request count over the trailing
/// window has reached `max_requests`, then round-robins among the rest.
///
/// The under-limit subset is computed from the request log with a single
/// grouped query and cached for `cache_ttl` (window/5, capped at 2s) to
/// amortise store load. The cache deliberately ignores in-flight selections:
/// over-selection within one cache window is bounded by roughly
/// `select_rate x cache_ttl`, which operators account for by configuring
/// `max_requests` below the hard ceiling.
pub struct RateLimitedSelector {
    pool: CandidatePool,
    request_log: Arc<dyn RequestLogStore>,
    max_requests: i64,
    window_secs: u64,
    cache_ttl: Duration,
    state: Mutex<WindowState>,
}

impl RateLimitedSelector {
    pub fn new(
        pool: CandidatePool,
        request_log: Arc<dyn RequestLogStore>,
        max_requests: u32,
        window_secs: u64,
    ) -> Self {
        let window_secs = window_secs.max(1);
        let cache_ttl = Duration::from_secs((window_secs / 5).min(2));
        Self {
            pool,
            request_log,
            max_requests: max_requests.max(1) as i64,
            window_secs,
            cache_ttl,
            state: Mutex::new(WindowState {
                available: Arc::new(Vec::new()),
                expires_at: Instant::now(),
                cursor: 0,
            }),
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    pub async fn do_select(&self) -> Result<Upstream, ProxyError> {
        let candidates = self.pool.snapshot();
        if candidates.is_empty() {
            return Err(ProxyError::NoUpstream);
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();

        // An empty cached subset is never reused: once anything could have
        // aged out of the window, the next select must look again.
        if now >= state.expires_at || state.available.is_empty() {
            let available = Arc::new(self.compute_available(&candidates).await);
            state.available = available;
            state.expires_at = now + self.cache_ttl;
        }

        if state.available.is_empty() {
            return Err(ProxyError::AllRateLimited {
                window_secs: self.window_secs,
            });
        }

        let idx = (state.cursor % state.available.len() as u64) as usize;
        state.cursor += 1;
        Ok(state.available[idx].clone())
    }

    /// One grouped query over the whole candidate set; upstreams absent from
    /// the result have no qualifying events and stay available. A failing or
    /// slow store degrades open: every candidate is treated as available.
    async fn compute_available(&self, candidates: &[Upstream]) -> Vec<Upstream> {
        let ids: Vec<i64> = candidates.iter().map(|u| u.id).collect();
        let counts = tokio::time::timeout(
            STORE_QUERY_BUDGET,
            self.request_log
                .count_by_upstream(&ids, self.window_secs, true),
        )
        .await;

        match counts {
            Ok(Ok(counts)) => candidates
                .iter()
                .filter(|u| counts.get(&u.id).copied().unwrap_or(0) < self.max_requests)
                .cloned()
                .collect(),
            Ok(Err(e)) => {
                warn!(
                    "rotation: usage query failed, serving all candidates, error={}",
                    e
                );
                candidates.to_vec()
            }
            Err(_) => {
                warn!(
                    "rotation: usage query exceeded {}s budget, serving all candidates",
                    STORE_QUERY_BUDGET.as_secs()
                );
                candidates.to_vec()
            }
        }
    }

    pub async fn refresh(&self) -> Result<usize, ProxyError> {
        let snapshot = self.pool.refresh().await?;
        // Invalidate the window cache; the cursor restarts with the new set.
        let mut state = self.state.lock().await;
        state.available = Arc::new(Vec::new());
        state.expires_at = Instant::now();
        state.cursor = 0;
        Ok(snapshot.len())
    }

    pub fn candidates(&self) -> Arc<Vec<Upstream>> {
        self.pool.snapshot()
    }
}
