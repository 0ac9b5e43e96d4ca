pub mod least_used;
pub mod random;
pub mod rate_limited;
pub mod round_robin;
pub mod time_slot;

use crate::config::types::{RotationMethod, RotationSettings};
use crate::error::ProxyError;
use crate::storage::{RequestLogStore, Upstream, UpstreamFilter, UpstreamRepository, UpstreamStatus};
use arc_swap::ArcSwap;
use least_used::LeastUsedSelector;
use random::RandomSelector;
use rate_limited::RateLimitedSelector;
use round_robin::RoundRobinSelector;
use std::sync::Arc;
use time_slot::TimeSlotSelector;

/// Rotation filters applied when a selector refreshes its candidate set.
/// Tightening any of these can only shrink the set.
#[derive(Debug, Clone)]
pub struct RotationFilters {
    pub statuses: Vec<UpstreamStatus>,
    /// Empty means every protocol is allowed.
    pub allowed_protocols: Vec<String>,
    /// 0 disables the threshold.
    pub max_response_time_ms: i64,
    /// 0 disables the threshold; otherwise percent in 0..100.
    pub min_success_rate_pct: f64,
}

impl RotationFilters {
    pub fn from_settings(rotation: &RotationSettings) -> Self {
        let statuses = if rotation.remove_unhealthy {
            vec![UpstreamStatus::Active, UpstreamStatus::Idle]
        } else {
            vec![
                UpstreamStatus::Active,
                UpstreamStatus::Idle,
                UpstreamStatus::Failed,
            ]
        };
        Self {
            statuses,
            allowed_protocols: rotation.allowed_protocols.clone(),
            max_response_time_ms: rotation.max_response_time,
            min_success_rate_pct: rotation.min_success_rate,
        }
    }

    /// Post-status filters; the status filter itself is pushed down into the
    /// repository query.
    pub fn matches(&self, upstream: &Upstream) -> bool {
        if !self.allowed_protocols.is_empty()
            && !self
                .allowed_protocols
                .iter()
                .any(|p| p == upstream.protocol.as_str())
        {
            return false;
        }

        if self.max_response_time_ms > 0 && upstream.avg_response_time_ms > self.max_response_time_ms
        {
            return false;
        }

        if self.min_success_rate_pct > 0.0 {
            if let Some(rate) = upstream.success_rate() {
                if rate < self.min_success_rate_pct {
                    return false;
                }
            }
        }

        true
    }
}

/// Shared candidate snapshot. Every selector variant owns one; `refresh`
/// replaces the whole snapshot atomically and `snapshot` is a lock-free load,
/// so concurrent selects never observe a partially updated set.
pub struct CandidatePool {
    repo: Arc<dyn UpstreamRepository>,
    filters: RotationFilters,
    candidates: ArcSwap<Vec<Upstream>>,
}

impl CandidatePool {
    pub fn new(repo: Arc<dyn UpstreamRepository>, filters: RotationFilters) -> Self {
        Self {
            repo,
            filters,
            candidates: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub async fn refresh(&self) -> Result<Arc<Vec<Upstream>>, ProxyError> {
        let filter = UpstreamFilter::with_statuses(&self.filters.statuses);
        let listed = self
            .repo
            .list_upstreams(&filter)
            .await
            .map_err(|e| ProxyError::SelectorLoad(e.to_string()))?;

        let filtered: Vec<Upstream> = listed
            .into_iter()
            .filter(|u| self.filters.matches(u))
            .collect();

        let snapshot = Arc::new(filtered);
        self.candidates.store(snapshot.clone());
        Ok(snapshot)
    }

    pub fn snapshot(&self) -> Arc<Vec<Upstream>> {
        self.candidates.load_full()
    }
}

/// Enum-based selector family — no trait objects, no dynamic dispatch.
///
/// The server owns the active selector behind an `ArcSwap`; a settings
/// reload builds a replacement and swaps it in whole, so the forwarding
/// engine never sees a half-reconfigured strategy.
pub enum Selector {
    Random(RandomSelector),
    RoundRobin(RoundRobinSelector),
    LeastUsed(LeastUsedSelector),
    TimeSlot(TimeSlotSelector),
    RateLimited(RateLimitedSelector),
}

impl Selector {
    pub fn build(
        rotation: &RotationSettings,
        repo: Arc<dyn UpstreamRepository>,
        request_log: Arc<dyn RequestLogStore>,
    ) -> Self {
        let filters = RotationFilters::from_settings(rotation);
        let pool = CandidatePool::new(repo, filters);
        match rotation.method() {
            RotationMethod::Random => Selector::Random(RandomSelector::new(pool)),
            RotationMethod::RoundRobin => Selector::RoundRobin(RoundRobinSelector::new(pool)),
            RotationMethod::LeastUsed => Selector::LeastUsed(LeastUsedSelector::new(pool)),
            RotationMethod::TimeSlot => {
                Selector::TimeSlot(TimeSlotSelector::new(pool, rotation.time_based.interval))
            }
            RotationMethod::RateLimited => Selector::RateLimited(RateLimitedSelector::new(
                pool,
                request_log,
                rotation.rate_limited.max_requests_per_minute,
                rotation.rate_limited.window_seconds,
            )),
        }
    }

    pub fn method(&self) -> RotationMethod {
        match self {
            Selector::Random(_) => RotationMethod::Random,
            Selector::RoundRobin(_) => RotationMethod::RoundRobin,
            Selector::LeastUsed(_) => RotationMethod::LeastUsed,
            Selector::TimeSlot(_) => RotationMethod::TimeSlot,
            Selector::RateLimited(_) => RotationMethod::RateLimited,
        }
    }

    /// Pick one upstream. Safe under concurrent callers.
    pub async fn select(&self) -> Result<Upstream, ProxyError> {
        match self {
            Selector::Random(s) => s.do_select(),
            Selector::RoundRobin(s) => s.do_select(),
            Selector::LeastUsed(s) => s.do_select(),
            Selector::TimeSlot(s) => s.do_select(),
            Selector::RateLimited(s) => s.do_select().await,
        }
    }

    /// Reload the candidate set from the repository, applying the rotation
    /// filters. Returns the new candidate count.
    pub async fn refresh(&self) -> Result<usize, ProxyError> {
        match self {
            Selector::Random(s) => s.refresh().await,
            Selector::RoundRobin(s) => s.refresh().await,
            Selector::LeastUsed(s) => s.refresh().await,
            Selector::TimeSlot(s) => s.refresh().await,
            Selector::RateLimited(s) => s.refresh().await,
        }
    }

    pub fn candidates(&self) -> Arc<Vec<Upstream>> {
        match self {
            Selector::Random(s) => s.candidates(),
            Selector::RoundRobin(s) => s.candidates(),
            Selector::LeastUsed(s) => s.candidates(),
            Selector::TimeSlot(s) => s.candidates(),
            Selector::RateLimited(s) => s.candidates(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::storage::model::Protocol;
    use std::sync::Arc;

    fn filters() -> RotationFilters {
        RotationFilters {
            statuses: vec![UpstreamStatus::Active, UpstreamStatus::Idle],
            allowed_protocols: Vec::new(),
            max_response_time_ms: 0,
            min_success_rate_pct: 0.0,
        }
    }

    #[test]
    fn test_filter_protocol() {
        let mut f = filters();
        f.allowed_protocols = vec!["socks5".to_string()];
        let mut u = upstream(1, "a:1");
        assert!(!f.matches(&u));
        u.protocol = Protocol::Socks5;
        assert!(f.matches(&u));
    }

    #[test]
    fn test_filter_max_response_time() {
        let mut f = filters();
        f.max_response_time_ms = 500;
        let mut u = upstream(1, "a:1");
        u.avg_response_time_ms = 499;
        assert!(f.matches(&u));
        u.avg_response_time_ms = 501;
        assert!(!f.matches(&u));
        // 0 disables the threshold.
        f.max_response_time_ms = 0;
        assert!(f.matches(&u));
    }

    #[test]
    fn test_filter_min_success_rate_skips_fresh_upstreams() {
        let mut f = filters();
        f.min_success_rate_pct = 90.0;
        let mut u = upstream(1, "a:1");
        // No requests yet — the rate filter does not apply.
        assert!(f.matches(&u));
        u.requests = 10;
        u.successful_requests = 8;
        u.failed_requests = 2;
        assert!(!f.matches(&u));
        u.successful_requests = 9;
        u.failed_requests = 1;
        assert!(f.matches(&u));
    }

    #[tokio::test]
    async fn test_refresh_applies_filters_and_orders() {
        let mut slow = upstream(2, "b:1");
        slow.avg_response_time_ms = 900;
        let repo = Arc::new(FakeRepository::with(vec![
            upstream(3, "c:1"),
            slow,
            upstream(1, "a:1"),
        ]));
        let mut f = filters();
        f.max_response_time_ms = 500;
        let pool = CandidatePool::new(repo, f);

        let snap = pool.refresh().await.unwrap();
        let addrs: Vec<&str> = snap.iter().map(|u| u.address.as_str()).collect();
        assert_eq!(addrs, vec!["a:1", "c:1"]);
    }

    #[tokio::test]
    async fn test_tightening_filters_never_enlarges_set() {
        let mut mixed = Vec::new();
        for i in 0..6 {
            let mut u = upstream(i, &format!("h{}:1", i));
            u.requests = 10;
            u.successful_requests = 5 + i;
            u.failed_requests = 10 - u.successful_requests;
            mixed.push(u);
        }
        let repo: Arc<dyn UpstreamRepository> = Arc::new(FakeRepository::with(mixed));

        let mut loose = filters();
        loose.min_success_rate_pct = 50.0;
        let loose_len = CandidatePool::new(repo.clone(), loose)
            .refresh()
            .await
            .unwrap()
            .len();

        let mut tight = filters();
        tight.min_success_rate_pct = 90.0;
        let tight_len = CandidatePool::new(repo, tight)
            .refresh()
            .await
            .unwrap()
            .len();

        assert!(tight_len <= loose_len);
    }

    #[tokio::test]
    async fn test_build_matches_method() {
        let repo: Arc<dyn UpstreamRepository> = Arc::new(FakeRepository::with(vec![]));
        let log: Arc<dyn RequestLogStore> = Arc::new(FakeRequestLog::empty());

        for (name, method) in [
            ("random", RotationMethod::Random),
            ("roundrobin", RotationMethod::RoundRobin),
            ("least_connections", RotationMethod::LeastUsed),
            ("time_based", RotationMethod::TimeSlot),
            ("rate-limited", RotationMethod::RateLimited),
            ("unknown-strategy", RotationMethod::Random),
        ] {
            let mut rotation = crate::config::types::RotationSettings::default();
            rotation.method = name.to_string();
            let selector = Selector::build(&rotation, repo.clone(), log.clone());
            assert_eq!(selector.method(), method, "method {}", name);
        }
    }

    #[tokio::test]
    async fn test_selector_usable_after_refresh_recovers_candidates() {
        let repo = Arc::new(FakeRepository::with(vec![]));
        let log: Arc<dyn RequestLogStore> = Arc::new(FakeRequestLog::empty());
        let rotation = crate::config::types::RotationSettings::default();
        let selector = Selector::build(&rotation, repo.clone(), log);

        selector.refresh().await.unwrap();
        assert!(matches!(
            selector.select().await,
            Err(ProxyError::NoUpstream)
        ));

        repo.upstreams.lock().unwrap().push(upstream(1, "a:1"));
        selector.refresh().await.unwrap();
        assert_eq!(selector.select().await.unwrap().id, 1);
    }
}
