use super::CandidatePool;
use crate::error::ProxyError;
use crate::storage::Upstream;
use std::sync::Arc;

/// Picks the candidate with the fewest lifetime requests. Ties break on the
/// first occurrence in address order, and the selector itself never mutates
/// counters — they only move when the tracker records an outcome.
pub struct LeastUsedSelector {
    pool: CandidatePool,
}

impl LeastUsedSelector {
    pub fn new(pool: CandidatePool) -> Self {
        Self { pool }
    }

    pub fn do_select(&self) -> Result<Upstream, ProxyError> {
        let candidates = self.pool.snapshot();
        let mut best: Option<&Upstream> = None;
        for candidate in candidates.iter() {
            match best {
                // Strict comparison keeps the first of equally used candidates.
                Some(current) if candidate.requests >= current.requests => {}
                _ => best = Some(candidate),
            }
        }
        best.cloned().ok_or(ProxyError::NoUpstream)
    }

    pub async fn refresh(&self) -> Result<usize, ProxyError> {
        Ok(self.pool.refresh().await?.len())
    }

    pub fn candidates(&self) -> Arc<Vec<Upstream>> {
        self.pool.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::testutil::{upstream, FakeRepository};
    use crate::rotation::RotationFilters;
    use crate::storage::UpstreamStatus;

    fn selector_with(upstreams: Vec<Upstream>) -> LeastUsedSelector {
        let pool = CandidatePool::new(
            Arc::new(FakeRepository::with(upstreams)),
            RotationFilters {
                statuses: vec![UpstreamStatus::Active, UpstreamStatus::Idle],
                allowed_protocols: Vec::new(),
                max_response_time_ms: 0,
                min_success_rate_pct: 0.0,
            },
        );
        LeastUsedSelector::new(pool)
    }

    fn used(id: i64, address: &str, requests: i64) -> Upstream {
        let mut u = upstream(id, address);
        u.requests = requests;
        u.successful_requests = requests;
        u
    }

    #[tokio::test]
    async fn test_picks_minimum_lifetime_requests() {
        let s = selector_with(vec![
            used(1, "a:1", 12),
            used(2, "b:1", 3),
            used(3, "c:1", 7),
        ]);
        s.refresh().await.unwrap();
        assert_eq!(s.do_select().unwrap().id, 2);
        // No counter mutation by the selector — the pick is stable.
        assert_eq!(s.do_select().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_tie_breaks_on_first_occurrence() {
        let s = selector_with(vec![
            used(1, "a:1", 5),
            used(2, "b:1", 5),
            used(3, "c:1", 9),
        ]);
        s.refresh().await.unwrap();
        assert_eq!(s.do_select().unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_empty_pool_fails() {
        let s = selector_with(vec![]);
        s.refresh().await.unwrap();
        assert!(matches!(s.do_select(), Err(ProxyError::NoUpstream)));
    }
}
