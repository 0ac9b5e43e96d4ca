use super::CandidatePool;
use crate::error::ProxyError;
use crate::storage::Upstream;
use rand::Rng;
use std::sync::Arc;

/// Uniform random selection. `thread_rng` is an OS-seeded CSPRNG, so the
/// rotation order is not predictable from outside.
pub struct RandomSelector {
    pool: CandidatePool,
}

impl RandomSelector {
    pub fn new(pool: CandidatePool) -> Self {
        Self { pool }
    }

    pub fn do_select(&self) -> Result<Upstream, ProxyError> {
        let candidates = self.pool.snapshot();
        if candidates.is_empty() {
            return Err(ProxyError::NoUpstream);
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Ok(candidates[idx].clone())
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
    use std::collections::HashMap;

    fn pool_with(upstreams: Vec<Upstream>) -> CandidatePool {
        CandidatePool::new(
            Arc::new(FakeRepository::with(upstreams)),
            RotationFilters {
                statuses: vec![UpstreamStatus::Active, UpstreamStatus::Idle],
                allowed_protocols: Vec::new(),
                max_response_time_ms: 0,
                min_success_rate_pct: 0.0,
            },
        )
    }

    #[tokio::test]
    async fn test_empty_pool_fails() {
        let s = RandomSelector::new(pool_with(vec![]));
        s.refresh().await.unwrap();
        assert!(matches!(s.do_select(), Err(ProxyError::NoUpstream)));
    }

    #[tokio::test]
    async fn test_select_returns_members_roughly_uniformly() {
        let s = RandomSelector::new(pool_with(vec![
            upstream(1, "a:1"),
            upstream(2, "b:1"),
            upstream(3, "c:1"),
        ]));
        s.refresh().await.unwrap();

        let mut counts: HashMap<i64, usize> = HashMap::new();
        for _ in 0..3000 {
            let u = s.do_select().unwrap();
            assert!((1..=3).contains(&u.id));
            *counts.entry(u.id).or_insert(0) += 1;
        }
        for id in 1..=3 {
            let n = counts[&id];
            assert!((700..1300).contains(&n), "id {} count {}", id, n);
        }
    }
}
