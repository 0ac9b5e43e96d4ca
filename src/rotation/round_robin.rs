use super::CandidatePool;
use crate::error::ProxyError;
use crate::storage::Upstream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Round-robin over the candidate snapshot using a modular atomic cursor:
/// within one snapshot, any cycle of `len` selects returns each candidate
/// exactly once.
pub struct RoundRobinSelector {
    pool: CandidatePool,
    cursor: AtomicU64,
}

impl RoundRobinSelector {
    pub fn new(pool: CandidatePool) -> Self {
        Self {
            pool,
            cursor: AtomicU64::new(0),
        }
    }

    pub fn do_select(&self) -> Result<Upstream, ProxyError> {
        let candidates = self.pool.snapshot();
        if candidates.is_empty() {
            return Err(ProxyError::NoUpstream);
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        let idx = (n % candidates.len() as u64) as usize;
        Ok(candidates[idx].clone())
    }

    pub async fn refresh(&self) -> Result<usize, ProxyError> {
        let before = self.pool.snapshot().len();
        let snapshot = self.pool.refresh().await?;
        // A different set size leaves the cursor pointing mid-cycle into a
        // snapshot it never cycled over; restart the rotation.
        if snapshot.len() != before {
            self.cursor.store(0, Ordering::Relaxed);
        }
        Ok(snapshot.len())
    }

    pub fn candidates(&self) -> Arc<Vec<Upstream>> {
        self.pool.snapshot()
    }
}
