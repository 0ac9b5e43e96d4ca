use super::CandidatePool;
use crate::error::ProxyError;
use crate::storage::Upstream;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Deterministic wall-clock rotation: all selects inside the same
/// `interval_secs` slot land on the same candidate, and the slot index walks
/// the set in order. No per-select state, no mutation.
pub struct TimeSlotSelector {
    pool: CandidatePool,
    interval_secs: u64,
}

impl TimeSlotSelector {
    pub fn new(pool: CandidatePool, interval_secs: u64) -> Self {
        Self {
            pool,
            interval_secs: interval_secs.max(1),
        }
    }

    pub fn do_select(&self) -> Result<Upstream, ProxyError> {
        let candidates = self.pool.snapshot();
        if candidates.is_empty() {
            return Err(ProxyError::NoUpstream);
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let idx = self.slot_index(now, candidates.len());
        Ok(candidates[idx].clone())
    }

    fn slot_index(&self, unix_seconds: u64, len: usize) -> usize {
        ((unix_seconds / self.interval_secs) % len as u64) as usize
    }

    pub async fn refresh(&self) -> Result<usize, ProxyError> {
        Ok(self.pool.refresh().await?.len())
    }

    pub fn candidates(&self) -> Arc<Vec<Upstream>> {
        self.pool.snapshot()
    }
}
