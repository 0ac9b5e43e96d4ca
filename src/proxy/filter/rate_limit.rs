use crate::config::types::ClientRateLimitSettings;
use crate::proxy::context::RequestContext;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use super::FilterResult;

/// Global per-client rate limiter: one token bucket per client IP.
///
/// Capacity is `max_requests` per `interval` seconds. Buckets live in a
/// concurrent map and carry their own small lock for token accounting;
/// entries idle for `GC_EXPIRE_SECS` are evicted by the background cleanup
/// loop so the map never grows without bound.
pub struct ClientRateLimiter {
    buckets: DashMap<IpAddr, Arc<Bucket>>,
}

/// `tokio::sync::Mutex` so waiting callers yield to the runtime instead of
/// blocking a worker thread.
struct Bucket {
    inner: Mutex<BucketInner>,
    /// Last access in microseconds since process start; updated outside the lock.
    last_access: AtomicU64,
}

struct BucketInner {
    tokens: u64,
    last_refill: u64,
    rate_per_us: f64,
    max_tokens: u64,
}

/// Entries not accessed for this long are eligible for eviction.
const GC_EXPIRE_SECS: u64 = 300;
/// Hard cap on tracked clients. Beyond it, the oldest entries are evicted
/// regardless of last-access time.
const MAX_ENTRIES: usize = 100_000;

/// Fixed-point precision for fractional token refill.
const PRECISION: u64 = 1_000_000;

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

impl Default for ClientRateLimiter {
    fn default() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }
}

impl ClientRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if allowed, `false` if the client is over its budget.
    pub async fn check(&self, settings: &ClientRateLimitSettings, client: IpAddr) -> bool {
        let interval = settings.interval.max(1);
        let max_requests = (settings.max_requests.max(1)) as u64;
        let rate_per_us = max_requests as f64 / (interval as f64 * 1_000_000.0);
        let max_tokens = max_requests * PRECISION;

        // Fast path: known client — no allocation.
        let bucket = if let Some(entry) = self.buckets.get(&client) {
            entry.value().clone()
        } else {
            self.buckets
                .entry(client)
                .or_insert_with(|| {
                    let now = now_us();
                    Arc::new(Bucket {
                        inner: Mutex::new(BucketInner {
                            tokens: max_tokens,
                            last_refill: now,
                            rate_per_us,
                            max_tokens,
                        }),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };

        bucket.last_access.store(now_us(), Ordering::Relaxed);
        bucket.try_acquire(rate_per_us, max_tokens).await
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    /// Remove entries idle for `GC_EXPIRE_SECS`; then force-evict the oldest
    /// entries if the map still exceeds `MAX_ENTRIES`. Called by the server's
    /// cleanup loop every 5 minutes.
    pub fn evict_stale(&self) {
        let now = now_us();
        let expire_us = GC_EXPIRE_SECS * 1_000_000;

        self.buckets
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);

        let overflow = self.buckets.len().saturating_sub(MAX_ENTRIES);
        if overflow == 0 {
            return;
        }
        let mut entries: Vec<(IpAddr, u64)> = self
            .buckets
            .iter()
            .map(|r| {
                let age = now.saturating_sub(r.value().last_access.load(Ordering::Relaxed));
                (*r.key(), age)
            })
            .collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in entries.into_iter().take(overflow) {
            self.buckets.remove(&key);
        }
    }
}

impl Bucket {
    /// Refill from elapsed time, then consume one token. The refill rate is
    /// recomputed from the live settings on every call so a reload takes
    /// effect in place, without touching existing buckets.
    async fn try_acquire(&self, rate_per_us: f64, max_tokens: u64) -> bool {
        let now = now_us();
        let mut b = self.inner.lock().await;
        b.rate_per_us = rate_per_us;
        b.max_tokens = max_tokens;

        let elapsed = now.saturating_sub(b.last_refill);
        if elapsed > 0 {
            let refill = (elapsed as f64 * b.rate_per_us * PRECISION as f64) as u64;
            b.tokens = (b.tokens + refill).min(b.max_tokens);
            b.last_refill = now;
        }

        if b.tokens >= PRECISION {
            b.tokens -= PRECISION;
            true
        } else {
            false
        }
    }
}

pub(super) async fn rate_limit_on_request(
    settings: &ClientRateLimitSettings,
    limiter: &ClientRateLimiter,
    ctx: &RequestContext,
) -> FilterResult {
    if !settings.enabled {
        return FilterResult::Continue;
    }

    if limiter.check(settings, ctx.client_ip).await {
        metrics::counter!("proxy_client_rate_limit_total", "verdict" => "allowed").increment(1);
        return FilterResult::Continue;
    }

    tracing::debug!("filter: rate_limit: rejected, client={}", ctx.client_ip);
    metrics::counter!("proxy_client_rate_limit_total", "verdict" => "rejected").increment(1);
    FilterResult::Reject(ctx.rate_limited_response(settings.interval))
}
