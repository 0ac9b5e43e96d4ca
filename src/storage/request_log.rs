use crate::error::ProxyError;
use crate::storage::model::RequestRecord;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

/// Append-only time-series of per-upstream request outcomes.
///
/// Retention is an external concern; queries only ever look at a recent
/// window of seconds to minutes.
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    async fn append(&self, record: &RequestRecord) -> Result<(), ProxyError>;

    /// Count events per upstream over the trailing window, in one grouped
    /// query. Upstreams with no qualifying events are absent from the map.
    async fn count_by_upstream(
        &self,
        upstream_ids: &[i64],
        since_seconds: u64,
        success_only: bool,
    ) -> Result<HashMap<i64, i64>, ProxyError>;
}

pub struct PgRequestLogStore {
    pool: PgPool,
}

impl PgRequestLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestLogStore for PgRequestLogStore {
    async fn append(&self, record: &RequestRecord) -> Result<(), ProxyError> {
        sqlx::query(
            "INSERT INTO request_logs (upstream_id, created_at, success, response_time_ms, status_code) \
             VALUES ($1, now(), $2, $3, $4)",
        )
        .bind(record.upstream_id)
        .bind(record.success)
        .bind(record.response_time_ms)
        .bind(record.status_code.map(|c| c as i32))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_by_upstream(
        &self,
        upstream_ids: &[i64],
        since_seconds: u64,
        success_only: bool,
    ) -> Result<HashMap<i64, i64>, ProxyError> {
        if upstream_ids.is_empty() {
            return Ok(HashMap::new());
        }

        // The window is a bound scalar fed through make_interval — never a
        // string-interpolated SQL fragment.
        let rows = sqlx::query(
            "SELECT upstream_id, COUNT(*) AS hits \
             FROM request_logs \
             WHERE upstream_id = ANY($1) \
               AND created_at >= now() - make_interval(secs => $2) \
               AND ($3::bool = FALSE OR success) \
             GROUP BY upstream_id",
        )
        .bind(upstream_ids)
        .bind(since_seconds as f64)
        .bind(success_only)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("upstream_id").map_err(ProxyError::from)?;
            let hits: i64 = row.try_get("hits").map_err(ProxyError::from)?;
            counts.insert(id, hits);
        }
        Ok(counts)
    }
}
