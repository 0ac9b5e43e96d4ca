use crate::error::ProxyError;
use crate::storage::model::{Protocol, Upstream, UpstreamStatus};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Row filter for `list_upstreams`. An empty status list means no filtering.
#[derive(Debug, Clone, Default)]
pub struct UpstreamFilter {
    pub statuses: Vec<UpstreamStatus>,
}

impl UpstreamFilter {
    pub fn with_statuses(statuses: &[UpstreamStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
        }
    }
}

/// Persistence contract for the upstream inventory.
///
/// Counter increments happen inside the database so concurrent recorders
/// never race; there is no in-memory contention path.
#[async_trait]
pub trait UpstreamRepository: Send + Sync {
    /// List upstreams matching the filter, ordered by address so that
    /// selector snapshots are deterministic.
    async fn list_upstreams(&self, filter: &UpstreamFilter) -> Result<Vec<Upstream>, ProxyError>;

    /// Atomically bump the lifetime counters for one request outcome. On
    /// success the rolling average response time is folded in as an
    /// equal-weight EMA.
    async fn increment_counters(
        &self,
        upstream_id: i64,
        success: bool,
        latency_ms: i64,
    ) -> Result<(), ProxyError>;

    async fn set_status(
        &self,
        upstream_id: i64,
        status: UpstreamStatus,
        last_error: Option<&str>,
    ) -> Result<(), ProxyError>;
}

pub struct PgUpstreamRepository {
    pool: PgPool,
}

impl PgUpstreamRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const UPSTREAM_COLUMNS: &str = "id, address, protocol, username, password, status, \
     requests, successful_requests, failed_requests, avg_response_time_ms, \
     last_check_at, last_error, created_at, updated_at";

fn upstream_from_row(row: &PgRow) -> Result<Upstream, sqlx::Error> {
    let protocol: String = row.try_get("protocol")?;
    let status: String = row.try_get("status")?;
    Ok(Upstream {
        id: row.try_get("id")?,
        address: row.try_get("address")?,
        protocol: Protocol::parse(&protocol),
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        status: UpstreamStatus::parse(&status),
        requests: row.try_get("requests")?,
        successful_requests: row.try_get("successful_requests")?,
        failed_requests: row.try_get("failed_requests")?,
        avg_response_time_ms: row.try_get("avg_response_time_ms")?,
        last_check_at: row.try_get("last_check_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl UpstreamRepository for PgUpstreamRepository {
    async fn list_upstreams(&self, filter: &UpstreamFilter) -> Result<Vec<Upstream>, ProxyError> {
        let rows = if filter.statuses.is_empty() {
            let sql = format!("SELECT {UPSTREAM_COLUMNS} FROM upstreams ORDER BY address");
            sqlx::query(&sql).fetch_all(&self.pool).await?
        } else {
            let statuses: Vec<String> = filter
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect();
            let sql = format!(
                "SELECT {UPSTREAM_COLUMNS} FROM upstreams WHERE status = ANY($1) ORDER BY address"
            );
            sqlx::query(&sql)
                .bind(&statuses)
                .fetch_all(&self.pool)
                .await?
        };

        let mut upstreams = Vec::with_capacity(rows.len());
        for row in &rows {
            upstreams.push(upstream_from_row(row).map_err(ProxyError::from)?);
        }
        Ok(upstreams)
    }

    async fn increment_counters(
        &self,
        upstream_id: i64,
        success: bool,
        latency_ms: i64,
    ) -> Result<(), ProxyError> {
        // Single-statement update keeps `requests = successful + failed`
        // invariant without a transaction. The EMA seeds from the first
        // sample instead of halving it against zero.
        sqlx::query(
            "UPDATE upstreams SET \
                 requests = requests + 1, \
                 successful_requests = successful_requests + CASE WHEN $2 THEN 1 ELSE 0 END, \
                 failed_requests = failed_requests + CASE WHEN $2 THEN 0 ELSE 1 END, \
                 avg_response_time_ms = CASE \
                     WHEN NOT $2 THEN avg_response_time_ms \
                     WHEN avg_response_time_ms = 0 THEN $3 \
                     ELSE (avg_response_time_ms + $3) / 2 \
                 END, \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(upstream_id)
        .bind(success)
        .bind(latency_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        upstream_id: i64,
        status: UpstreamStatus,
        last_error: Option<&str>,
    ) -> Result<(), ProxyError> {
        sqlx::query(
            "UPDATE upstreams SET status = $2, last_error = $3, updated_at = now() WHERE id = $1",
        )
        .bind(upstream_id)
        .bind(status.as_str())
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
