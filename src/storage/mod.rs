pub mod model;
pub mod repository;
pub mod request_log;
pub mod settings;

pub use model::{Protocol, RequestOutcome, RequestRecord, Upstream, UpstreamStatus};
pub use repository::{PgUpstreamRepository, UpstreamFilter, UpstreamRepository};
pub use request_log::{PgRequestLogStore, RequestLogStore};
pub use settings::{PgSettingsRepository, SettingsRepository};

use crate::config::DatabaseConfig;
use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Connect the shared Postgres pool used by all three store contracts.
///
/// The inventory, the request log and the settings record are owned by
/// external collaborator subsystems (management API, retention jobs,
/// migrations); this crate only reads and appends through the contracts in
/// this module.
pub async fn connect(cfg: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&cfg.url)
        .await?;
    tracing::info!("storage: connected, max_connections={}", cfg.max_connections);
    Ok(pool)
}
