use crate::config::types::Settings;
use crate::error::ProxyError;
use async_trait::async_trait;
use sqlx::{PgPool, Row};

/// Versioned single-record store for the runtime settings.
///
/// The management plane writes the record; this crate reads it at startup
/// and polls the version to detect reloads. `save` exists so operational
/// tooling built on this crate can seed or adjust the record.
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    /// Current record and its version, or `None` when nothing has been
    /// written yet (the caller falls back to defaults).
    async fn load(&self) -> Result<Option<(Settings, i64)>, ProxyError>;

    /// Latest version without fetching the payload — cheap to poll.
    async fn current_version(&self) -> Result<Option<i64>, ProxyError>;

    /// Persist the record, bumping the version. Returns the new version.
    async fn save(&self, settings: &Settings) -> Result<i64, ProxyError>;
}

pub struct PgSettingsRepository {
    pool: PgPool,
}

impl PgSettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for PgSettingsRepository {
    async fn load(&self) -> Result<Option<(Settings, i64)>, ProxyError> {
        let row = sqlx::query("SELECT version, data FROM proxy_settings WHERE id")
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let version: i64 = row.try_get("version").map_err(ProxyError::from)?;
        let data: serde_json::Value = row.try_get("data").map_err(ProxyError::from)?;
        // Unknown fields are ignored and missing fields default, so a record
        // written by a newer or older management plane still parses.
        let settings: Settings = serde_json::from_value(data)
            .map_err(|e| ProxyError::Config(format!("settings record: {}", e)))?;
        Ok(Some((settings, version)))
    }

    async fn current_version(&self) -> Result<Option<i64>, ProxyError> {
        let row = sqlx::query("SELECT version FROM proxy_settings WHERE id")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("version").map_err(ProxyError::from)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, settings: &Settings) -> Result<i64, ProxyError> {
        let data = serde_json::to_value(settings)
            .map_err(|e| ProxyError::Internal(format!("settings serialize: {}", e)))?;
        let row = sqlx::query(
            "INSERT INTO proxy_settings (id, version, data) VALUES (TRUE, 1, $1) \
             ON CONFLICT (id) DO UPDATE \
                 SET version = proxy_settings.version + 1, data = EXCLUDED.data \
             RETURNING version",
        )
        .bind(data)
        .fetch_one(&self.pool)
        .await?;
        row.try_get("version").map_err(ProxyError::from)
    }
}
