pub mod store;
pub mod types;

pub use store::SettingsStore;
pub use types::*;

use anyhow::Result;
use std::path::Path;

impl ProxyConfig {
    /// Load infrastructure configuration from a file (if it exists) and apply
    /// environment variable overrides. When the file does not exist, built-in
    /// defaults are used — the proxy can start with zero configuration for
    /// local development.
    ///
    /// Runtime behavior (rotation, authentication, client rate limit) is NOT
    /// configured here; it lives in the settings store and is reloadable.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ProxyConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            ProxyConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded proxy infrastructure configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SPINDLE_DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("SPINDLE_DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse::<u32>() {
                self.database.max_connections = n;
            }
        }

        if let Ok(prefix) = std::env::var("SPINDLE_PASSTHROUGH_PREFIX") {
            let target = std::env::var("SPINDLE_PASSTHROUGH_TARGET").unwrap_or_default();
            if !target.is_empty() {
                self.passthrough = Some(PassthroughConfig { prefix, target });
            }
        }

        if let Ok(v) = std::env::var("SPINDLE_REFRESH_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.background.refresh_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SPINDLE_SETTINGS_POLL_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.background.settings_poll_interval_secs = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("database url cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database max_connections must be at least 1");
        }
        if let Some(ref pt) = self.passthrough {
            if pt.prefix.trim_matches('/').is_empty() {
                anyhow::bail!("passthrough prefix cannot be empty");
            }
            if !pt.target.starts_with("http://") && !pt.target.starts_with("https://") {
                anyhow::bail!("passthrough target must be an absolute http(s) URL");
            }
        }
        if self.background.refresh_interval_secs == 0 {
            anyhow::bail!("refresh interval must be at least 1s");
        }
        Ok(())
    }
}
