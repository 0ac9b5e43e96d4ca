use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Infrastructure configuration — loaded once at startup from file + env.
// Runtime behavior (rotation, auth, client rate limit) lives in `Settings`
// and is reloadable from the settings store.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Optional path-rewriting passthrough rule for a single API prefix.
    #[serde(default)]
    pub passthrough: Option<PassthroughConfig>,

    #[serde(default)]
    pub background: BackgroundConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://127.0.0.1:5432/spindle".to_string()
}

fn default_max_connections() -> u32 {
    10
}

/// Requests whose path is `/<prefix>` or starts with `/<prefix>/` are
/// rewritten to `target` (scheme + host) and forwarded through the pool.
/// The rewritten path is treated as public: it bypasses client
/// authentication but stays behind the per-client rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassthroughConfig {
    pub prefix: String,
    /// Absolute base, e.g. "https://api.example.com".
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// How often the active selector reloads its candidate set (seconds).
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// How often stale per-client limiter buckets are evicted (seconds).
    #[serde(default = "default_limiter_gc_interval")]
    pub limiter_gc_interval_secs: u64,

    /// How often the settings store is polled for a version change (seconds).
    #[serde(default = "default_settings_poll_interval")]
    pub settings_poll_interval_secs: u64,

    /// How long shutdown waits for in-flight requests and tunnels (seconds).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            limiter_gc_interval_secs: default_limiter_gc_interval(),
            settings_poll_interval_secs: default_settings_poll_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_limiter_gc_interval() -> u64 {
    300
}

fn default_settings_poll_interval() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Runtime settings — one logical record in the settings store, versioned,
// mutable at runtime. Unknown fields are ignored; every field has a default
// so a partial record is always usable.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub rotation: RotationSettings,

    #[serde(default)]
    pub authentication: AuthSettings,

    #[serde(default)]
    pub rate_limit: ClientRateLimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationSettings {
    /// Selection strategy. Unknown values fall back to `random`.
    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub time_based: TimeBasedSettings,

    #[serde(default)]
    pub rate_limited: RateLimitedSettings,

    /// Drop `failed` upstreams from the candidate set.
    #[serde(default = "default_true")]
    pub remove_unhealthy: bool,

    /// Re-select a different upstream when the chosen one fails to connect.
    #[serde(default = "default_true")]
    pub fallback: bool,

    /// Upper bound on upstream-switching attempts (enforced >= 1).
    #[serde(default = "default_fallback_max_retries")]
    pub fallback_max_retries: u32,

    #[serde(default)]
    pub follow_redirect: bool,

    /// Per-attempt deadline in seconds, covering dial and response headers.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Same-upstream re-dials on connect error inside one attempt.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Empty means all protocols are allowed.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub allowed_protocols: Vec<String>,

    /// Filter threshold in milliseconds; 0 disables the filter.
    #[serde(default)]
    pub max_response_time: i64,

    /// Filter threshold in percent (0..100); 0 disables the filter.
    #[serde(default)]
    pub min_success_rate: f64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            method: default_method(),
            time_based: TimeBasedSettings::default(),
            rate_limited: RateLimitedSettings::default(),
            remove_unhealthy: true,
            fallback: true,
            fallback_max_retries: default_fallback_max_retries(),
            follow_redirect: false,
            timeout: default_timeout(),
            retries: default_retries(),
            allowed_protocols: Vec::new(),
            max_response_time: 0,
            min_success_rate: 0.0,
        }
    }
}

impl RotationSettings {
    pub fn method(&self) -> RotationMethod {
        RotationMethod::parse(&self.method)
    }

    /// Attempts the fallback loop may make; always at least one.
    pub fn attempts(&self) -> u32 {
        if self.fallback {
            self.fallback_max_retries.max(1)
        } else {
            1
        }
    }
}

fn default_method() -> String {
    "random".to_string()
}

fn default_fallback_max_retries() -> u32 {
    3
}

fn default_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBasedSettings {
    /// Slot size in seconds for the time-slot strategy.
    #[serde(default = "default_time_slot_interval")]
    pub interval: u64,
}

impl Default for TimeBasedSettings {
    fn default() -> Self {
        Self {
            interval: default_time_slot_interval(),
        }
    }
}

fn default_time_slot_interval() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitedSettings {
    /// Per-window successful-request cap per upstream.
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,

    /// Sliding window size in seconds.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for RateLimitedSettings {
    fn default() -> Self {
        Self {
            max_requests_per_minute: default_max_requests_per_minute(),
            window_seconds: default_window_seconds(),
        }
    }
}

fn default_max_requests_per_minute() -> u32 {
    30
}

fn default_window_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub users: Vec<ProxyUser>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyUser {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRateLimitSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Window length in seconds.
    #[serde(default = "default_client_interval")]
    pub interval: u64,

    /// Requests allowed per client IP per window.
    #[serde(default = "default_client_max_requests")]
    pub max_requests: u32,
}

impl Default for ClientRateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_client_interval(),
            max_requests: default_client_max_requests(),
        }
    }
}

fn default_client_interval() -> u64 {
    60
}

fn default_client_max_requests() -> u32 {
    100
}

/// Upstream selection strategy. String values in the settings record accept
/// the historical aliases; anything unrecognised selects `Random`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationMethod {
    Random,
    RoundRobin,
    LeastUsed,
    TimeSlot,
    RateLimited,
}

impl RotationMethod {
    pub fn parse(s: &str) -> Self {
        match s {
            "round-robin" | "roundrobin" => RotationMethod::RoundRobin,
            "least-conn" | "least_conn" | "least_connections" => RotationMethod::LeastUsed,
            "time-based" | "time_based" => RotationMethod::TimeSlot,
            "rate-limited" | "rate_limited" => RotationMethod::RateLimited,
            _ => RotationMethod::Random,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RotationMethod::Random => "random",
            RotationMethod::RoundRobin => "round-robin",
            RotationMethod::LeastUsed => "least-conn",
            RotationMethod::TimeSlot => "time-based",
            RotationMethod::RateLimited => "rate-limited",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.rotation.method, "random");
        assert_eq!(s.rotation.time_based.interval, 120);
        assert_eq!(s.rotation.rate_limited.max_requests_per_minute, 30);
        assert_eq!(s.rotation.rate_limited.window_seconds, 60);
        assert!(s.rotation.remove_unhealthy);
        assert!(s.rotation.fallback);
        assert_eq!(s.rotation.fallback_max_retries, 3);
        assert!(!s.rotation.follow_redirect);
        assert_eq!(s.rotation.timeout, 30);
        assert_eq!(s.rotation.retries, 1);
        assert!(s.rotation.allowed_protocols.is_empty());
        assert_eq!(s.rotation.max_response_time, 0);
        assert_eq!(s.rotation.min_success_rate, 0.0);

        assert!(!s.authentication.enabled);
        assert!(s.authentication.users.is_empty());

        assert!(!s.rate_limit.enabled);
        assert_eq!(s.rate_limit.interval, 60);
        assert_eq!(s.rate_limit.max_requests, 100);
    }

    #[test]
    fn test_settings_unknown_fields_ignored() {
        let json = r#"{"rotation": {"method": "round-robin", "shiny": true}, "dashboard": {}}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.rotation.method(), RotationMethod::RoundRobin);
    }

    #[test]
    fn test_settings_full() {
        let json = r#"{
            "rotation": {
                "method": "rate_limited",
                "time_based": {"interval": 60},
                "rate_limited": {"max_requests_per_minute": 10, "window_seconds": 30},
                "remove_unhealthy": false,
                "fallback": true,
                "fallback_max_retries": 5,
                "follow_redirect": true,
                "timeout": 15,
                "retries": 2,
                "allowed_protocols": ["http", "socks5"],
                "max_response_time": 2000,
                "min_success_rate": 80.0
            },
            "authentication": {
                "enabled": true,
                "users": [{"username": "alice", "password": "s3cret"}]
            },
            "rate_limit": {"enabled": true, "interval": 10, "max_requests": 50}
        }"#;

        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.rotation.method(), RotationMethod::RateLimited);
        assert_eq!(s.rotation.time_based.interval, 60);
        assert_eq!(s.rotation.rate_limited.max_requests_per_minute, 10);
        assert_eq!(s.rotation.rate_limited.window_seconds, 30);
        assert!(!s.rotation.remove_unhealthy);
        assert_eq!(s.rotation.fallback_max_retries, 5);
        assert!(s.rotation.follow_redirect);
        assert_eq!(s.rotation.timeout, 15);
        assert_eq!(s.rotation.retries, 2);
        assert_eq!(s.rotation.allowed_protocols, vec!["http", "socks5"]);
        assert_eq!(s.rotation.max_response_time, 2000);
        assert_eq!(s.rotation.min_success_rate, 80.0);
        assert!(s.authentication.enabled);
        assert_eq!(s.authentication.users.len(), 1);
        assert_eq!(s.authentication.users[0].username, "alice");
        assert!(s.rate_limit.enabled);
        assert_eq!(s.rate_limit.interval, 10);
        assert_eq!(s.rate_limit.max_requests, 50);
    }

    #[test]
    fn test_null_users_defaults_to_empty() {
        let json = r#"{"authentication": {"enabled": true, "users": null}}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert!(s.authentication.users.is_empty());
    }

    #[test]
    fn test_null_allowed_protocols_defaults_to_empty() {
        let json = r#"{"rotation": {"allowed_protocols": null}}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert!(s.rotation.allowed_protocols.is_empty());
    }

    #[test]
    fn test_method_aliases() {
        assert_eq!(RotationMethod::parse("random"), RotationMethod::Random);
        assert_eq!(RotationMethod::parse("round-robin"), RotationMethod::RoundRobin);
        assert_eq!(RotationMethod::parse("roundrobin"), RotationMethod::RoundRobin);
        assert_eq!(RotationMethod::parse("least-conn"), RotationMethod::LeastUsed);
        assert_eq!(RotationMethod::parse("least_conn"), RotationMethod::LeastUsed);
        assert_eq!(
            RotationMethod::parse("least_connections"),
            RotationMethod::LeastUsed
        );
        assert_eq!(RotationMethod::parse("time-based"), RotationMethod::TimeSlot);
        assert_eq!(RotationMethod::parse("time_based"), RotationMethod::TimeSlot);
        assert_eq!(
            RotationMethod::parse("rate-limited"),
            RotationMethod::RateLimited
        );
        assert_eq!(
            RotationMethod::parse("rate_limited"),
            RotationMethod::RateLimited
        );
        assert_eq!(RotationMethod::parse("banana"), RotationMethod::Random);
        assert_eq!(RotationMethod::parse(""), RotationMethod::Random);
    }

    #[test]
    fn test_attempts_bounds() {
        let mut r = RotationSettings::default();
        r.fallback = true;
        r.fallback_max_retries = 0;
        assert_eq!(r.attempts(), 1);
        r.fallback_max_retries = 4;
        assert_eq!(r.attempts(), 4);
        r.fallback = false;
        assert_eq!(r.attempts(), 1);
    }

    #[test]
    fn test_proxy_config_defaults() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.database.url, "postgres://127.0.0.1:5432/spindle");
        assert_eq!(cfg.database.max_connections, 10);
        assert!(cfg.passthrough.is_none());
        assert_eq!(cfg.background.refresh_interval_secs, 30);
        assert_eq!(cfg.background.limiter_gc_interval_secs, 300);
        assert_eq!(cfg.background.settings_poll_interval_secs, 30);
        assert_eq!(cfg.background.shutdown_grace_secs, 30);
    }

    #[test]
    fn test_proxy_config_toml() {
        let toml_src = r#"
            [database]
            url = "postgres://db:5432/pool"
            max_connections = 4

            [passthrough]
            prefix = "api"
            target = "https://api.example.com"
        "#;
        let cfg: ProxyConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.database.url, "postgres://db:5432/pool");
        assert_eq!(cfg.database.max_connections, 4);
        let pt = cfg.passthrough.unwrap();
        assert_eq!(pt.prefix, "api");
        assert_eq!(pt.target, "https://api.example.com");
    }

    #[test]
    fn test_settings_roundtrip() {
        let mut s = Settings::default();
        s.rotation.method = "time-based".to_string();
        s.authentication.enabled = true;
        s.authentication.users.push(ProxyUser {
            username: "bob".to_string(),
            password: "pw".to_string(),
        });

        let serialized = serde_json::to_string(&s).unwrap();
        let deserialized: Settings = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.rotation.method(), RotationMethod::TimeSlot);
        assert!(deserialized.authentication.enabled);
        assert_eq!(deserialized.authentication.users[0].username, "bob");
    }
}
