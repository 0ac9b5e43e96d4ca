use crate::config::types::Settings;
use crate::config::{ProxyConfig, SettingsStore};
use crate::error::ProxyError;
use crate::proxy::filter::ClientRateLimiter;
use crate::proxy::forward::OutboundClients;
use crate::proxy::passthrough::PassthroughRewriter;
use crate::rotation::Selector;
use crate::server::inflight::InFlight;
use crate::storage::settings::SettingsRepository;
use crate::storage::{RequestLogStore, UpstreamRepository};
use crate::tracker::UsageTracker;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared server state, cheaply cloneable.
///
/// The active selector lives behind an `ArcSwap`: the engine loads it per
/// request and holds no long-lived reference, so a settings reload swaps
/// strategies atomically from the engine's perspective.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<ProxyConfig>,
    pub settings: SettingsStore,
    pub selector: Arc<ArcSwap<Selector>>,
    pub limiter: Arc<ClientRateLimiter>,
    pub tracker: UsageTracker,
    pub clients: Arc<OutboundClients>,
    pub passthrough: Option<Arc<PassthroughRewriter>>,
    /// Drain registry for shutdown: open connections plus detached tunnel
    /// splices, which outlive the requests that started them.
    pub in_flight: Arc<InFlight>,
    repo: Arc<dyn UpstreamRepository>,
    request_log: Arc<dyn RequestLogStore>,
    settings_repo: Arc<dyn SettingsRepository>,
}

impl ProxyState {
    pub async fn new(
        config: Arc<ProxyConfig>,
        repo: Arc<dyn UpstreamRepository>,
        request_log: Arc<dyn RequestLogStore>,
        settings_repo: Arc<dyn SettingsRepository>,
    ) -> Result<Self, ProxyError> {
        let passthrough = match config.passthrough {
            Some(ref cfg) => Some(Arc::new(PassthroughRewriter::new(cfg)?)),
            None => None,
        };

        let (settings, version) = match settings_repo.load().await {
            Ok(Some((settings, version))) => (settings, version),
            Ok(None) => {
                info!("settings: no record in store, starting with defaults");
                (Settings::default(), 0)
            }
            Err(e) => {
                // The record is external; an unreachable store at boot must
                // not keep the listener down.
                warn!("settings: load failed, starting with defaults, error={}", e);
                (Settings::default(), 0)
            }
        };
        let settings_store = SettingsStore::new(settings, version);

        let selector = Selector::build(
            &settings_store.current().rotation,
            repo.clone(),
            request_log.clone(),
        );
        match selector.refresh().await {
            Ok(count) => info!(
                "rotation: selector ready, method={}, candidates={}",
                selector.method().as_str(),
                count
            ),
            Err(e) => warn!(
                "rotation: initial refresh failed (serving 502 until upstreams load), error={}",
                e
            ),
        }

        Ok(Self {
            config,
            settings: settings_store,
            selector: Arc::new(ArcSwap::from_pointee(selector)),
            limiter: Arc::new(ClientRateLimiter::new()),
            tracker: UsageTracker::new(repo.clone(), request_log.clone()),
            clients: Arc::new(OutboundClients::new()),
            passthrough,
            in_flight: InFlight::new(),
            repo,
            request_log,
            settings_repo,
        })
    }

    /// Refresh the active selector's candidate set. Failures keep the
    /// previous snapshot; selection degrades to `NoUpstream` only when the
    /// snapshot was already empty.
    pub async fn refresh_selector(&self) {
        let selector = self.selector.load_full();
        match selector.refresh().await {
            Ok(count) => {
                metrics::gauge!("proxy_rotation_candidates").set(count as f64);
                tracing::debug!("rotation: refreshed, candidates={}", count);
            }
            Err(e) => warn!("rotation: refresh failed, error={}", e),
        }
    }

    /// Install a newer settings record: rebuild the selector for the (maybe
    /// changed) method, refresh it, swap it in atomically, and drop cached
    /// outbound clients so timeout/redirect changes apply. Middleware reads
    /// the settings snapshot per request, so it updates in place.
    pub async fn apply_settings(&self, settings: Settings, version: i64) {
        if !self.settings.install(settings, version) {
            return;
        }

        let rotation = self.settings.current().rotation.clone();
        let selector = Selector::build(&rotation, self.repo.clone(), self.request_log.clone());
        match selector.refresh().await {
            Ok(count) => info!(
                "settings: reloaded v{}, method={}, candidates={}",
                version,
                selector.method().as_str(),
                count
            ),
            Err(e) => warn!(
                "settings: reloaded v{}, but selector refresh failed, error={}",
                version, e
            ),
        }
        self.selector.store(Arc::new(selector));
        self.clients.invalidate();
        metrics::counter!("proxy_settings_reloads_total").increment(1);
    }

    /// One settings poll: apply the stored record when its version moved.
    pub async fn poll_settings_once(&self) -> Result<(), ProxyError> {
        let Some(version) = self.settings_repo.current_version().await? else {
            return Ok(());
        };
        if version <= self.settings.version() {
            return Ok(());
        }
        if let Some((settings, version)) = self.settings_repo.load().await? {
            self.apply_settings(settings, version).await;
        }
        Ok(())
    }
}
