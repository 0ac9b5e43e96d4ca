use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::storage::{PgRequestLogStore, PgSettingsRepository, PgUpstreamRepository};
use crate::{server, storage};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Proxy lifecycle: init → connect stores → build state → loops → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();
    let metrics = Metrics::install();

    // Phase 1: configuration and stores.
    let config = Arc::new(ProxyConfig::load(&args.config_path)?);
    let pool = storage::connect(&config.database).await?;
    let repo = Arc::new(PgUpstreamRepository::new(pool.clone()));
    let request_log = Arc::new(PgRequestLogStore::new(pool.clone()));
    let settings_repo = Arc::new(PgSettingsRepository::new(pool));

    // Phase 2: shared state — loads settings and does the initial selector
    // refresh (non-fatal when the inventory is empty or unreachable).
    let state = server::ProxyState::new(config.clone(), repo, request_log, settings_repo).await?;

    // Phase 3: background loops, all owned here and stopped via `shutdown`.
    let shutdown = Arc::new(Notify::new());
    start_refresh_loop(&state, &shutdown);
    start_limiter_gc_loop(&state, &shutdown);
    start_settings_poll_loop(&state, &shutdown);

    // Phase 4: admin + proxy listeners.
    start_admin_server(&state, metrics, &args);

    tracing::info!("server: starting proxy, listen={}", args.listen);
    let drain_deadline =
        std::time::Duration::from_secs(config.background.shutdown_grace_secs.max(1));
    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown, drain_deadline).await }
    });

    // Phase 5: block until signal, then drain.
    wait_for_shutdown(&shutdown).await;

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

// ---------------------------------------------------------------------------
// Loop owners — each function spawns a task with the interval loop. The
// state methods only provide single-shot operations.
// ---------------------------------------------------------------------------

/// Sleep for `duration`, but return `true` immediately if shutdown is signalled.
/// Returns `false` if the full duration elapsed normally.
async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

fn start_refresh_loop(state: &server::ProxyState, shutdown: &Arc<Notify>) {
    let interval = std::time::Duration::from_secs(state.config.background.refresh_interval_secs);
    let state = state.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            state.refresh_selector().await;
        }
    });
}

fn start_limiter_gc_loop(state: &server::ProxyState, shutdown: &Arc<Notify>) {
    let interval = std::time::Duration::from_secs(state.config.background.limiter_gc_interval_secs);
    let state = state.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            state.limiter.evict_stale();
            tracing::debug!(
                "limiter: eviction pass done, tracked_clients={}",
                state.limiter.tracked_clients()
            );
        }
    });
}

fn start_settings_poll_loop(state: &server::ProxyState, shutdown: &Arc<Notify>) {
    let interval =
        std::time::Duration::from_secs(state.config.background.settings_poll_interval_secs);
    let state = state.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            if let Err(e) = state.poll_settings_once().await {
                tracing::warn!("settings: poll failed, error={}", e);
            }
        }
    });
}

fn start_admin_server(state: &server::ProxyState, metrics: Metrics, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s, metrics).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
