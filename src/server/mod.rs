mod admin;
pub mod bootstrap;
pub mod inflight;
pub mod state;

pub use inflight::InFlight;
pub use state::ProxyState;

use crate::metrics::Metrics;
use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Accept loop for proxy traffic.
///
/// On `shutdown` the listener closes immediately; the drain phase then waits
/// up to `drain_deadline` (caller-supplied) for everything still in flight.
/// That covers both kinds of work this proxy does: request/response cycles
/// on open client connections, and CONNECT splices, which detach from their
/// originating request and keep moving bytes after it was answered.
pub async fn run_proxy_server(
    listen: &str,
    state: ProxyState,
    shutdown: Arc<Notify>,
    drain_deadline: Duration,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("proxy: accepting clients, addr={}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    metrics::counter!(
                        "proxy_connections_total",
                        "status" => "accepted",
                    )
                    .increment(1);
                    serve_client(stream, peer_addr, state.clone());
                }
                Err(e) => {
                    // Usually FD exhaustion — every live tunnel holds two
                    // sockets. Back off briefly instead of spinning.
                    error!("proxy: accept error, error={}", e);
                    metrics::counter!(
                        "proxy_connections_total",
                        "status" => "error",
                    )
                    .increment(1);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            _ = shutdown.notified() => break,
        }
    }

    drop(listener);
    info!(
        "proxy: listener closed, draining {} connections and {} tunnels",
        state.in_flight.connections(),
        state.in_flight.tunnels()
    );

    if state.in_flight.drain(drain_deadline).await {
        info!("proxy: drained, nothing left in flight");
    } else {
        info!(
            "proxy: drain deadline ({}s) expired with {} connections and {} tunnels still open",
            drain_deadline.as_secs(),
            state.in_flight.connections(),
            state.in_flight.tunnels()
        );
    }

    Ok(())
}

/// Serve one downstream connection on its own task. The in-flight guard
/// covers the serve loop; tunnel splices register themselves separately when
/// they detach.
fn serve_client(stream: TcpStream, peer_addr: SocketAddr, state: ProxyState) {
    tokio::spawn(async move {
        let _open = state.in_flight.track_connection();
        let io = TokioIo::new(stream);

        let svc_state = state.clone();
        let svc = service_fn(move |req: Request<Incoming>| {
            let state = svc_state.clone();
            async move { proxy::handle_request(req, state, peer_addr).await }
        });

        // Upgrade support is load-bearing here: CONNECT takes over the
        // connection after the 200.
        let served = auto::Builder::new(TokioExecutor::new())
            .http1()
            .keep_alive(true)
            .http2()
            .keep_alive_interval(Some(Duration::from_secs(20)))
            .serve_connection_with_upgrades(io, svc)
            .await;

        if let Err(e) = served {
            let msg = e.to_string();
            if !msg.contains("connection closed") {
                debug!("proxy: client connection ended, peer={}, error={}", peer_addr, msg);
            }
        }
    });
}

/// Health/readiness/metrics listener. Plain request/response traffic only —
/// no upgrades, no rotation involvement.
pub async fn run_admin_server(listen: &str, state: ProxyState, metrics: Metrics) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("admin: serving health and metrics, addr={}", addr);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = state.clone();
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                let metrics = metrics.clone();
                async move { admin::handle_admin(req, state, metrics) }
            });

            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, svc)
                .await
            {
                debug!("admin: connection ended, peer={}, error={}", peer_addr, e);
            }
        });
    }
}
