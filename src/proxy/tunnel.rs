use crate::error::ProxyError;
use crate::proxy::context::{empty_body, BoxBody, RequestContext};
use crate::server::state::ProxyState;
use crate::storage::{Protocol, RequestOutcome, Upstream};
use base64::Engine;
use http::StatusCode;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Upper bound on the upstream's CONNECT response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

pub(crate) trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

type UpstreamTunnel = Box<dyn RawStream>;

/// Handle a CONNECT request: dial an upstream proxy (with fallback), ask it
/// to open the tunnel, answer 200 to the client, then splice bytes both ways
/// until either side closes.
pub async fn handle_connect(
    state: &ProxyState,
    ctx: &mut RequestContext,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
        return ctx.error_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
    };

    let settings = state.settings.current();
    let rotation = &settings.rotation;
    let attempts = rotation.attempts();
    let deadline = Duration::from_secs(rotation.timeout.max(1));
    let mut last_error = ProxyError::NoUpstream;

    for attempt in 0..attempts {
        let selector = state.selector.load();
        let upstream = match selector.select().await {
            Ok(u) => u,
            Err(e @ ProxyError::AllRateLimited { .. }) => {
                return respond_with_error(ctx, &e);
            }
            Err(e) => {
                last_error = e;
                break;
            }
        };
        ctx.set_upstream(upstream.id, &upstream.address);

        let started = Instant::now();
        let dial = establish_with_retries(&upstream, &target, rotation.retries);
        match tokio::time::timeout(deadline, dial).await {
            Ok(Ok(tunnel)) => {
                let establish_ms = started.elapsed().as_millis() as i64;
                metrics::counter!("proxy_tunnels_total", "result" => "established").increment(1);
                spawn_tunnel(state, ctx, req, upstream, tunnel, establish_ms);
                ctx.finalize_metrics(200);
                ctx.log_access(200);
                return Response::builder()
                    .status(StatusCode::OK)
                    .body(empty_body())
                    .unwrap();
            }
            Ok(Err(e)) => {
                let latency = started.elapsed().as_millis() as i64;
                state
                    .tracker
                    .record(&upstream, RequestOutcome::failure(latency, e.to_string()));
                note_attempt_failure(attempt, attempts, &upstream, &e);
                last_error = e;
            }
            Err(_) => {
                let e = ProxyError::UpstreamTimeout;
                state.tracker.record(
                    &upstream,
                    RequestOutcome::failure(deadline.as_millis() as i64, e.to_string()),
                );
                note_attempt_failure(attempt, attempts, &upstream, &e);
                last_error = e;
            }
        }
    }

    metrics::counter!("proxy_tunnels_total", "result" => "failed").increment(1);
    respond_with_error(ctx, &last_error)
}

fn note_attempt_failure(attempt: u32, attempts: u32, upstream: &Upstream, e: &ProxyError) {
    if attempt + 1 < attempts {
        debug!(
            "tunnel: attempt {}/{} failed, upstream={}, error={}",
            attempt + 1,
            attempts,
            upstream.address,
            e
        );
        metrics::counter!("proxy_fallback_attempts_total").increment(1);
    } else {
        warn!(
            "tunnel: all attempts failed, upstream={}, error={}",
            upstream.address, e
        );
    }
}

fn respond_with_error(ctx: &RequestContext, err: &ProxyError) -> Response<BoxBody> {
    match err {
        ProxyError::AllRateLimited { window_secs } => ctx.rate_limited_response(*window_secs),
        ProxyError::UpstreamTimeout => {
            ctx.error_response(StatusCode::GATEWAY_TIMEOUT, "gateway timeout")
        }
        _ => ctx.error_response(StatusCode::BAD_GATEWAY, "bad gateway"),
    }
}

/// After the upstream said 200, the client side upgrades and the two copy
/// directions run until one closes. The outcome is recorded at close with
/// the establishment latency — the 200 already decided success.
///
/// The splice task registers itself with the shutdown drain: the originating
/// request is answered before any payload moves, so the connection count
/// alone says nothing about whether this tunnel is still alive.
fn spawn_tunnel(
    state: &ProxyState,
    ctx: &RequestContext,
    req: Request<Incoming>,
    upstream: Upstream,
    mut tunnel: UpstreamTunnel,
    establish_ms: i64,
) {
    let tracker = state.tracker.clone();
    let client_ip = ctx.client_ip;
    let splice = state.in_flight.track_tunnel();
    tokio::spawn(async move {
        let _splice = splice;
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client_io = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut client_io, &mut tunnel).await {
                    Ok((to_upstream, to_client)) => {
                        debug!(
                            "tunnel: closed, upstream={}, client={}, tx={}, rx={}",
                            upstream.address, client_ip, to_upstream, to_client
                        );
                    }
                    Err(e) => {
                        debug!(
                            "tunnel: transfer error, upstream={}, client={}, error={}",
                            upstream.address, client_ip, e
                        );
                    }
                }
            }
            Err(e) => {
                warn!("tunnel: client upgrade failed, client={}, error={}", client_ip, e);
            }
        }
        tracker.record(&upstream, RequestOutcome::success(establish_ms, Some(200)));
    });
}

/// Same-upstream re-dials on connect errors; a deterministic rejection from
/// the proxy (non-2xx CONNECT answer) is returned immediately.
async fn establish_with_retries(
    upstream: &Upstream,
    target: &str,
    retries: u32,
) -> Result<UpstreamTunnel, ProxyError> {
    let mut inner = 0;
    loop {
        match establish(upstream, target).await {
            Err(ProxyError::UpstreamConnect(msg)) if inner < retries => {
                inner += 1;
                debug!(
                    "tunnel: connect error, re-dialing same upstream {} ({}/{}): {}",
                    upstream.address,
                    inner,
                    retries + 1,
                    msg
                );
            }
            other => return other,
        }
    }
}

/// Open a transport to the upstream proxy and ask it to connect `target`.
async fn establish(upstream: &Upstream, target: &str) -> Result<UpstreamTunnel, ProxyError> {
    let tcp = TcpStream::connect(&upstream.address)
        .await
        .map_err(|e| ProxyError::UpstreamConnect(format!("{}: {}", upstream.address, e)))?;
    tcp.set_nodelay(true).ok();

    match upstream.protocol {
        Protocol::Http => {
            let mut stream = tcp;
            http_connect_handshake(&mut stream, target, upstream).await?;
            Ok(Box::new(stream))
        }
        Protocol::Https => {
            let host = upstream.address.split(':').next().unwrap_or_default();
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| ProxyError::UpstreamConnect(format!("bad tls name: {}", host)))?;
            let mut stream = tls_connector()
                .connect(server_name, tcp)
                .await
                .map_err(|e| ProxyError::UpstreamConnect(format!("tls: {}", e)))?;
            http_connect_handshake(&mut stream, target, upstream).await?;
            Ok(Box::new(stream))
        }
        Protocol::Socks5 => {
            let mut stream = tcp;
            socks5_connect(&mut stream, target, upstream).await?;
            Ok(Box::new(stream))
        }
    }
}

fn tls_connector() -> tokio_rustls::TlsConnector {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    let config = CONFIG.get_or_init(|| {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    });
    tokio_rustls::TlsConnector::from(config.clone())
}

/// Issue `CONNECT target HTTP/1.1` on an open proxy connection and require a
/// 2xx answer.
async fn http_connect_handshake<S>(
    stream: &mut S,
    target: &str,
    upstream: &Upstream,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let (Some(user), Some(pass)) = (&upstream.username, &upstream.password) {
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ProxyError::UpstreamConnect(format!("connect write: {}", e)))?;

    let head = read_response_head(stream).await?;
    let status = parse_status_line(&head)?;
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(ProxyError::UpstreamResponse(status))
    }
}

/// Read until the blank line terminating the response head. The tunnel
/// payload starts only after our 200 to the client, so nothing past the head
/// can be lost here.
async fn read_response_head<S>(stream: &mut S) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| ProxyError::UpstreamConnect(format!("connect read: {}", e)))?;
        if n == 0 {
            return Err(ProxyError::UpstreamConnect(
                "connection closed during CONNECT handshake".to_string(),
            ));
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(ProxyError::UpstreamConnect(
                "CONNECT response head too large".to_string(),
            ));
        }
    }
}

fn parse_status_line(head: &[u8]) -> Result<u16, ProxyError> {
    let line = head.split(|&b| b == b'\r').next().unwrap_or_default();
    let line = std::str::from_utf8(line)
        .map_err(|_| ProxyError::UpstreamConnect("malformed CONNECT response".to_string()))?;
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::UpstreamConnect(format!(
            "malformed CONNECT response: {}",
            line
        )));
    }
    parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| ProxyError::UpstreamConnect(format!("malformed CONNECT response: {}", line)))
}

/// Minimal SOCKS5 client handshake (RFC 1928/1929): greeting, optional
/// username/password auth, then a CONNECT request for the target.
async fn socks5_connect<S>(stream: &mut S, target: &str, upstream: &Upstream) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = split_target(target)?;

    let with_auth = upstream.username.is_some();
    let greeting: &[u8] = if with_auth {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream
        .write_all(greeting)
        .await
        .map_err(socks_io_err)?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.map_err(socks_io_err)?;
    if choice[0] != 0x05 {
        return Err(ProxyError::UpstreamConnect("not a SOCKS5 proxy".to_string()));
    }
    match choice[1] {
        0x00 => {}
        0x02 => {
            let user = upstream.username.as_deref().unwrap_or_default();
            let pass = upstream.password.as_deref().unwrap_or_default();
            if user.len() > 255 || pass.len() > 255 {
                return Err(ProxyError::UpstreamConnect(
                    "SOCKS5 credentials too long".to_string(),
                ));
            }
            let mut auth = Vec::with_capacity(3 + user.len() + pass.len());
            auth.push(0x01);
            auth.push(user.len() as u8);
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            stream.write_all(&auth).await.map_err(socks_io_err)?;

            let mut verdict = [0u8; 2];
            stream.read_exact(&mut verdict).await.map_err(socks_io_err)?;
            if verdict[1] != 0x00 {
                return Err(ProxyError::UpstreamConnect(
                    "SOCKS5 authentication rejected".to_string(),
                ));
            }
        }
        _ => {
            return Err(ProxyError::UpstreamConnect(
                "SOCKS5 proxy offered no usable auth method".to_string(),
            ));
        }
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => {
            request.push(0x01);
            request.extend_from_slice(&v4.octets());
        }
        Ok(std::net::IpAddr::V6(v6)) => {
            request.push(0x04);
            request.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(ProxyError::UpstreamConnect("target host too long".to_string()));
            }
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.map_err(socks_io_err)?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.map_err(socks_io_err)?;
    if reply[1] != 0x00 {
        return Err(ProxyError::UpstreamConnect(format!(
            "SOCKS5 connect refused (code {})",
            reply[1]
        )));
    }
    // Drain the bound address so the tunnel starts at the payload boundary.
    let addr_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(socks_io_err)?;
            len[0] as usize
        }
        other => {
            return Err(ProxyError::UpstreamConnect(format!(
                "SOCKS5 reply with unknown address type {}",
                other
            )));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await.map_err(socks_io_err)?;
    Ok(())
}

fn socks_io_err(e: std::io::Error) -> ProxyError {
    ProxyError::UpstreamConnect(format!("socks5: {}", e))
}

/// Split "host:port" from a CONNECT authority; HTTPS default port applies
/// when the client omitted it.
fn split_target(target: &str) -> Result<(&str, u16), ProxyError> {
    if let Some(rest) = target.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let Some((host, port)) = rest.split_once("]:") else {
            return Ok((rest.strip_suffix(']').unwrap_or(rest), 443));
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| ProxyError::UpstreamConnect(format!("bad target port: {}", target)))?;
        return Ok((host, port));
    }
    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ProxyError::UpstreamConnect(format!("bad target port: {}", target)))?;
            Ok((host, port))
        }
        None => Ok((target, 443)),
    }
}
