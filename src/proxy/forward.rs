use crate::config::types::RotationSettings;
use crate::error::ProxyError;
use crate::proxy::context::{BoxBody, BoxError, RequestContext};
use crate::server::state::ProxyState;
use crate::storage::{RequestOutcome, Upstream};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use http::header::{HeaderName, CONNECTION, HOST, TE, TRAILER, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Idle keep-alive for pooled outbound connections.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Idle connections kept per upstream host.
const POOL_MAX_IDLE_PER_HOST: usize = 10;
/// Upstream clients kept alive at once; dropping a client drops its pool,
/// which keeps the total idle-connection count bounded.
const MAX_CACHED_CLIENTS: usize = 100;

/// One outbound client per upstream, configured with that upstream as its
/// HTTP/SOCKS proxy. Cached so connection pools survive across requests;
/// invalidated wholesale on settings reload.
pub struct OutboundClients {
    clients: DashMap<i64, CachedClient>,
}

struct CachedClient {
    client: reqwest::Client,
    last_used: AtomicU64,
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

impl Default for OutboundClients {
    fn default() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }
}

impl OutboundClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(
        &self,
        upstream: &Upstream,
        rotation: &RotationSettings,
    ) -> Result<reqwest::Client, ProxyError> {
        if let Some(entry) = self.clients.get(&upstream.id) {
            entry.last_used.store(now_us(), Ordering::Relaxed);
            return Ok(entry.client.clone());
        }

        let client = build_proxied_client(upstream, rotation)?;
        if self.clients.len() >= MAX_CACHED_CLIENTS {
            self.evict_oldest();
        }
        self.clients.insert(
            upstream.id,
            CachedClient {
                client: client.clone(),
                last_used: AtomicU64::new(now_us()),
            },
        );
        Ok(client)
    }

    /// Drop every cached client. Called on settings reload so timeout and
    /// redirect policy changes take effect immediately.
    pub fn invalidate(&self) {
        self.clients.clear();
    }

    fn evict_oldest(&self) {
        let oldest = self
            .clients
            .iter()
            .min_by_key(|e| e.value().last_used.load(Ordering::Relaxed))
            .map(|e| *e.key());
        if let Some(key) = oldest {
            self.clients.remove(&key);
        }
    }
}

fn build_proxied_client(
    upstream: &Upstream,
    rotation: &RotationSettings,
) -> Result<reqwest::Client, ProxyError> {
    let proxy = reqwest::Proxy::all(upstream.proxy_url())
        .map_err(|e| ProxyError::UpstreamConnect(format!("proxy url: {}", e)))?;

    let redirect = if rotation.follow_redirect {
        reqwest::redirect::Policy::limited(10)
    } else {
        reqwest::redirect::Policy::none()
    };

    reqwest::Client::builder()
        .proxy(proxy)
        .timeout(Duration::from_secs(rotation.timeout.max(1)))
        .connect_timeout(Duration::from_secs(rotation.timeout.max(1)))
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .redirect(redirect)
        .build()
        .map_err(|e| ProxyError::Internal(format!("client build: {}", e)))
}

/// Absolute target URL for a proxy-style request. Origin-form requests are
/// reconstructed from the `Host` header.
pub fn target_url(uri: &http::Uri, headers: &HeaderMap) -> Result<String, ProxyError> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::Internal("request has no absolute URI and no Host".to_string()))?;
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Ok(format!("http://{}{}", host, path_and_query))
}

/// Hop-by-hop headers are meaningful only for the client↔proxy connection.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("proxy-connection"),
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ];
    for h in hop_headers {
        headers.remove(h);
    }
}

/// Forward one HTTP request through the rotation pool, re-selecting a fresh
/// upstream on failure up to the configured fallback budget. `host_override`
/// is set by the passthrough rewriter.
pub async fn handle_http(
    state: &ProxyState,
    ctx: &mut RequestContext,
    req: Request<Incoming>,
    url: String,
    host_override: Option<String>,
) -> Response<BoxBody> {
    let settings = state.settings.current();
    let rotation = &settings.rotation;

    let method = req.method().clone();
    let mut headers = req.headers().clone();
    strip_hop_headers(&mut headers);
    if let Some(ref host) = host_override {
        match HeaderValue::from_str(host) {
            Ok(v) => {
                headers.insert(HOST, v);
            }
            Err(_) => {
                return ctx.error_response(StatusCode::BAD_GATEWAY, "bad gateway");
            }
        }
    }

    // Buffer the body so attempts can be replayed against another upstream.
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("forward: failed to read request body, error={}", e);
            return ctx.error_response(StatusCode::BAD_REQUEST, "bad request");
        }
    };

    let attempts = rotation.attempts();
    let mut last_error = ProxyError::NoUpstream;

    for attempt in 0..attempts {
        let selector = state.selector.load();
        let upstream = match selector.select().await {
            Ok(u) => u,
            Err(e @ ProxyError::AllRateLimited { .. }) => {
                // Every pool member is at its window cap; retrying locally
                // cannot help within this window.
                return respond_with_error(ctx, &e);
            }
            Err(e) => {
                last_error = e;
                break;
            }
        };
        ctx.set_upstream(upstream.id, &upstream.address);

        let client = match state.clients.get_or_build(&upstream, rotation) {
            Ok(c) => c,
            Err(e) => {
                last_error = e;
                continue;
            }
        };

        match send_via_upstream(
            state,
            &client,
            &upstream,
            &method,
            &url,
            &headers,
            body.clone(),
            rotation,
        )
        .await
        {
            Ok(resp) => return downstream_response(ctx, resp),
            Err(e) => {
                if attempt + 1 < attempts {
                    debug!(
                        "forward: attempt {}/{} failed, upstream={}, error={}",
                        attempt + 1,
                        attempts,
                        upstream.address,
                        e
                    );
                    metrics::counter!("proxy_fallback_attempts_total").increment(1);
                } else {
                    warn!(
                        "forward: all attempts failed, upstream={}, error={}",
                        upstream.address, e
                    );
                }
                last_error = e;
            }
        }
    }

    respond_with_error(ctx, &last_error)
}

/// One fallback attempt: up to `retries` extra same-upstream re-dials on
/// connect errors, tracker recording on every terminal outcome.
#[allow(clippy::too_many_arguments)]
async fn send_via_upstream(
    state: &ProxyState,
    client: &reqwest::Client,
    upstream: &Upstream,
    method: &Method,
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
    rotation: &RotationSettings,
) -> Result<reqwest::Response, ProxyError> {
    let inner_tries = rotation.retries.saturating_add(1);
    let started = Instant::now();
    let mut inner = 0;

    loop {
        let request = client
            .request(method.clone(), url)
            .headers(headers.clone())
            .body(body.clone());

        match request.send().await {
            Ok(resp) => {
                let latency = started.elapsed().as_millis() as i64;
                state.tracker.record(
                    upstream,
                    RequestOutcome::success(latency, Some(resp.status().as_u16())),
                );
                return Ok(resp);
            }
            Err(e) if e.is_connect() && inner + 1 < inner_tries => {
                inner += 1;
                debug!(
                    "forward: connect error, re-dialing same upstream {} ({}/{})",
                    upstream.address, inner, inner_tries
                );
            }
            Err(e) => {
                let latency = started.elapsed().as_millis() as i64;
                let err = classify(e);
                state
                    .tracker
                    .record(upstream, RequestOutcome::failure(latency, err.to_string()));
                return Err(err);
            }
        }
    }
}

fn classify(e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::UpstreamTimeout
    } else {
        ProxyError::UpstreamConnect(e.to_string())
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

/// Convert the upstream response into a streamed client response.
fn downstream_response(ctx: &RequestContext, resp: reqwest::Response) -> Response<BoxBody> {
    let status = resp.status();
    ctx.finalize_metrics(status.as_u16());

    let mut builder = Response::builder().status(status);
    let mut resp_headers = resp.headers().clone();
    strip_hop_headers(&mut resp_headers);
    for (name, value) in &resp_headers {
        builder = builder.header(name, value);
    }

    let stream = resp
        .bytes_stream()
        .map(|chunk| chunk.map(Frame::data).map_err(|e| Box::new(e) as BoxError));
    builder
        .body(BodyExt::boxed_unsync(StreamBody::new(stream)))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(crate::proxy::context::full_body("bad gateway\n"))
                .unwrap()
        })
}
