pub mod context;
pub mod filter;
pub mod forward;
pub mod passthrough;
pub mod tunnel;

use crate::proxy::context::{full_body, BoxBody, RequestContext, RequestKind};
use crate::server::state::ProxyState;
use http::{Method, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;

/// Handle one incoming request through the fixed phases:
///
/// 1. local endpoints  — `/health` answers without touching rotation
/// 2. classification   — CONNECT / passthrough / proxy-style HTTP
/// 3. middleware       — client auth (skipped for passthrough), client rate limit
/// 4. engine           — tunnel or forward through a selected upstream
/// 5. access log
pub async fn handle_request(
    req: Request<Incoming>,
    state: ProxyState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, Infallible> {
    let client_ip = peer_addr.ip();
    let is_connect = req.method() == Method::CONNECT;
    let origin_form = req.uri().authority().is_none();

    if !is_connect && origin_form && req.uri().path() == "/health" {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap());
    }

    // The passthrough prefix is served to clients talking to the proxy as an
    // ordinary web server, so only origin-form requests qualify.
    let rewriter = if !is_connect && origin_form {
        state
            .passthrough
            .as_ref()
            .filter(|r| r.matches(req.uri().path()))
    } else {
        None
    };

    let kind = if is_connect {
        RequestKind::Connect
    } else if rewriter.is_some() {
        RequestKind::Passthrough
    } else {
        RequestKind::Http
    };

    let target = if is_connect {
        req.uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default()
    } else {
        req.uri().to_string()
    };

    let mut ctx = RequestContext::new(req.method().as_str().to_string(), target, client_ip, kind);

    let settings = state.settings.current();
    let chain = filter::build_chain(&state.limiter, rewriter.is_some());
    for f in &chain {
        if let filter::FilterResult::Reject(resp) = f
            .on_request(&settings, req.headers(), &ctx)
            .await
        {
            ctx.log_access(resp.status().as_u16());
            return Ok(resp);
        }
    }

    let resp = if is_connect {
        // The tunnel path logs on its own because the response returns
        // before the splice finishes.
        return Ok(tunnel::handle_connect(&state, &mut ctx, req).await);
    } else if let Some(rewriter) = rewriter {
        let url = rewriter.rewrite(req.uri().path(), req.uri().query());
        let host = rewriter.target_host().to_string();
        forward::handle_http(&state, &mut ctx, req, url, Some(host)).await
    } else {
        match forward::target_url(req.uri(), req.headers()) {
            Ok(url) => forward::handle_http(&state, &mut ctx, req, url, None).await,
            Err(_) => ctx.error_response(StatusCode::BAD_REQUEST, "bad request"),
        }
    };

    ctx.log_access(resp.status().as_u16());
    Ok(resp)
}
