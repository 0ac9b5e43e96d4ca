use crate::config::types::AuthSettings;
use crate::proxy::context::{BoxBody, RequestContext};
use base64::Engine;
use http::header::PROXY_AUTHORIZATION;
use http::StatusCode;

use super::FilterResult;

/// Parse a `Proxy-Authorization: Basic <base64>` header into credentials.
fn parse_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ").or_else(|| header.strip_prefix("basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn credentials_match(settings: &AuthSettings, user: &str, pass: &str) -> bool {
    settings
        .users
        .iter()
        .any(|u| u.username == user && u.password == pass)
}

fn challenge(ctx: &RequestContext) -> hyper::Response<BoxBody> {
    let mut resp = ctx.error_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, "proxy authentication required");
    resp.headers_mut().insert(
        http::header::PROXY_AUTHENTICATE,
        http::HeaderValue::from_static("Basic realm=\"proxy\""),
    );
    resp
}

pub(super) fn auth_on_request(
    settings: &AuthSettings,
    headers: &http::HeaderMap,
    ctx: &RequestContext,
) -> FilterResult {
    if !settings.enabled {
        return FilterResult::Continue;
    }

    let header = headers
        .get(PROXY_AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(header) = header else {
        tracing::debug!("filter: auth: missing credentials, client={}", ctx.client_ip);
        metrics::counter!("proxy_auth_rejected_total", "reason" => "missing").increment(1);
        return FilterResult::Reject(challenge(ctx));
    };

    match parse_basic(header) {
        Some((user, pass)) if credentials_match(settings, &user, &pass) => FilterResult::Continue,
        _ => {
            tracing::debug!("filter: auth: invalid credentials, client={}", ctx.client_ip);
            metrics::counter!("proxy_auth_rejected_total", "reason" => "invalid").increment(1);
            FilterResult::Reject(challenge(ctx))
        }
    }
}
