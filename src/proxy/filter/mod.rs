pub mod auth;
pub mod rate_limit;

use crate::config::types::Settings;
use crate::proxy::context::{BoxBody, RequestContext};
pub use rate_limit::ClientRateLimiter;
use std::sync::Arc;

/// Result of a filter's request phase.
pub enum FilterResult {
    /// Continue to the next filter / the engine.
    Continue,
    /// Short-circuit: return this response immediately.
    Reject(hyper::Response<BoxBody>),
}

/// Enum-based middleware — static dispatch, exhaustive match.
///
/// The chain is rebuilt per request from the current settings snapshot, so a
/// settings reload takes effect on the next request without any swap
/// machinery here. Order matters and is fixed by `build_chain`:
///
/// 1. Auth       (reject unauthenticated clients before any work)
/// 2. RateLimit  (cheap local verdict before touching the rotation path)
pub enum Filter {
    Auth,
    RateLimit { limiter: Arc<ClientRateLimiter> },
}

impl Filter {
    pub async fn on_request(
        &self,
        settings: &Settings,
        headers: &http::HeaderMap,
        ctx: &RequestContext,
    ) -> FilterResult {
        match self {
            Filter::Auth => auth::auth_on_request(&settings.authentication, headers, ctx),
            Filter::RateLimit { limiter } => {
                rate_limit::rate_limit_on_request(&settings.rate_limit, limiter, ctx).await
            }
        }
    }
}

/// Build the middleware chain for one request. Passthrough requests are
/// public: they skip authentication but stay behind the client rate limit.
pub fn build_chain(limiter: &Arc<ClientRateLimiter>, bypass_auth: bool) -> Vec<Filter> {
    let mut chain = Vec::with_capacity(2);
    if !bypass_auth {
        chain.push(Filter::Auth);
    }
    chain.push(Filter::RateLimit {
        limiter: limiter.clone(),
    });
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ProxyUser;
    use crate::proxy::context::RequestKind;

    fn ctx() -> RequestContext {
        RequestContext::new(
            "GET".to_string(),
            "http://example.com/".to_string(),
            "127.0.0.1".parse().unwrap(),
            RequestKind::Http,
        )
    }

    fn strict_settings() -> Settings {
        let mut s = Settings::default();
        s.authentication.enabled = true;
        s.authentication.users.push(ProxyUser {
            username: "u".to_string(),
            password: "p".to_string(),
        });
        s.rate_limit.enabled = true;
        s.rate_limit.max_requests = 100;
        s
    }

    #[tokio::test]
    async fn test_auth_runs_before_rate_limit() {
        let limiter = Arc::new(ClientRateLimiter::new());
        let settings = strict_settings();
        let chain = build_chain(&limiter, false);

        // No credentials: the chain stops at auth and never consumes a token.
        let mut rejected_status = None;
        for filter in &chain {
            if let FilterResult::Reject(resp) = filter
                .on_request(&settings, &http::HeaderMap::new(), &ctx())
                .await
            {
                rejected_status = Some(resp.status());
                break;
            }
        }
        assert_eq!(
            rejected_status,
            Some(http::StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        );
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[tokio::test]
    async fn test_passthrough_skips_auth_but_not_rate_limit() {
        let limiter = Arc::new(ClientRateLimiter::new());
        let mut settings = strict_settings();
        settings.rate_limit.max_requests = 1;
        let chain = build_chain(&limiter, true);

        // First request passes without credentials.
        for filter in &chain {
            let result = filter
                .on_request(&settings, &http::HeaderMap::new(), &ctx())
                .await;
            assert!(matches!(result, FilterResult::Continue));
        }

        // Second request trips the client rate limit.
        let mut rejected_status = None;
        for filter in &chain {
            if let FilterResult::Reject(resp) = filter
                .on_request(&settings, &http::HeaderMap::new(), &ctx())
                .await
            {
                rejected_status = Some(resp.status());
                break;
            }
        }
        assert_eq!(rejected_status, Some(http::StatusCode::TOO_MANY_REQUESTS));
    }
}
