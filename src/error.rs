use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    /// The candidate set is empty (nothing passed the rotation filters).
    NoUpstream,
    /// Every candidate has exhausted its window allowance.
    AllRateLimited { window_secs: u64 },
    SelectorLoad(String),
    UpstreamConnect(String),
    UpstreamTimeout,
    /// The upstream proxy answered a CONNECT with a non-2xx status.
    UpstreamResponse(u16),
    Store(String),
    Config(String),
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NoUpstream => write!(f, "no upstream available"),
            ProxyError::AllRateLimited { window_secs } => {
                write!(f, "all upstreams rate limited (window {}s)", window_secs)
            }
            ProxyError::SelectorLoad(msg) => write!(f, "selector load error: {}", msg),
            ProxyError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            ProxyError::UpstreamTimeout => write!(f, "upstream timeout"),
            ProxyError::UpstreamResponse(status) => {
                write!(f, "upstream rejected tunnel with status {}", status)
            }
            ProxyError::Store(msg) => write!(f, "store error: {}", msg),
            ProxyError::Config(msg) => write!(f, "config error: {}", msg),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<sqlx::Error> for ProxyError {
    fn from(e: sqlx::Error) -> Self {
        ProxyError::Store(e.to_string())
    }
}
