use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// How the classifier routed a request; used as a metrics label and in the
/// access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Http,
    Connect,
    Passthrough,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Http => "http",
            RequestKind::Connect => "connect",
            RequestKind::Passthrough => "passthrough",
        }
    }
}

/// Per-request context that flows through the middleware chain and the
/// engine; accumulates the chosen upstream for logging and metrics.
pub struct RequestContext {
    pub method: String,
    pub target: String,
    pub client_ip: IpAddr,
    pub kind: RequestKind,
    pub upstream_id: Option<i64>,
    pub upstream_addr: String,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(method: String, target: String, client_ip: IpAddr, kind: RequestKind) -> Self {
        Self {
            method,
            target,
            client_ip,
            kind,
            upstream_id: None,
            upstream_addr: String::new(),
            start: Instant::now(),
        }
    }

    pub fn set_upstream(&mut self, id: i64, addr: &str) {
        self.upstream_id = Some(id);
        self.upstream_addr.clear();
        self.upstream_addr.push_str(addr);
    }

    /// Single exit point for error paths: records metrics and builds a short
    /// plain-text response.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        self.count_request(status.as_u16());
        hyper::Response::builder()
            .status(status)
            .header("content-type", "text/plain; charset=utf-8")
            .body(full_body(format!("{}\n", msg)))
            .unwrap()
    }

    /// 429 with the window length surfaced so well-behaved clients can back
    /// off for exactly one window.
    pub fn rate_limited_response(&self, retry_after_secs: u64) -> hyper::Response<BoxBody> {
        self.count_request(StatusCode::TOO_MANY_REQUESTS.as_u16());
        hyper::Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("content-type", "text/plain; charset=utf-8")
            .header("retry-after", retry_after_secs.to_string())
            .body(full_body("too many requests\n"))
            .unwrap()
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        self.count_request(resp_status);
        metrics::histogram!(
            "proxy_request_duration_seconds",
            "kind" => self.kind.as_str(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }

    fn count_request(&self, status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);
        metrics::counter!(
            "proxy_requests_total",
            "kind" => self.kind.as_str(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);
    }

    /// Structured access log — one line per request at info level.
    pub fn log_access(&self, status: u16) {
        tracing::info!(
            client_ip = %self.client_ip,
            method = %self.method,
            target = %self.target,
            kind = self.kind.as_str(),
            status = status,
            upstream = %self.upstream_addr,
            latency_ms = %self.start.elapsed().as_millis(),
            "access"
        );
    }
}
