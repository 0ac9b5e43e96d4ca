use crate::metrics::Metrics;
use crate::server::state::ProxyState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::convert::Infallible;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).boxed()
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: ProxyState,
    metrics: Metrics,
) -> Result<Response<BoxBody>, Infallible> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let selector = state.selector.load();
            let candidates = selector.candidates().len();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(format!(
                    r#"{{"status":"ready","method":"{}","candidates":{},"settings_version":{}}}"#,
                    selector.method().as_str(),
                    candidates,
                    state.settings.version(),
                )))
                .unwrap())
        }

        "/metrics" => Ok(Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(metrics.render()))
            .unwrap()),

        _ => Ok(Response::builder()
            .status(404)
            .header("content-type", "application/json")
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
