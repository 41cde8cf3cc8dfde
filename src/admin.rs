//! Admin endpoints: health, metrics and the active rules.

use crate::metrics::Metrics;
use crate::store::DynamicConfigStore;
use http::{header, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, warn};

type AdminBody = BoxBody<Bytes, hyper::Error>;

/// Admin service.
///
/// Serves:
/// - `/health` - 200 OK while the process is up
/// - `/metrics` - Prometheus metrics in text format
/// - `/rules` - the active rule snapshot as JSON
///
/// # Example
///
/// ```
/// use rust_apigateway::admin::AdminService;
/// use rust_apigateway::metrics::Metrics;
/// use rust_apigateway::store::DynamicConfigStore;
/// use std::sync::Arc;
///
/// let service = AdminService::new(Arc::new(Metrics::new()), Arc::new(DynamicConfigStore::new()));
/// ```
#[derive(Clone)]
pub struct AdminService {
    metrics: Arc<Metrics>,
    store: Arc<DynamicConfigStore>,
}

impl AdminService {
    pub fn new(metrics: Arc<Metrics>, store: Arc<DynamicConfigStore>) -> Self {
        Self { metrics, store }
    }

    fn route(&self, path: &str) -> Response<AdminBody> {
        match path {
            "/health" => {
                debug!("health check requested");
                respond(StatusCode::OK, "text/plain", Bytes::from_static(b"healthy"))
            }
            "/metrics" => match self.metrics.encode() {
                Ok(metrics) => respond(StatusCode::OK, "text/plain; version=0.0.4", Bytes::from(metrics)),
                Err(e) => {
                    warn!(error = %e, "failed to encode metrics");
                    respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        Bytes::from_static(b"Failed to encode metrics"),
                    )
                }
            },
            "/rules" => {
                let rules: Vec<_> = self
                    .store
                    .rules()
                    .all()
                    .iter()
                    .map(|rule| rule.as_ref().clone())
                    .collect();
                match serde_json::to_vec(&rules) {
                    Ok(body) => respond(StatusCode::OK, "application/json", Bytes::from(body)),
                    Err(e) => {
                        warn!(error = %e, "failed to serialize rules");
                        respond(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "text/plain",
                            Bytes::from_static(b"Failed to serialize rules"),
                        )
                    }
                }
            }
            _ => respond(StatusCode::NOT_FOUND, "text/plain", Bytes::from_static(b"Not Found")),
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<AdminBody> {
    let mut response = Response::new(Full::new(body).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
    response
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<AdminBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let response = self.route(req.uri().path());
        Box::pin(async move { Ok(response) })
    }
}
