//! Pooled HTTP client for backend calls.

use crate::config::GatewayConfig;
use crate::error::TransportError;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, instrument};

/// Fully read backend response.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Async HTTP client shared by every outbound call.
///
/// Connections are pooled per host; a call either yields a complete
/// response or a classified [`TransportError`].
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: Client<HttpConnector, Full<Bytes>>,
    default_timeout: Duration,
}

impl HttpClient {
    /// Builds the pool from the connect, idle and per-host settings.
    pub fn new(config: &GatewayConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.connections_per_host)
            .build(connector);

        Self {
            client,
            default_timeout: config.request_timeout,
        }
    }

    /// Timeout applied when a request carries none.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Sends the request and reads the whole body within `limit`.
    #[instrument(level = "debug", skip(self, request), fields(method = %request.method()))]
    pub async fn execute(
        &self,
        request: Request<Full<Bytes>>,
        url: &str,
        limit: Duration,
    ) -> Result<BackendResponse, TransportError> {
        let start = Instant::now();
        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| {
                if e.is_connect() {
                    TransportError::Connect {
                        url: url.to_string(),
                        reason: e.to_string(),
                    }
                } else {
                    TransportError::Io {
                        url: url.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| TransportError::Io {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?
                .to_bytes();
            Ok(BackendResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        let result = match timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                url: url.to_string(),
                timeout_ms: limit.as_millis() as u64,
            }),
        };
        debug!(
            url,
            ok = result.is_ok(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "backend call finished"
        );
        result
    }
}
