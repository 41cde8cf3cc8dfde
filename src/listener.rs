//! Inbound HTTP/1.1 listener.
//!
//! Every request is collected up to the body limit, wrapped with its response
//! sink and handed to the processor. The connection task then waits on the
//! sink for whatever the pipeline writes back.

use crate::config::GatewayConfig;
use crate::context::{ResponseSink, SinkMessage};
use crate::error::{GatewayError, ResponseCode, Result};
use crate::helper;
use crate::processor::{HttpRequestWrapper, Processor};
use crate::response::GatewayResponse;
use http::{header, Response, Version};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};

/// HTTP listener that accepts connections and spawns handler tasks.
///
/// # Example
///
/// ```no_run
/// use rust_apigateway::config::GatewayConfig;
/// use rust_apigateway::gateway::Gateway;
/// use rust_apigateway::listener::Listener;
/// use rust_apigateway::metrics::Metrics;
/// use rust_apigateway::store::DynamicConfigStore;
/// use std::sync::Arc;
/// use tokio::runtime::Handle;
/// use tokio::sync::broadcast;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = GatewayConfig::default();
///     let store = Arc::new(DynamicConfigStore::new());
///     let gateway = Gateway::new(config, store, Arc::new(Metrics::new()), Handle::current())?;
///     let (shutdown_tx, _) = broadcast::channel(1);
///     let listener = Listener::bind(gateway.config(), gateway.processor()).await?;
///     listener.serve(shutdown_tx.subscribe()).await?;
///     Ok(())
/// }
/// ```
pub struct Listener {
    tcp_listener: TcpListener,
    processor: Arc<dyn Processor>,
    addr: SocketAddr,
    max_content_length: usize,
    connections: Arc<Semaphore>,
}

impl Listener {
    /// Binds `listen_addr`.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip_all, fields(addr = %config.listen_addr))]
    pub async fn bind(config: &GatewayConfig, processor: Arc<dyn Processor>) -> Result<Self> {
        let addr = config.listen_addr.as_str();
        let bind_error = |source| GatewayError::ListenerBind {
            addr: addr.to_string(),
            source,
        };
        let tcp_listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = tcp_listener.local_addr().map_err(bind_error)?;

        info!(addr = %local_addr, "gateway bound (HTTP/1.1)");

        Ok(Self {
            tcp_listener,
            processor,
            addr: local_addr,
            max_content_length: config.max_content_length,
            connections: Arc::new(Semaphore::new(config.max_connections.max(1))),
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves incoming connections until a shutdown signal is received.
    ///
    /// Connections beyond `max_connections` are dropped on accept.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let Ok(permit) = Arc::clone(&self.connections).try_acquire_owned() else {
                                warn!(peer = %peer_addr, "connection limit reached, dropping connection");
                                continue;
                            };
                            debug!(peer = %peer_addr, "accepted connection");
                            let processor = Arc::clone(&self.processor);
                            let limit = self.max_content_length;
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, peer_addr, processor, limit, permit).await {
                                    debug!(peer = %peer_addr, error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        peer: SocketAddr,
        processor: Arc<dyn Processor>,
        max_content_length: usize,
        _permit: OwnedSemaphorePermit,
    ) -> Result<()> {
        let service = service_fn(move |req: Request<Incoming>| {
            let processor = Arc::clone(&processor);
            async move { Self::handle_request(req, peer, processor, max_content_length).await }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
            .map_err(GatewayError::Http)
    }

    async fn handle_request(
        req: Request<Incoming>,
        peer: SocketAddr,
        processor: Arc<dyn Processor>,
        max_content_length: usize,
    ) -> Result<Response<Full<Bytes>>> {
        let keep_alive = is_keep_alive(&req);
        let (parts, body) = req.into_parts();

        let body = match Limited::new(body, max_content_length).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                warn!(path = %parts.uri.path(), limit = max_content_length, "request body too large");
                return Ok(GatewayResponse::from_code(ResponseCode::PayloadTooLarge).to_http(false));
            }
            Err(e) => {
                return Err(GatewayError::Internal(format!("failed to read request body: {}", e)));
            }
        };

        let client_ip = helper::client_ip(&parts.headers, Some(peer));
        let (sink, rx) = ResponseSink::channel();
        processor.process(HttpRequestWrapper {
            parts,
            body,
            client_ip,
            keep_alive,
            sink,
        });

        match rx.await {
            Ok(SinkMessage::Response(response)) => Ok(response),
            Ok(SinkMessage::Close) => Err(GatewayError::Internal(
                "connection closed without a response".to_string(),
            )),
            Err(_) => {
                error!("request dropped without a response");
                Ok(GatewayResponse::from_code(ResponseCode::InternalError).to_http(keep_alive))
            }
        }
    }
}

/// HTTP/1.1 keeps the connection unless told to close; HTTP/1.0 only when
/// asked to keep it.
fn is_keep_alive<B>(req: &Request<B>) -> bool {
    let connection = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_lowercase);
    match req.version() {
        Version::HTTP_10 => connection.as_deref() == Some("keep-alive"),
        _ => connection.as_deref() != Some("close"),
    }
}
