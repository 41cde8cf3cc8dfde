//! Admin listener for health, metrics and rules.

use crate::admin::AdminService;
use crate::error::{GatewayError, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, info, instrument, warn};

/// Admin HTTP listener, served on its own port.
///
/// # Example
///
/// ```no_run
/// use rust_apigateway::admin::AdminService;
/// use rust_apigateway::admin_listener::AdminListener;
/// use rust_apigateway::metrics::Metrics;
/// use rust_apigateway::store::DynamicConfigStore;
/// use std::sync::Arc;
/// use tokio::sync::broadcast;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (shutdown_tx, _) = broadcast::channel(1);
///     let service = AdminService::new(Arc::new(Metrics::new()), Arc::new(DynamicConfigStore::new()));
///     let listener = AdminListener::bind("127.0.0.1:18100", service).await?;
///     listener.serve(shutdown_tx.subscribe()).await?;
///     Ok(())
/// }
/// ```
pub struct AdminListener {
    tcp_listener: TcpListener,
    admin_service: AdminService,
    addr: SocketAddr,
}

impl AdminListener {
    /// Binds the admin port.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(admin_service))]
    pub async fn bind(addr: &str, admin_service: AdminService) -> Result<Self> {
        let bind_error = |source| GatewayError::ListenerBind {
            addr: addr.to_string(),
            source,
        };
        let tcp_listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = tcp_listener.local_addr().map_err(bind_error)?;

        info!(addr = %local_addr, "admin endpoint bound");

        Ok(Self {
            tcp_listener,
            admin_service,
            addr: local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves admin endpoints until a shutdown signal is received.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving admin endpoints");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "admin connection");
                            let service = self.admin_service.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, service).await {
                                    error!(peer = %peer_addr, error = %e, "admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping admin listener");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(stream: tokio::net::TcpStream, service: AdminService) -> Result<()> {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<Incoming>| {
            let mut service = service.clone();
            async move { service.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(GatewayError::Http)
    }
}
