//! Request processors.
//!
//! [`CoreProcessor`] runs the whole pipeline for one request on the calling
//! thread. [`ParallelProcessor`] puts requests on the dispatch ring and lets
//! its worker threads drive the core processor.

use crate::config::GatewayConfig;
use crate::context::ResponseSink;
use crate::dispatch::{BoxError, EventListener, ParallelQueue};
use crate::error::{GatewayError, Result};
use crate::filter::{FilterChainFactory, RouterFilter};
use crate::helper;
use crate::metrics::Metrics;
use crate::store::DynamicConfigStore;
use http::request::Parts;
use hyper::body::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A received request waiting to be processed.
#[derive(Debug)]
pub struct HttpRequestWrapper {
    /// Request line and headers.
    pub parts: Parts,
    /// Collected body.
    pub body: Bytes,
    /// Resolved client address.
    pub client_ip: String,
    /// Whether the connection stays open after the response.
    pub keep_alive: bool,
    /// Where the response goes.
    pub sink: ResponseSink,
}

/// Entry point of the request pipeline.
pub trait Processor: Send + Sync {
    /// Processes one request. The response always arrives through the
    /// wrapper's sink, never as a return value.
    fn process(&self, wrapper: HttpRequestWrapper);

    /// Starts any background machinery.
    fn start(&self) -> Result<()>;

    /// Stops background machinery after draining accepted work.
    fn shut_down(&self);
}

/// Builds the context, runs the filter chain and hands the context to the
/// router.
pub struct CoreProcessor {
    store: Arc<DynamicConfigStore>,
    factory: FilterChainFactory,
    router: Arc<RouterFilter>,
}

impl CoreProcessor {
    pub fn new(store: Arc<DynamicConfigStore>, factory: FilterChainFactory, router: Arc<RouterFilter>) -> Self {
        Self { store, factory, router }
    }

    fn handle(&self, wrapper: &HttpRequestWrapper) {
        let mut ctx = match helper::do_context(wrapper, &self.store) {
            Ok(ctx) => ctx,
            Err(err) => {
                debug!(path = %wrapper.parts.uri.path(), error = %err, "request rejected before routing");
                helper::write_error(&wrapper.sink, wrapper.keep_alive, &err);
                return;
            }
        };

        let chain = self.factory.build(ctx.rule());
        match chain.execute(&mut ctx) {
            Ok(()) => Arc::clone(&self.router).dispatch(ctx),
            Err(err) => helper::fail(&mut ctx, err),
        }
    }
}

impl Processor for CoreProcessor {
    fn process(&self, wrapper: HttpRequestWrapper) {
        self.handle(&wrapper);
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn shut_down(&self) {}
}

struct BatchEventListener {
    core: Arc<CoreProcessor>,
}

impl EventListener<HttpRequestWrapper> for BatchEventListener {
    fn on_event(&self, event: &HttpRequestWrapper) -> std::result::Result<(), BoxError> {
        self.core.handle(event);
        Ok(())
    }

    fn on_exception(&self, err: BoxError, sequence: i64, event: HttpRequestWrapper) {
        error!(sequence, path = %event.parts.uri.path(), error = %err, "request processing failed");
        helper::write_error(
            &event.sink,
            event.keep_alive,
            &GatewayError::Internal(err.to_string()),
        );
    }
}

/// Dispatches requests to the core processor through the ring buffer.
///
/// Enqueueing never waits: a full ring answers 503 right away.
pub struct ParallelProcessor {
    queue: ParallelQueue<HttpRequestWrapper>,
    metrics: Arc<Metrics>,
}

impl ParallelProcessor {
    /// Sizes the ring and worker pool from `buffer_size`, `process_threads`
    /// and `wait_strategy`.
    pub fn new(core: Arc<CoreProcessor>, config: &GatewayConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let strategy = config
            .wait_strategy()
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;
        let queue = ParallelQueue::builder()
            .capacity(config.buffer_size)
            .threads(config.process_threads)
            .wait_strategy(strategy)
            .name_prefix("gateway-dispatch")
            .listener(Arc::new(BatchEventListener { core }))
            .build()
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;
        Ok(Self { queue, metrics })
    }
}

impl Processor for ParallelProcessor {
    fn process(&self, wrapper: HttpRequestWrapper) {
        if let Err(wrapper) = self.queue.try_add(wrapper) {
            self.metrics.record_rejected();
            warn!(path = %wrapper.parts.uri.path(), "dispatch ring full, rejecting request");
            helper::write_error(&wrapper.sink, wrapper.keep_alive, &GatewayError::GatewayBusy);
        }
    }

    fn start(&self) -> Result<()> {
        self.queue
            .start()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        info!(capacity = self.queue.capacity(), "parallel processor started");
        Ok(())
    }

    fn shut_down(&self) {
        self.queue.shut_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use crate::client::HttpClient;
    use crate::context::SinkMessage;
    use crate::filter::{CompletionExecutor, FilterRegistry};
    use crate::rule::Rule;
    use http::StatusCode;
    use http_body_util::BodyExt;
    use tokio::runtime::Handle;
    use tokio::sync::oneshot;

    fn core(store: Arc<DynamicConfigStore>) -> Arc<CoreProcessor> {
        let config = GatewayConfig::default();
        let router = Arc::new(RouterFilter::new(
            HttpClient::new(&config),
            Arc::new(CircuitBreakerRegistry::new()),
            Arc::new(Metrics::new()),
            CompletionExecutor::Inline,
            Handle::current(),
        ));
        let mut registry = FilterRegistry::new();
        registry.register(router.clone());
        Arc::new(CoreProcessor::new(store, FilterChainFactory::new(registry), router))
    }

    fn wrapper(headers: &[(&str, &str)]) -> (HttpRequestWrapper, oneshot::Receiver<SinkMessage>) {
        let mut builder = http::Request::builder().uri("/ping");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        let (sink, rx) = ResponseSink::channel();
        let wrapper = HttpRequestWrapper {
            parts,
            body: Bytes::new(),
            client_ip: "127.0.0.1".to_string(),
            keep_alive: false,
            sink,
        };
        (wrapper, rx)
    }

    async fn json(rx: oneshot::Receiver<SinkMessage>) -> (StatusCode, serde_json::Value) {
        match rx.await.unwrap() {
            SinkMessage::Response(response) => {
                let status = response.status();
                assert_eq!(response.headers().get("connection").unwrap(), "close");
                let body = response.into_body().collect().await.unwrap().to_bytes();
                (status, serde_json::from_slice(&body).unwrap())
            }
            SinkMessage::Close => panic!("connection closed without a response"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_unique_id_is_bad_request() {
        let processor = core(Arc::new(DynamicConfigStore::new()));
        let (wrapper, rx) = wrapper(&[]);
        processor.process(wrapper);

        let (status, body) = json(rx).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 10000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unmatched_path_is_not_found() {
        let store = Arc::new(DynamicConfigStore::new());
        store.put_all_rules(vec![Rule::new("r1", "svc").with_path("/other")]);
        let processor = core(store);
        let (wrapper, rx) = wrapper(&[("uniqueId", "svc")]);
        processor.process(wrapper);

        let (status, body) = json(rx).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 10001);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_processor_runs_pipeline() {
        let processor = ParallelProcessor::new(
            core(Arc::new(DynamicConfigStore::new())),
            &GatewayConfig {
                buffer_size: 8,
                process_threads: 2,
                ..GatewayConfig::default()
            },
            Arc::new(Metrics::new()),
        )
        .unwrap();
        processor.start().unwrap();

        let (wrapper, rx) = wrapper(&[]);
        processor.process(wrapper);
        let (status, _) = json(rx).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        processor.shut_down();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_ring_answers_busy() {
        let metrics = Arc::new(Metrics::new());
        let processor = ParallelProcessor::new(
            core(Arc::new(DynamicConfigStore::new())),
            &GatewayConfig {
                buffer_size: 1,
                process_threads: 1,
                ..GatewayConfig::default()
            },
            Arc::clone(&metrics),
        )
        .unwrap();

        // not started: the first request occupies the only slot
        let (first, _rx1) = wrapper(&[]);
        processor.process(first);
        let (second, rx2) = wrapper(&[]);
        processor.process(second);

        let (status, body) = json(rx2).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], 1001);
        assert!(metrics.encode().unwrap().contains("gateway_rejected_total 1"));
    }
}
