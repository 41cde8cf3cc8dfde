//! Outbound routing.
//!
//! The filter itself only prepares the call. Once the chain has finished, the
//! processor hands the context to [`RouterFilter::dispatch`], which moves it
//! into an async task that performs the call, retries on transport failures
//! and writes the response back.

use super::{Filter, ROUTER_FILTER_ID, ROUTER_FILTER_ORDER};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::client::{BackendResponse, HttpClient};
use crate::context::{GatewayContext, OutboundCall};
use crate::error::{GatewayError, Result, TransportError};
use crate::helper;
use crate::metrics::Metrics;
use crate::response::GatewayResponse;
use crate::rule::CircuitBreakerPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

/// Where the continuation of an outbound call runs.
#[derive(Debug, Clone)]
pub enum CompletionExecutor {
    /// On the task that completed the call.
    Inline,
    /// On a fresh task of the given runtime.
    Spawn(Handle),
}

impl CompletionExecutor {
    /// `Inline` when `when_complete` is set, otherwise a spawn on `handle`.
    pub fn from_config(when_complete: bool, handle: Handle) -> Self {
        if when_complete {
            CompletionExecutor::Inline
        } else {
            CompletionExecutor::Spawn(handle)
        }
    }
}

enum Step {
    Retry(GatewayContext),
    Done,
}

/// Sends the request to the chosen instance.
#[derive(Debug)]
pub struct RouterFilter {
    client: HttpClient,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<Metrics>,
    executor: CompletionExecutor,
    handle: Handle,
}

impl RouterFilter {
    pub fn new(
        client: HttpClient,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<Metrics>,
        executor: CompletionExecutor,
        handle: Handle,
    ) -> Self {
        Self {
            client,
            breakers,
            metrics,
            executor,
            handle,
        }
    }

    /// Takes ownership of a context whose chain completed and runs its
    /// outbound call on the runtime.
    pub fn dispatch(self: Arc<Self>, ctx: GatewayContext) {
        let handle = self.handle.clone();
        handle.spawn(self.route(ctx));
    }

    async fn route(self: Arc<Self>, mut ctx: GatewayContext) {
        loop {
            let Some(OutboundCall { request, url }) = ctx.take_outbound() else {
                helper::write_response(&mut ctx);
                return;
            };

            let rule = Arc::clone(ctx.rule());
            if let Some(policy) = rule.circuit_breaker(ctx.request().path()) {
                self.guarded(ctx, request, url, policy).await;
                return;
            }

            let limit = ctx
                .request()
                .request_timeout()
                .unwrap_or_else(|| self.client.default_timeout());
            let outcome = self.client.execute(request, &url, limit).await;

            match &self.executor {
                CompletionExecutor::Inline => match self.complete(ctx, &url, outcome) {
                    Step::Retry(next) => ctx = next,
                    Step::Done => return,
                },
                CompletionExecutor::Spawn(handle) => {
                    let router = Arc::clone(&self);
                    handle.spawn(async move {
                        if let Step::Retry(next) = router.complete(ctx, &url, outcome) {
                            router.dispatch(next);
                        }
                    });
                    return;
                }
            }
        }
    }

    fn complete(
        &self,
        mut ctx: GatewayContext,
        url: &str,
        outcome: std::result::Result<BackendResponse, TransportError>,
    ) -> Step {
        // released on write, a retry sends the body again
        match outcome {
            Ok(response) => {
                ctx.set_response(GatewayResponse::from_backend(
                    response.status,
                    response.headers,
                    response.body,
                ));
                ctx.writtened();
                helper::write_response(&mut ctx);
            }
            Err(err) if err.is_retryable() && ctx.retry_times() < ctx.rule().retry_config.times => {
                ctx.increment_retry_times();
                self.metrics.record_retry(ctx.unique_id());
                warn!(
                    url,
                    unique_id = %ctx.unique_id(),
                    retry = ctx.retry_times(),
                    error = %err,
                    "retrying backend call"
                );
                ctx.runned();
                match self.do_filter(&mut ctx) {
                    Ok(()) => return Step::Retry(ctx),
                    Err(err) => helper::fail(&mut ctx, err),
                }
            }
            Err(err) => {
                if matches!(err, TransportError::Timeout { .. }) {
                    warn!(url, unique_id = %ctx.unique_id(), "backend request timed out");
                } else {
                    error!(url, unique_id = %ctx.unique_id(), error = %err, "backend request failed");
                }
                helper::fail(&mut ctx, GatewayError::Transport(err));
            }
        }
        Step::Done
    }

    /// Breaker-guarded call. Every failure, including a short-circuit or a
    /// saturated bulkhead, answers with the policy's fallback; there is no
    /// retry on this path.
    async fn guarded(
        &self,
        mut ctx: GatewayContext,
        request: http::Request<http_body_util::Full<hyper::body::Bytes>>,
        url: String,
        policy: &CircuitBreakerPolicy,
    ) {
        let guard = self.breakers.get_or_create(ctx.unique_id(), policy);
        let permit = if guard.breaker().allow_request() {
            guard.try_acquire()
        } else {
            None
        };

        let response = match permit {
            None => {
                debug!(url = %url, unique_id = %ctx.unique_id(), "circuit short-circuited, using fallback");
                fallback(policy)
            }
            Some(_permit) => {
                let limit = if policy.timeout_ms == 0 {
                    self.client.default_timeout()
                } else {
                    Duration::from_millis(policy.timeout_ms)
                };
                match self.client.execute(request, &url, limit).await {
                    Ok(response) => {
                        guard.breaker().record_success();
                        GatewayResponse::from_backend(response.status, response.headers, response.body)
                    }
                    Err(err) => {
                        guard.breaker().record_failure();
                        warn!(url = %url, unique_id = %ctx.unique_id(), error = %err, "guarded call failed, using fallback");
                        fallback(policy)
                    }
                }
            }
        };

        ctx.release_request();
        ctx.set_response(response);
        ctx.writtened();
        helper::write_response(&mut ctx);
    }
}

fn fallback(policy: &CircuitBreakerPolicy) -> GatewayResponse {
    GatewayResponse::success(serde_json::Value::String(policy.fallback_response.clone()))
}

impl Filter for RouterFilter {
    fn id(&self) -> &'static str {
        ROUTER_FILTER_ID
    }

    fn name(&self) -> &'static str {
        "router filter"
    }

    fn order(&self) -> i32 {
        ROUTER_FILTER_ORDER
    }

    fn do_filter(&self, ctx: &mut GatewayContext) -> Result<()> {
        let request = ctx.request().build_outbound()?;
        let url = ctx.request().target_url();
        ctx.arm_outbound(OutboundCall { request, url });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::State;
    use crate::config::GatewayConfig;
    use crate::context::tests::context_for;
    use crate::context::SinkMessage;
    use crate::rule::Rule;
    use http::StatusCode;
    use http_body_util::BodyExt;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn router(executor: CompletionExecutor) -> Arc<RouterFilter> {
        let config = GatewayConfig {
            request_timeout: Duration::from_secs(2),
            ..GatewayConfig::default()
        };
        Arc::new(RouterFilter::new(
            HttpClient::new(&config),
            Arc::new(CircuitBreakerRegistry::new()),
            Arc::new(Metrics::new()),
            executor,
            Handle::current(),
        ))
    }

    async fn pong_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\nconnection: close\r\n\r\npong")
                        .await;
                });
            }
        });
        addr
    }

    /// Accepts connections and never answers.
    async fn silent_upstream(accepted: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    drop(socket);
                });
            }
        });
        addr
    }

    /// Leaves the first `stalls` connections unanswered, then answers `pong`
    /// to requests that carried the inbound body and `empty` otherwise.
    async fn flaky_upstream(stalls: usize, accepted: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let attempt = accepted.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(async move {
                    if attempt <= stalls {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        return;
                    }
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    let _ = tokio::time::timeout(Duration::from_millis(500), async {
                        while !request.ends_with(b"hello") {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => request.extend_from_slice(&buf[..n]),
                            }
                        }
                    })
                    .await;
                    let reply: &[u8] = if request.ends_with(b"hello") {
                        b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\nconnection: close\r\n\r\npong"
                    } else {
                        b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nempty"
                    };
                    let _ = socket.write_all(reply).await;
                });
            }
        });
        addr
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn armed(router: &RouterFilter, rule: Rule, addr: SocketAddr) -> (GatewayContext, oneshot::Receiver<SinkMessage>) {
        let (mut ctx, rx) = context_for(rule, "/ping", &[("uniqueId", "svc")]);
        ctx.request_mut().set_modify_host(addr.to_string());
        router.do_filter(&mut ctx).unwrap();
        (ctx, rx)
    }

    async fn received(rx: oneshot::Receiver<SinkMessage>) -> (StatusCode, hyper::body::Bytes) {
        match rx.await.unwrap() {
            SinkMessage::Response(response) => {
                let status = response.status();
                let body = response.into_body().collect().await.unwrap().to_bytes();
                (status, body)
            }
            SinkMessage::Close => panic!("connection closed without a response"),
        }
    }

    fn breaker_policy() -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            path: "/ping".to_string(),
            timeout_ms: 200,
            thread_core_size: 2,
            fallback_response: "busy".to_string(),
            failure_threshold: 1,
            open_ms: 60_000,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_do_filter_arms_outbound_call() {
        let router = router(CompletionExecutor::Inline);
        let (mut ctx, _rx) = context_for(Rule::new("r1", "svc"), "/ping?a=1", &[("uniqueId", "svc")]);
        ctx.request_mut().set_modify_host("10.0.0.1:8080");
        router.do_filter(&mut ctx).unwrap();

        let call = ctx.take_outbound().unwrap();
        assert_eq!(call.url, "http://10.0.0.1:8080/ping?a=1");
        assert_eq!(call.request.headers().get("host").unwrap(), "10.0.0.1:8080");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispatch_relays_backend_response() {
        let addr = pong_upstream().await;
        let router = router(CompletionExecutor::Inline);
        let (ctx, rx) = armed(&router, Rule::new("r1", "svc"), addr);

        Arc::clone(&router).dispatch(ctx);
        let (status, body) = received(rx).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "pong");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_continuation_relays_response() {
        let addr = pong_upstream().await;
        let router = router(CompletionExecutor::Spawn(Handle::current()));
        let (ctx, rx) = armed(&router, Rule::new("r1", "svc"), addr);

        Arc::clone(&router).dispatch(ctx);
        let (status, body) = received(rx).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "pong");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_retries_then_gateway_timeout() {
        for executor in [CompletionExecutor::Inline, CompletionExecutor::Spawn(Handle::current())] {
            let accepted = Arc::new(AtomicUsize::new(0));
            let addr = silent_upstream(Arc::clone(&accepted)).await;
            let router = router(executor);
            let (mut ctx, rx) = context_for(Rule::new("r1", "svc").with_retry_times(2), "/ping", &[("uniqueId", "svc")]);
            ctx.request_mut().set_modify_host(addr.to_string());
            ctx.request_mut().set_request_timeout(Duration::from_millis(100));
            router.do_filter(&mut ctx).unwrap();

            Arc::clone(&router).dispatch(ctx);
            let (status, body) = received(rx).await;
            assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
            assert!(String::from_utf8_lossy(&body).contains("10005"));
            assert_eq!(accepted.load(Ordering::SeqCst), 3);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retry_then_success_writes_once() {
        for executor in [CompletionExecutor::Inline, CompletionExecutor::Spawn(Handle::current())] {
            let accepted = Arc::new(AtomicUsize::new(0));
            let addr = flaky_upstream(2, Arc::clone(&accepted)).await;
            let router = router(executor);
            let (mut ctx, rx) = context_for(Rule::new("r1", "svc").with_retry_times(2), "/ping", &[("uniqueId", "svc")]);
            ctx.request_mut().set_modify_host(addr.to_string());
            ctx.request_mut().set_request_timeout(Duration::from_millis(150));
            let fired = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&fired);
            ctx.add_completed_callback(Box::new(move |ctx| {
                if ctx.is_completed() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }));
            router.do_filter(&mut ctx).unwrap();

            Arc::clone(&router).dispatch(ctx);
            let (status, body) = received(rx).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "pong");
            assert_eq!(accepted.load(Ordering::SeqCst), 3);

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_failure_without_retry_is_bad_gateway() {
        let addr = closed_port().await;
        let router = router(CompletionExecutor::Inline);
        let (ctx, rx) = armed(&router, Rule::new("r1", "svc"), addr);

        Arc::clone(&router).dispatch(ctx);
        let (status, _) = received(rx).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_breaker_failure_answers_with_fallback() {
        let addr = closed_port().await;
        let router = router(CompletionExecutor::Inline);
        let rule = Rule::new("r1", "svc")
            .with_retry_times(3)
            .with_circuit_breaker(breaker_policy());

        let (ctx, rx) = armed(&router, rule.clone(), addr);
        Arc::clone(&router).dispatch(ctx);
        let (status, body) = received(rx).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["data"], "busy");

        let guard = router.breakers.get_or_create("svc", &breaker_policy());
        assert_eq!(guard.breaker().state(), State::Open);

        let (ctx, rx) = armed(&router, rule, addr);
        Arc::clone(&router).dispatch(ctx);
        let (status, _) = received(rx).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(guard.breaker().stats().total_failures, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unarmed_context_gets_internal_error() {
        let router = router(CompletionExecutor::Inline);
        let (ctx, rx) = context_for(Rule::new("r1", "svc"), "/ping", &[("uniqueId", "svc")]);
        Arc::clone(&router).dispatch(ctx);
        let (status, _) = received(rx).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
