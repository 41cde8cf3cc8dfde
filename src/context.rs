//! Per-request context and its lifecycle.
//!
//! A [`GatewayContext`] is owned by exactly one thread or task at a time:
//! the intake or worker thread while the filter chain runs, then the router's
//! outbound task once the call is dispatched. Status moves
//! `Running -> Written -> Completed`, or to `Terminated` when the connection
//! is closed without a response.

use crate::error::{GatewayError, Result};
use crate::request::GatewayRequest;
use crate::response::GatewayResponse;
use crate::rule::Rule;
use http::Response;
use http_body_util::Full;
use hyper::body::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

/// Lifecycle status of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextStatus {
    /// Filters or the outbound call are still running.
    Running = 0,
    /// A response is assembled and ready to flush.
    Written = 1,
    /// The response was flushed.
    Completed = 2,
    /// The connection was closed without a response.
    Terminated = 3,
}

impl ContextStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ContextStatus::Written,
            2 => ContextStatus::Completed,
            3 => ContextStatus::Terminated,
            _ => ContextStatus::Running,
        }
    }
}

/// What the intake side receives for a request.
#[derive(Debug)]
pub enum SinkMessage {
    /// Write this response.
    Response(Response<Full<Bytes>>),
    /// Close the connection without a response.
    Close,
}

/// Take-once handle for writing the response of one request.
///
/// Clones share the same underlying channel, so whichever path writes first
/// wins and later writes are ignored.
#[derive(Clone)]
pub struct ResponseSink {
    tx: Arc<Mutex<Option<oneshot::Sender<SinkMessage>>>>,
}

impl ResponseSink {
    /// Creates a sink and the receiver the intake side awaits.
    pub fn channel() -> (Self, oneshot::Receiver<SinkMessage>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Sends the response. Returns `false` if something was already sent.
    pub fn write(&self, response: Response<Full<Bytes>>) -> bool {
        self.send(SinkMessage::Response(response))
    }

    /// Asks the intake side to close the connection.
    pub fn close(&self) -> bool {
        self.send(SinkMessage::Close)
    }

    fn send(&self, message: SinkMessage) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!("caller went away before the response was written");
                }
                true
            }
            None => false,
        }
    }

    /// Whether a response or close was already sent.
    pub fn is_written(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("written", &self.is_written())
            .finish()
    }
}

/// Callback fired once when the request ends.
pub type CompletedCallback = Box<dyn FnOnce(&GatewayContext) + Send + Sync>;

/// Outbound call prepared by the router filter, waiting to be dispatched.
#[derive(Debug)]
pub struct OutboundCall {
    /// Request to send.
    pub request: http::Request<Full<Bytes>>,
    /// Target URL, kept for logging.
    pub url: String,
}

/// Per-request state threaded through the pipeline.
pub struct GatewayContext {
    protocol: String,
    keep_alive: bool,
    request: GatewayRequest,
    response: Option<GatewayResponse>,
    rule: Arc<Rule>,
    attributes: HashMap<String, serde_json::Value>,
    retry_times: u32,
    gray: bool,
    error: Option<GatewayError>,
    status: AtomicU8,
    request_released: AtomicBool,
    completed_callbacks: Vec<CompletedCallback>,
    sink: ResponseSink,
    timer_start: Option<Instant>,
    outbound: Option<OutboundCall>,
}

impl GatewayContext {
    /// Starts building a context.
    pub fn builder() -> GatewayContextBuilder {
        GatewayContextBuilder::default()
    }

    /// Backend protocol of the matched rule.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Whether the connection stays open after the response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Inbound request.
    pub fn request(&self) -> &GatewayRequest {
        &self.request
    }

    /// Mutable forward view of the request.
    pub fn request_mut(&mut self) -> &mut GatewayRequest {
        &mut self.request
    }

    /// Service key of the request.
    pub fn unique_id(&self) -> &str {
        self.request.unique_id()
    }

    /// Matched rule.
    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    /// Response set so far.
    pub fn response(&self) -> Option<&GatewayResponse> {
        self.response.as_ref()
    }

    /// Sets the response.
    pub fn set_response(&mut self, response: GatewayResponse) {
        self.response = Some(response);
    }

    /// Error recorded for the request.
    pub fn error(&self) -> Option<&GatewayError> {
        self.error.as_ref()
    }

    /// Records an error.
    pub fn set_error(&mut self, error: GatewayError) {
        self.error = Some(error);
    }

    /// Attribute shared between filters.
    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    /// Sets an attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
    }

    /// Retries performed so far.
    pub fn retry_times(&self) -> u32 {
        self.retry_times
    }

    /// Counts one more retry.
    pub fn increment_retry_times(&mut self) {
        self.retry_times += 1;
    }

    /// Whether the request is routed to gray instances.
    pub fn is_gray(&self) -> bool {
        self.gray
    }

    /// Marks the request as gray.
    pub fn set_gray(&mut self, gray: bool) {
        self.gray = gray;
    }

    /// Start instant recorded by the monitor filter.
    pub fn timer_start(&self) -> Option<Instant> {
        self.timer_start
    }

    /// Records the start instant.
    pub fn set_timer_start(&mut self, start: Instant) {
        self.timer_start = Some(start);
    }

    /// Sink the response is written to.
    pub fn sink(&self) -> &ResponseSink {
        &self.sink
    }

    /// Arms the outbound call for dispatch.
    pub fn arm_outbound(&mut self, call: OutboundCall) {
        self.outbound = Some(call);
    }

    /// Takes the armed outbound call.
    pub fn take_outbound(&mut self) -> Option<OutboundCall> {
        self.outbound.take()
    }

    /// Current status.
    pub fn status(&self) -> ContextStatus {
        ContextStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ContextStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Back to running, used when a retry is issued.
    pub fn runned(&self) {
        self.set_status(ContextStatus::Running);
    }

    /// Response assembled.
    pub fn writtened(&self) {
        self.set_status(ContextStatus::Written);
    }

    /// Response flushed.
    pub fn completed(&self) {
        self.set_status(ContextStatus::Completed);
    }

    /// Closed without a response.
    pub fn terminated(&self) {
        self.set_status(ContextStatus::Terminated);
    }

    /// Whether the context is running.
    pub fn is_running(&self) -> bool {
        self.status() == ContextStatus::Running
    }

    /// Whether a response is ready to flush.
    pub fn is_written(&self) -> bool {
        self.status() == ContextStatus::Written
    }

    /// Whether the response was flushed.
    pub fn is_completed(&self) -> bool {
        self.status() == ContextStatus::Completed
    }

    /// Whether the connection was closed without a response.
    pub fn is_terminated(&self) -> bool {
        self.status() == ContextStatus::Terminated
    }

    /// Frees the inbound buffer. Only the first call on a context does
    /// anything; it returns `true`.
    pub fn release_request(&self) -> bool {
        if self
            .request_released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.request.free_inbound();
            true
        } else {
            false
        }
    }

    /// Whether the inbound buffer was released.
    pub fn is_request_released(&self) -> bool {
        self.request_released.load(Ordering::Acquire)
    }

    /// Registers a callback fired when the request ends.
    pub fn add_completed_callback(&mut self, callback: CompletedCallback) {
        self.completed_callbacks.push(callback);
    }

    /// Fires registered callbacks in registration order. Each callback runs
    /// at most once.
    pub fn invoke_completed_callbacks(&mut self) {
        let callbacks = std::mem::take(&mut self.completed_callbacks);
        for callback in callbacks {
            callback(&*self);
        }
    }
}

impl fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayContext")
            .field("unique_id", &self.unique_id())
            .field("path", &self.request.path())
            .field("rule", &self.rule.id)
            .field("status", &self.status())
            .field("retry_times", &self.retry_times)
            .field("gray", &self.gray)
            .finish()
    }
}

/// Builder for [`GatewayContext`].
#[derive(Default)]
pub struct GatewayContextBuilder {
    protocol: Option<String>,
    keep_alive: bool,
    request: Option<GatewayRequest>,
    rule: Option<Arc<Rule>>,
    sink: Option<ResponseSink>,
}

impl GatewayContextBuilder {
    /// Sets the backend protocol.
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Sets the keep-alive flag.
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets the request.
    pub fn request(mut self, request: GatewayRequest) -> Self {
        self.request = Some(request);
        self
    }

    /// Sets the matched rule.
    pub fn rule(mut self, rule: Arc<Rule>) -> Self {
        self.rule = Some(rule);
        self
    }

    /// Sets the response sink.
    pub fn sink(mut self, sink: ResponseSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the context, failing if request, rule or sink is missing.
    pub fn build(self) -> Result<GatewayContext> {
        let missing = |what: &str| GatewayError::Internal(format!("context built without {}", what));
        let rule = self.rule.ok_or_else(|| missing("rule"))?;
        Ok(GatewayContext {
            protocol: self.protocol.unwrap_or_else(|| rule.protocol.clone()),
            keep_alive: self.keep_alive,
            request: self.request.ok_or_else(|| missing("request"))?,
            response: None,
            rule,
            attributes: HashMap::new(),
            retry_times: 0,
            gray: false,
            error: None,
            status: AtomicU8::new(ContextStatus::Running as u8),
            request_released: AtomicBool::new(false),
            completed_callbacks: Vec::new(),
            sink: self.sink.ok_or_else(|| missing("sink"))?,
            timer_start: None,
            outbound: None,
        })
    }
}
