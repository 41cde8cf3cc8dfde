//! Error types for the gateway.
//!
//! Every error that can end a request maps to a [`ResponseCode`], which in
//! turn carries the HTTP status and the numeric code rendered in the JSON
//! error body.

use http::StatusCode;
use std::io;
use thiserror::Error;

/// Response codes rendered into synthesized JSON bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// Request handled successfully.
    Success,
    /// Unexpected failure inside the gateway.
    InternalError,
    /// The dispatch core is saturated.
    GatewayBusy,
    /// The `uniqueId` header is missing.
    MissingUniqueId,
    /// No rule matches the service and path.
    PathNoMatched,
    /// No live instance is registered for the service.
    ServiceInstanceNotFound,
    /// The JWT cookie is missing or invalid.
    Unauthorized,
    /// A flow control limit rejected the request.
    FlowControlled,
    /// The backend did not answer within the timeout.
    RequestTimeout,
    /// The backend could not be reached or failed mid-exchange.
    HttpResponseError,
    /// The inbound body exceeded the configured limit.
    PayloadTooLarge,
}

impl ResponseCode {
    /// HTTP status used when this code is written back.
    pub fn status(&self) -> StatusCode {
        match self {
            ResponseCode::Success => StatusCode::OK,
            ResponseCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ResponseCode::GatewayBusy => StatusCode::SERVICE_UNAVAILABLE,
            ResponseCode::MissingUniqueId => StatusCode::BAD_REQUEST,
            ResponseCode::PathNoMatched => StatusCode::NOT_FOUND,
            ResponseCode::ServiceInstanceNotFound => StatusCode::NOT_FOUND,
            ResponseCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ResponseCode::FlowControlled => StatusCode::TOO_MANY_REQUESTS,
            ResponseCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ResponseCode::HttpResponseError => StatusCode::BAD_GATEWAY,
            ResponseCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Numeric code placed in the `code` field of the JSON body.
    pub fn code(&self) -> u32 {
        match self {
            ResponseCode::Success => 0,
            ResponseCode::InternalError => 1000,
            ResponseCode::GatewayBusy => 1001,
            ResponseCode::MissingUniqueId => 10000,
            ResponseCode::PathNoMatched => 10001,
            ResponseCode::ServiceInstanceNotFound => 10002,
            ResponseCode::Unauthorized => 10003,
            ResponseCode::FlowControlled => 10004,
            ResponseCode::RequestTimeout => 10005,
            ResponseCode::HttpResponseError => 10006,
            ResponseCode::PayloadTooLarge => 10007,
        }
    }

    /// Human readable message placed in the `message` field.
    pub fn message(&self) -> &'static str {
        match self {
            ResponseCode::Success => "success",
            ResponseCode::InternalError => "internal gateway error",
            ResponseCode::GatewayBusy => "gateway is busy, try again later",
            ResponseCode::MissingUniqueId => "missing uniqueId header",
            ResponseCode::PathNoMatched => "no rule matches the request path",
            ResponseCode::ServiceInstanceNotFound => "no service instance available",
            ResponseCode::Unauthorized => "unauthorized",
            ResponseCode::FlowControlled => "request rejected by flow control",
            ResponseCode::RequestTimeout => "backend request timed out",
            ResponseCode::HttpResponseError => "backend service error",
            ResponseCode::PayloadTooLarge => "request body too large",
        }
    }
}

/// Outbound call failures, classified for the retry decision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No response within the request timeout.
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    /// The connection could not be established.
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The exchange failed after the connection was established.
    #[error("io error talking to {url}: {reason}")]
    Io { url: String, reason: String },

    /// The outbound request could not be built.
    #[error("invalid outbound request to {url}: {reason}")]
    InvalidRequest { url: String, reason: String },
}

impl TransportError {
    /// Timeouts and connection level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. } | TransportError::Connect { .. } | TransportError::Io { .. }
        )
    }

    /// Target URL of the failed call.
    pub fn url(&self) -> &str {
        match self {
            TransportError::Timeout { url, .. }
            | TransportError::Connect { url, .. }
            | TransportError::Io { url, .. }
            | TransportError::InvalidRequest { url, .. } => url,
        }
    }
}

/// Errors that can occur while processing a request.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// HTTP protocol error on an inbound connection.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The request did not carry a `uniqueId` header.
    #[error("request is missing the uniqueId header")]
    MissingUniqueId,

    /// No rule matches the service and path.
    #[error("no rule for service {service_id} and path {path}")]
    PathNoMatched { service_id: String, path: String },

    /// No live instance is registered for the service.
    #[error("no instance available for service {unique_id}")]
    ServiceInstanceNotFound { unique_id: String },

    /// JWT validation failed.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// A flow control limit rejected the request.
    #[error("flow control rejected {key}")]
    FlowControlled { key: String },

    /// Outbound call failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The dispatch core rejected the request.
    #[error("dispatch queue is full or shut down")]
    GatewayBusy,

    /// The inbound body exceeded the configured limit.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Anything else raised while processing.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Maps the error onto the code written back to the caller.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            GatewayError::MissingUniqueId => ResponseCode::MissingUniqueId,
            GatewayError::PathNoMatched { .. } => ResponseCode::PathNoMatched,
            GatewayError::ServiceInstanceNotFound { .. } => ResponseCode::ServiceInstanceNotFound,
            GatewayError::Unauthorized { .. } => ResponseCode::Unauthorized,
            GatewayError::FlowControlled { .. } => ResponseCode::FlowControlled,
            GatewayError::Transport(TransportError::Timeout { .. }) => ResponseCode::RequestTimeout,
            GatewayError::Transport(_) => ResponseCode::HttpResponseError,
            GatewayError::GatewayBusy => ResponseCode::GatewayBusy,
            GatewayError::PayloadTooLarge { .. } => ResponseCode::PayloadTooLarge,
            GatewayError::ListenerBind { .. }
            | GatewayError::Http(_)
            | GatewayError::Io(_)
            | GatewayError::InvalidConfig(_)
            | GatewayError::Internal(_) => ResponseCode::InternalError,
        }
    }

    /// Policy errors are raised on purpose by filters and are never retried.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            GatewayError::MissingUniqueId
                | GatewayError::PathNoMatched { .. }
                | GatewayError::ServiceInstanceNotFound { .. }
                | GatewayError::Unauthorized { .. }
                | GatewayError::FlowControlled { .. }
        )
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
