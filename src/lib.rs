//! Rust API Gateway - rule-driven HTTP gateway
//!
//! Requests are matched to a rule by service and path, run through a sorted
//! filter chain (gray routing, JWT auth, flow control, load balancing) and
//! forwarded to a backend instance with retries and circuit breaking. A
//! ring-buffer dispatch core decouples connection handling from the pipeline.

pub mod admin;
pub mod admin_listener;
pub mod center;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod helper;
pub mod listener;
pub mod load_balance;
pub mod metrics;
pub mod processor;
pub mod ratelimit;
pub mod request;
pub mod response;
pub mod rule;
pub mod store;
