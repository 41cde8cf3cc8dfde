//! Building contexts from inbound requests and writing responses back.

use crate::context::{ContextStatus, GatewayContext, ResponseSink};
use crate::error::{GatewayError, ResponseCode, Result};
use crate::processor::HttpRequestWrapper;
use crate::request::GatewayRequest;
use crate::response::GatewayResponse;
use crate::store::DynamicConfigStore;
use http::HeaderMap;
use std::net::SocketAddr;
use tracing::{debug, error};

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Client address: the first `X-Forwarded-For` entry, else the peer address.
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| remote.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}

/// Builds the context for a wrapped request: requires the `uniqueId` header
/// and a rule matching service and path.
pub fn do_context(wrapper: &HttpRequestWrapper, store: &DynamicConfigStore) -> Result<GatewayContext> {
    let request = GatewayRequest::from_parts(&wrapper.parts, wrapper.body.clone(), wrapper.client_ip.clone());
    if request.unique_id().is_empty() {
        return Err(GatewayError::MissingUniqueId);
    }
    let rule = store.resolve_rule(request.unique_id(), request.path())?;
    GatewayContext::builder()
        .protocol(rule.protocol.clone())
        .keep_alive(wrapper.keep_alive)
        .request(request)
        .rule(rule)
        .sink(wrapper.sink.clone())
        .build()
}

/// Writes a JSON error for a request that never got a context.
pub fn write_error(sink: &ResponseSink, keep_alive: bool, err: &GatewayError) -> bool {
    let response = GatewayResponse::from_code(err.response_code());
    sink.write(response.to_http(keep_alive))
}

/// Records `err` as the outcome of `ctx` and writes it back.
pub fn fail(ctx: &mut GatewayContext, err: GatewayError) {
    ctx.set_response(GatewayResponse::from_code(err.response_code()));
    ctx.set_error(err);
    ctx.writtened();
    write_response(ctx);
}

/// Sends the context's outcome through its sink exactly once.
///
/// Releases the inbound request first. A context still running here was
/// abandoned by its pipeline and gets an internal error.
pub fn write_response(ctx: &mut GatewayContext) {
    ctx.release_request();
    match ctx.status() {
        ContextStatus::Written => {
            let response = ctx
                .response()
                .cloned()
                .unwrap_or_else(|| GatewayResponse::from_code(ResponseCode::InternalError));
            if !ctx.sink().write(response.to_http(ctx.keep_alive())) {
                debug!(unique_id = %ctx.unique_id(), "response already written");
            }
            ctx.completed();
            ctx.invoke_completed_callbacks();
        }
        ContextStatus::Completed => ctx.invoke_completed_callbacks(),
        ContextStatus::Terminated => {
            ctx.sink().close();
            ctx.invoke_completed_callbacks();
        }
        ContextStatus::Running => {
            error!(unique_id = %ctx.unique_id(), path = %ctx.request().path(), "writing response for a running context");
            ctx.set_response(GatewayResponse::from_code(ResponseCode::InternalError));
            ctx.writtened();
            write_response(ctx);
        }
    }
}
