//! Outbound response model.

use crate::error::ResponseCode;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Response, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use serde::Serialize;

/// Content type of synthesized JSON bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

#[derive(Serialize)]
struct ErrorBody<'a> {
    status: u16,
    code: u32,
    message: &'a str,
}

#[derive(Serialize)]
struct DataBody<'a> {
    status: u16,
    code: u32,
    data: &'a serde_json::Value,
}

/// Response written back to the caller.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    status: StatusCode,
    headers: HeaderMap,
    extra_headers: HeaderMap,
    content: Bytes,
}

impl GatewayResponse {
    /// Translates a backend response verbatim.
    pub fn from_backend(status: StatusCode, headers: HeaderMap, content: Bytes) -> Self {
        Self {
            status,
            headers,
            extra_headers: HeaderMap::new(),
            content,
        }
    }

    /// JSON error body `{status, code, message}` for a response code.
    pub fn from_code(code: ResponseCode) -> Self {
        Self::from_code_with_message(code, code.message())
    }

    /// JSON error body with a custom message.
    pub fn from_code_with_message(code: ResponseCode, message: &str) -> Self {
        let body = ErrorBody {
            status: code.status().as_u16(),
            code: code.code(),
            message,
        };
        Self::json(code.status(), serde_json::to_vec(&body).unwrap_or_default())
    }

    /// JSON success body `{status, code, data}`.
    pub fn success(data: serde_json::Value) -> Self {
        let code = ResponseCode::Success;
        let body = DataBody {
            status: code.status().as_u16(),
            code: code.code(),
            data: &data,
        };
        Self::json(code.status(), serde_json::to_vec(&body).unwrap_or_default())
    }

    fn json(status: StatusCode, content: Vec<u8>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(JSON_CONTENT_TYPE),
        );
        Self {
            status,
            headers,
            extra_headers: HeaderMap::new(),
            content: Bytes::from(content),
        }
    }

    /// Adds a header on top of the backend headers.
    pub fn add_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.extra_headers.insert(name, value);
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers, extra headers excluded.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Response body.
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Builds the HTTP response, setting the connection header.
    pub fn to_http(&self, keep_alive: bool) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.content.clone()));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if name == header::CONNECTION
                || name == header::TRANSFER_ENCODING
                || name == header::CONTENT_LENGTH
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        for (name, value) in &self.extra_headers {
            headers.insert(name.clone(), value.clone());
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.content.len()));
        headers.insert(
            header::CONNECTION,
            HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body() {
        let resp = GatewayResponse::from_code(ResponseCode::ServiceInstanceNotFound);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(resp.content()).unwrap();
        assert_eq!(body["status"], 404);
        assert_eq!(body["code"], ResponseCode::ServiceInstanceNotFound.code());
        assert!(body["message"].is_string());
        assert_eq!(resp.headers().get("content-type").unwrap(), JSON_CONTENT_TYPE);
    }

    #[test]
    fn test_success_body() {
        let resp = GatewayResponse::success(serde_json::json!("degraded"));
        let body: serde_json::Value = serde_json::from_slice(resp.content()).unwrap();
        assert_eq!(body["status"], 200);
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"], "degraded");
    }

    #[test]
    fn test_backend_translation_is_verbatim() {
        let mut headers = HeaderMap::new();
        headers.insert("x-backend", HeaderValue::from_static("yes"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let resp = GatewayResponse::from_backend(StatusCode::CREATED, headers, Bytes::from("pong"));

        let http = resp.to_http(true);
        assert_eq!(http.status(), StatusCode::CREATED);
        assert_eq!(http.headers().get("x-backend").unwrap(), "yes");
        assert_eq!(http.headers().get("connection").unwrap(), "keep-alive");
        assert_eq!(http.headers().get("content-length").unwrap(), "4");
        assert!(http.headers().get("transfer-encoding").is_none());
    }

    #[test]
    fn test_close_connection() {
        let http = GatewayResponse::from_code(ResponseCode::InternalError).to_http(false);
        assert_eq!(http.headers().get("connection").unwrap(), "close");
        assert_eq!(http.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
