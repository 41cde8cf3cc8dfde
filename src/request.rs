//! Inbound request model with a mutable forward view.
//!
//! The inbound parts are kept as received. Filters rewrite the forward view
//! (target host, path, extra headers, query and form params, cookies) and the
//! router builds the outbound request from it.

use crate::error::TransportError;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use http::{Method, Request};
use http_body_util::Full;
use hyper::body::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use url::form_urlencoded;

/// Header carrying the target service key.
pub const UNIQUE_ID: &str = "uniqueId";

/// Header carrying the authenticated user id to the backend.
pub const USER_ID: &str = "userid";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A request received by the gateway.
#[derive(Debug)]
pub struct GatewayRequest {
    unique_id: String,
    begin_time: Instant,
    client_ip: String,
    host: String,
    path: String,
    uri: String,
    method: Method,
    content_type: Option<String>,
    headers: HeaderMap,
    query: Option<String>,
    query_params: Vec<(String, String)>,
    cookies: BTreeMap<String, String>,
    body: Mutex<Option<Bytes>>,

    user_id: Option<i64>,
    modify_scheme: String,
    modify_host: String,
    modify_path: String,
    extra_headers: HeaderMap,
    extra_query_params: Vec<(String, String)>,
    form_params: Vec<(String, String)>,
    outbound_cookies: BTreeMap<String, String>,
    request_timeout: Option<Duration>,
}

impl GatewayRequest {
    /// Builds the request from received parts and the collected body.
    pub fn from_parts(parts: &Parts, body: Bytes, client_ip: impl Into<String>) -> Self {
        let headers = parts.headers.clone();
        let unique_id = header_str(&headers, UNIQUE_ID).unwrap_or_default().to_string();
        let host = header_str(&headers, header::HOST.as_str())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let path = parts.uri.path().to_string();
        let query_params = parts
            .uri
            .query()
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        let cookies = parse_cookies(&headers);
        let content_type = header_str(&headers, header::CONTENT_TYPE.as_str()).map(str::to_string);

        Self {
            unique_id,
            begin_time: Instant::now(),
            client_ip: client_ip.into(),
            modify_host: host.clone(),
            host,
            modify_path: path.clone(),
            path,
            uri: parts.uri.to_string(),
            method: parts.method.clone(),
            content_type,
            headers,
            query: parts.uri.query().map(str::to_string),
            query_params,
            outbound_cookies: cookies.clone(),
            cookies,
            body: Mutex::new(Some(body)),
            user_id: None,
            modify_scheme: "http://".to_string(),
            extra_headers: HeaderMap::new(),
            extra_query_params: Vec::new(),
            form_params: Vec::new(),
            request_timeout: None,
        }
    }

    /// Service key from the `uniqueId` header, empty when absent.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// When the request was received.
    pub fn begin_time(&self) -> Instant {
        self.begin_time
    }

    /// Caller address.
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    /// Inbound host header.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Inbound path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Inbound URI as received.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Inbound method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Inbound content type.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Inbound headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Inbound header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    /// Inbound query parameters in order of appearance.
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query_params
    }

    /// Inbound cookie value.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Inbound body. Empty once the buffer was released.
    pub fn body(&self) -> Bytes {
        self.body.lock().clone().unwrap_or_default()
    }

    /// Drops the inbound buffer. The request is its only owner once the
    /// dispatch slot let go of the wrapper.
    ///
    /// Returns `true` if the buffer was still held.
    pub(crate) fn free_inbound(&self) -> bool {
        self.body.lock().take().is_some()
    }

    /// Whether the inbound buffer is still held.
    pub fn holds_inbound(&self) -> bool {
        self.body.lock().is_some()
    }

    /// Authenticated user id.
    pub fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    /// Records the authenticated user id and forwards it as a header.
    pub fn set_user_id(&mut self, user_id: i64) {
        self.user_id = Some(user_id);
        if let Ok(value) = HeaderValue::from_str(&user_id.to_string()) {
            self.extra_headers.insert(HeaderName::from_static(USER_ID), value);
        }
    }

    /// Outbound scheme, `http://` by default.
    pub fn modify_scheme(&self) -> &str {
        &self.modify_scheme
    }

    /// Sets the outbound scheme.
    pub fn set_modify_scheme(&mut self, scheme: impl Into<String>) {
        self.modify_scheme = scheme.into();
    }

    /// Outbound `host:port`.
    pub fn modify_host(&self) -> &str {
        &self.modify_host
    }

    /// Sets the outbound `host:port`.
    pub fn set_modify_host(&mut self, host: impl Into<String>) {
        self.modify_host = host.into();
    }

    /// Outbound path.
    pub fn modify_path(&self) -> &str {
        &self.modify_path
    }

    /// Sets the outbound path.
    pub fn set_modify_path(&mut self, path: impl Into<String>) {
        self.modify_path = path.into();
    }

    /// Adds or replaces an outbound header.
    pub fn add_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.extra_headers.insert(name, value);
    }

    /// Appends an outbound query parameter.
    pub fn add_query_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.extra_query_params.push((name.into(), value.into()));
    }

    /// Appends an outbound form parameter.
    pub fn add_form_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.form_params.push((name.into(), value.into()));
    }

    /// Adds or replaces an outbound cookie.
    pub fn add_or_replace_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.outbound_cookies.insert(name.into(), value.into());
    }

    /// Per request timeout overriding the client default.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Sets the per request timeout.
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = Some(timeout);
    }

    /// Outbound URL assembled from scheme, host, path and query.
    ///
    /// The inbound query is forwarded byte for byte. Parameters added by
    /// filters are encoded and appended.
    pub fn target_url(&self) -> String {
        let mut url = format!("{}{}{}", self.modify_scheme, self.modify_host, self.modify_path);
        let mut query = self.query.clone().unwrap_or_default();
        if !self.extra_query_params.is_empty() {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(
                &form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(self.extra_query_params.iter())
                    .finish(),
            );
        }
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    /// Builds the outbound request from the forward view.
    pub fn build_outbound(&self) -> Result<Request<Full<Bytes>>, TransportError> {
        let url = self.target_url();
        let invalid = |reason: String| TransportError::InvalidRequest {
            url: url.clone(),
            reason,
        };

        let mut headers = HeaderMap::with_capacity(self.headers.len() + self.extra_headers.len());
        for (name, value) in &self.headers {
            let lower = name.as_str();
            if HOP_BY_HOP.contains(&lower)
                || name == header::HOST
                || name == header::CONTENT_LENGTH
                || name == header::COOKIE
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        for (name, value) in &self.extra_headers {
            headers.insert(name.clone(), value.clone());
        }
        if !self.outbound_cookies.is_empty() {
            let cookie = self
                .outbound_cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            let value = HeaderValue::from_str(&cookie).map_err(|e| invalid(e.to_string()))?;
            headers.insert(header::COOKIE, value);
        }
        let host = HeaderValue::from_str(&self.modify_host).map_err(|e| invalid(e.to_string()))?;
        headers.insert(header::HOST, host);

        let body = self.body();
        let body = if !self.form_params.is_empty() && body.is_empty() {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
            Bytes::from(
                form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(self.form_params.iter())
                    .finish(),
            )
        } else {
            body
        };

        let mut builder = Request::builder().method(self.method.clone()).uri(url.as_str());
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        builder
            .body(Full::new(body))
            .map_err(|e| invalid(e.to_string()))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}
