use super::{Filter, GRAY_FILTER_ID, GRAY_FILTER_ORDER};
use crate::context::GatewayContext;
use crate::error::Result;

const GRAY_HEADER: &str = "gray";
const GRAY_BUCKETS: i32 = 1024;

/// Steers tagged traffic, plus one client-IP bucket out of 1024, to gray
/// instances.
#[derive(Debug, Default)]
pub struct GrayFilter;

impl Filter for GrayFilter {
    fn id(&self) -> &'static str {
        GRAY_FILTER_ID
    }

    fn name(&self) -> &'static str {
        "gray filter"
    }

    fn order(&self) -> i32 {
        GRAY_FILTER_ORDER
    }

    fn do_filter(&self, ctx: &mut GatewayContext) -> Result<()> {
        if ctx.request().header(GRAY_HEADER) == Some("true") {
            ctx.set_gray(true);
        }
        if ip_hash(ctx.request().client_ip()) & (GRAY_BUCKETS - 1) == 1 {
            ctx.set_gray(true);
        }
        Ok(())
    }
}

/// 31-polynomial hash over UTF-16 code units, wrapping.
fn ip_hash(ip: &str) -> i32 {
    ip.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(i32::from(c)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context_for;
    use crate::context::ResponseSink;
    use crate::request::GatewayRequest;
    use crate::rule::Rule;
    use hyper::body::Bytes;
    use std::sync::Arc;

    #[test]
    fn test_header_marks_gray() {
        let (mut ctx, _rx) = context_for(Rule::new("r1", "svc"), "/ping", &[("gray", "true")]);
        GrayFilter.do_filter(&mut ctx).unwrap();
        assert!(ctx.is_gray());
    }

    #[test]
    fn test_untagged_request_not_gray() {
        let (mut ctx, _rx) = context_for(Rule::new("r1", "svc"), "/ping", &[("gray", "false")]);
        GrayFilter.do_filter(&mut ctx).unwrap();
        assert!(!ctx.is_gray());
    }

    #[test]
    fn test_ip_bucket_marks_gray() {
        let (parts, _) = http::Request::get("/ping").body(()).unwrap().into_parts();
        let request = GatewayRequest::from_parts(&parts, Bytes::new(), "10.0.0.172");
        let (sink, _rx) = ResponseSink::channel();
        let mut ctx = GatewayContext::builder()
            .request(request)
            .rule(Arc::new(Rule::new("r1", "svc")))
            .sink(sink)
            .build()
            .unwrap();

        GrayFilter.do_filter(&mut ctx).unwrap();
        assert!(ctx.is_gray());
    }

    #[test]
    fn test_ip_hash_matches_string_hash() {
        assert_eq!(ip_hash(""), 0);
        assert_eq!(ip_hash("a"), 97);
        assert_eq!(ip_hash("ab"), 97 * 31 + 98);
        assert_eq!(ip_hash("127.0.0.1") & 1023, 381);
    }
}
