//! Request timing. The start filter runs first; the end filter registers a
//! completion callback so the measurement covers the outbound call and the
//! write-back.

use super::{Filter, MONITOR_END_FILTER_ID, MONITOR_END_FILTER_ORDER, MONITOR_FILTER_ID, MONITOR_FILTER_ORDER};
use crate::context::GatewayContext;
use crate::error::Result;
use crate::metrics::Metrics;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Default)]
pub struct MonitorFilter;

impl Filter for MonitorFilter {
    fn id(&self) -> &'static str {
        MONITOR_FILTER_ID
    }

    fn name(&self) -> &'static str {
        "monitor filter"
    }

    fn order(&self) -> i32 {
        MONITOR_FILTER_ORDER
    }

    fn do_filter(&self, ctx: &mut GatewayContext) -> Result<()> {
        ctx.set_timer_start(Instant::now());
        Ok(())
    }
}

#[derive(Debug)]
pub struct MonitorEndFilter {
    metrics: Arc<Metrics>,
}

impl MonitorEndFilter {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl Filter for MonitorEndFilter {
    fn id(&self) -> &'static str {
        MONITOR_END_FILTER_ID
    }

    fn name(&self) -> &'static str {
        "monitor end filter"
    }

    fn order(&self) -> i32 {
        MONITOR_END_FILTER_ORDER
    }

    fn do_filter(&self, ctx: &mut GatewayContext) -> Result<()> {
        let metrics = Arc::clone(&self.metrics);
        ctx.add_completed_callback(Box::new(move |ctx: &GatewayContext| {
            let start = ctx.timer_start().unwrap_or_else(|| ctx.request().begin_time());
            let duration = start.elapsed().as_secs_f64();
            let status = ctx.response().map(|r| r.status().as_u16()).unwrap_or(0);
            let method = ctx.request().method().as_str();

            metrics.record_request(method, status, ctx.unique_id(), duration);
            info!(
                method = %method,
                path = %ctx.request().path(),
                unique_id = %ctx.unique_id(),
                status,
                retries = ctx.retry_times(),
                duration_ms = duration * 1000.0,
                "request completed"
            );
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context_for;
    use crate::error::ResponseCode;
    use crate::response::GatewayResponse;
    use crate::rule::Rule;

    #[test]
    fn test_end_filter_records_on_completion() {
        let metrics = Arc::new(Metrics::new());
        let (mut ctx, _rx) = context_for(Rule::new("r1", "svc"), "/ping", &[("uniqueId", "svc")]);

        MonitorFilter.do_filter(&mut ctx).unwrap();
        assert!(ctx.timer_start().is_some());
        MonitorEndFilter::new(Arc::clone(&metrics)).do_filter(&mut ctx).unwrap();
        assert!(!metrics.encode().unwrap().contains("service=\"svc\""));

        ctx.set_response(GatewayResponse::from_code(ResponseCode::FlowControlled));
        ctx.invoke_completed_callbacks();

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("service=\"svc\""));
        assert!(encoded.contains("status=\"429\""));
    }
}
