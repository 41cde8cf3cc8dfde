//! Per-path and per-service flow control.

use super::{Filter, FLOW_CTL_FILTER_ID, FLOW_CTL_FILTER_ORDER};
use crate::context::GatewayContext;
use crate::error::{GatewayError, Result};
use crate::ratelimit::{RateLimit, RedisCountLimiter, TokenBucketLimiter};
use crate::rule::{FlowCtlConfig, FlowCtlLimit, FlowCtlModel, FlowCtlType};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A limiter and the settings it was built from.
#[derive(Debug)]
struct CachedLimiter {
    model: FlowCtlModel,
    limit: FlowCtlLimit,
    limiter: Arc<dyn RateLimit>,
}

impl CachedLimiter {
    fn matches(&self, config: &FlowCtlConfig) -> bool {
        self.model == config.model && self.limit == config.config
    }
}

/// Applies a rule's flow control configs, caching one limiter per
/// `serviceId.path` (or per service id for service-wide limits).
///
/// A cached limiter is rebuilt when a rule update changes its model,
/// window or permits.
#[derive(Debug, Default)]
pub struct FlowCtlFilter {
    redis_url: Option<String>,
    limiters: DashMap<String, CachedLimiter>,
}

impl FlowCtlFilter {
    /// `redis_url` backs the `distributed` model; without it those configs
    /// count locally.
    pub fn new(redis_url: Option<String>) -> Self {
        Self {
            redis_url,
            limiters: DashMap::new(),
        }
    }

    /// Number of cached limiters.
    pub fn cached_limiters(&self) -> usize {
        self.limiters.len()
    }

    fn limiter(&self, key: &str, config: &FlowCtlConfig) -> Arc<dyn RateLimit> {
        if let Some(cached) = self.limiters.get(key) {
            if cached.matches(config) {
                return Arc::clone(&cached.limiter);
            }
        }
        let mut cached = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| self.create(key, config));
        if !cached.matches(config) {
            info!(
                key,
                permits = config.config.permits,
                duration_secs = config.config.duration,
                "flow control settings changed, rebuilding limiter"
            );
            *cached = self.create(key, config);
        }
        Arc::clone(&cached.limiter)
    }

    fn create(&self, key: &str, config: &FlowCtlConfig) -> CachedLimiter {
        CachedLimiter {
            model: config.model,
            limit: config.config,
            limiter: self.build(key, config),
        }
    }

    fn build(&self, key: &str, config: &FlowCtlConfig) -> Arc<dyn RateLimit> {
        let duration = Duration::from_secs(config.config.duration.max(1));
        let permits = config.config.permits;
        if config.model == FlowCtlModel::Distributed {
            match self.redis_url.as_deref() {
                Some(url) => match RedisCountLimiter::new(url, key, permits, duration) {
                    Ok(limiter) => return Arc::new(limiter),
                    Err(e) => warn!(key, error = %e, "redis limiter unavailable, counting locally"),
                },
                None => warn!(key, "distributed flow control without redis_url, counting locally"),
            }
        }
        Arc::new(TokenBucketLimiter::new(permits, duration))
    }
}

impl Filter for FlowCtlFilter {
    fn id(&self) -> &'static str {
        FLOW_CTL_FILTER_ID
    }

    fn name(&self) -> &'static str {
        "flow control filter"
    }

    fn order(&self) -> i32 {
        FLOW_CTL_FILTER_ORDER
    }

    fn do_filter(&self, ctx: &mut GatewayContext) -> Result<()> {
        let rule = Arc::clone(ctx.rule());
        let path = ctx.request().path();
        for config in &rule.flow_ctl_configs {
            let key = match config.kind {
                FlowCtlType::Path if config.value == path => format!("{}.{}", rule.service_id, path),
                FlowCtlType::Path => continue,
                FlowCtlType::Service => rule.service_id.clone(),
            };
            if !self.limiter(&key, config).try_acquire() {
                return Err(GatewayError::FlowControlled { key });
            }
        }
        Ok(())
    }
}
