use super::{Filter, LOAD_BALANCE_FILTER_ID, LOAD_BALANCE_FILTER_ORDER};
use crate::context::GatewayContext;
use crate::error::{GatewayError, Result};
use crate::load_balance::{LoadBalance, LoadBalanceStrategy, RandomLoadBalance, RoundRobinLoadBalance};
use crate::store::DynamicConfigStore;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

/// Config key naming the strategy.
pub const LOAD_BALANCE_KEY: &str = "load_balance";

/// Picks a live instance and points the outbound request at it.
#[derive(Debug)]
pub struct LoadBalanceFilter {
    store: Arc<DynamicConfigStore>,
    round_robin: DashMap<String, Arc<RoundRobinLoadBalance>>,
}

impl LoadBalanceFilter {
    pub fn new(store: Arc<DynamicConfigStore>) -> Self {
        Self {
            store,
            round_robin: DashMap::new(),
        }
    }

    fn strategy(ctx: &GatewayContext) -> LoadBalanceStrategy {
        let Some(setting) = ctx
            .rule()
            .filter_config(LOAD_BALANCE_FILTER_ID)
            .and_then(|c| c.str_setting(LOAD_BALANCE_KEY))
        else {
            return LoadBalanceStrategy::default();
        };
        setting.parse().unwrap_or_else(|e| {
            warn!(rule = %ctx.rule().id, error = %e, "falling back to random load balancing");
            LoadBalanceStrategy::default()
        })
    }

    fn balancer(&self, ctx: &GatewayContext) -> Arc<dyn LoadBalance> {
        match Self::strategy(ctx) {
            LoadBalanceStrategy::Random => Arc::new(RandomLoadBalance),
            LoadBalanceStrategy::RoundRobin => {
                let balancer: Arc<RoundRobinLoadBalance> = self
                    .round_robin
                    .entry(ctx.unique_id().to_string())
                    .or_insert_with(|| Arc::new(RoundRobinLoadBalance::new()))
                    .clone();
                balancer
            }
        }
    }
}

impl Filter for LoadBalanceFilter {
    fn id(&self) -> &'static str {
        LOAD_BALANCE_FILTER_ID
    }

    fn name(&self) -> &'static str {
        "load balance filter"
    }

    fn order(&self) -> i32 {
        LOAD_BALANCE_FILTER_ORDER
    }

    fn do_filter(&self, ctx: &mut GatewayContext) -> Result<()> {
        let instances = self.store.service_instances(ctx.unique_id(), ctx.is_gray());
        let address = self.balancer(ctx).choose(&instances).map(|i| i.address());

        match address {
            Some(address) => {
                ctx.request_mut().set_modify_host(address);
                Ok(())
            }
            None => {
                warn!(unique_id = %ctx.unique_id(), gray = ctx.is_gray(), "no instance available");
                Err(GatewayError::ServiceInstanceNotFound {
                    unique_id: ctx.unique_id().to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context_for;
    use crate::rule::{FilterConfig, Rule, ServiceDefinition, ServiceInstance};

    fn store() -> Arc<DynamicConfigStore> {
        let store = Arc::new(DynamicConfigStore::new());
        store.put_service_instances(
            ServiceDefinition::new("svc"),
            vec![
                ServiceInstance::new("svc", "10.0.0.3", 80),
                ServiceInstance::new("svc", "10.0.0.1", 80),
                ServiceInstance::new("svc", "10.0.0.2", 80).with_gray(true),
            ],
        );
        store
    }

    fn round_robin_rule() -> Rule {
        Rule::new("r1", "svc").with_filter(
            FilterConfig::new(LOAD_BALANCE_FILTER_ID)
                .with_config(serde_json::json!({ "load_balance": "roundRobin" })),
        )
    }

    #[test]
    fn test_round_robin_across_requests() {
        let filter = LoadBalanceFilter::new(store());
        let hosts: Vec<String> = (0..6)
            .map(|_| {
                let (mut ctx, _rx) = context_for(round_robin_rule(), "/ping", &[("uniqueId", "svc")]);
                filter.do_filter(&mut ctx).unwrap();
                ctx.request().modify_host().to_string()
            })
            .collect();
        assert_eq!(
            hosts,
            vec!["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80", "10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]
        );
    }

    #[test]
    fn test_gray_request_uses_gray_instances() {
        let filter = LoadBalanceFilter::new(store());
        for _ in 0..10 {
            let (mut ctx, _rx) = context_for(Rule::new("r1", "svc"), "/ping", &[("uniqueId", "svc")]);
            ctx.set_gray(true);
            filter.do_filter(&mut ctx).unwrap();
            assert_eq!(ctx.request().modify_host(), "10.0.0.2:80");
        }
    }

    #[test]
    fn test_no_instance_not_found() {
        let filter = LoadBalanceFilter::new(Arc::new(DynamicConfigStore::new()));
        let (mut ctx, _rx) = context_for(Rule::new("r1", "svc"), "/ping", &[("uniqueId", "svc")]);
        let err = filter.do_filter(&mut ctx).unwrap_err();
        assert!(matches!(err, GatewayError::ServiceInstanceNotFound { .. }));
    }

    #[test]
    fn test_unknown_strategy_defaults_to_random() {
        let filter = LoadBalanceFilter::new(store());
        let rule = Rule::new("r1", "svc").with_filter(
            FilterConfig::new(LOAD_BALANCE_FILTER_ID).with_config(serde_json::json!({ "load_balance": "weighted" })),
        );
        let (mut ctx, _rx) = context_for(rule, "/ping", &[("uniqueId", "svc")]);
        filter.do_filter(&mut ctx).unwrap();
        assert!(ctx.request().modify_host().starts_with("10.0.0."));
    }
}
