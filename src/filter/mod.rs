//! Filter chain engine.
//!
//! Filters are registered by id at startup. For every request the factory
//! assembles the filters a rule asks for, plus the ones every request runs,
//! and sorts them by order.

pub mod auth;
pub mod flow_ctl;
pub mod gray;
pub mod load_balance;
pub mod monitor;
pub mod router;

use crate::context::GatewayContext;
use crate::error::Result;
use crate::rule::Rule;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

pub use auth::UserAuthFilter;
pub use flow_ctl::FlowCtlFilter;
pub use gray::GrayFilter;
pub use load_balance::LoadBalanceFilter;
pub use monitor::{MonitorEndFilter, MonitorFilter};
pub use router::{CompletionExecutor, RouterFilter};

pub const GRAY_FILTER_ID: &str = "gray_filter";
pub const USER_AUTH_FILTER_ID: &str = "user_auth_filter";
pub const FLOW_CTL_FILTER_ID: &str = "flow_ctl_filter";
pub const LOAD_BALANCE_FILTER_ID: &str = "load_balance_filter";
pub const MONITOR_FILTER_ID: &str = "monitor_filter";
pub const MONITOR_END_FILTER_ID: &str = "monitor_end_filter";
pub const ROUTER_FILTER_ID: &str = "router_filter";

pub const MONITOR_FILTER_ORDER: i32 = i32::MIN;
pub const GRAY_FILTER_ORDER: i32 = 0;
pub const USER_AUTH_FILTER_ORDER: i32 = 1;
pub const FLOW_CTL_FILTER_ORDER: i32 = 50;
pub const LOAD_BALANCE_FILTER_ORDER: i32 = 100;
pub const ROUTER_FILTER_ORDER: i32 = i32::MAX - 1;
pub const MONITOR_END_FILTER_ORDER: i32 = i32::MAX;

/// Filters every chain runs, whatever the rule says.
const ALWAYS: [&str; 4] = [
    GRAY_FILTER_ID,
    MONITOR_FILTER_ID,
    MONITOR_END_FILTER_ID,
    LOAD_BALANCE_FILTER_ID,
];

/// One policy step of the request pipeline.
///
/// A filter aborts the chain by returning an error; there is no other way to
/// stop it.
pub trait Filter: Send + Sync {
    /// Stable id rules refer to.
    fn id(&self) -> &'static str;

    /// Human readable name.
    fn name(&self) -> &'static str;

    /// Position in the chain, ascending.
    fn order(&self) -> i32;

    /// Applies the policy to the context.
    fn do_filter(&self, ctx: &mut GatewayContext) -> Result<()>;
}

/// Filters by id.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: HashMap<&'static str, Arc<dyn Filter>>,
}

impl FilterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter under its id, returning the one it replaced.
    pub fn register(&mut self, filter: Arc<dyn Filter>) -> Option<Arc<dyn Filter>> {
        debug!(id = filter.id(), order = filter.order(), "filter registered");
        self.filters.insert(filter.id(), filter)
    }

    /// Filter by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Filter>> {
        self.filters.get(id).cloned()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.filters.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("filters", &self.ids())
            .finish()
    }
}

/// Ordered, immutable list of filters for one request.
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    /// Filter ids in execution order.
    pub fn ids(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs every filter in order. The first error aborts the rest.
    pub fn execute(&self, ctx: &mut GatewayContext) -> Result<()> {
        for filter in &self.filters {
            if let Err(err) = filter.do_filter(ctx) {
                if err.is_policy() {
                    debug!(filter = filter.id(), unique_id = %ctx.unique_id(), error = %err, "filter rejected request");
                } else {
                    error!(filter = filter.id(), unique_id = %ctx.unique_id(), error = %err, "filter failed");
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

/// Builds the chain for a rule.
#[derive(Debug, Clone)]
pub struct FilterChainFactory {
    registry: FilterRegistry,
}

impl FilterChainFactory {
    pub fn new(registry: FilterRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    /// Always-present filters, then the rule's filters by id, then the
    /// router, stably sorted by order. Unknown ids are skipped.
    pub fn build(&self, rule: &Rule) -> FilterChain {
        let mut filters: Vec<Arc<dyn Filter>> = ALWAYS
            .iter()
            .filter_map(|id| self.registry.get(id))
            .collect();

        for config in &rule.filter_configs {
            let id = config.id.as_str();
            if ALWAYS.contains(&id) || id == ROUTER_FILTER_ID {
                continue;
            }
            match self.registry.get(id) {
                Some(filter) => filters.push(filter),
                None => debug!(rule = %rule.id, filter = id, "unknown filter id skipped"),
            }
        }

        if let Some(router) = self.registry.get(ROUTER_FILTER_ID) {
            filters.push(router);
        }

        filters.sort_by_key(|f| f.order());
        FilterChain { filters }
    }
}
