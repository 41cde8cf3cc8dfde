//! Composition root.
//!
//! Builds every shared component once, wires them together and hands out the
//! processor the listener feeds.

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::client::HttpClient;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::filter::{
    CompletionExecutor, FilterChainFactory, FilterRegistry, FlowCtlFilter, GrayFilter, LoadBalanceFilter,
    MonitorEndFilter, MonitorFilter, RouterFilter, UserAuthFilter,
};
use crate::metrics::Metrics;
use crate::processor::{CoreProcessor, ParallelProcessor, Processor};
use crate::store::DynamicConfigStore;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

/// The assembled gateway.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    store: Arc<DynamicConfigStore>,
    metrics: Arc<Metrics>,
    processor: Arc<dyn Processor>,
}

impl Gateway {
    /// Validates `config` and builds the filter registry, router and
    /// processor. `handle` runs the outbound calls.
    pub fn new(
        config: GatewayConfig,
        store: Arc<DynamicConfigStore>,
        metrics: Arc<Metrics>,
        handle: Handle,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;

        let router = Arc::new(RouterFilter::new(
            HttpClient::new(&config),
            Arc::new(CircuitBreakerRegistry::new()),
            Arc::clone(&metrics),
            CompletionExecutor::from_config(config.when_complete, handle.clone()),
            handle,
        ));
        let registry = filter_registry(&config, &store, &metrics, Arc::clone(&router));
        info!(filters = ?registry.ids(), "filters registered");

        let core = Arc::new(CoreProcessor::new(
            Arc::clone(&store),
            FilterChainFactory::new(registry),
            router,
        ));
        let processor: Arc<dyn Processor> = if config.is_parallel() {
            Arc::new(ParallelProcessor::new(core, &config, Arc::clone(&metrics))?)
        } else {
            core
        };

        Ok(Self {
            config: Arc::new(config),
            store,
            metrics,
            processor,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DynamicConfigStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// The processor the listener hands requests to.
    pub fn processor(&self) -> Arc<dyn Processor> {
        Arc::clone(&self.processor)
    }

    /// Starts the processor.
    pub fn start(&self) -> Result<()> {
        self.processor.start()?;
        info!(
            application = %self.config.application_name,
            env = %self.config.env,
            parallel = self.config.is_parallel(),
            "gateway started"
        );
        Ok(())
    }

    /// Stops the processor after it drained accepted requests.
    pub fn shut_down(&self) {
        self.processor.shut_down();
        info!("gateway stopped");
    }
}

/// Every built-in filter, registered by id.
pub fn filter_registry(
    config: &GatewayConfig,
    store: &Arc<DynamicConfigStore>,
    metrics: &Arc<Metrics>,
    router: Arc<RouterFilter>,
) -> FilterRegistry {
    let mut registry = FilterRegistry::new();
    registry.register(Arc::new(MonitorFilter));
    registry.register(Arc::new(GrayFilter));
    registry.register(Arc::new(UserAuthFilter));
    registry.register(Arc::new(FlowCtlFilter::new(config.redis_url.clone())));
    registry.register(Arc::new(LoadBalanceFilter::new(Arc::clone(store))));
    registry.register(router);
    registry.register(Arc::new(MonitorEndFilter::new(Arc::clone(metrics))));
    registry
}
