use rust_apigateway::admin::AdminService;
use rust_apigateway::admin_listener::AdminListener;
use rust_apigateway::center::{ConfigCenter, FileConfigCenter, InMemoryRegisterCenter, RegisterCenter};
use rust_apigateway::config::GatewayConfig;
use rust_apigateway::gateway::Gateway;
use rust_apigateway::listener::Listener;
use rust_apigateway::metrics::Metrics;
use rust_apigateway::rule::{Rule, ServiceDefinition, ServiceInstance};
use rust_apigateway::store::DynamicConfigStore;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Rust API Gateway");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::from_env_validated()?;
    info!(
        listen = %config.listen_addr,
        admin = %config.admin_addr,
        buffer_type = %config.buffer_type,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        "config loaded"
    );

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
    let store = Arc::new(DynamicConfigStore::new());
    let metrics = Arc::new(Metrics::new());

    let register_center = Arc::new(InMemoryRegisterCenter::new());
    register_center.subscribe_all_services({
        let store = Arc::clone(&store);
        Arc::new(move |definition: ServiceDefinition, instances: Vec<ServiceInstance>| {
            store.put_service_instances(definition, instances);
        })
    });

    let watcher = match &config.rules_file {
        Some(path) => {
            let center = Arc::new(
                FileConfigCenter::open(path)?.with_register_center(Arc::clone(&register_center)),
            );
            center.subscribe_rules_change({
                let store = Arc::clone(&store);
                Arc::new(move |rules: Vec<Rule>| store.put_all_rules(rules))
            });
            Some(center.watch(config.rules_poll_interval, shutdown_tx.subscribe()))
        }
        None => {
            warn!("no rules file configured, every request will be unmatched");
            None
        }
    };

    let gateway = Gateway::new(config, Arc::clone(&store), Arc::clone(&metrics), Handle::current())?;
    gateway.start()?;

    let proxy_listener = Listener::bind(gateway.config(), gateway.processor()).await?;
    let proxy_addr = proxy_listener.local_addr();
    info!("gateway listening on {}", proxy_addr);

    let self_definition = ServiceDefinition::new(gateway.config().application_name.clone());
    let self_instance = ServiceInstance::new(
        gateway.config().application_name.clone(),
        proxy_addr.ip().to_string(),
        proxy_addr.port(),
    );
    register_center.register(self_definition.clone(), self_instance.clone());

    let admin_listener = AdminListener::bind(
        &gateway.config().admin_addr,
        AdminService::new(Arc::clone(&metrics), Arc::clone(&store)),
    )
    .await?;
    let admin_addr = admin_listener.local_addr();
    info!("admin endpoints on {} (/health, /metrics, /rules)", admin_addr);

    let mut proxy_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = proxy_listener.serve(shutdown_rx).await {
                error!("gateway listener error: {}", e);
            }
        }
    });

    let mut admin_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin_listener.serve(shutdown_rx).await {
                error!("admin listener error: {}", e);
            }
        }
    });

    let mut proxy_finished = false;
    let mut admin_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut proxy_task => {
            proxy_finished = true;
            if let Err(err) = res {
                error!("gateway task join error: {}", err);
            }
        }
        res = &mut admin_task => {
            admin_finished = true;
            if let Err(err) = res {
                error!("admin task join error: {}", err);
            }
        }
    }

    register_center.deregister(&self_definition, &self_instance);
    let _ = shutdown_tx.send(());

    if !proxy_finished {
        if let Err(err) = proxy_task.await {
            error!("gateway task join error: {}", err);
        }
    }
    if !admin_finished {
        if let Err(err) = admin_task.await {
            error!("admin task join error: {}", err);
        }
    }
    if let Some(watcher) = watcher {
        if let Err(err) = watcher.await {
            error!("rules watcher join error: {}", err);
        }
    }

    // dispatch workers block, keep them off the runtime threads
    tokio::task::spawn_blocking(move || gateway.shut_down()).await?;

    info!("shutdown complete");
    Ok(())
}
