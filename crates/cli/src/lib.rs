use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use zaproute_core::config::{AppConfig, DispatchMode};
use zaproute_core::metrics::MetricsStore;
use zaproute_core::store::CrmStore;
use zaproute_evolution::client::EvolutionClient;
use zaproute_persistence::SqliteCrmStore;
use zaproute_routing::{
    AutomationDispatcher, DeliveryRouter, ForwardingRelay, GatewayDispatcher, HttpForwarder,
    InboundProcessor, InstanceResolver, OutboundDispatcher, WebhookPipeline,
};
use zaproute_server::{AppState, Gateway};

pub async fn open_store(config: &AppConfig) -> anyhow::Result<SqliteCrmStore> {
    SqliteCrmStore::new(&config.database.url, config.database.max_connections).await
}

/// Outbound transport for the configured dispatch mode.
pub fn build_dispatcher(config: &AppConfig) -> anyhow::Result<Arc<dyn OutboundDispatcher>> {
    let dispatcher: Arc<dyn OutboundDispatcher> = match config.automation.dispatch_mode {
        DispatchMode::Gateway => {
            let client = EvolutionClient::new(
                Duration::from_secs(config.evolution.timeout_secs),
                config.evolution.max_retries,
                config.evolution.retry_jitter_ms,
            )?;
            Arc::new(GatewayDispatcher::new(
                client,
                config.evolution.api_url.clone(),
                config.evolution.api_key.clone(),
            ))
        }
        DispatchMode::Automation => Arc::new(AutomationDispatcher::new(
            config.automation.outbound_webhook_url.clone(),
            Duration::from_secs(config.automation.timeout_secs),
        )?),
    };
    info!("Outbound dispatch via {}", dispatcher.name());
    Ok(dispatcher)
}

/// Wire the store into the webhook pipeline, delivery router and HTTP gateway.
pub fn build_gateway(config: &AppConfig, store: SqliteCrmStore) -> anyhow::Result<Gateway> {
    let metrics = MetricsStore::new();
    let store: Arc<dyn CrmStore> = Arc::new(store);

    let forwarder = HttpForwarder::new(Duration::from_secs(config.automation.timeout_secs))?;
    let relay = ForwardingRelay::new(
        store.clone(),
        Arc::new(forwarder),
        metrics.clone(),
        config.automation.global_webhook_url.clone(),
    );
    let pipeline = WebhookPipeline::new(
        store.clone(),
        InboundProcessor::new(store.clone(), metrics.clone()),
        relay,
        metrics.clone(),
    );

    let resolver = InstanceResolver::default();
    info!(tiers = ?resolver.tier_names(), "Instance resolution order");
    let delivery = DeliveryRouter::new(
        store.clone(),
        resolver,
        build_dispatcher(config)?,
        metrics.clone(),
    );

    let state = AppState::new(
        config.server.clone(),
        store,
        Arc::new(pipeline),
        Arc::new(delivery),
        metrics,
    );
    Ok(Gateway::new(state))
}
