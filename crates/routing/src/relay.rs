use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use zaproute_core::context::RequestContext;
use zaproute_core::metrics::MetricsStore;
use zaproute_core::store::CrmStore;
use zaproute_evolution::metadata::EventMetadata;

use crate::tenant::TenantResolution;

/// Transport for relayed events.
#[async_trait]
pub trait EventForwarder: Send + Sync {
    async fn forward(&self, url: &str, body: &Value) -> anyhow::Result<()>;
}

pub struct HttpForwarder {
    client: Client,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EventForwarder for HttpForwarder {
    async fn forward(&self, url: &str, body: &Value) -> anyhow::Result<()> {
        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("automation webhook returned {status}: {text}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayOutcome {
    pub forwarded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RelayOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            forwarded: false,
            reason: Some(reason.into()),
        }
    }
}

/// Relays every sanitized webhook event to the automation engine: the
/// tenant's own webhook when set, else the global one.
pub struct ForwardingRelay {
    store: Arc<dyn CrmStore>,
    forwarder: Arc<dyn EventForwarder>,
    metrics: Arc<MetricsStore>,
    global_url: Option<String>,
}

impl ForwardingRelay {
    pub fn new(
        store: Arc<dyn CrmStore>,
        forwarder: Arc<dyn EventForwarder>,
        metrics: Arc<MetricsStore>,
        global_url: Option<String>,
    ) -> Self {
        Self {
            store,
            forwarder,
            metrics,
            global_url: global_url.filter(|u| !u.trim().is_empty()),
        }
    }

    pub fn body(
        sanitized: &Value,
        metadata: &EventMetadata,
        resolution: &TenantResolution,
    ) -> Value {
        json!({
            "source": "evolution",
            "metadata": metadata,
            "data": sanitized,
            "timestamp": Utc::now().to_rfc3339(),
            "workspaceId": resolution.tenant_id,
            "connectionId": resolution.connection_id,
        })
    }

    async fn target_url(
        &self,
        ctx: &RequestContext,
        resolution: &TenantResolution,
    ) -> Option<String> {
        if let Some(tenant_id) = resolution.tenant_id.as_deref() {
            match self.store.get_tenant(tenant_id).await {
                Ok(Some(tenant)) => {
                    let url = tenant.automation_webhook_url;
                    if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
                        return Some(url);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(
                    request_id = %ctx.correlation_id,
                    tenant_id,
                    error = %e,
                    "Tenant lookup for relay URL failed; using global URL"
                ),
            }
        }
        self.global_url.clone()
    }

    /// Never fails: problems end up in the outcome and the log.
    pub async fn relay(
        &self,
        ctx: &RequestContext,
        sanitized: &Value,
        metadata: &EventMetadata,
        resolution: &TenantResolution,
    ) -> RelayOutcome {
        let Some(url) = self.target_url(ctx, resolution).await else {
            debug!(request_id = %ctx.correlation_id, "No automation webhook configured");
            return RelayOutcome::skipped("no webhook configured");
        };

        let body = Self::body(sanitized, metadata, resolution);
        match self.forwarder.forward(&url, &body).await {
            Ok(()) => {
                self.metrics.record_relay(true);
                info!(
                    request_id = %ctx.correlation_id,
                    event = ?metadata.event,
                    instance = ?metadata.instance,
                    "Event relayed to automation engine"
                );
                RelayOutcome {
                    forwarded: true,
                    reason: None,
                }
            }
            Err(e) => {
                self.metrics.record_relay(false);
                warn!(request_id = %ctx.correlation_id, error = %e, "Automation relay failed");
                RelayOutcome::skipped(e.to_string())
            }
        }
    }
}
