use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use zaproute_core::audit::log_audit;
use zaproute_core::context::RequestContext;
use zaproute_core::metrics::MetricsStore;
use zaproute_core::store::CrmStore;
use zaproute_evolution::metadata::{extract_metadata, EventKind, EventMetadata};
use zaproute_evolution::sanitize::sanitize_event;

use crate::inbound::{BatchSummary, InboundProcessor, InboundSource};
use crate::relay::{ForwardingRelay, RelayOutcome};
use crate::tenant::{resolve_tenant, TenantResolution};

/// Internal outcome of one webhook delivery. The HTTP layer always answers
/// 200 with this body; nothing here changes the status code.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub ok: bool,
    pub processed: bool,
    pub forwarded: bool,
    pub metadata: Option<EventMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<BatchSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessingResult {
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            ok: true,
            processed: false,
            forwarded: false,
            metadata: None,
            summary: None,
            error: Some(error.into()),
        }
    }
}

/// What local processing made of an event.
#[derive(Debug, Default)]
struct LocalOutcome {
    processed: bool,
    summary: Option<BatchSummary>,
    error: Option<String>,
}

/// Extract, sanitize, resolve, then process locally and relay concurrently.
pub struct WebhookPipeline {
    store: Arc<dyn CrmStore>,
    inbound: InboundProcessor,
    relay: ForwardingRelay,
    metrics: Arc<MetricsStore>,
}

impl WebhookPipeline {
    pub fn new(
        store: Arc<dyn CrmStore>,
        inbound: InboundProcessor,
        relay: ForwardingRelay,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self {
            store,
            inbound,
            relay,
            metrics,
        }
    }

    pub async fn handle(&self, ctx: &RequestContext, event: &Value) -> ProcessingResult {
        self.metrics.inc_webhooks_received();

        let metadata = extract_metadata(event);
        let sanitized = sanitize_event(event);
        let resolution = resolve_tenant(self.store.as_ref(), metadata.instance.as_deref()).await;

        let (local, relayed) = tokio::join!(
            self.process_locally(ctx, &metadata, &sanitized, &resolution),
            self.relay.relay(ctx, &sanitized, &metadata, &resolution),
        );

        log_audit(
            "webhook_received",
            &ctx.correlation_id,
            json!({
                "event": metadata.event,
                "instance": metadata.instance,
                "tenant_id": resolution.tenant_id,
                "processed": local.processed,
                "forwarded": relayed.forwarded,
            }),
        );

        let error = local.error.or_else(|| match &relayed {
            RelayOutcome {
                forwarded: false,
                reason: Some(reason),
            } if reason != "no webhook configured" => Some(format!("relay: {reason}")),
            _ => None,
        });

        ProcessingResult {
            ok: true,
            processed: local.processed,
            forwarded: relayed.forwarded,
            metadata: Some(metadata),
            summary: local.summary,
            error,
        }
    }

    async fn process_locally(
        &self,
        ctx: &RequestContext,
        metadata: &EventMetadata,
        sanitized: &Value,
        resolution: &TenantResolution,
    ) -> LocalOutcome {
        let Some(tenant_id) = resolution.tenant_id.as_deref() else {
            warn!(
                request_id = %ctx.correlation_id,
                instance = ?metadata.instance,
                event = ?metadata.event,
                "Skipping event for unknown instance"
            );
            return LocalOutcome {
                error: Some(format!(
                    "tenant not resolved for instance {}",
                    metadata.instance.as_deref().unwrap_or("<none>")
                )),
                ..Default::default()
            };
        };

        let kind = metadata.kind();
        match &kind {
            EventKind::MessagesUpsert => {
                let source = InboundSource {
                    tenant_id,
                    connection_id: resolution.connection_id.as_deref(),
                    instance: metadata.instance.as_deref(),
                };
                let summary = self.inbound.process_upsert(ctx, source, sanitized).await;
                info!(
                    request_id = %ctx.correlation_id,
                    tenant_id,
                    ingested = summary.ingested,
                    duplicates = summary.duplicates,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "messages.upsert processed"
                );
                LocalOutcome {
                    processed: summary.ingested + summary.duplicates > 0,
                    error: (summary.failed > 0)
                        .then(|| format!("{} message unit(s) failed", summary.failed)),
                    summary: Some(summary),
                }
            }
            EventKind::MessagesUpdate => {
                let applied = self.inbound.apply_status_updates(ctx, tenant_id, sanitized).await;
                LocalOutcome {
                    processed: applied > 0,
                    ..Default::default()
                }
            }
            EventKind::ConnectionUpdate | EventKind::QrcodeUpdated => {
                let changed = self
                    .inbound
                    .apply_connection_update(
                        ctx,
                        resolution.connection_id.as_deref(),
                        &kind,
                        sanitized,
                    )
                    .await;
                LocalOutcome {
                    processed: changed,
                    ..Default::default()
                }
            }
            EventKind::Other(name) => {
                info!(request_id = %ctx.correlation_id, event = %name, "Event relayed only");
                LocalOutcome::default()
            }
        }
    }
}
