use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use zaproute_core::context::RequestContext;
use zaproute_core::error::RouteError;
use zaproute_core::metrics::MetricsStore;
use zaproute_core::redact::mask_phone;
use zaproute_core::store::CrmStore;
use zaproute_core::types::{InsertOutcome, Message, SenderType};
use zaproute_evolution::decode::{
    classify_content, connection_update, message_units, status_updates, ClassifiedContent,
    InboundUnit,
};
use zaproute_evolution::metadata::EventKind;

/// Why a message unit was left out of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    FromMe,
    NoRemoteJid,
    NoExternalId,
    UnsupportedContent,
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Ingested { message_id: String },
    Duplicate { media_filled: bool },
    Skipped(SkipReason),
}

/// Per-event tally of what happened to each message unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub ingested: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn units(&self) -> usize {
        self.ingested + self.duplicates + self.skipped + self.failed
    }
}

/// Where an inbound unit came from.
#[derive(Debug, Clone, Copy)]
pub struct InboundSource<'a> {
    pub tenant_id: &'a str,
    pub connection_id: Option<&'a str>,
    pub instance: Option<&'a str>,
}

pub struct InboundProcessor {
    store: Arc<dyn CrmStore>,
    metrics: Arc<MetricsStore>,
}

impl InboundProcessor {
    pub fn new(store: Arc<dyn CrmStore>, metrics: Arc<MetricsStore>) -> Self {
        Self { store, metrics }
    }

    /// Ingest every unit of a `messages.upsert` event. Units are handled in
    /// order and a failing unit never stops its siblings.
    pub async fn process_upsert(
        &self,
        ctx: &RequestContext,
        source: InboundSource<'_>,
        event: &Value,
    ) -> BatchSummary {
        let mut summary = BatchSummary::default();

        for raw in message_units(event) {
            match self.process_unit(ctx, source, raw).await {
                Ok(UnitOutcome::Ingested { .. }) => summary.ingested += 1,
                Ok(UnitOutcome::Duplicate { .. }) => summary.duplicates += 1,
                Ok(UnitOutcome::Skipped(reason)) => {
                    debug!(request_id = %ctx.correlation_id, ?reason, "Message unit skipped");
                    summary.skipped += 1;
                }
                Err(e) => {
                    warn!(
                        request_id = %ctx.correlation_id,
                        tenant_id = source.tenant_id,
                        error = %format!("{e:#}"),
                        "Failed to ingest message unit"
                    );
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Persist one contact-originated message: contact, conversation, then
    /// the message itself unless its external id was already stored.
    #[instrument(
        skip(self, ctx, raw),
        fields(request_id = %ctx.correlation_id, tenant_id = source.tenant_id)
    )]
    pub async fn process_unit(
        &self,
        ctx: &RequestContext,
        source: InboundSource<'_>,
        raw: &Value,
    ) -> anyhow::Result<UnitOutcome> {
        let unit = match InboundUnit::from_value(raw) {
            Ok(unit) => unit,
            Err(e) => return Ok(UnitOutcome::Skipped(SkipReason::Malformed(e.to_string()))),
        };

        let Some(remote_jid) = unit.remote_jid() else {
            return Ok(UnitOutcome::Skipped(SkipReason::NoRemoteJid));
        };
        if unit.from_me() {
            return Ok(UnitOutcome::Skipped(SkipReason::FromMe));
        }
        // The contact is whoever the chat is with, never the instance's own number.
        let Some(phone) = unit.sender_phone() else {
            return Ok(UnitOutcome::Skipped(SkipReason::NoRemoteJid));
        };
        let Some(external_id) = unit.external_id() else {
            return Ok(UnitOutcome::Skipped(SkipReason::NoExternalId));
        };
        let Some(content) = classify_content(&unit.message, Some(external_id)) else {
            return Ok(UnitOutcome::Skipped(SkipReason::UnsupportedContent));
        };
        let file_url = content
            .file_url
            .clone()
            .or_else(|| unit.media_url.clone().filter(|u| !u.trim().is_empty()));

        let push_name = unit.push_name.as_deref().map(str::trim).filter(|n| !n.is_empty());
        let contact = self
            .store
            .upsert_contact(source.tenant_id, &phone, push_name)
            .await?;
        let conversation = self
            .store
            .upsert_conversation(source.tenant_id, &contact.id, source.connection_id)
            .await?;

        if self.store.message_exists(source.tenant_id, external_id).await? {
            return self
                .handle_duplicate(source.tenant_id, external_id, &content, file_url.as_deref())
                .await;
        }

        let received_at = unit.timestamp().unwrap_or_else(Utc::now);
        let mut message = Message::new(
            source.tenant_id,
            &conversation.id,
            SenderType::Contact,
            content.message_type,
            &content.content,
        )
        .with_sender(&contact.id)
        .with_external_id(external_id)
        .with_file(file_url, content.file_name.clone(), content.mime_type.clone())
        .with_metadata("source", json!("evolution_webhook"))
        .with_metadata("remote_jid", json!(remote_jid))
        .with_metadata("participant", json!(unit.key.participant.as_deref()))
        .with_metadata("original_timestamp", unit.message_timestamp.clone())
        .with_metadata("push_name", json!(push_name))
        .with_metadata("evolution_instance", json!(source.instance))
        .with_metadata("correlation_id", json!(ctx.correlation_id));
        message.created_at = received_at;

        match self.store.insert_message_if_absent(&message).await? {
            InsertOutcome::Inserted => {
                self.store
                    .touch_conversation(&conversation.id, received_at, true)
                    .await?;
                self.metrics.inc_messages_ingested();
                info!(
                    message_id = %message.id,
                    external_id,
                    conversation_id = %conversation.id,
                    contact = %mask_phone(&phone),
                    kind = content.message_type.as_str(),
                    "Inbound message stored"
                );
                Ok(UnitOutcome::Ingested {
                    message_id: message.id,
                })
            }
            // Lost the race against a concurrent delivery of the same message.
            InsertOutcome::Duplicate => {
                let file_url = message.file_url.as_deref();
                self.handle_duplicate(source.tenant_id, external_id, &content, file_url)
                    .await
            }
        }
    }

    async fn handle_duplicate(
        &self,
        tenant_id: &str,
        external_id: &str,
        content: &ClassifiedContent,
        file_url: Option<&str>,
    ) -> anyhow::Result<UnitOutcome> {
        self.metrics.inc_duplicates_skipped();
        let media_filled = if content.message_type.is_media() && file_url.is_some() {
            self.store
                .fill_message_media(
                    tenant_id,
                    external_id,
                    &content.content,
                    file_url,
                    content.file_name.as_deref(),
                    content.mime_type.as_deref(),
                )
                .await?
        } else {
            false
        };
        debug!(external_id, media_filled, "Duplicate delivery ignored");
        Ok(UnitOutcome::Duplicate { media_filled })
    }

    /// Apply `messages.update` status reports. Returns how many messages moved.
    pub async fn apply_status_updates(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        event: &Value,
    ) -> usize {
        let mut applied = 0;
        for update in status_updates(event) {
            match self
                .store
                .advance_message_status(tenant_id, &update.external_id, update.status)
                .await
            {
                Ok(true) => {
                    applied += 1;
                    debug!(
                        request_id = %ctx.correlation_id,
                        external_id = %update.external_id,
                        status = update.status.as_str(),
                        "Message status advanced"
                    );
                }
                Ok(false) => {}
                Err(e) => warn!(
                    request_id = %ctx.correlation_id,
                    external_id = %update.external_id,
                    error = %e,
                    "Failed to apply status update"
                ),
            }
        }
        applied
    }

    /// Apply a `connection.update` / `qrcode.updated` event to the resolved
    /// connection. Returns whether the connection row changed.
    pub async fn apply_connection_update(
        &self,
        ctx: &RequestContext,
        connection_id: Option<&str>,
        kind: &EventKind,
        event: &Value,
    ) -> bool {
        let Some(connection_id) = connection_id else {
            debug!(
                request_id = %ctx.correlation_id,
                "Connection event for an instance without connection row"
            );
            return false;
        };
        let Some(update) = connection_update(kind, event) else {
            return false;
        };

        match self
            .store
            .update_connection_status(connection_id, update.status, update.phone_number.as_deref())
            .await
        {
            Ok(()) => {
                info!(
                    request_id = %ctx.correlation_id,
                    connection_id,
                    status = update.status.as_str(),
                    "Connection status updated"
                );
                true
            }
            Err(e) => {
                warn!(
                    request_id = %ctx.correlation_id,
                    connection_id,
                    error = %e,
                    "Failed to update connection status"
                );
                false
            }
        }
    }
}

/// Mark a conversation's contact messages read, enforcing the caller's tenant.
pub async fn mark_conversation_read(
    store: &dyn CrmStore,
    ctx: &RequestContext,
    conversation_id: &str,
) -> Result<u64, RouteError> {
    let conversation_id = conversation_id.trim();
    if conversation_id.is_empty() {
        return Err(RouteError::Validation("conversation_id is required".into()));
    }

    let conversation = store
        .get_conversation(conversation_id)
        .await
        .map_err(RouteError::database)?
        .ok_or_else(|| RouteError::NotFound(format!("conversation {conversation_id}")))?;

    if let Some(tenant_id) = ctx.tenant_id.as_deref() {
        if tenant_id != conversation.tenant_id {
            return Err(RouteError::WorkspaceMismatch(format!(
                "conversation {conversation_id} does not belong to workspace {tenant_id}"
            )));
        }
    }

    let marked = store
        .mark_conversation_read(conversation_id)
        .await
        .map_err(RouteError::database)?;
    info!(request_id = %ctx.correlation_id, conversation_id, marked, "Conversation marked as read");
    Ok(marked)
}
