use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use zaproute_core::audit::log_audit;
use zaproute_core::context::RequestContext;
use zaproute_core::error::RouteError;
use zaproute_core::metrics::MetricsStore;
use zaproute_core::store::CrmStore;
use zaproute_core::types::{
    Conversation, InsertOutcome, Message, MessageStatus, MessageType, SenderType,
};
use zaproute_evolution::encode::{encode_outbound, OutboundContent, SenderDisplay};

use crate::dispatch::{DispatchRequest, OutboundDispatcher};
use crate::instance::{InstanceQuery, InstanceResolver};

/// Reply as the CRM submits it.
#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_type: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub evolution_instance: Option<String>,
}

fn default_message_type() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct SentMessage {
    pub id: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// A request that passed validation.
struct ValidSend {
    kind: MessageType,
    sender_type: SenderType,
}

fn validate(request: &SendRequest) -> Result<ValidSend, RouteError> {
    if request.conversation_id.trim().is_empty() {
        return Err(RouteError::Validation("conversation_id is required".into()));
    }

    let kind = MessageType::parse(&request.message_type).ok_or_else(|| {
        RouteError::Validation(format!("unknown message_type '{}'", request.message_type))
    })?;
    if matches!(kind, MessageType::Location | MessageType::Contact) {
        return Err(RouteError::Validation(format!(
            "message_type '{}' cannot be sent",
            kind.as_str()
        )));
    }

    let sender_type = match request.sender_type.as_deref() {
        None => SenderType::Agent,
        Some(raw) => SenderType::parse(raw)
            .ok_or_else(|| RouteError::Validation(format!("unknown sender_type '{raw}'")))?,
    };
    if sender_type == SenderType::Contact {
        return Err(RouteError::Validation(
            "replies cannot be sent as the contact".into(),
        ));
    }

    if kind == MessageType::Text && request.content.trim().is_empty() {
        return Err(RouteError::Validation("content is required for text messages".into()));
    }
    if kind.is_media()
        && request
            .file_url
            .as_deref()
            .map_or(true, |u| u.trim().is_empty())
    {
        return Err(RouteError::Validation(format!(
            "file_url is required for {} messages",
            kind.as_str()
        )));
    }

    Ok(ValidSend { kind, sender_type })
}

/// WhatsApp JID for a stored contact phone.
pub fn remote_jid_for(phone: &str) -> String {
    if phone.contains('@') {
        phone.to_string()
    } else if phone.contains('-') || phone.len() > 15 {
        format!("{phone}@g.us")
    } else {
        format!("{phone}@s.whatsapp.net")
    }
}

/// Owns the lifecycle of an outbound reply: `sending`, then `sent` or `failed`.
pub struct DeliveryRouter {
    store: Arc<dyn CrmStore>,
    resolver: InstanceResolver,
    dispatcher: Arc<dyn OutboundDispatcher>,
    metrics: Arc<MetricsStore>,
}

impl DeliveryRouter {
    pub fn new(
        store: Arc<dyn CrmStore>,
        resolver: InstanceResolver,
        dispatcher: Arc<dyn OutboundDispatcher>,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self {
            store,
            resolver,
            dispatcher,
            metrics,
        }
    }

    #[instrument(
        skip(self, ctx, request),
        fields(
            request_id = %ctx.correlation_id,
            conversation_id = %request.conversation_id
        )
    )]
    pub async fn send(
        &self,
        ctx: &RequestContext,
        request: SendRequest,
    ) -> Result<SentMessage, RouteError> {
        let valid = validate(&request)?;
        let conversation_id = request.conversation_id.trim();

        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await
            .map_err(RouteError::database)?
            .ok_or_else(|| RouteError::NotFound(format!("conversation {conversation_id}")))?;

        self.check_tenant(ctx, &conversation).await?;

        let sender_id = request.sender_id.clone().or_else(|| ctx.user_id.clone());
        let mut message = Message::new(
            &conversation.tenant_id,
            &conversation.id,
            valid.sender_type,
            valid.kind,
            request.content.trim(),
        )
        .with_file(
            request.file_url.clone(),
            request.file_name.clone(),
            request.mime_type.clone(),
        )
        .with_metadata("source", json!("crm"))
        .with_metadata("correlation_id", json!(ctx.correlation_id))
        .with_metadata("sender_id", json!(sender_id));
        message.sender_id = sender_id.clone();

        match self
            .store
            .insert_message_if_absent(&message)
            .await
            .map_err(RouteError::database)?
        {
            InsertOutcome::Inserted => {}
            InsertOutcome::Duplicate => {
                return Err(RouteError::Unexpected(format!(
                    "message {} was not stored",
                    message.id
                )))
            }
        }

        if let Err(e) = self
            .store
            .touch_conversation(&conversation.id, message.created_at, false)
            .await
        {
            warn!(conversation_id = %conversation.id, error = %e, "Failed to touch conversation");
        }

        match self
            .deliver(ctx, &request, &conversation, &message, sender_id.as_deref())
            .await
        {
            Ok(sent) => {
                self.metrics.record_send(true);
                Ok(sent)
            }
            Err(err) => {
                self.metrics.record_send(false);
                self.mark_failed(ctx, &message.id, &err).await;
                Err(err)
            }
        }
    }

    /// The caller's workspace and the conversation's connection must both
    /// belong to the conversation's tenant.
    async fn check_tenant(
        &self,
        ctx: &RequestContext,
        conversation: &Conversation,
    ) -> Result<(), RouteError> {
        if let Some(tenant_id) = ctx.tenant_id.as_deref() {
            if tenant_id != conversation.tenant_id {
                warn!(
                    conversation_id = %conversation.id,
                    caller = tenant_id,
                    owner = %conversation.tenant_id,
                    "Send rejected: workspace mismatch"
                );
                return Err(RouteError::WorkspaceMismatch(format!(
                    "conversation {} does not belong to workspace {tenant_id}",
                    conversation.id
                )));
            }
        }

        if let Some(connection_id) = conversation.connection_id.as_deref() {
            let connection = self
                .store
                .get_connection(connection_id)
                .await
                .map_err(RouteError::database)?;
            if let Some(connection) = connection {
                if connection.tenant_id != conversation.tenant_id {
                    return Err(RouteError::WorkspaceMismatch(format!(
                        "connection {connection_id} belongs to another workspace"
                    )));
                }
            }
        }

        Ok(())
    }

    async fn deliver(
        &self,
        ctx: &RequestContext,
        request: &SendRequest,
        conversation: &Conversation,
        message: &Message,
        sender_id: Option<&str>,
    ) -> Result<SentMessage, RouteError> {
        let resolved = self
            .resolver
            .resolve(
                self.store.as_ref(),
                &InstanceQuery {
                    conversation,
                    sender_id,
                    requested: request.evolution_instance.as_deref(),
                },
            )
            .await?;

        let connection = self
            .store
            .find_connection_by_instance(&resolved.instance)
            .await
            .map_err(RouteError::database)?;
        if let Some(connection) = &connection {
            if connection.tenant_id != conversation.tenant_id {
                return Err(RouteError::WorkspaceMismatch(format!(
                    "instance {} belongs to another workspace",
                    resolved.instance
                )));
            }
        }

        let contact = self
            .store
            .get_contact(&conversation.contact_id)
            .await
            .map_err(RouteError::database)?
            .ok_or_else(|| RouteError::NotFound(format!("contact {}", conversation.contact_id)))?;
        let remote_jid = remote_jid_for(&contact.phone);

        let content = OutboundContent {
            message_type: message.message_type,
            content: message.content.clone(),
            file_url: message.file_url.clone(),
            file_name: message.file_name.clone(),
            mime_type: message.mime_type.clone(),
        };
        let sender = SenderDisplay {
            name: request.sender_name.clone(),
        };
        let envelope = encode_outbound(&content, &remote_jid, &sender)
            .map_err(|e| RouteError::Validation(e.to_string()))?;

        let receipt = self
            .dispatcher
            .dispatch(DispatchRequest {
                correlation_id: ctx.correlation_id.clone(),
                tenant_id: conversation.tenant_id.clone(),
                conversation_id: conversation.id.clone(),
                message_id: message.id.clone(),
                instance: resolved.instance.clone(),
                remote_jid,
                envelope,
                connection,
            })
            .await?;

        // The gateway has the message now; a failed write must not turn it into `failed`.
        if let Err(e) = self
            .store
            .update_message_status(
                &message.id,
                MessageStatus::Sent,
                receipt.external_id.as_deref(),
                Some(json!({
                    "evolution_instance": resolved.instance,
                    "instance_tier": resolved.tier,
                    "dispatcher": self.dispatcher.name(),
                })),
            )
            .await
        {
            error!(
                message_id = %message.id,
                external_id = ?receipt.external_id,
                error = %e,
                "Reply delivered but sent status not recorded"
            );
        }

        info!(
            message_id = %message.id,
            instance = %resolved.instance,
            external_id = ?receipt.external_id,
            "Reply sent"
        );
        log_audit(
            "message_sent",
            &ctx.correlation_id,
            json!({
                "message_id": message.id,
                "tenant_id": conversation.tenant_id,
                "instance": resolved.instance,
                "dispatcher": self.dispatcher.name(),
            }),
        );

        Ok(SentMessage {
            id: message.id.clone(),
            status: MessageStatus::Sent,
            created_at: message.created_at,
        })
    }

    /// Compensating transition: a reply that did not go out ends as `failed`.
    async fn mark_failed(&self, ctx: &RequestContext, message_id: &str, err: &RouteError) {
        let patch = json!({
            "error": {
                "message": err.to_string(),
                "code": err.code(),
                "failed_at": Utc::now().to_rfc3339(),
            }
        });
        if let Err(e) = self
            .store
            .update_message_status(message_id, MessageStatus::Failed, None, Some(patch))
            .await
        {
            error!(
                message_id,
                error = %e,
                "Failed to record send failure; message left in sending"
            );
        }
        warn!(message_id, code = err.code(), error = %err, "Reply failed");
        log_audit(
            "message_failed",
            &ctx.correlation_id,
            json!({ "message_id": message_id, "code": err.code(), "error": err.to_string() }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        conversation_for, seeded_store, RecordingDispatcher, SentWriteFailingStore,
    };
    use zaproute_persistence::SqliteCrmStore;

    fn router(store: &SqliteCrmStore, dispatcher: Arc<RecordingDispatcher>) -> DeliveryRouter {
        DeliveryRouter::new(
            Arc::new(store.clone()),
            InstanceResolver::default(),
            dispatcher,
            MetricsStore::new(),
        )
    }

    fn text(conversation_id: &str, content: &str) -> SendRequest {
        SendRequest {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            message_type: "text".into(),
            sender_id: Some("agent-1".into()),
            sender_type: Some("agent".into()),
            sender_name: Some("Ana".into()),
            file_url: None,
            file_name: None,
            mime_type: None,
            evolution_instance: None,
        }
    }

    #[tokio::test]
    async fn successful_send_ends_sent_with_external_id() {
        let (store, _) = seeded_store().await;
        let conversation = conversation_for(&store, "t1", "5511999999999").await;
        let inbound = Message::new(
            "t1",
            &conversation.id,
            SenderType::Contact,
            MessageType::Text,
            "oi",
        )
        .with_external_id("IN1")
        .with_metadata("evolution_instance", json!("shop-01"));
        store.insert_message_if_absent(&inbound).await.expect("insert");

        let dispatcher = Arc::new(RecordingDispatcher::succeeding("3EB0ABC"));
        let ctx = RequestContext::new().with_tenant(Some("t1"));
        let sent = router(&store, dispatcher.clone())
            .send(&ctx, text(&conversation.id, "Olá!"))
            .await
            .expect("send");
        assert_eq!(sent.status, MessageStatus::Sent);

        let stored = store.get_message(&sent.id).await.expect("get").expect("message");
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.external_id.as_deref(), Some("3EB0ABC"));
        assert_eq!(stored.sender_type, SenderType::Agent);
        assert_eq!(stored.metadata["evolution_instance"], "shop-01");
        assert_eq!(stored.metadata["correlation_id"], json!(ctx.correlation_id));

        let calls = dispatcher.calls.lock().expect("lock");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].instance, "shop-01");
        assert_eq!(calls[0].remote_jid, "5511999999999@s.whatsapp.net");
        assert_eq!(calls[0].envelope["message"]["conversation"], "Olá!");
        assert_eq!(calls[0].envelope["pushName"], "Ana");
        assert!(calls[0].connection.is_some());

        let touched = store.get_conversation(&conversation.id).await.expect("get").expect("conv");
        assert!(touched.last_activity_at.is_some());
        assert_eq!(touched.unread_count, 0);
    }

    #[tokio::test]
    async fn unresolved_instance_leaves_failed_row() {
        let (store, _) = seeded_store().await;
        let conversation = conversation_for(&store, "t1", "5511999999999").await;
        let dispatcher = Arc::new(RecordingDispatcher::succeeding("X"));

        let err = router(&store, dispatcher.clone())
            .send(&RequestContext::new(), text(&conversation.id, "hi"))
            .await
            .expect_err("unresolved");
        assert!(matches!(err, RouteError::InstanceNotResolved { .. }));
        assert_eq!(err.code(), "MISSING_CONNECTION");
        assert_eq!(dispatcher.call_count(), 0);

        let messages = store.list_messages(&conversation.id).await.expect("list");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Failed);
        assert_eq!(messages[0].metadata["error"]["code"], "MISSING_CONNECTION");
        assert!(messages[0].metadata["error"]["failed_at"].is_string());
    }

    #[tokio::test]
    async fn dispatch_failure_is_compensated() {
        let (store, _) = seeded_store().await;
        let conversation = conversation_for(&store, "t1", "5511999999999").await;
        let dispatcher = Arc::new(RecordingDispatcher::failing("gateway timed out"));
        let mut request = text(&conversation.id, "hi");
        request.evolution_instance = Some("shop-01".into());

        let err = router(&store, dispatcher)
            .send(&RequestContext::new(), request)
            .await
            .expect_err("dispatch");
        assert_eq!(err.code(), "N8N_ROUTING_ERROR");

        let messages = store.list_messages(&conversation.id).await.expect("list");
        assert_eq!(messages[0].status, MessageStatus::Failed);
        assert!(messages[0].metadata["error"]["message"]
            .as_str()
            .expect("message")
            .contains("gateway timed out"));
    }

    #[tokio::test]
    async fn workspace_mismatch_and_missing_conversation() {
        let (store, _) = seeded_store().await;
        let conversation = conversation_for(&store, "t1", "5511999999999").await;
        let dispatcher = Arc::new(RecordingDispatcher::succeeding("X"));
        let router = router(&store, dispatcher);

        let foreign = RequestContext::new().with_tenant(Some("t2"));
        let err = router
            .send(&foreign, text(&conversation.id, "hi"))
            .await
            .expect_err("mismatch");
        assert_eq!(err.code(), "WORKSPACE_MISMATCH");
        assert!(store.list_messages(&conversation.id).await.expect("list").is_empty());

        let err = router
            .send(&RequestContext::new(), text("missing", "hi"))
            .await
            .expect_err("missing");
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn instance_of_another_tenant_is_refused() {
        let (store, _) = seeded_store().await;
        // shop-01 belongs to t1; t2's conversation must not send through it.
        let conversation = conversation_for(&store, "t2", "5522").await;
        store
            .set_conversation_instance(&conversation.id, "shop-01")
            .await
            .expect("set");
        let dispatcher = Arc::new(RecordingDispatcher::succeeding("X"));

        let err = router(&store, dispatcher.clone())
            .send(&RequestContext::new(), text(&conversation.id, "hi"))
            .await
            .expect_err("leak");
        assert_eq!(err.code(), "WORKSPACE_MISMATCH");
        assert_eq!(dispatcher.call_count(), 0);
    }

    #[tokio::test]
    async fn delivered_reply_is_never_marked_failed() {
        let (store, _) = seeded_store().await;
        let conversation = conversation_for(&store, "t1", "5511999999999").await;
        let dispatcher = Arc::new(RecordingDispatcher::succeeding("3EB0OK"));
        let metrics = MetricsStore::new();
        let router = DeliveryRouter::new(
            Arc::new(SentWriteFailingStore(store.clone())),
            InstanceResolver::default(),
            dispatcher.clone(),
            metrics.clone(),
        );

        let mut request = text(&conversation.id, "Olá!");
        request.evolution_instance = Some("shop-01".into());
        let sent = router
            .send(&RequestContext::new().with_tenant(Some("t1")), request)
            .await
            .expect("delivered");
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(dispatcher.call_count(), 1);

        let stored = store.get_message(&sent.id).await.expect("get").expect("message");
        assert_ne!(stored.status, MessageStatus::Failed);
        assert!(stored.metadata.get("error").is_none());
        assert_eq!(metrics.snapshot().sends_succeeded, 1);
        assert_eq!(metrics.snapshot().sends_failed, 0);
    }

    #[tokio::test]
    async fn validation_happens_before_any_write() {
        let (store, _) = seeded_store().await;
        let conversation = conversation_for(&store, "t1", "5511").await;
        let router = router(&store, Arc::new(RecordingDispatcher::succeeding("X")));

        let mut image = text(&conversation.id, "caption");
        image.message_type = "image".into();
        let mut contact_sender = text(&conversation.id, "hi");
        contact_sender.sender_type = Some("contact".into());
        let mut location = text(&conversation.id, "here");
        location.message_type = "location".into();

        let invalid = [
            text(&conversation.id, "  "),
            text("", "hi"),
            image,
            contact_sender,
            location,
        ];
        for request in invalid {
            let err = router
                .send(&RequestContext::new(), request)
                .await
                .expect_err("invalid");
            assert_eq!(err.code(), "VALIDATION_ERROR");
        }
        assert!(store.list_messages(&conversation.id).await.expect("list").is_empty());
    }

    #[test]
    fn jid_for_phones_and_groups() {
        assert_eq!(remote_jid_for("5511999999999"), "5511999999999@s.whatsapp.net");
        assert_eq!(remote_jid_for("120363025246125486"), "120363025246125486@g.us");
        assert_eq!(remote_jid_for("5511-1600000000"), "5511-1600000000@g.us");
        assert_eq!(remote_jid_for("x@s.whatsapp.net"), "x@s.whatsapp.net");
    }
}
