use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Mutex;
use zaproute_core::store::CrmStore;
use zaproute_core::types::{
    Connection, ConnectionSecret, ConnectionStatus, Contact, Conversation, InsertOutcome, Message,
    MessageStatus, Tenant,
};
use zaproute_persistence::SqliteCrmStore;

use crate::dispatch::{DispatchError, DispatchReceipt, DispatchRequest, OutboundDispatcher};
use crate::relay::EventForwarder;

/// Tenants `t1` (no default instance, relay URL set) and `t2` (default
/// instance `t2-default`), plus connection `shop-01` owned by `t1`.
pub(crate) async fn seeded_store() -> (SqliteCrmStore, Connection) {
    let store = SqliteCrmStore::in_memory().await.expect("store");
    for (id, default_instance, webhook) in [
        ("t1", None, Some("https://n8n.example.com/webhook/t1")),
        ("t2", Some("t2-default"), None),
    ] {
        store
            .insert_tenant(&Tenant {
                id: id.to_string(),
                name: format!("Tenant {id}"),
                connection_limit: 3,
                default_instance: default_instance.map(str::to_string),
                automation_webhook_url: webhook.map(str::to_string),
            })
            .await
            .expect("tenant");
    }

    let secret = ConnectionSecret {
        api_token: "shop-01-token".to_string(),
        api_url: Some("https://evo.example.com".to_string()),
    };
    let conn = store
        .insert_connection("t1", "shop-01", Some(&secret))
        .await
        .expect("connection");
    (store, conn)
}

pub(crate) async fn conversation_for(
    store: &SqliteCrmStore,
    tenant_id: &str,
    phone: &str,
) -> Conversation {
    let contact = store
        .upsert_contact(tenant_id, phone, None)
        .await
        .expect("contact");
    store
        .upsert_conversation(tenant_id, &contact.id, None)
        .await
        .expect("conversation")
}

/// Dispatcher that records requests and answers with a fixed result.
pub(crate) struct RecordingDispatcher {
    pub calls: Mutex<Vec<DispatchRequest>>,
    pub failure: Option<String>,
    pub external_id: Option<String>,
}

impl RecordingDispatcher {
    pub fn succeeding(external_id: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failure: None,
            external_id: Some(external_id.to_string()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failure: Some(reason.to_string()),
            external_id: None,
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("lock").len()
    }
}

#[async_trait]
impl OutboundDispatcher for RecordingDispatcher {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        self.calls.lock().expect("lock").push(request);
        match &self.failure {
            Some(reason) => Err(DispatchError::Gateway(reason.clone())),
            None => Ok(DispatchReceipt {
                external_id: self.external_id.clone(),
            }),
        }
    }
}

/// Forwarder that records every POST and optionally fails.
#[derive(Default)]
pub(crate) struct RecordingForwarder {
    pub posts: Mutex<Vec<(String, Value)>>,
    pub fail: bool,
}

#[async_trait]
impl EventForwarder for RecordingForwarder {
    async fn forward(&self, url: &str, body: &Value) -> anyhow::Result<()> {
        self.posts
            .lock()
            .expect("lock")
            .push((url.to_string(), body.clone()));
        if self.fail {
            anyhow::bail!("automation engine unreachable");
        }
        Ok(())
    }
}

/// SQLite store whose writes of `sent` status fail.
pub(crate) struct SentWriteFailingStore(pub SqliteCrmStore);

#[async_trait]
impl CrmStore for SentWriteFailingStore {
    async fn get_tenant(&self, tenant_id: &str) -> anyhow::Result<Option<Tenant>> {
        self.0.get_tenant(tenant_id).await
    }

    async fn find_connection_by_instance(
        &self,
        instance_name: &str,
    ) -> anyhow::Result<Option<Connection>> {
        self.0.find_connection_by_instance(instance_name).await
    }

    async fn get_connection(&self, connection_id: &str) -> anyhow::Result<Option<Connection>> {
        self.0.get_connection(connection_id).await
    }

    async fn find_legacy_instance_tenant(
        &self,
        instance_name: &str,
    ) -> anyhow::Result<Option<String>> {
        self.0.find_legacy_instance_tenant(instance_name).await
    }

    async fn update_connection_status(
        &self,
        connection_id: &str,
        status: ConnectionStatus,
        phone_number: Option<&str>,
    ) -> anyhow::Result<()> {
        self.0
            .update_connection_status(connection_id, status, phone_number)
            .await
    }

    async fn upsert_contact(
        &self,
        tenant_id: &str,
        phone: &str,
        name: Option<&str>,
    ) -> anyhow::Result<Contact> {
        self.0.upsert_contact(tenant_id, phone, name).await
    }

    async fn get_contact(&self, contact_id: &str) -> anyhow::Result<Option<Contact>> {
        self.0.get_contact(contact_id).await
    }

    async fn upsert_conversation(
        &self,
        tenant_id: &str,
        contact_id: &str,
        connection_id: Option<&str>,
    ) -> anyhow::Result<Conversation> {
        self.0
            .upsert_conversation(tenant_id, contact_id, connection_id)
            .await
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Option<Conversation>> {
        self.0.get_conversation(conversation_id).await
    }

    async fn set_conversation_instance(
        &self,
        conversation_id: &str,
        instance: &str,
    ) -> anyhow::Result<()> {
        self.0.set_conversation_instance(conversation_id, instance).await
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
        increment_unread: bool,
    ) -> anyhow::Result<()> {
        self.0
            .touch_conversation(conversation_id, at, increment_unread)
            .await
    }

    async fn mark_conversation_read(&self, conversation_id: &str) -> anyhow::Result<u64> {
        self.0.mark_conversation_read(conversation_id).await
    }

    async fn message_exists(&self, tenant_id: &str, external_id: &str) -> anyhow::Result<bool> {
        self.0.message_exists(tenant_id, external_id).await
    }

    async fn insert_message_if_absent(&self, message: &Message) -> anyhow::Result<InsertOutcome> {
        self.0.insert_message_if_absent(message).await
    }

    async fn fill_message_media(
        &self,
        tenant_id: &str,
        external_id: &str,
        content: &str,
        file_url: Option<&str>,
        file_name: Option<&str>,
        mime_type: Option<&str>,
    ) -> anyhow::Result<bool> {
        self.0
            .fill_message_media(tenant_id, external_id, content, file_url, file_name, mime_type)
            .await
    }

    async fn get_message(&self, message_id: &str) -> anyhow::Result<Option<Message>> {
        self.0.get_message(message_id).await
    }

    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
        external_id: Option<&str>,
        metadata_patch: Option<Value>,
    ) -> anyhow::Result<()> {
        if status == MessageStatus::Sent {
            anyhow::bail!("database is locked");
        }
        self.0
            .update_message_status(message_id, status, external_id, metadata_patch)
            .await
    }

    async fn advance_message_status(
        &self,
        tenant_id: &str,
        external_id: &str,
        status: MessageStatus,
    ) -> anyhow::Result<bool> {
        self.0
            .advance_message_status(tenant_id, external_id, status)
            .await
    }

    async fn last_contact_message_instance(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Option<String>> {
        self.0.last_contact_message_instance(conversation_id).await
    }

    async fn list_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>> {
        self.0.list_messages(conversation_id).await
    }
}
