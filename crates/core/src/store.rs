use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{
    Connection, ConnectionStatus, Contact, Conversation, InsertOutcome, Message, MessageStatus,
    Tenant,
};

/// Storage seam between the routing core and the CRM's data store.
///
/// Uniqueness (contact by tenant+phone, conversation by
/// tenant+contact+connection, message by tenant+external id) is enforced
/// by the backend so concurrent duplicate deliveries collapse into one row.
#[async_trait]
pub trait CrmStore: Send + Sync {
    async fn get_tenant(&self, tenant_id: &str) -> anyhow::Result<Option<Tenant>>;

    /// Primary lookup: connection (with secret) by gateway instance name.
    async fn find_connection_by_instance(
        &self,
        instance_name: &str,
    ) -> anyhow::Result<Option<Connection>>;

    async fn get_connection(&self, connection_id: &str) -> anyhow::Result<Option<Connection>>;

    /// Legacy lookup: tenant id from the old instance-token table.
    async fn find_legacy_instance_tenant(
        &self,
        instance_name: &str,
    ) -> anyhow::Result<Option<String>>;

    async fn update_connection_status(
        &self,
        connection_id: &str,
        status: ConnectionStatus,
        phone_number: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Insert or refresh a contact. A reported name only replaces an empty
    /// or phone-only stored name.
    async fn upsert_contact(
        &self,
        tenant_id: &str,
        phone: &str,
        name: Option<&str>,
    ) -> anyhow::Result<Contact>;

    async fn get_contact(&self, contact_id: &str) -> anyhow::Result<Option<Contact>>;

    /// Return the conversation for the key, creating an `open` one if absent.
    async fn upsert_conversation(
        &self,
        tenant_id: &str,
        contact_id: &str,
        connection_id: Option<&str>,
    ) -> anyhow::Result<Conversation>;

    async fn get_conversation(&self, conversation_id: &str)
        -> anyhow::Result<Option<Conversation>>;

    async fn set_conversation_instance(
        &self,
        conversation_id: &str,
        instance: &str,
    ) -> anyhow::Result<()>;

    /// Bump recency timestamps; optionally count one more unread message.
    async fn touch_conversation(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
        increment_unread: bool,
    ) -> anyhow::Result<()>;

    /// Mark all unread contact messages read and zero the counter.
    /// Returns how many messages were marked.
    async fn mark_conversation_read(&self, conversation_id: &str) -> anyhow::Result<u64>;

    async fn message_exists(&self, tenant_id: &str, external_id: &str) -> anyhow::Result<bool>;

    /// Insert unless a message with the same (tenant, external id) exists.
    async fn insert_message_if_absent(&self, message: &Message) -> anyhow::Result<InsertOutcome>;

    /// Fill file fields of an existing message that has none yet.
    /// Returns whether a row was patched.
    async fn fill_message_media(
        &self,
        tenant_id: &str,
        external_id: &str,
        content: &str,
        file_url: Option<&str>,
        file_name: Option<&str>,
        mime_type: Option<&str>,
    ) -> anyhow::Result<bool>;

    async fn get_message(&self, message_id: &str) -> anyhow::Result<Option<Message>>;

    /// Set status (and optionally external id) of a message by row id, merging
    /// `metadata_patch` keys into its metadata object.
    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
        external_id: Option<&str>,
        metadata_patch: Option<Value>,
    ) -> anyhow::Result<()>;

    /// Apply a gateway status report if it moves the message forward.
    /// Returns whether the stored status changed.
    async fn advance_message_status(
        &self,
        tenant_id: &str,
        external_id: &str,
        status: MessageStatus,
    ) -> anyhow::Result<bool>;

    /// `metadata.evolution_instance` of the newest contact-authored message.
    async fn last_contact_message_instance(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Option<String>>;

    async fn list_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>>;
}
