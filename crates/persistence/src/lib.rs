use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use zaproute_core::store::CrmStore;
use zaproute_core::types::{
    Connection, ConnectionSecret, ConnectionStatus, Contact, Conversation, ConversationStatus,
    InsertOutcome, Message, MessageStatus, MessageType, SenderType, Tenant,
};

#[derive(Clone)]
pub struct SqliteCrmStore {
    pool: SqlitePool,
}

/// Row counts reported by `zaproute status`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub tenants: i64,
    pub connections: i64,
    pub contacts: i64,
    pub conversations: i64,
    pub messages: i64,
}

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    id: String,
    tenant_id: String,
    instance_name: String,
    status: String,
    phone_number: Option<String>,
    api_token: Option<String>,
    api_url: Option<String>,
}

impl From<ConnectionRow> for Connection {
    fn from(row: ConnectionRow) -> Self {
        let status = ConnectionStatus::parse(&row.status).unwrap_or(ConnectionStatus::Error);
        let secret = row.api_token.map(|api_token| ConnectionSecret {
            api_token,
            api_url: row.api_url,
        });
        Connection {
            id: row.id,
            tenant_id: row.tenant_id,
            instance_name: row.instance_name,
            status,
            phone_number: row.phone_number,
            secret,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ContactRow {
    id: String,
    tenant_id: String,
    phone: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ContactRow> for Contact {
    fn from(row: ContactRow) -> Self {
        Contact {
            id: row.id,
            tenant_id: row.tenant_id,
            phone: row.phone,
            name: row.name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: String,
    tenant_id: String,
    contact_id: String,
    connection_id: Option<String>,
    status: String,
    unread_count: i64,
    assigned_user_id: Option<String>,
    evolution_instance: Option<String>,
    last_activity_at: Option<DateTime<Utc>>,
    last_message_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.id,
            tenant_id: row.tenant_id,
            contact_id: row.contact_id,
            connection_id: row.connection_id,
            status: ConversationStatus::parse(&row.status).unwrap_or(ConversationStatus::Open),
            unread_count: row.unread_count,
            assigned_user_id: row.assigned_user_id,
            evolution_instance: row.evolution_instance,
            last_activity_at: row.last_activity_at,
            last_message_at: row.last_message_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    tenant_id: String,
    conversation_id: String,
    content: String,
    message_type: String,
    sender_type: String,
    sender_id: Option<String>,
    status: String,
    external_id: Option<String>,
    file_url: Option<String>,
    file_name: Option<String>,
    mime_type: Option<String>,
    metadata: String,
    read_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        let metadata =
            serde_json::from_str(&row.metadata).unwrap_or_else(|_| serde_json::json!({}));
        Message {
            id: row.id,
            tenant_id: row.tenant_id,
            conversation_id: row.conversation_id,
            content: row.content,
            message_type: MessageType::parse(&row.message_type).unwrap_or(MessageType::Text),
            sender_type: SenderType::parse(&row.sender_type).unwrap_or(SenderType::System),
            sender_id: row.sender_id,
            status: MessageStatus::parse(&row.status).unwrap_or(MessageStatus::Failed),
            external_id: row.external_id,
            file_url: row.file_url,
            file_name: row.file_name,
            mime_type: row.mime_type,
            metadata,
            read_at: row.read_at,
            created_at: row.created_at,
        }
    }
}

const CONNECTION_SELECT: &str = r#"
    SELECT c.id, c.tenant_id, c.instance_name, c.status, c.phone_number,
           s.api_token, s.api_url
    FROM connections c
    LEFT JOIN connection_secrets s ON s.connection_id = c.id
"#;

const CONTACT_SELECT: &str =
    "SELECT id, tenant_id, phone, name, created_at, updated_at FROM contacts";

const CONVERSATION_SELECT: &str = r#"
    SELECT id, tenant_id, contact_id, connection_id, status, unread_count,
           assigned_user_id, evolution_instance, last_activity_at, last_message_at,
           created_at, updated_at
    FROM conversations
"#;

const MESSAGE_SELECT: &str = r#"
    SELECT id, tenant_id, conversation_id, content, message_type, sender_type, sender_id,
           status, external_id, file_url, file_name, mime_type, metadata, read_at, created_at
    FROM messages
"#;

impl SqliteCrmStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid SQLite database url")?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database lives only as long as its single connection.
        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { max_connections.max(1) });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        let store = Self { pool };
        store.migrate().await?;

        info!("SqliteCrmStore initialized");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:", 1).await
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }

    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.id))]
    pub async fn insert_tenant(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants
                (id, name, connection_limit, default_instance, automation_webhook_url)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(tenant.connection_limit)
        .bind(&tenant.default_instance)
        .bind(&tenant.automation_webhook_url)
        .execute(&self.pool)
        .await
        .context("Failed to insert tenant")?;
        Ok(())
    }

    /// Register a gateway instance for a tenant, refusing to exceed the
    /// tenant's connection quota.
    #[instrument(skip(self, secret))]
    pub async fn insert_connection(
        &self,
        tenant_id: &str,
        instance_name: &str,
        secret: Option<&ConnectionSecret>,
    ) -> Result<Connection> {
        let mut tx = self.pool.begin().await?;

        let limit: Option<(i64,)> =
            sqlx::query_as("SELECT connection_limit FROM tenants WHERE id = ?")
                .bind(tenant_id)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to load tenant")?;
        let Some((limit,)) = limit else {
            anyhow::bail!("tenant '{tenant_id}' does not exist");
        };

        let (existing,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM connections WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to count connections")?;
        if existing >= limit {
            anyhow::bail!(
                "tenant '{tenant_id}' reached its connection limit ({existing}/{limit})"
            );
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO connections (id, tenant_id, instance_name, status)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(instance_name)
        .bind(ConnectionStatus::Creating.as_str())
        .execute(&mut *tx)
        .await
        .context("Failed to insert connection")?;

        if let Some(secret) = secret {
            sqlx::query(
                r#"
                INSERT INTO connection_secrets (connection_id, api_token, api_url)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(&secret.api_token)
            .bind(&secret.api_url)
            .execute(&mut *tx)
            .await
            .context("Failed to insert connection secret")?;
        }

        tx.commit().await?;

        Ok(Connection {
            id,
            tenant_id: tenant_id.to_string(),
            instance_name: instance_name.to_string(),
            status: ConnectionStatus::Creating,
            phone_number: None,
            secret: secret.cloned(),
        })
    }

    #[instrument(skip(self, token))]
    pub async fn insert_legacy_instance(
        &self,
        instance_name: &str,
        tenant_id: &str,
        token: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instance_tokens (instance_name, tenant_id, token)
            VALUES (?, ?, ?)
            ON CONFLICT(instance_name)
                DO UPDATE SET tenant_id = excluded.tenant_id, token = excluded.token
            "#,
        )
        .bind(instance_name)
        .bind(tenant_id)
        .bind(token)
        .execute(&self.pool)
        .await
        .context("Failed to insert legacy instance")?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn list_connections(&self) -> Result<Vec<Connection>> {
        let rows: Vec<ConnectionRow> =
            sqlx::query_as(&format!("{CONNECTION_SELECT} ORDER BY c.created_at ASC"))
                .fetch_all(&self.pool)
                .await
                .context("Failed to list connections")?;
        Ok(rows.into_iter().map(Connection::from).collect())
    }

    #[instrument(skip(self))]
    pub async fn stats(&self) -> Result<StoreStats> {
        let (tenants, connections, contacts, conversations, messages): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM tenants),
                    (SELECT COUNT(*) FROM connections),
                    (SELECT COUNT(*) FROM contacts),
                    (SELECT COUNT(*) FROM conversations),
                    (SELECT COUNT(*) FROM messages)
                "#,
            )
            .fetch_one(&self.pool)
            .await
            .context("Failed to collect stats")?;

        Ok(StoreStats {
            tenants,
            connections,
            contacts,
            conversations,
            messages,
        })
    }

    /// Contact and its conversation on the given connection, by phone.
    #[instrument(skip(self))]
    pub async fn find_conversation_by_phone(
        &self,
        tenant_id: &str,
        phone: &str,
        connection_id: Option<&str>,
    ) -> Result<Option<(Contact, Conversation)>> {
        let contact: Option<ContactRow> =
            sqlx::query_as(&format!("{CONTACT_SELECT} WHERE tenant_id = ? AND phone = ?"))
                .bind(tenant_id)
                .bind(phone)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to find contact")?;
        let Some(contact) = contact.map(Contact::from) else {
            return Ok(None);
        };

        let conversation: Option<ConversationRow> = sqlx::query_as(&format!(
            "{CONVERSATION_SELECT} WHERE tenant_id = ? AND contact_id = ? AND connection_key = ?"
        ))
        .bind(tenant_id)
        .bind(&contact.id)
        .bind(connection_id.unwrap_or_default())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to find conversation")?;

        Ok(conversation.map(|row| (contact, row.into())))
    }

    async fn contact_by_phone(&self, tenant_id: &str, phone: &str) -> Result<Contact> {
        let sql = format!("{CONTACT_SELECT} WHERE tenant_id = ? AND phone = ?");
        let row: ContactRow = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(phone)
            .fetch_one(&self.pool)
            .await
            .context("Failed to load contact")?;
        Ok(row.into())
    }
}

#[async_trait]
impl CrmStore for SqliteCrmStore {
    #[instrument(skip(self))]
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let row: Option<(String, String, i64, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, name, connection_limit, default_instance, automation_webhook_url
            FROM tenants
            WHERE id = ?
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get tenant")?;

        Ok(row.map(
            |(id, name, connection_limit, default_instance, automation_webhook_url)| Tenant {
                id,
                name,
                connection_limit,
                default_instance,
                automation_webhook_url,
            },
        ))
    }

    #[instrument(skip(self))]
    async fn find_connection_by_instance(&self, instance_name: &str) -> Result<Option<Connection>> {
        let row: Option<ConnectionRow> =
            sqlx::query_as(&format!("{CONNECTION_SELECT} WHERE c.instance_name = ?"))
                .bind(instance_name)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to find connection by instance")?;
        Ok(row.map(Connection::from))
    }

    #[instrument(skip(self))]
    async fn get_connection(&self, connection_id: &str) -> Result<Option<Connection>> {
        let sql = format!("{CONNECTION_SELECT} WHERE c.id = ?");
        let row: Option<ConnectionRow> = sqlx::query_as(&sql)
            .bind(connection_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get connection")?;
        Ok(row.map(Connection::from))
    }

    #[instrument(skip(self))]
    async fn find_legacy_instance_tenant(&self, instance_name: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT tenant_id FROM instance_tokens WHERE instance_name = ?")
                .bind(instance_name)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to find legacy instance")?;
        Ok(row.map(|r| r.0))
    }

    #[instrument(skip(self))]
    async fn update_connection_status(
        &self,
        connection_id: &str,
        status: ConnectionStatus,
        phone_number: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE connections
            SET status = ?, phone_number = COALESCE(?, phone_number), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(phone_number)
        .bind(Utc::now())
        .bind(connection_id)
        .execute(&self.pool)
        .await
        .context("Failed to update connection status")?;
        Ok(())
    }

    #[instrument(skip(self, name))]
    async fn upsert_contact(
        &self,
        tenant_id: &str,
        phone: &str,
        name: Option<&str>,
    ) -> Result<Contact> {
        let now = Utc::now();
        let name = name.map(str::trim).filter(|n| !n.is_empty());

        sqlx::query(
            r#"
            INSERT INTO contacts (id, tenant_id, phone, name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, phone) DO UPDATE SET
                name = CASE
                    WHEN excluded.name IS NOT NULL
                     AND (contacts.name IS NULL
                          OR contacts.name = ''
                          OR contacts.name = contacts.phone)
                    THEN excluded.name
                    ELSE contacts.name
                END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(phone)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to upsert contact")?;

        self.contact_by_phone(tenant_id, phone).await
    }

    #[instrument(skip(self))]
    async fn get_contact(&self, contact_id: &str) -> Result<Option<Contact>> {
        let row: Option<ContactRow> = sqlx::query_as(&format!("{CONTACT_SELECT} WHERE id = ?"))
            .bind(contact_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get contact")?;
        Ok(row.map(Contact::from))
    }

    #[instrument(skip(self))]
    async fn upsert_conversation(
        &self,
        tenant_id: &str,
        contact_id: &str,
        connection_id: Option<&str>,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let connection_key = connection_id.unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO conversations
                (id, tenant_id, contact_id, connection_id, connection_key, status,
                 unread_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(tenant_id, contact_id, connection_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(contact_id)
        .bind(connection_id)
        .bind(connection_key)
        .bind(ConversationStatus::Open.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to upsert conversation")?;

        let row: ConversationRow = sqlx::query_as(&format!(
            "{CONVERSATION_SELECT} WHERE tenant_id = ? AND contact_id = ? AND connection_key = ?"
        ))
        .bind(tenant_id)
        .bind(contact_id)
        .bind(connection_key)
        .fetch_one(&self.pool)
        .await
        .context("Failed to load conversation")?;

        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let sql = format!("{CONVERSATION_SELECT} WHERE id = ?");
        let row: Option<ConversationRow> = sqlx::query_as(&sql)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get conversation")?;
        Ok(row.map(Conversation::from))
    }

    #[instrument(skip(self))]
    async fn set_conversation_instance(&self, conversation_id: &str, instance: &str) -> Result<()> {
        sqlx::query("UPDATE conversations SET evolution_instance = ?, updated_at = ? WHERE id = ?")
            .bind(instance)
            .bind(Utc::now())
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .context("Failed to set conversation instance")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn touch_conversation(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
        increment_unread: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_activity_at = CASE
                    WHEN last_activity_at IS NULL OR julianday(last_activity_at) < julianday(?1)
                    THEN ?1 ELSE last_activity_at END,
                last_message_at = CASE
                    WHEN last_message_at IS NULL OR julianday(last_message_at) < julianday(?1)
                    THEN ?1 ELSE last_message_at END,
                updated_at = ?2,
                unread_count = unread_count + ?3
            WHERE id = ?4
            "#,
        )
        .bind(at)
        .bind(Utc::now())
        .bind(i64::from(increment_unread))
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .context("Failed to touch conversation")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<u64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query(
            r#"
            UPDATE messages
            SET read_at = ?, updated_at = ?
            WHERE conversation_id = ? AND sender_type = 'contact' AND read_at IS NULL
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await
        .context("Failed to mark messages read")?
        .rows_affected();

        sqlx::query("UPDATE conversations SET unread_count = 0, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .context("Failed to reset unread count")?;

        tx.commit().await?;
        Ok(marked)
    }

    #[instrument(skip(self))]
    async fn message_exists(&self, tenant_id: &str, external_id: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM messages WHERE tenant_id = ? AND external_id = ?")
                .bind(tenant_id)
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to check message existence")?;
        Ok(row.is_some())
    }

    #[instrument(skip(self, message), fields(message_id = %message.id))]
    async fn insert_message_if_absent(&self, message: &Message) -> Result<InsertOutcome> {
        let metadata = serde_json::to_string(&message.metadata)?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages
                (id, tenant_id, conversation_id, content, message_type, sender_type, sender_id,
                 status, external_id, file_url, file_name, mime_type, metadata, read_at,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, external_id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(&message.tenant_id)
        .bind(&message.conversation_id)
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(message.sender_type.as_str())
        .bind(&message.sender_id)
        .bind(message.status.as_str())
        .bind(&message.external_id)
        .bind(&message.file_url)
        .bind(&message.file_name)
        .bind(&message.mime_type)
        .bind(metadata)
        .bind(message.read_at)
        .bind(message.created_at)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    #[instrument(skip(self, content))]
    async fn fill_message_media(
        &self,
        tenant_id: &str,
        external_id: &str,
        content: &str,
        file_url: Option<&str>,
        file_name: Option<&str>,
        mime_type: Option<&str>,
    ) -> Result<bool> {
        let Some(file_url) = file_url.filter(|u| !u.trim().is_empty()) else {
            return Ok(false);
        };

        let result = sqlx::query(
            r#"
            UPDATE messages
            SET file_url = ?,
                file_name = COALESCE(file_name, ?),
                mime_type = COALESCE(mime_type, ?),
                content = CASE WHEN content = '' THEN ? ELSE content END,
                updated_at = ?
            WHERE tenant_id = ? AND external_id = ? AND (file_url IS NULL OR file_url = '')
            "#,
        )
        .bind(file_url)
        .bind(file_name)
        .bind(mime_type)
        .bind(content)
        .bind(Utc::now())
        .bind(tenant_id)
        .bind(external_id)
        .execute(&self.pool)
        .await
        .context("Failed to fill message media")?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(&format!("{MESSAGE_SELECT} WHERE id = ?"))
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get message")?;
        Ok(row.map(Message::from))
    }

    #[instrument(skip(self, metadata_patch))]
    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
        external_id: Option<&str>,
        metadata_patch: Option<Value>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String,)> = sqlx::query_as("SELECT metadata FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to load message metadata")?;
        let Some((raw,)) = row else {
            anyhow::bail!("message '{message_id}' does not exist");
        };

        let mut metadata: Value =
            serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({}));
        if !metadata.is_object() {
            metadata = serde_json::json!({});
        }
        if let (Some(target), Some(Value::Object(patch))) =
            (metadata.as_object_mut(), metadata_patch)
        {
            for (key, value) in patch {
                target.insert(key, value);
            }
        }

        sqlx::query(
            r#"
            UPDATE messages
            SET status = ?, external_id = COALESCE(?, external_id), metadata = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(external_id)
        .bind(serde_json::to_string(&metadata)?)
        .bind(Utc::now())
        .bind(message_id)
        .execute(&mut *tx)
        .await
        .context("Failed to update message status")?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn advance_message_status(
        &self,
        tenant_id: &str,
        external_id: &str,
        status: MessageStatus,
    ) -> Result<bool> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT id, status FROM messages WHERE tenant_id = ? AND external_id = ?",
        )
        .bind(tenant_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load message status")?;

        let Some((id, current)) = row else {
            return Ok(false);
        };
        let Some(current) = MessageStatus::parse(&current) else {
            warn!(message_id = %id, status = %current, "Stored message has unknown status");
            return Ok(false);
        };
        if !current.can_advance_to(status) {
            return Ok(false);
        }

        // Re-check the status in the WHERE clause so a concurrent report cannot regress it.
        let result = sqlx::query(
            "UPDATE messages SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(&id)
            .bind(current.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to advance message status")?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn last_contact_message_instance(&self, conversation_id: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            SELECT json_extract(metadata, '$.evolution_instance')
            FROM messages
            WHERE conversation_id = ? AND sender_type = 'contact'
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load last contact message instance")?;

        Ok(row
            .and_then(|r| r.0)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    #[instrument(skip(self))]
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "{MESSAGE_SELECT} WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list messages")?;
        Ok(rows.into_iter().map(Message::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    async fn seeded() -> SqliteCrmStore {
        let store = SqliteCrmStore::in_memory().await.expect("store");
        store
            .insert_tenant(&Tenant {
                id: "t1".into(),
                name: "Shop".into(),
                connection_limit: 1,
                default_instance: Some("shop-default".into()),
                automation_webhook_url: None,
            })
            .await
            .expect("tenant");
        store
    }

    #[tokio::test]
    async fn connection_lookup_includes_secret() {
        let store = seeded().await;
        let secret = ConnectionSecret {
            api_token: "tok".into(),
            api_url: Some("https://evo.example.com".into()),
        };
        let created = store
            .insert_connection("t1", "shop-01", Some(&secret))
            .await
            .expect("connection");

        let found = store
            .find_connection_by_instance("shop-01")
            .await
            .expect("query")
            .expect("connection");
        assert_eq!(found.id, created.id);
        assert_eq!(found.tenant_id, "t1");
        assert_eq!(found.secret.expect("secret").api_token, "tok");
        assert!(store.find_connection_by_instance("nope").await.expect("query").is_none());
    }

    #[tokio::test]
    async fn connection_quota_is_enforced() {
        let store = seeded().await;
        store.insert_connection("t1", "shop-01", None).await.expect("first");
        let err = store
            .insert_connection("t1", "shop-02", None)
            .await
            .expect_err("quota");
        assert!(err.to_string().contains("connection limit"));
    }

    #[tokio::test]
    async fn contact_name_keeps_richer_value() {
        let store = seeded().await;
        let first = store
            .upsert_contact("t1", "5511999999999", Some("5511999999999"))
            .await
            .expect("insert");
        assert_eq!(first.name.as_deref(), Some("5511999999999"));

        let upgraded = store
            .upsert_contact("t1", "5511999999999", Some("Maria"))
            .await
            .expect("upgrade");
        assert_eq!(upgraded.id, first.id);
        assert_eq!(upgraded.name.as_deref(), Some("Maria"));

        let kept = store
            .upsert_contact("t1", "5511999999999", Some("M."))
            .await
            .expect("keep");
        assert_eq!(kept.name.as_deref(), Some("Maria"));
    }

    #[tokio::test]
    async fn conversation_is_unique_per_connection_key() {
        let store = seeded().await;
        let contact = store.upsert_contact("t1", "5511", None).await.expect("contact");

        let a = store.upsert_conversation("t1", &contact.id, None).await.expect("a");
        let b = store.upsert_conversation("t1", &contact.id, None).await.expect("b");
        assert_eq!(a.id, b.id);
        assert_eq!(a.status, ConversationStatus::Open);
        assert_eq!(a.unread_count, 0);

        let conn = store.insert_connection("t1", "shop-01", None).await.expect("conn");
        let c = store
            .upsert_conversation("t1", &contact.id, Some(&conn.id))
            .await
            .expect("c");
        assert_ne!(a.id, c.id);
        assert_eq!(c.connection_id.as_deref(), Some(conn.id.as_str()));
    }

    #[tokio::test]
    async fn insert_if_absent_collapses_duplicates() {
        let store = seeded().await;
        let contact = store.upsert_contact("t1", "5511", None).await.expect("contact");
        let conv = store.upsert_conversation("t1", &contact.id, None).await.expect("conv");

        let first = Message::new("t1", &conv.id, SenderType::Contact, MessageType::Text, "Hello")
            .with_external_id("MSG1");
        let again = Message::new("t1", &conv.id, SenderType::Contact, MessageType::Text, "Hello")
            .with_external_id("MSG1");

        assert_eq!(
            store.insert_message_if_absent(&first).await.expect("first"),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_message_if_absent(&again).await.expect("again"),
            InsertOutcome::Duplicate
        );
        assert!(store.message_exists("t1", "MSG1").await.expect("exists"));
        assert_eq!(store.list_messages(&conv.id).await.expect("list").len(), 1);

        // Outbound rows without an external id never collide.
        for _ in 0..2 {
            let out = Message::new("t1", &conv.id, SenderType::Agent, MessageType::Text, "reply");
            assert_eq!(
                store.insert_message_if_absent(&out).await.expect("out"),
                InsertOutcome::Inserted
            );
        }
    }

    #[tokio::test]
    async fn media_is_filled_only_once() {
        let store = seeded().await;
        let contact = store.upsert_contact("t1", "5511", None).await.expect("contact");
        let conv = store.upsert_conversation("t1", &contact.id, None).await.expect("conv");
        let msg = Message::new("t1", &conv.id, SenderType::Contact, MessageType::Image, "[image]")
            .with_external_id("IMG1");
        store.insert_message_if_absent(&msg).await.expect("insert");

        let patched = store
            .fill_message_media(
                "t1",
                "IMG1",
                "[image]",
                Some("https://x/a.jpg"),
                Some("image_IMG1.jpg"),
                Some("image/jpeg"),
            )
            .await
            .expect("fill");
        assert!(patched);
        let again = store
            .fill_message_media("t1", "IMG1", "[image]", Some("https://x/b.jpg"), None, None)
            .await
            .expect("fill again");
        assert!(!again);

        let stored = store.get_message(&msg.id).await.expect("get").expect("message");
        assert_eq!(stored.file_url.as_deref(), Some("https://x/a.jpg"));
        assert_eq!(stored.mime_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn unread_counter_and_mark_read() {
        let store = seeded().await;
        let contact = store.upsert_contact("t1", "5511", None).await.expect("contact");
        let conv = store.upsert_conversation("t1", &contact.id, None).await.expect("conv");

        for id in ["A", "B", "C"] {
            let msg = Message::new("t1", &conv.id, SenderType::Contact, MessageType::Text, id)
                .with_external_id(id);
            store.insert_message_if_absent(&msg).await.expect("insert");
            store.touch_conversation(&conv.id, Utc::now(), true).await.expect("touch");
        }
        let before = store.get_conversation(&conv.id).await.expect("get").expect("conv");
        assert_eq!(before.unread_count, 3);
        assert!(before.last_message_at.is_some());

        let marked = store.mark_conversation_read(&conv.id).await.expect("mark");
        assert_eq!(marked, 3);
        let after = store.get_conversation(&conv.id).await.expect("get").expect("conv");
        assert_eq!(after.unread_count, 0);
        assert!(store
            .list_messages(&conv.id)
            .await
            .expect("list")
            .iter()
            .all(|m| m.read_at.is_some()));
    }

    #[tokio::test]
    async fn recency_never_moves_backwards() {
        let store = seeded().await;
        let contact = store.upsert_contact("t1", "5511", None).await.expect("contact");
        let conv = store.upsert_conversation("t1", &contact.id, None).await.expect("conv");
        let newer = Utc.timestamp_opt(1_717_000_000, 0).single().expect("ts");
        let older = Utc.timestamp_opt(1_600_000_000, 0).single().expect("ts");

        store.touch_conversation(&conv.id, newer, true).await.expect("touch");
        store.touch_conversation(&conv.id, older, true).await.expect("late touch");

        let stored = store.get_conversation(&conv.id).await.expect("get").expect("conv");
        assert_eq!(stored.last_message_at, Some(newer));
        assert_eq!(stored.last_activity_at, Some(newer));
        assert_eq!(stored.unread_count, 2);
    }

    #[tokio::test]
    async fn status_update_merges_metadata_and_advances_forward_only() {
        let store = seeded().await;
        let contact = store.upsert_contact("t1", "5511", None).await.expect("contact");
        let conv = store.upsert_conversation("t1", &contact.id, None).await.expect("conv");
        let msg = Message::new("t1", &conv.id, SenderType::Agent, MessageType::Text, "hi")
            .with_metadata("correlation_id", json!("req-1"));
        store.insert_message_if_absent(&msg).await.expect("insert");

        store
            .update_message_status(
                &msg.id,
                MessageStatus::Sent,
                Some("EXT1"),
                Some(json!({ "evolution_instance": "shop-01" })),
            )
            .await
            .expect("sent");
        let stored = store.get_message(&msg.id).await.expect("get").expect("message");
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.external_id.as_deref(), Some("EXT1"));
        assert_eq!(stored.metadata["correlation_id"], "req-1");
        assert_eq!(stored.metadata["evolution_instance"], "shop-01");

        let advance = |external_id: &'static str, status: MessageStatus| {
            store.advance_message_status("t1", external_id, status)
        };
        assert!(advance("EXT1", MessageStatus::Read).await.expect("read"));
        assert!(!advance("EXT1", MessageStatus::Delivered).await.expect("regress"));
        assert!(!advance("missing", MessageStatus::Read).await.expect("missing"));
    }

    #[tokio::test]
    async fn last_contact_instance_reads_newest_contact_message() {
        let store = seeded().await;
        let contact = store.upsert_contact("t1", "5511", None).await.expect("contact");
        let conv = store.upsert_conversation("t1", &contact.id, None).await.expect("conv");
        assert_eq!(store.last_contact_message_instance(&conv.id).await.expect("empty"), None);

        let old = Message::new("t1", &conv.id, SenderType::Contact, MessageType::Text, "a")
            .with_external_id("A")
            .with_metadata("evolution_instance", json!("shop-01"));
        let mut new = Message::new("t1", &conv.id, SenderType::Contact, MessageType::Text, "b")
            .with_external_id("B")
            .with_metadata("evolution_instance", json!("shop-02"));
        new.created_at = old.created_at + chrono::Duration::seconds(5);
        let agent = Message::new("t1", &conv.id, SenderType::Agent, MessageType::Text, "c")
            .with_metadata("evolution_instance", json!("shop-03"));

        for msg in [&old, &new, &agent] {
            store.insert_message_if_absent(msg).await.expect("insert");
        }
        assert_eq!(
            store.last_contact_message_instance(&conv.id).await.expect("instance").as_deref(),
            Some("shop-02")
        );
    }

    #[tokio::test]
    async fn legacy_instance_maps_to_tenant() {
        let store = seeded().await;
        store.insert_legacy_instance("old-line", "t1", Some("tok")).await.expect("legacy");
        assert_eq!(
            store.find_legacy_instance_tenant("old-line").await.expect("query").as_deref(),
            Some("t1")
        );
        assert_eq!(store.find_legacy_instance_tenant("other").await.expect("query"), None);
        assert_eq!(store.stats().await.expect("stats").tenants, 1);
    }
}
