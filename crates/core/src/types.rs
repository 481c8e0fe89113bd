use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Location,
    Contact,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::Document => "document",
            MessageType::Sticker => "sticker",
            MessageType::Location => "location",
            MessageType::Contact => "contact",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(MessageType::Text),
            "image" => Some(MessageType::Image),
            "video" => Some(MessageType::Video),
            "audio" => Some(MessageType::Audio),
            "document" => Some(MessageType::Document),
            "sticker" => Some(MessageType::Sticker),
            "location" => Some(MessageType::Location),
            "contact" => Some(MessageType::Contact),
            _ => None,
        }
    }

    /// Kinds whose payload is a binary file on the gateway side.
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            MessageType::Image
                | MessageType::Video
                | MessageType::Audio
                | MessageType::Document
                | MessageType::Sticker
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Contact,
    Agent,
    System,
    Ia,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::Contact => "contact",
            SenderType::Agent => "agent",
            SenderType::System => "system",
            SenderType::Ia => "ia",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "contact" => Some(SenderType::Contact),
            "agent" => Some(SenderType::Agent),
            "system" => Some(SenderType::System),
            "ia" | "ai" => Some(SenderType::Ia),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
    Received,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
            MessageStatus::Received => "received",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sending" => Some(MessageStatus::Sending),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            "received" => Some(MessageStatus::Received),
            _ => None,
        }
    }

    /// Whether a later gateway report may move a message from `self` to `next`.
    /// Delivery status only moves forward; `failed` is reachable only before delivery.
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        fn rank(status: MessageStatus) -> u8 {
            match status {
                MessageStatus::Sending => 0,
                MessageStatus::Sent => 1,
                MessageStatus::Delivered => 2,
                MessageStatus::Read => 3,
                MessageStatus::Failed | MessageStatus::Received => u8::MAX,
            }
        }

        match (self, next) {
            (MessageStatus::Received, _) | (MessageStatus::Failed, _) => false,
            (current, MessageStatus::Failed) => {
                matches!(current, MessageStatus::Sending | MessageStatus::Sent)
            }
            (_, MessageStatus::Received) => false,
            (current, next) => rank(next) > rank(*current),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Creating,
    Qr,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Creating => "creating",
            ConnectionStatus::Qr => "qr",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "creating" => Some(ConnectionStatus::Creating),
            "qr" => Some(ConnectionStatus::Qr),
            "connecting" => Some(ConnectionStatus::Connecting),
            "connected" => Some(ConnectionStatus::Connected),
            "disconnected" => Some(ConnectionStatus::Disconnected),
            "error" => Some(ConnectionStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Pending,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Pending => "pending",
            ConversationStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Some(ConversationStatus::Open),
            "pending" => Some(ConversationStatus::Pending),
            "closed" => Some(ConversationStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub connection_limit: i64,
    /// Tenant-wide fallback gateway instance for outbound replies.
    pub default_instance: Option<String>,
    /// Automation-engine webhook that receives this tenant's relayed events.
    pub automation_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSecret {
    pub api_token: String,
    pub api_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub tenant_id: String,
    pub instance_name: String,
    pub status: ConnectionStatus,
    pub phone_number: Option<String>,
    #[serde(skip_serializing)]
    pub secret: Option<ConnectionSecret>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub tenant_id: String,
    pub phone: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub connection_id: Option<String>,
    pub status: ConversationStatus,
    pub unread_count: i64,
    pub assigned_user_id: Option<String>,
    pub evolution_instance: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub tenant_id: String,
    pub conversation_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub sender_type: SenderType,
    #[serde(default)]
    pub sender_id: Option<String>,
    pub status: MessageStatus,
    /// Gateway-assigned id; unique per tenant once set.
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default = "empty_metadata")]
    pub metadata: Value,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn empty_metadata() -> Value {
    json!({})
}

impl Message {
    pub fn new(
        tenant_id: &str,
        conversation_id: &str,
        sender_type: SenderType,
        message_type: MessageType,
        content: &str,
    ) -> Self {
        let status = match sender_type {
            SenderType::Contact => MessageStatus::Received,
            _ => MessageStatus::Sending,
        };

        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            message_type,
            sender_type,
            sender_id: None,
            status,
            external_id: None,
            file_url: None,
            file_name: None,
            mime_type: None,
            metadata: empty_metadata(),
            read_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_sender(mut self, sender_id: &str) -> Self {
        self.sender_id = Some(sender_id.to_string());
        self
    }

    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.external_id = Some(external_id.to_string());
        self
    }

    pub fn with_file(
        mut self,
        file_url: Option<String>,
        file_name: Option<String>,
        mime_type: Option<String>,
    ) -> Self {
        self.file_url = file_url;
        self.file_name = file_name;
        self.mime_type = mime_type;
        self
    }

    /// Set a metadata key, turning a non-object metadata bag into an object first.
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        if !self.metadata.is_object() {
            self.metadata = empty_metadata();
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }
}

/// Outcome of a conditional insert keyed on (tenant, external id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_messages_start_received_and_agent_messages_start_sending() {
        let inbound = Message::new("t1", "c1", SenderType::Contact, MessageType::Text, "hi");
        assert_eq!(inbound.status, MessageStatus::Received);

        let outbound = Message::new("t1", "c1", SenderType::Agent, MessageType::Text, "hello");
        assert_eq!(outbound.status, MessageStatus::Sending);
    }

    #[test]
    fn status_only_moves_forward() {
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Delivered));
        assert!(MessageStatus::Delivered.can_advance_to(MessageStatus::Read));
        assert!(!MessageStatus::Read.can_advance_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Delivered.can_advance_to(MessageStatus::Failed));
        assert!(MessageStatus::Sending.can_advance_to(MessageStatus::Failed));
        assert!(!MessageStatus::Received.can_advance_to(MessageStatus::Read));
    }

    #[test]
    fn enums_parse_their_own_labels() {
        for kind in [
            MessageType::Text,
            MessageType::Image,
            MessageType::Video,
            MessageType::Audio,
            MessageType::Document,
            MessageType::Sticker,
            MessageType::Location,
            MessageType::Contact,
        ] {
            assert_eq!(MessageType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SenderType::parse("AI"), Some(SenderType::Ia));
        assert_eq!(ConnectionStatus::parse("qr"), Some(ConnectionStatus::Qr));
        assert_eq!(MessageType::parse("poll"), None);
    }

    #[test]
    fn with_metadata_builds_object() {
        let msg = Message::new("t1", "c1", SenderType::Agent, MessageType::Text, "x")
            .with_metadata("correlation_id", json!("req-1"));
        assert_eq!(msg.metadata["correlation_id"], "req-1");
    }
}
