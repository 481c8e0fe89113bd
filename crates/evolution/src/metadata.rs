use serde::Serialize;
use serde_json::Value;
use zaproute_core::redact::mask_phone;
use zaproute_core::types::MessageType;

/// Payload keys that identify a message kind, checked in this order.
const MESSAGE_KEYS: [(&str, MessageType); 10] = [
    ("conversation", MessageType::Text),
    ("extendedTextMessage", MessageType::Text),
    ("imageMessage", MessageType::Image),
    ("videoMessage", MessageType::Video),
    ("audioMessage", MessageType::Audio),
    ("documentMessage", MessageType::Document),
    ("documentWithCaptionMessage", MessageType::Document),
    ("stickerMessage", MessageType::Sticker),
    ("locationMessage", MessageType::Location),
    ("contactMessage", MessageType::Contact),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    MessagesUpsert,
    MessagesUpdate,
    ConnectionUpdate,
    QrcodeUpdated,
    Other(String),
}

impl EventKind {
    /// `MESSAGES_UPSERT` and `messages.upsert` name the same event.
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', ".");
        match normalized.as_str() {
            "messages.upsert" => EventKind::MessagesUpsert,
            "messages.update" => EventKind::MessagesUpdate,
            "connection.update" => EventKind::ConnectionUpdate,
            "qrcode.updated" => EventKind::QrcodeUpdated,
            _ => EventKind::Other(normalized),
        }
    }
}

/// Compact summary of a raw gateway event.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub event: Option<String>,
    pub instance: Option<String>,
    pub timestamp: Option<String>,
    pub message_type: String,
    pub has_media: bool,
    /// Masked; safe to log.
    pub contact_phone: Option<String>,
    pub message_id: Option<String>,
    pub from_me: Option<bool>,
    pub remote_jid: Option<String>,
    /// Full sender phone for internal use only; never serialized.
    #[serde(skip_serializing)]
    pub phone_number: Option<String>,
}

impl EventMetadata {
    pub fn kind(&self) -> EventKind {
        EventKind::parse(self.event.as_deref().unwrap_or_default())
    }
}

/// Kind of a gateway `message` object, by the first known payload key present.
pub fn detect_message_type(message: &Value) -> Option<MessageType> {
    let object = message.as_object()?;
    MESSAGE_KEYS
        .iter()
        .find(|(key, _)| object.get(*key).is_some_and(|v| !v.is_null()))
        .map(|(_, kind)| *kind)
}

/// Strip the JID suffix (`@s.whatsapp.net`, device `:NN`) from a sender id.
pub fn phone_from_jid(jid: &str) -> Option<String> {
    let user = jid.split('@').next().unwrap_or_default();
    let user = user.split(':').next().unwrap_or_default().trim();
    if user.is_empty() {
        None
    } else {
        Some(user.to_string())
    }
}

/// The first message unit of a single or batch event.
pub fn first_unit(event: &Value) -> Option<&Value> {
    let data = event.get("data")?;
    if let Some(items) = data.as_array() {
        return items.first();
    }
    if let Some(items) = data.get("messages").and_then(Value::as_array) {
        return items.first();
    }
    Some(data)
}

/// Gateway instance name, either a plain string or `{instanceName}`.
pub fn instance_name(event: &Value) -> Option<String> {
    let instance = event.get("instance")?;
    instance
        .as_str()
        .or_else(|| instance.get("instanceName").and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Summarize a raw event. Never panics; missing pieces become `None`/`unknown`.
pub fn extract_metadata(event: &Value) -> EventMetadata {
    let unit = first_unit(event);
    let key = unit.and_then(|u| u.get("key"));

    let message_type = unit
        .and_then(|u| u.get("message"))
        .and_then(detect_message_type);

    let remote_jid = key
        .and_then(|k| k.get("remoteJid"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let phone_number = remote_jid.as_deref().and_then(phone_from_jid);

    let timestamp = event
        .get("date_time")
        .and_then(value_as_text)
        .or_else(|| unit.and_then(|u| u.get("messageTimestamp")).and_then(value_as_text));

    EventMetadata {
        event: event.get("event").and_then(value_as_text),
        instance: instance_name(event),
        timestamp,
        message_type: message_type
            .map(|kind| kind.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        has_media: message_type.is_some_and(|kind| kind.is_media()),
        contact_phone: phone_number.as_deref().map(mask_phone),
        message_id: key
            .and_then(|k| k.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        from_me: key.and_then(|k| k.get("fromMe")).and_then(Value::as_bool),
        remote_jid,
        phone_number,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summarizes_single_image_event() {
        let event = json!({
            "event": "messages.upsert",
            "instance": "shop-01",
            "data": {
                "key": {
                    "remoteJid": "5511999999999@s.whatsapp.net",
                    "id": "MSG1",
                    "fromMe": false
                },
                "message": { "imageMessage": { "url": "https://x/y.jpg", "caption": "hi" } },
                "messageTimestamp": 1717000000
            }
        });

        let meta = extract_metadata(&event);
        assert_eq!(meta.kind(), EventKind::MessagesUpsert);
        assert_eq!(meta.instance.as_deref(), Some("shop-01"));
        assert_eq!(meta.message_type, "image");
        assert!(meta.has_media);
        assert_eq!(meta.message_id.as_deref(), Some("MSG1"));
        assert_eq!(meta.from_me, Some(false));
        assert_eq!(meta.phone_number.as_deref(), Some("5511999999999"));
        assert_eq!(meta.contact_phone.as_deref(), Some("5511****"));
        assert_eq!(meta.timestamp.as_deref(), Some("1717000000"));
    }

    #[test]
    fn serialized_metadata_never_contains_full_phone() {
        let event = json!({
            "event": "MESSAGES_UPSERT",
            "instance": "shop-01",
            "data": { "messages": [ {
                "key": { "remoteJid": "5511988887777@s.whatsapp.net", "id": "A" },
                "message": { "conversation": "oi" }
            } ] }
        });

        let meta = extract_metadata(&event);
        let serialized = serde_json::to_string(&meta).expect("serialize");
        assert!(!serialized.contains("5511988887777"));
        assert!(serialized.contains("\"messageType\":\"text\""));
        assert_eq!(meta.kind(), EventKind::MessagesUpsert);
    }

    #[test]
    fn malformed_input_yields_defaults() {
        for event in [json!(null), json!("text"), json!({ "data": 5 }), json!({ "data": [] })] {
            let meta = extract_metadata(&event);
            assert_eq!(meta.message_type, "unknown");
            assert!(!meta.has_media);
            assert_eq!(meta.phone_number, None);
            assert_eq!(meta.instance, None);
        }
    }

    #[test]
    fn jid_suffix_and_device_are_stripped() {
        assert_eq!(
            phone_from_jid("5511999999999:12@s.whatsapp.net").as_deref(),
            Some("5511999999999")
        );
        assert_eq!(phone_from_jid("@s.whatsapp.net"), None);
    }

    #[test]
    fn location_is_not_media() {
        let message = json!({ "locationMessage": { "degreesLatitude": 1.0 } });
        assert_eq!(detect_message_type(&message), Some(MessageType::Location));
        assert!(!MessageType::Location.is_media());
    }
}
