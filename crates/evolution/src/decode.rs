use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use zaproute_core::types::{ConnectionStatus, MessageStatus, MessageType};

use crate::metadata::{detect_message_type, phone_from_jid, EventKind};
use crate::mime::extension_from_mime;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    #[serde(default)]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub from_me: Option<bool>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub participant: Option<String>,
}

/// One message from a `messages.upsert` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundUnit {
    #[serde(default)]
    pub key: MessageKey,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub message_timestamp: Value,
    /// Set when the gateway stores media itself and hands out a URL.
    #[serde(default)]
    pub media_url: Option<String>,
}

impl InboundUnit {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        InboundUnit::deserialize(value)
    }

    pub fn from_me(&self) -> bool {
        self.key.from_me.unwrap_or(false)
    }

    pub fn remote_jid(&self) -> Option<&str> {
        self.key
            .remote_jid
            .as_deref()
            .map(str::trim)
            .filter(|jid| !jid.is_empty())
    }

    pub fn external_id(&self) -> Option<&str> {
        self.key
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn sender_phone(&self) -> Option<String> {
        self.remote_jid().and_then(phone_from_jid)
    }

    pub fn is_group(&self) -> bool {
        self.remote_jid().is_some_and(|jid| jid.ends_with("@g.us"))
    }

    /// Gateway timestamp in epoch seconds, as number, numeric string or `{low, high}`.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let secs = match &self.message_timestamp {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            Value::Object(long) => long.get("low").and_then(Value::as_i64),
            _ => None,
        }?;
        if secs <= 0 {
            return None;
        }
        Utc.timestamp_opt(secs, 0).single()
    }
}

/// Raw message units of a single (`data`), batch (`data.messages`) or array event.
pub fn message_units(event: &Value) -> Vec<&Value> {
    let Some(data) = event.get("data") else {
        return Vec::new();
    };
    if let Some(items) = data.as_array() {
        return items.iter().collect();
    }
    if let Some(items) = data.get("messages").and_then(Value::as_array) {
        return items.iter().collect();
    }
    if data.is_object() {
        vec![data]
    } else {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedContent {
    pub message_type: MessageType,
    pub content: String,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

fn text_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn placeholder(kind: MessageType) -> String {
    format!("[{}]", kind.as_str())
}

fn media_payload(message: &Value, kind: MessageType) -> Option<&Value> {
    let payload = match kind {
        MessageType::Image => message.get("imageMessage"),
        MessageType::Video => message.get("videoMessage"),
        MessageType::Audio => message.get("audioMessage"),
        MessageType::Sticker => message.get("stickerMessage"),
        MessageType::Document => message.get("documentMessage").or_else(|| {
            message
                .get("documentWithCaptionMessage")
                .and_then(|wrapper| wrapper.get("message"))
                .and_then(|inner| inner.get("documentMessage"))
        }),
        _ => None,
    };
    payload.filter(|p| p.is_object())
}

fn synthesized_file_name(
    kind: MessageType,
    external_id: Option<&str>,
    mime: Option<&str>,
) -> String {
    let ext = mime
        .and_then(extension_from_mime)
        .unwrap_or_else(|| "bin".to_string());
    format!("{}_{}.{}", kind.as_str(), external_id.unwrap_or("file"), ext)
}

/// Type and displayable content of a gateway `message` object.
/// Returns `None` when no known payload key is present.
pub fn classify_content(message: &Value, external_id: Option<&str>) -> Option<ClassifiedContent> {
    let kind = detect_message_type(message)?;

    match kind {
        MessageType::Text => {
            let content = text_at(message, "conversation")
                .or_else(|| message.get("extendedTextMessage").and_then(|m| text_at(m, "text")))
                .unwrap_or_default()
                .to_string();
            Some(ClassifiedContent {
                message_type: kind,
                content,
                file_url: None,
                file_name: None,
                mime_type: None,
            })
        }
        MessageType::Location => {
            let loc = message.get("locationMessage").cloned().unwrap_or(Value::Null);
            let described = text_at(&loc, "name").or_else(|| text_at(&loc, "address"));
            let content = match described {
                Some(text) => text.to_string(),
                None => match (
                    loc.get("degreesLatitude").and_then(Value::as_f64),
                    loc.get("degreesLongitude").and_then(Value::as_f64),
                ) {
                    (Some(lat), Some(long)) => format!("{lat},{long}"),
                    _ => placeholder(kind),
                },
            };
            Some(ClassifiedContent {
                message_type: kind,
                content,
                file_url: None,
                file_name: None,
                mime_type: None,
            })
        }
        MessageType::Contact => {
            let content = message
                .get("contactMessage")
                .and_then(|c| text_at(c, "displayName"))
                .map(str::to_string)
                .unwrap_or_else(|| placeholder(kind));
            Some(ClassifiedContent {
                message_type: kind,
                content,
                file_url: None,
                file_name: None,
                mime_type: None,
            })
        }
        _ => {
            let payload = media_payload(message, kind).cloned().unwrap_or(Value::Null);
            let mime_type = text_at(&payload, "mimetype").map(str::to_string);
            let content = text_at(&payload, "caption")
                .map(str::to_string)
                .unwrap_or_else(|| placeholder(kind));
            let file_name = text_at(&payload, "fileName")
                .or_else(|| text_at(&payload, "title"))
                .map(str::to_string)
                .unwrap_or_else(|| synthesized_file_name(kind, external_id, mime_type.as_deref()));
            Some(ClassifiedContent {
                message_type: kind,
                content,
                file_url: text_at(&payload, "url").map(str::to_string),
                file_name: Some(file_name),
                mime_type,
            })
        }
    }
}

/// A gateway report about a previously sent or received message.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub external_id: String,
    pub status: MessageStatus,
}

/// Map a gateway ack (name or numeric code) onto a message status.
pub fn map_gateway_status(raw: &Value) -> Option<MessageStatus> {
    match raw {
        Value::String(s) => match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" | "FAILED" => Some(MessageStatus::Failed),
            "SERVER_ACK" | "SENT" => Some(MessageStatus::Sent),
            "DELIVERY_ACK" | "DELIVERED" => Some(MessageStatus::Delivered),
            "READ" | "PLAYED" => Some(MessageStatus::Read),
            _ => None,
        },
        Value::Number(n) => match n.as_i64()? {
            0 => Some(MessageStatus::Failed),
            2 => Some(MessageStatus::Sent),
            3 => Some(MessageStatus::Delivered),
            4 | 5 => Some(MessageStatus::Read),
            _ => None,
        },
        _ => None,
    }
}

/// Status reports carried by a `messages.update` event; unusable items are dropped.
pub fn status_updates(event: &Value) -> Vec<StatusUpdate> {
    let Some(data) = event.get("data") else {
        return Vec::new();
    };
    let items: Vec<&Value> = match data.as_array() {
        Some(items) => items.iter().collect(),
        None => vec![data],
    };

    items
        .into_iter()
        .filter_map(|item| {
            let external_id = text_at(item, "keyId")
                .or_else(|| item.get("key").and_then(|k| text_at(k, "id")))?;
            let raw_status = item
                .get("status")
                .or_else(|| item.get("update").and_then(|u| u.get("status")))?;
            Some(StatusUpdate {
                external_id: external_id.to_string(),
                status: map_gateway_status(raw_status)?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionUpdate {
    pub status: ConnectionStatus,
    pub phone_number: Option<String>,
}

/// Connection lifecycle change carried by `connection.update` / `qrcode.updated`.
pub fn connection_update(kind: &EventKind, event: &Value) -> Option<ConnectionUpdate> {
    let data = event.get("data").cloned().unwrap_or(Value::Null);
    match kind {
        EventKind::QrcodeUpdated => Some(ConnectionUpdate {
            status: ConnectionStatus::Qr,
            phone_number: None,
        }),
        EventKind::ConnectionUpdate => {
            let status = match text_at(&data, "state")?.to_ascii_lowercase().as_str() {
                "open" => ConnectionStatus::Connected,
                "connecting" => ConnectionStatus::Connecting,
                "close" | "closed" => ConnectionStatus::Disconnected,
                "refused" => ConnectionStatus::Error,
                _ => return None,
            };
            let phone_number = if status == ConnectionStatus::Connected {
                text_at(&data, "wuid").and_then(phone_from_jid)
            } else {
                None
            };
            Some(ConnectionUpdate {
                status,
                phone_number,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn units_from_single_batch_and_array_shapes() {
        let single = json!({ "data": { "key": { "id": "A" } } });
        let batch = json!({
            "data": { "messages": [ { "key": { "id": "A" } }, { "key": { "id": "B" } } ] }
        });
        let array = json!({ "data": [ { "key": { "id": "A" } } ] });
        assert_eq!(message_units(&single).len(), 1);
        assert_eq!(message_units(&batch).len(), 2);
        assert_eq!(message_units(&array).len(), 1);
        assert!(message_units(&json!({ "data": "x" })).is_empty());
    }

    #[test]
    fn unit_accessors() {
        let unit = InboundUnit::from_value(&json!({
            "key": { "remoteJid": "5511999999999@s.whatsapp.net", "id": "MSG1", "fromMe": null },
            "pushName": "Maria",
            "message": { "conversation": "Hello" },
            "messageTimestamp": "1717000000"
        }))
        .expect("unit");
        assert!(!unit.from_me());
        assert_eq!(unit.sender_phone().as_deref(), Some("5511999999999"));
        assert_eq!(unit.external_id(), Some("MSG1"));
        assert_eq!(unit.timestamp().map(|t| t.timestamp()), Some(1_717_000_000));
        assert!(!unit.is_group());
    }

    #[test]
    fn classifies_text_and_extended_text() {
        let plain = classify_content(&json!({ "conversation": "Hello" }), None).expect("text");
        assert_eq!(plain.message_type, MessageType::Text);
        assert_eq!(plain.content, "Hello");

        let extended =
            classify_content(&json!({ "extendedTextMessage": { "text": "Link https://x" } }), None)
                .expect("text");
        assert_eq!(extended.content, "Link https://x");
    }

    #[test]
    fn media_without_caption_gets_placeholder_and_synthesized_name() {
        let classified = classify_content(
            &json!({
                "audioMessage": {
                    "url": "https://x/a.enc",
                    "mimetype": "audio/ogg; codecs=opus",
                    "ptt": true
                }
            }),
            Some("MSG7"),
        )
        .expect("audio");
        assert_eq!(classified.message_type, MessageType::Audio);
        assert_eq!(classified.content, "[audio]");
        assert_eq!(classified.file_name.as_deref(), Some("audio_MSG7.ogg"));
        assert_eq!(classified.file_url.as_deref(), Some("https://x/a.enc"));
        assert_eq!(classified.mime_type.as_deref(), Some("audio/ogg; codecs=opus"));
    }

    #[test]
    fn document_with_caption_wrapper_is_unwrapped() {
        let classified = classify_content(
            &json!({ "documentWithCaptionMessage": { "message": { "documentMessage": {
                "fileName": "invoice.pdf", "caption": "your invoice", "mimetype": "application/pdf"
            } } } }),
            Some("D1"),
        )
        .expect("document");
        assert_eq!(classified.message_type, MessageType::Document);
        assert_eq!(classified.content, "your invoice");
        assert_eq!(classified.file_name.as_deref(), Some("invoice.pdf"));
    }

    #[test]
    fn location_falls_back_to_coordinates() {
        let classified = classify_content(
            &json!({ "locationMessage": { "degreesLatitude": -23.5, "degreesLongitude": -46.6 } }),
            None,
        )
        .expect("location");
        assert_eq!(classified.content, "-23.5,-46.6");
    }

    #[test]
    fn unknown_payload_is_unclassified() {
        assert_eq!(classify_content(&json!({ "reactionMessage": {} }), None), None);
        assert_eq!(classify_content(&Value::Null, None), None);
    }

    #[test]
    fn status_updates_from_both_gateway_versions() {
        let v2 = json!({ "data": { "keyId": "MSG1", "status": "READ" } });
        assert_eq!(
            status_updates(&v2),
            vec![StatusUpdate { external_id: "MSG1".into(), status: MessageStatus::Read }]
        );

        let v1 = json!({ "data": [
            { "key": { "id": "A" }, "update": { "status": 3 } },
            { "key": { "id": "B" }, "update": { "status": 1 } }
        ] });
        assert_eq!(
            status_updates(&v1),
            vec![StatusUpdate { external_id: "A".into(), status: MessageStatus::Delivered }]
        );
    }

    #[test]
    fn connection_open_records_phone() {
        let event = json!({ "data": { "state": "open", "wuid": "5511912345678@s.whatsapp.net" } });
        let update = connection_update(&EventKind::ConnectionUpdate, &event).expect("update");
        assert_eq!(update.status, ConnectionStatus::Connected);
        assert_eq!(update.phone_number.as_deref(), Some("5511912345678"));

        let qr = connection_update(&EventKind::QrcodeUpdated, &json!({})).expect("qr");
        assert_eq!(qr.status, ConnectionStatus::Qr);
        assert_eq!(connection_update(&EventKind::MessagesUpsert, &event), None);
    }
}
