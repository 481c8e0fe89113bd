use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use zaproute_core::types::MessageType;

use crate::metadata::phone_from_jid;
use crate::mime::infer_mime;

#[derive(Debug, Error, PartialEq)]
pub enum EncodeError {
    #[error("message type '{0}' cannot be sent through the gateway")]
    Unsupported(&'static str),
    #[error("{0} messages require a file url")]
    MissingFile(&'static str),
    #[error("text message has no content")]
    EmptyText,
    #[error("recipient jid '{0}' has no phone number")]
    InvalidRecipient(String),
}

/// Generic outbound message as the CRM describes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundContent {
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SenderDisplay {
    pub name: Option<String>,
}

/// Content that only marks "no caption" and must not reach the contact.
pub fn is_placeholder_caption(content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    if lowered == "no caption" || lowered == "sem legenda" {
        return true;
    }
    trimmed.starts_with('[')
        && trimmed.ends_with(']')
        && !trimmed[1..trimmed.len() - 1].trim().is_empty()
        && !trimmed[1..trimmed.len() - 1].contains(char::is_whitespace)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Caller's MIME type if given, else inferred from the file extension.
pub fn resolve_mime(message: &OutboundContent) -> Option<String> {
    non_blank(message.mime_type.as_deref())
        .map(str::to_string)
        .or_else(|| {
            infer_mime(message.file_name.as_deref(), message.file_url.as_deref())
                .map(str::to_string)
        })
}

fn payload_key(kind: MessageType) -> Result<&'static str, EncodeError> {
    match kind {
        MessageType::Text => Ok("conversation"),
        MessageType::Image => Ok("imageMessage"),
        MessageType::Video => Ok("videoMessage"),
        MessageType::Audio => Ok("audioMessage"),
        MessageType::Document => Ok("documentMessage"),
        MessageType::Sticker => Ok("stickerMessage"),
        other => Err(EncodeError::Unsupported(other.as_str())),
    }
}

/// Translate a generic message into the gateway envelope whose `message`
/// object has exactly one key, matching the message type.
pub fn encode_outbound(
    message: &OutboundContent,
    remote_jid: &str,
    sender: &SenderDisplay,
) -> Result<Value, EncodeError> {
    let key = payload_key(message.message_type)?;

    let payload = if message.message_type == MessageType::Text {
        let text = message.content.trim();
        if text.is_empty() {
            return Err(EncodeError::EmptyText);
        }
        Value::String(text.to_string())
    } else {
        let url = non_blank(message.file_url.as_deref())
            .ok_or(EncodeError::MissingFile(message.message_type.as_str()))?;

        let mut media = Map::new();
        media.insert("url".to_string(), json!(url));
        if let Some(mime) = resolve_mime(message) {
            media.insert("mimetype".to_string(), json!(mime));
        }

        let carries_name = matches!(
            message.message_type,
            MessageType::Image | MessageType::Video | MessageType::Document | MessageType::Audio
        );
        if carries_name {
            if let Some(name) = non_blank(message.file_name.as_deref()) {
                media.insert("fileName".to_string(), json!(name));
            }
        }

        let carries_caption = matches!(
            message.message_type,
            MessageType::Image | MessageType::Video | MessageType::Document
        );
        if carries_caption && !is_placeholder_caption(&message.content) {
            media.insert("caption".to_string(), json!(message.content.trim()));
        }

        if message.message_type == MessageType::Audio {
            media.insert("ptt".to_string(), json!(true));
        }

        Value::Object(media)
    };

    let mut body = Map::new();
    body.insert(key.to_string(), payload);

    Ok(json!({
        "key": { "remoteJid": remote_jid, "fromMe": true },
        "pushName": sender.name,
        "messageType": key,
        "message": Value::Object(body),
    }))
}

/// REST call on the gateway that delivers an encoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    /// Path below the gateway base URL, without the instance segment.
    pub endpoint: &'static str,
    pub body: Value,
}

/// Map an envelope onto the gateway's send endpoints.
pub fn to_gateway_request(envelope: &Value) -> Result<GatewayRequest, EncodeError> {
    let remote_jid = envelope["key"]["remoteJid"].as_str().unwrap_or_default();
    let number = if remote_jid.ends_with("@g.us") {
        Some(remote_jid.to_string())
    } else {
        phone_from_jid(remote_jid)
    }
    .ok_or_else(|| EncodeError::InvalidRecipient(remote_jid.to_string()))?;

    let message = &envelope["message"];
    if let Some(text) = message.get("conversation").and_then(Value::as_str) {
        return Ok(GatewayRequest {
            endpoint: "message/sendText",
            body: json!({ "number": number, "text": text }),
        });
    }
    if let Some(audio) = message.get("audioMessage") {
        return Ok(GatewayRequest {
            endpoint: "message/sendWhatsAppAudio",
            body: json!({ "number": number, "audio": audio["url"] }),
        });
    }
    if let Some(sticker) = message.get("stickerMessage") {
        return Ok(GatewayRequest {
            endpoint: "message/sendSticker",
            body: json!({ "number": number, "sticker": sticker["url"] }),
        });
    }

    let (mediatype, media) = [
        ("image", "imageMessage"),
        ("video", "videoMessage"),
        ("document", "documentMessage"),
    ]
    .into_iter()
    .find_map(|(kind, key)| message.get(key).map(|m| (kind, m)))
    .ok_or(EncodeError::Unsupported("unknown"))?;

    let mut body = json!({
        "number": number,
        "mediatype": mediatype,
        "media": media["url"],
    });
    for (from, to) in [("mimetype", "mimetype"), ("caption", "caption"), ("fileName", "fileName")] {
        if let Some(value) = media.get(from) {
            body[to] = value.clone();
        }
    }

    Ok(GatewayRequest {
        endpoint: "message/sendMedia",
        body,
    })
}
