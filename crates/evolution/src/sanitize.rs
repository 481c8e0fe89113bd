use serde_json::{Map, Value};

/// Thumbnails longer than this many characters are replaced.
pub const MAX_THUMBNAIL_CHARS: usize = 1024;
pub const THUMBNAIL_PLACEHOLDER: &str = "[thumbnail removed]";

const MEDIA_KEYS: [&str; 6] = [
    "imageMessage",
    "videoMessage",
    "audioMessage",
    "documentMessage",
    "stickerMessage",
    "documentWithCaptionMessage",
];

const THUMBNAIL_KEYS: [&str; 2] = ["jpegThumbnail", "thumbnail"];

/// Copy of `event` with embedded base64 payloads removed and oversized
/// thumbnails replaced. The input is left untouched and dropped payloads are
/// never copied.
pub fn sanitize_event(event: &Value) -> Value {
    filtered(event, None)
}

fn filtered(value: &Value, parent_key: Option<&str>) -> Value {
    match value {
        Value::Object(map) => Value::Object(filtered_object(map, parent_key)),
        Value::Array(items) => Value::Array(items.iter().map(|v| filtered(v, None)).collect()),
        other => other.clone(),
    }
}

fn filtered_object(map: &Map<String, Value>, parent_key: Option<&str>) -> Map<String, Value> {
    // `message.base64` sits next to the media key when the gateway inlines files.
    let drop_base64 = matches!(parent_key, Some("message"))
        || parent_key.is_some_and(|key| MEDIA_KEYS.contains(&key))
        || MEDIA_KEYS.iter().any(|key| map.contains_key(*key));

    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        if drop_base64 && key == "base64" {
            continue;
        }
        let oversized_thumbnail = THUMBNAIL_KEYS.contains(&key.as_str())
            && matches!(
                value,
                Value::String(thumb) if thumb.chars().count() > MAX_THUMBNAIL_CHARS
            );
        let copied = if oversized_thumbnail {
            Value::String(THUMBNAIL_PLACEHOLDER.to_string())
        } else {
            filtered(value, Some(key))
        };
        out.insert(key.clone(), copied);
    }
    out
}
