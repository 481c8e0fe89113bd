/// Extension → MIME type table used when the caller gives no MIME type.
const EXTENSION_MIME: [(&str, &str); 26] = [
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("mp4", "video/mp4"),
    ("3gp", "video/3gpp"),
    ("mov", "video/quicktime"),
    ("webm", "video/webm"),
    ("mp3", "audio/mpeg"),
    ("ogg", "audio/ogg"),
    ("opus", "audio/ogg"),
    ("m4a", "audio/mp4"),
    ("aac", "audio/aac"),
    ("wav", "audio/wav"),
    ("pdf", "application/pdf"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("xls", "application/vnd.ms-excel"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("ppt", "application/vnd.ms-powerpoint"),
    ("pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("zip", "application/zip"),
    ("json", "application/json"),
];

/// Lowercased extension of a file name or URL path, ignoring query and fragment.
pub fn extension_of(name_or_url: &str) -> Option<String> {
    let path = name_or_url
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let file = path.rsplit('/').next().unwrap_or_default();
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn mime_from_extension(ext: &str) -> Option<&'static str> {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    EXTENSION_MIME
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
}

/// MIME type for a file, trying the file name first, then the URL.
pub fn infer_mime(file_name: Option<&str>, file_url: Option<&str>) -> Option<&'static str> {
    file_name
        .and_then(extension_of)
        .and_then(|ext| mime_from_extension(&ext))
        .or_else(|| {
            file_url
                .and_then(extension_of)
                .and_then(|ext| mime_from_extension(&ext))
        })
}

/// File extension for a MIME type; falls back to the MIME subtype.
pub fn extension_from_mime(mime: &str) -> Option<String> {
    let essence = mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    if let Some((ext, _)) = EXTENSION_MIME.iter().find(|(_, known)| *known == essence) {
        return Some((*ext).to_string());
    }
    let subtype = essence.split('/').nth(1)?;
    let subtype = subtype.rsplit('.').next().unwrap_or(subtype);
    let cleaned: String = subtype
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_ignores_query_string() {
        assert_eq!(
            extension_of("https://cdn.example.com/a/b/report.PDF?sig=abc").as_deref(),
            Some("pdf")
        );
        assert_eq!(extension_of("https://cdn.example.com/noext"), None);
        assert_eq!(extension_of(".hidden"), None);
    }

    #[test]
    fn infers_from_name_then_url() {
        assert_eq!(infer_mime(Some("photo.jpg"), None), Some("image/jpeg"));
        assert_eq!(
            infer_mime(Some("unknown.xyz"), Some("https://x/clip.mp4")),
            Some("video/mp4")
        );
        assert_eq!(infer_mime(Some("data.bin"), None), None);
    }

    #[test]
    fn mime_to_extension() {
        assert_eq!(extension_from_mime("audio/ogg; codecs=opus").as_deref(), Some("ogg"));
        assert_eq!(extension_from_mime("image/jpeg").as_deref(), Some("jpg"));
        assert_eq!(extension_from_mime("application/x-custom").as_deref(), Some("xcustom"));
        assert_eq!(extension_from_mime("garbage"), None);
    }
}
