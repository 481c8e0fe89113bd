/// Mask a secret value for safe display in logs.
/// Shows first 4 and last 4 chars, the rest as `****`.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        "****".to_string()
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}****{tail}")
    }
}

/// Mask a phone number for logs: keep a 4-digit prefix only.
pub fn mask_phone(phone: &str) -> String {
    let prefix: String = phone.chars().take(4).collect();
    if prefix.is_empty() {
        String::new()
    } else {
        format!("{prefix}****")
    }
}
