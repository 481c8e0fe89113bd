use serde::Serialize;
use serde_json::Value;
use std::time::SystemTime;
use tracing::info;

#[derive(Serialize)]
pub struct AuditEvent {
    pub timestamp: u64,
    pub event_type: String,
    pub correlation_id: String,
    pub details: Value,
}

/// Emit one JSON line on the `audit` target. The binary routes this target
/// to the rolling audit file instead of stdout.
pub fn log_audit(event_type: &str, correlation_id: &str, details: Value) {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    let event = AuditEvent {
        timestamp: now,
        event_type: event_type.to_string(),
        correlation_id: correlation_id.to_string(),
        details,
    };

    if let Ok(json_str) = serde_json::to_string(&event) {
        info!(target: "audit", "{}", json_str);
    }
}
