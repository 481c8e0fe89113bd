use serde::Serialize;
use uuid::Uuid;

/// Identity and tracing data threaded explicitly through every core call.
#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub correlation_id: String,
}

impl RequestContext {
    /// Fresh context with a generated correlation id and no identity.
    pub fn new() -> Self {
        Self {
            tenant_id: None,
            user_id: None,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Use a caller-supplied correlation id when it is non-blank.
    pub fn with_correlation_id(mut self, correlation_id: Option<&str>) -> Self {
        if let Some(id) = correlation_id.map(str::trim).filter(|id| !id.is_empty()) {
            self.correlation_id = id.to_string();
        }
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<&str>) -> Self {
        self.tenant_id = tenant_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        self
    }

    pub fn with_user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
