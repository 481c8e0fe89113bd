use thiserror::Error;

/// Errors surfaced to callers of the outbound path. Each variant maps to a
/// stable machine-readable code via [`RouteError::code`].
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Workspace mismatch: {0}")]
    WorkspaceMismatch(String),

    #[error("Missing connection: {0}")]
    MissingConnection(String),

    #[error("Gateway instance not resolved for conversation {conversation_id}")]
    InstanceNotResolved { conversation_id: String },

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl RouteError {
    pub fn code(&self) -> &'static str {
        match self {
            RouteError::Validation(_) => "VALIDATION_ERROR",
            RouteError::NotFound(_) => "NOT_FOUND",
            RouteError::WorkspaceMismatch(_) => "WORKSPACE_MISMATCH",
            RouteError::MissingConnection(_) | RouteError::InstanceNotResolved { .. } => {
                "MISSING_CONNECTION"
            }
            RouteError::Dispatch(_) => "N8N_ROUTING_ERROR",
            RouteError::Database(_) => "DATABASE_ERROR",
            RouteError::Unexpected(_) => "UNEXPECTED_ERROR",
        }
    }

    pub fn database(err: anyhow::Error) -> Self {
        RouteError::Database(format!("{err:#}"))
    }
}
