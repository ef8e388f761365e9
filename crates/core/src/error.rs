/// Domain-level error shared by every crate in the workspace.
///
/// Each variant maps to a stable error code via [`CoreError::code`] so that
/// callers (HTTP layers, CLIs, tests) can branch on the kind of failure
/// without parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a missing job.
    pub fn job_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "job",
            id: id.into(),
        }
    }

    /// Shorthand for a missing webhook subscription.
    pub fn webhook_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "webhook",
            id: id.into(),
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
