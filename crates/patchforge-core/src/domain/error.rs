//! Domain-level error taxonomy for Patchforge core.

/// Patchforge core errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid finding: {0}")]
    InvalidFinding(String),

    #[error("patch not found: {0}")]
    PatchNotFound(String),

    #[error("finding not found for {0}")]
    FindingNotFound(String),

    #[error("invalid patch status transition: {from} -> {to} ({reason})")]
    InvalidStatusTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type for Patchforge core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
