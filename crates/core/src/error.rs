use thiserror::Error;

pub type AutohealResult<T> = Result<T, AutohealError>;

#[derive(Error, Debug)]
pub enum AutohealError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Validation rejected: {0}")]
    Validation(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Rollback failed: {0}")]
    Rollback(String),

    #[error("Approval expired for plan {0}")]
    ApprovalExpired(String),

    #[error("External collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AutohealError {
    /// Refusals that are guaranteed to have produced no side effect.
    pub fn is_side_effect_free(&self) -> bool {
        matches!(
            self,
            AutohealError::InsufficientData(_)
                | AutohealError::Validation(_)
                | AutohealError::ApprovalExpired(_)
                | AutohealError::NotFound(_)
        )
    }
}
