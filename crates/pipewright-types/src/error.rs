use thiserror::Error;

/// Errors from state store operations (used by the `StateStore` trait in
/// pipewright-core).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The snapshot exists but cannot be trusted.
    #[error("corrupt state snapshot for '{workflow_id}': {reason}")]
    Corrupt { workflow_id: String, reason: String },

    #[error("internal store error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
