use thiserror::Error;

use crate::kv::KvError;

/// Result type for tenant store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Tagged outcome of a failed storage operation.
///
/// Callers branch on the variant; the message is only meant for humans.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced project, endpoint or key does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller supplied malformed input
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A quota was reached or a unique value is already taken
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend failed or did not answer before the deadline
    #[error("internal storage error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<KvError> for StoreError {
    fn from(err: KvError) -> Self {
        StoreError::Internal(err.to_string())
    }
}
