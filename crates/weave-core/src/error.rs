use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, WeaveError>;

#[derive(Debug, Error)]
pub enum WeaveError {
    #[error("Storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage operation error: {0}")]
    StorageOperation(#[from] redb::StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Episode not found: {0}")]
    EpisodeNotFound(Uuid),

    #[error("Entity not found: {0}")]
    EntityNotFound(Uuid),

    #[error("Edge not found: {0}")]
    EdgeNotFound(Uuid),

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Malformed model output: {0}")]
    BadLlmOutput(String),

    #[error("Retries exhausted after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal invariant violation: {0}")]
    Internal(String),
}

/// Coarse error classification used for retry decisions and the
/// HTTP status mapping at the server edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    RateLimited,
    Transient,
    BadLlmOutput,
    Exhausted,
    Cancelled,
    Internal,
}

/// Which backoff schedule applies to a retryable error.
/// Provider errors back off slowly (the provider told us to);
/// store blips recover on a much shorter schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Provider,
    Store,
}

impl WeaveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WeaveError::Validation(_) => ErrorKind::Validation,
            WeaveError::EpisodeNotFound(_)
            | WeaveError::EntityNotFound(_)
            | WeaveError::EdgeNotFound(_) => ErrorKind::NotFound,
            WeaveError::RateLimited(_) => ErrorKind::RateLimited,
            WeaveError::Transient(_) => ErrorKind::Transient,
            WeaveError::BadLlmOutput(_) => ErrorKind::BadLlmOutput,
            WeaveError::Exhausted { .. } => ErrorKind::Exhausted,
            WeaveError::Cancelled => ErrorKind::Cancelled,
            WeaveError::Internal(_) => ErrorKind::Internal,
            // Store-level faults surface as transient: the queue retries
            // them on the short schedule and reports exhaustion if they
            // persist.
            WeaveError::Storage(_)
            | WeaveError::Database(_)
            | WeaveError::Table(_)
            | WeaveError::Transaction(_)
            | WeaveError::Commit(_)
            | WeaveError::StorageOperation(_)
            | WeaveError::Serialization(_) => ErrorKind::Transient,
        }
    }

    /// Returns the retry schedule for this error, or `None` if it must
    /// not be retried (`bad_llm_output`, validation, cancellation, ...).
    pub fn retry_class(&self) -> Option<RetryClass> {
        match self {
            WeaveError::RateLimited(_) | WeaveError::Transient(_) => Some(RetryClass::Provider),
            WeaveError::Storage(_)
            | WeaveError::Database(_)
            | WeaveError::Table(_)
            | WeaveError::Transaction(_)
            | WeaveError::Commit(_)
            | WeaveError::StorageOperation(_) => Some(RetryClass::Store),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_provider_retryable() {
        let err = WeaveError::RateLimited("429".into());
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_class(), Some(RetryClass::Provider));
    }

    #[test]
    fn bad_output_is_never_retried() {
        let err = WeaveError::BadLlmOutput("missing field".into());
        assert_eq!(err.retry_class(), None);
    }

    #[test]
    fn cancellation_is_terminal() {
        assert_eq!(WeaveError::Cancelled.retry_class(), None);
        assert_eq!(WeaveError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
