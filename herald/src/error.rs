//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether a delivery attempt that failed with this error may be retried.
    ///
    /// Misconfiguration and malformed records will fail the same way on every
    /// attempt, so they go straight to `FAILED`.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Configuration(_)
                | Self::Validation(_)
                | Self::TemplateNotFound(_)
                | Self::Serialization(_)
                | Self::InvalidStateTransition { .. }
                | Self::NotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::transport("connection reset").is_retryable());
        assert!(Error::Other("provider timeout".to_string()).is_retryable());
        assert!(!Error::config("missing api key").is_retryable());
        assert!(!Error::TemplateNotFound("welcome".to_string()).is_retryable());
        assert!(!Error::invalid_transition("SENT", "PROCESSING").is_retryable());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = Error::invalid_transition("FAILED", "PENDING");
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot transition from FAILED to PENDING"
        );
    }
}
