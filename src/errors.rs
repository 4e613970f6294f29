//! # Engine Errors
//!
//! Error types for the subscription engine.

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Subscription engine errors
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    // ==================
    // Configuration Errors
    // ==================
    /// No publication registered under this name
    #[error("Unknown publication: {0}")]
    UnknownPublication(String),

    /// Requested kind does not match the registered publication
    #[error("Publication kind mismatch for '{name}': requested {requested}, registered {registered}")]
    KindMismatch {
        name: String,
        requested: String,
        registered: String,
    },

    /// The publication's query configuration refused this subscriber's args
    #[error("Subscription refused by publication '{0}'")]
    Refused(String),

    /// Per-connection subscription limit reached
    #[error("Too many subscriptions (max: {0})")]
    TooManySubscriptions(usize),

    // ==================
    // Fetch Errors
    // ==================
    /// A publication's fetch function failed
    #[error("Fetch failed for publication '{publication}': {message}")]
    Fetch {
        publication: String,
        message: String,
    },

    // ==================
    // Internal Errors
    // ==================
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a fetch error for a publication
    pub fn fetch(publication: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            publication: publication.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::UnknownPublication("todos".to_string());
        assert_eq!(err.to_string(), "Unknown publication: todos");

        let err = EngineError::KindMismatch {
            name: "todos".to_string(),
            requested: "object".to_string(),
            registered: "map".to_string(),
        };
        assert!(err.to_string().contains("requested object"));
        assert!(err.to_string().contains("registered map"));
    }

    #[test]
    fn test_fetch_error_helper() {
        let err = EngineError::fetch("todos", "store unavailable");
        assert_eq!(
            err.to_string(),
            "Fetch failed for publication 'todos': store unavailable"
        );
    }
}
