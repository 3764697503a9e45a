use thiserror::Error;

/// Errors from repository operations (used by the storage port in cascade-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

impl RepositoryError {
    /// Whether the failure came from the storage backend being unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(self, RepositoryError::Connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_conflict_display() {
        let err = RepositoryError::Conflict("run already completed".to_string());
        assert_eq!(err.to_string(), "conflict: run already completed");
        assert!(!err.is_connection());
        assert!(RepositoryError::Connection.is_connection());
    }
}
