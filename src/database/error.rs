//! Storage error type shared by all repositories

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("database failure: {message}")]
    Query { message: String, retryable: bool },
}

impl DatabaseError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        DatabaseError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Map a sqlx error, surfacing unique-key violations distinctly so
    /// callers can translate them into duplicate-id validation errors.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return DatabaseError::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                };
            }
        }
        let retryable = matches!(
            err,
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
        );
        DatabaseError::Query {
            message: err.to_string(),
            retryable,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, DatabaseError::UniqueViolation { .. })
    }
}
