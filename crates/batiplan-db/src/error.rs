//! # Database Error Types
//!
//! Error types for database operations and for the service built on them.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)       CoreError (batiplan-core)             │
//! │       │                                │                                │
//! │       ▼                                ▼                                │
//! │  DbError (this module) ← Adds context; domain errors pass through       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  API collaborator: DbError::code() + field() for the message            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use batiplan_core::{CoreError, ValidationError};
use thiserror::Error;

/// Database operation errors.
///
/// These errors wrap sqlx errors and the domain errors raised while a
/// repository or service call runs.
#[derive(Debug, Error)]
pub enum DbError {
    /// Entity not found in database.
    ///
    /// ## When This Occurs
    /// - `fetch_one` returns no rows
    /// - ID doesn't exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - Inserting a duplicate DQE reference
    /// - Creating a second project for the same DQE
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// Foreign key constraint violation.
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file doesn't exist and can't be created
    /// - File permissions issue
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Transaction failed.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// The stored row changed since it was loaded.
    ///
    /// ## When This Occurs
    /// - Two editors saved the same DQE; the second save lost the race
    #[error("{entity} {id} was modified concurrently (expected version {expected})")]
    VersionConflict {
        entity: String,
        id: String,
        expected: i64,
    },

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),

    /// A domain rule rejected the operation.
    #[error(transparent)]
    Domain(#[from] CoreError),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a UniqueViolation error.
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Machine-readable code, stable across message wording changes.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::NotFound { .. } => "not_found",
            DbError::UniqueViolation { .. } => "unique_violation",
            DbError::ForeignKeyViolation { .. } => "foreign_key_violation",
            DbError::ConnectionFailed(_) => "connection_failed",
            DbError::MigrationFailed(_) => "migration_failed",
            DbError::QueryFailed(_) => "query_failed",
            DbError::TransactionFailed(_) => "transaction_failed",
            DbError::VersionConflict { .. } => "version_conflict",
            DbError::PoolExhausted => "pool_exhausted",
            DbError::Internal(_) => "internal",
            DbError::Domain(err) => match err {
                CoreError::NotFound { .. } => "not_found",
                CoreError::InvalidState { .. } => "invalid_state",
                CoreError::ImmutableState { .. } => "immutable_state",
                CoreError::AlreadyConverted { .. } => "already_converted",
                CoreError::NotConvertible { .. } => "not_convertible",
                CoreError::Validation(_) => "validation",
            },
        }
    }

    /// Offending input field, for field-level messages.
    pub fn field(&self) -> Option<&str> {
        match self {
            DbError::Domain(CoreError::Validation(err)) => err.field(),
            _ => None,
        }
    }
}

impl From<ValidationError> for DbError {
    fn from(err: ValidationError) -> Self {
        DbError::Domain(CoreError::Validation(err))
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → Analyze message for constraint type
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // UNIQUE constraint: "UNIQUE constraint failed: <table>.<column>"
                // FK constraint: "FOREIGN KEY constraint failed"
                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(DbError::not_found("DQE", "x").code(), "not_found");
        let err: DbError = CoreError::AlreadyConverted {
            dqe_id: "d".to_string(),
            project_id: None,
        }
        .into();
        assert_eq!(err.code(), "already_converted");
    }

    #[test]
    fn test_validation_field_passes_through() {
        let err: DbError = ValidationError::Required {
            field: "designation".to_string(),
        }
        .into();
        assert_eq!(err.code(), "validation");
        assert_eq!(err.field(), Some("designation"));
        assert_eq!(DbError::PoolExhausted.field(), None);
    }
}
