//! Error types for the pool facade.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Errors fall into four classes: validation (bad input, raised before a connection
//! is touched), acquisition (the pool could not hand out a connection), execution
//! (raised by the database or by result-shape checks) and internal failures.

use crate::config::DEFAULT_ACQUIRE_TIMEOUT_SECS;
use sqlx::mysql::MySqlDatabaseError;
use std::time::Duration;
use thiserror::Error;

/// SQLSTATE for `serialization_failure`.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE for `deadlock_detected`.
pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

/// MySQL error numbers that abort the current transaction and are safe to retry:
/// `ER_LOCK_DEADLOCK` and `ER_LOCK_WAIT_TIMEOUT`.
const MYSQL_RETRYABLE_ERRORS: &[u16] = &[1213, 1205];

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid query: {message}")]
    Validation { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Connection pool is shutting down")]
    PoolShuttingDown,

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "40001" for serialization failure
        sql_state: Option<String>,
        /// Vendor error number (MySQL reports its retryable errors only here)
        error_number: Option<u16>,
        suggestion: String,
    },

    #[error("Query returned no rows")]
    NotFound,

    #[error("Data integrity error: {message}")]
    DataIntegrity { message: String },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            error_number: None,
            suggestion: suggestion.into(),
        }
    }

    /// Attach the vendor error number to a database error.
    pub fn with_error_number(mut self, number: u16) -> Self {
        if let Self::Database { error_number, .. } = &mut self {
            *error_number = Some(number);
        }
        self
    }

    /// Create a data integrity error.
    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self::DataIntegrity {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// SQLSTATE (or vendor error code) reported by the database, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Check if this error aborted a transaction in a way that makes
    /// re-running the whole transaction safe.
    pub fn is_transaction_retryable(&self) -> bool {
        let Self::Database {
            sql_state,
            error_number,
            ..
        } = self
        else {
            return false;
        };
        matches!(
            sql_state.as_deref(),
            Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_DEADLOCK_DETECTED)
        ) || error_number.is_some_and(|n| MYSQL_RETRYABLE_ERRORS.contains(&n))
    }

    /// Vendor error number reported by the database, if any.
    pub fn error_number(&self) -> Option<u16> {
        match self {
            Self::Database { error_number, .. } => *error_number,
            _ => None,
        }
    }

    /// Whether the connection that raised this error can no longer be trusted
    /// and must be discarded instead of returned to the pool.
    pub fn breaks_connection(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                // MySQL's code() is the SQLSTATE; deadlock and lock-wait
                // timeouts are only distinguishable by error number.
                let number = db_err
                    .try_downcast_ref::<MySqlDatabaseError>()
                    .map(MySqlDatabaseError::number);
                let mut err = DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                );
                if let Some(number) = number {
                    err = err.with_error_number(number);
                }
                if err.is_transaction_retryable() {
                    if let DbError::Database { suggestion, .. } = &mut err {
                        *suggestion = "Retry the transaction".to_string();
                    }
                }
                err
            }
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::PoolTimedOut => DbError::timeout(
                "connection pool acquire",
                Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            ),
            sqlx::Error::PoolClosed => DbError::PoolShuttingDown,
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::internal(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
