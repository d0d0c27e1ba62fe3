//! Error types for transactional sessions.
//!
//! All fallible operations return [`DbResult`]. Protocol violations
//! (`AlreadyInTransaction`, `NotInTransaction`, `ConnectorExhausted`) are
//! programmer errors and are never retried. `Rollback` and `Cleanup` are fatal
//! to the session that produced them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Failed to open physical connection: {message}")]
    Open {
        message: String,
        #[source]
        source: Option<Box<DbError>>,
    },

    #[error("Incompatible driver '{driver}': missing capabilities [{}]", .missing.join(", "))]
    IncompatibleDriver {
        driver: String,
        missing: Vec<&'static str>,
    },

    #[error("Already inside a session transaction")]
    AlreadyInTransaction,

    #[error("Not inside a session transaction")]
    NotInTransaction,

    #[error("Lease cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Cleanup '{action}' failed: {source}")]
    Cleanup {
        action: &'static str,
        #[source]
        source: Box<DbError>,
    },

    #[error("Rolling back the outer transaction failed: {source}")]
    Rollback {
        #[source]
        source: Box<DbError>,
    },

    #[error("Session unavailable: the physical connection was lost after a fatal error")]
    SessionUnavailable,

    #[error("Connector already used: a lease is backed by exactly one connection")]
    ConnectorExhausted,

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create an open error wrapping the underlying cause.
    pub fn open(source: DbError) -> Self {
        Self::Open {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an incompatible driver error.
    pub fn incompatible_driver(driver: impl Into<String>, missing: Vec<&'static str>) -> Self {
        Self::IncompatibleDriver {
            driver: driver.into(),
            missing,
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Wrap a driver error raised while running a cleanup action.
    pub fn cleanup(action: &'static str, source: DbError) -> Self {
        Self::Cleanup {
            action,
            source: Box::new(source),
        }
    }

    /// Wrap a driver error raised while rolling back the outer transaction.
    pub fn rollback(source: DbError) -> Self {
        Self::Rollback {
            source: Box::new(source),
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Errors caused by misuse of the session protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInTransaction | Self::NotInTransaction | Self::ConnectorExhausted
        )
    }

    /// Errors after which the physical connection must be presumed poisoned.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Rollback { .. } | Self::Cleanup { .. } | Self::SessionUnavailable
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => {
                DbError::connection(format!("Invalid configuration: {}", msg))
            }
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::database("No rows returned", None),
            sqlx::Error::PoolTimedOut => DbError::connection("Connection acquire timed out"),
            sqlx::Error::PoolClosed => DbError::connection("Connection pool is closed"),
            sqlx::Error::Io(io_err) => DbError::connection(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DbError::connection(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => DbError::connection(format!("Protocol error: {}", msg)),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::database(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for session operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("refused");
        assert!(err.to_string().contains("Connection error"));
    }

    #[test]
    fn test_incompatible_driver_lists_missing_capabilities() {
        let err = DbError::incompatible_driver("odbc", vec!["ping", "close"]);
        assert_eq!(
            err.to_string(),
            "Incompatible driver 'odbc': missing capabilities [ping, close]"
        );
    }

    #[test]
    fn test_protocol_violations() {
        assert!(DbError::AlreadyInTransaction.is_protocol_violation());
        assert!(DbError::NotInTransaction.is_protocol_violation());
        assert!(DbError::ConnectorExhausted.is_protocol_violation());
        assert!(!DbError::cancelled("deadline").is_protocol_violation());
    }

    #[test]
    fn test_fatal_errors() {
        let cleanup = DbError::cleanup("reset-sequences", DbError::database("boom", None));
        let rollback = DbError::rollback(DbError::connection("reset"));
        assert!(cleanup.is_fatal());
        assert!(rollback.is_fatal());
        assert!(!DbError::NotInTransaction.is_fatal());
    }

    #[test]
    fn test_cleanup_error_keeps_source() {
        use std::error::Error as _;

        let err = DbError::cleanup(
            "reset-auto-increment",
            DbError::database("table is locked", Some("HY000".to_string())),
        );
        assert!(err.to_string().contains("reset-auto-increment"));
        let source = err.source().map(|s| s.to_string()).unwrap_or_default();
        assert!(source.contains("table is locked"));
    }

    #[test]
    fn test_open_wraps_cause() {
        let err = DbError::open(DbError::connection("connection refused"));
        assert!(matches!(err, DbError::Open { .. }));
        assert!(err.to_string().contains("connection refused"));
    }
}
