//! Error types for the data-access layer.
//!
//! Driver failures are classified once, at the query executor boundary, into a
//! small set of stable kinds. Code above that boundary only ever sees
//! [`DbError::NotFound`], [`DbError::DuplicateKey`] or a passthrough
//! [`DbError::Execution`], plus the transaction-level failures produced by the
//! [`Transactor`](crate::db::Transactor).

use thiserror::Error;

/// SQLSTATE for a unique index or unique constraint violation (PostgreSQL).
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// Extended result codes for `SQLITE_CONSTRAINT_UNIQUE` and `SQLITE_CONSTRAINT_PRIMARYKEY`.
const SQLITE_UNIQUE: &str = "2067";
const SQLITE_PRIMARY_KEY: &str = "1555";

#[derive(Error, Debug)]
pub enum DbError {
    /// A query that required a row matched none.
    #[error("not found")]
    NotFound,

    /// A write was rejected by a unique constraint. Wraps the driver error.
    #[error("duplicate key: {0}")]
    DuplicateKey(#[source] sqlx::Error),

    /// Any other driver failure, passed through unchanged.
    #[error(transparent)]
    Execution(sqlx::Error),

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("begin transaction: {0}")]
    Begin(#[source] sqlx::Error),

    #[error("committing tx: {0}")]
    Commit(#[source] sqlx::Error),

    /// Rollback failed while handling another error. Carries both.
    #[error("rollback error: {source}, rollback cause: {cause}")]
    Rollback {
        source: sqlx::Error,
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("panic recovered: {message}")]
    PanicRecovered { message: String, stack: String },

    #[error("Timeout: {operation} exceeded the session deadline")]
    Timeout { operation: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
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

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }

    /// The underlying driver error for classified and passthrough failures.
    pub fn driver_error(&self) -> Option<&sqlx::Error> {
        match self {
            Self::DuplicateKey(err)
            | Self::Execution(err)
            | Self::Begin(err)
            | Self::Commit(err)
            | Self::Rollback { source: err, .. } => Some(err),
            _ => None,
        }
    }

    /// The error that triggered a failed rollback.
    pub fn rollback_cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Rollback { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }
}

/// Map a driver failure to its domain kind.
///
/// Evaluated in order: no rows, unique violation, passthrough.
pub fn classify(err: sqlx::Error) -> DbError {
    if matches!(err, sqlx::Error::RowNotFound) {
        return DbError::NotFound;
    }
    if is_unique_violation(&err) {
        return DbError::DuplicateKey(err);
    }
    DbError::Execution(err)
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation()
                || matches!(
                    db_err.code().as_deref(),
                    Some(PG_UNIQUE_VIOLATION | SQLITE_UNIQUE | SQLITE_PRIMARY_KEY)
                )
        }
        _ => false,
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        classify(err)
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
