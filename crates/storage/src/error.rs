//! Storage error types and result alias.
//!
//! Every database adapter maps its driver errors onto [`StorageError`]. The
//! auth layer wraps these verbatim, so callers never see driver types.
//!
//! # Error Types
//!
//! - [`StorageError::NoRows`] - A single-row query matched nothing
//! - [`StorageError::MissingColumn`] / [`StorageError::TypeMismatch`] - Row shape errors
//! - [`StorageError::SizeLimitExceeded`] - A key exceeded its column width
//! - [`StorageError::Conflict`] - Serialization failure or unique violation
//! - [`StorageError::Connection`] - Network, pool or connection failures
//! - [`StorageError::Serialization`] - Data encoding/decoding failures
//! - [`StorageError::Internal`] - Backend-specific internal errors
//! - [`StorageError::Timeout`] - Operation exceeded its time limit
//!
//! # Example
//!
//! ```
//! use touno_core_storage::{StorageError, StorageResult};
//!
//! fn lookup(found: bool) -> StorageResult<u64> {
//!     if found { Ok(1) } else { Err(StorageError::no_rows()) }
//! }
//!
//! assert!(lookup(false).unwrap_err().is_no_rows());
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Errors preserve their source chain via the `#[source]` attribute, so
/// structured logging can print the full driver context.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match expressions
/// must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A query that must return exactly one row returned none.
    #[error("No rows in result set")]
    NoRows,

    /// A row did not contain the requested column.
    #[error("Missing column: {column}")]
    MissingColumn {
        /// The column that was requested.
        column: String,
    },

    /// A column held a value of a different type than requested.
    #[error("Column {column} is not {expected}")]
    TypeMismatch {
        /// The column that was requested.
        column: String,
        /// The type the caller asked for.
        expected: &'static str,
    },

    /// A value exceeded the size its column can hold.
    #[error("{kind} size {actual} exceeds limit of {limit}")]
    SizeLimitExceeded {
        /// What was too large (e.g. `"cache key"`).
        kind: &'static str,
        /// Actual size in bytes.
        actual: usize,
        /// Maximum allowed size in bytes.
        limit: usize,
    },

    /// Serialization failure or constraint violation reported by the database.
    #[error("Transaction conflict: {message}")]
    Conflict {
        /// Description reported by the database.
        message: String,
    },

    /// Connection, pool or network error.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Serialization or deserialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Internal storage backend error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out.
    #[error("Operation timeout")]
    Timeout,
}

impl StorageError {
    /// Creates a new `NoRows` error.
    #[must_use]
    pub fn no_rows() -> Self {
        Self::NoRows
    }

    /// Creates a new `MissingColumn` error.
    #[must_use]
    pub fn missing_column(column: impl Into<String>) -> Self {
        Self::MissingColumn { column: column.into() }
    }

    /// Creates a new `TypeMismatch` error.
    #[must_use]
    pub fn type_mismatch(column: impl Into<String>, expected: &'static str) -> Self {
        Self::TypeMismatch { column: column.into(), expected }
    }

    /// Creates a new `SizeLimitExceeded` error.
    #[must_use]
    pub fn size_limit_exceeded(kind: &'static str, actual: usize, limit: usize) -> Self {
        Self::SizeLimitExceeded { kind, actual, limit }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Returns `true` if this is a [`StorageError::NoRows`].
    #[must_use]
    pub fn is_no_rows(&self) -> bool {
        matches!(self, Self::NoRows)
    }
}

/// Errors raised while validating configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric or duration field is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// The offending field.
        field: &'static str,
        /// The smallest accepted value.
        min: String,
        /// The rejected value.
        value: String,
    },

    /// A field has a value that cannot be used.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// A required environment variable or field is absent.
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(StorageError::no_rows().to_string(), "No rows in result set");
        assert_eq!(StorageError::missing_column("a_value").to_string(), "Missing column: a_value");
        assert_eq!(
            StorageError::type_mismatch("t_expire", "an integer").to_string(),
            "Column t_expire is not an integer"
        );
        assert_eq!(
            StorageError::size_limit_exceeded("cache key", 65, 64).to_string(),
            "cache key size 65 exceeds limit of 64"
        );
    }

    #[test]
    fn test_connection_error_preserves_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = StorageError::connection_with_source("pool exhausted", inner);

        let source = err.source().expect("source chain must be preserved");
        assert_eq!(source.to_string(), "refused");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::BelowMinimum {
            field: "max_connections",
            min: "1".into(),
            value: "0".into(),
        };
        assert_eq!(err.to_string(), "max_connections must be at least 1, got 0");

        assert_eq!(ConfigError::Missing("PG_HOST").to_string(), "missing required setting PG_HOST");
    }
}
