//! Database trait definition.
//!
//! [`Database`] is the only thing the auth layer knows about persistence:
//! it hands out [`SqlTransaction`]s at a requested isolation level. Every
//! adapter ([`MemoryDatabase`](crate::MemoryDatabase), and the PostgreSQL
//! adapter behind the `postgres` feature) implements it.
//!
//! # Implementing an Adapter
//!
//! 1. Implement [`Database`]
//! 2. Implement a corresponding [`SqlTransaction`] type that rolls back on drop
//! 3. Map driver-specific errors to [`StorageError`](crate::StorageError)

use async_trait::async_trait;

use crate::{error::StorageResult, transaction::SqlTransaction, types::IsolationLevel};

/// A transactional, row-oriented database.
///
/// Adapters are shared across requests (`Send + Sync`) and bound the number
/// of concurrently open transactions themselves.
#[async_trait]
pub trait Database: Send + Sync {
    /// Opens a transaction at the given isolation level.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Connection`](crate::StorageError::Connection) or
    /// [`StorageError::Timeout`](crate::StorageError::Timeout) when no
    /// connection can be obtained.
    #[must_use = "a transaction that is never used is rolled back immediately"]
    async fn begin(&self, level: IsolationLevel) -> StorageResult<Box<dyn SqlTransaction>>;

    /// Verifies that the database is reachable.
    async fn health_check(&self) -> StorageResult<()>;
}
