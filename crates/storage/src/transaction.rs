//! Transaction trait for row-oriented database access.
//!
//! A [`SqlTransaction`] is the unit every auth operation runs inside. All
//! reads and writes go through it, and nothing becomes visible to other
//! transactions until [`commit`](SqlTransaction::commit).
//!
//! # Transaction Semantics
//!
//! - **Atomicity**: either every statement's effect is published on commit or none is
//! - **Read-your-writes**: statements see earlier writes of the same transaction
//! - **Drop is rollback**: a transaction dropped without commit discards its writes
//!
//! # Example
//!
//! ```
//! use touno_core_storage::{
//!     Database, IsolationLevel, MemoryDatabase, Outcome, Row, SqlValue, Statement,
//! };
//!
//! const PUT: Statement = Statement::new_static("kv.put", "INSERT INTO kv VALUES ($1)");
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let db = MemoryDatabase::new();
//! db.register("kv.put", |tables, params| {
//!     let key = params[0].as_str().unwrap_or_default().to_owned();
//!     tables.table_mut("kv").insert(key.clone(), Row::new().with("k", key));
//!     Ok(Outcome::affected(1))
//! });
//!
//! let mut tx = db.begin(IsolationLevel::Default).await.unwrap();
//! tx.execute(&PUT, &[SqlValue::from("a")]).await.unwrap();
//! tx.commit().await.unwrap();
//!
//! assert_eq!(db.snapshot().await.table("kv").map(|t| t.len()), Some(1));
//! # });
//! ```

use async_trait::async_trait;

use crate::{
    error::{StorageError, StorageResult},
    types::{Row, SqlValue, Statement},
};

/// An open database transaction.
///
/// Implementations must discard uncommitted work when dropped, so an early
/// return via `?` never leaks partial writes.
#[async_trait]
pub trait SqlTransaction: Send {
    /// Runs a statement and returns every row it produced.
    async fn query(&mut self, stmt: &Statement, params: &[SqlValue]) -> StorageResult<Vec<Row>>;

    /// Runs a statement that must produce a row, returning the first one.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NoRows`] when the statement produced nothing.
    async fn query_one(&mut self, stmt: &Statement, params: &[SqlValue]) -> StorageResult<Row> {
        self.query(stmt, params).await?.into_iter().next().ok_or_else(StorageError::no_rows)
    }

    /// Like [`query_one`](Self::query_one), but maps an empty result to `None`.
    async fn query_opt(
        &mut self,
        stmt: &Statement,
        params: &[SqlValue],
    ) -> StorageResult<Option<Row>> {
        match self.query_one(stmt, params).await {
            Ok(row) => Ok(Some(row)),
            Err(StorageError::NoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Runs a statement for its side effects and returns the affected row count.
    async fn execute(&mut self, stmt: &Statement, params: &[SqlValue]) -> StorageResult<u64>;

    /// Publishes every write made in this transaction.
    ///
    /// This method consumes the transaction. After commit (successful or
    /// not), the transaction cannot be used further.
    async fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Discards every write made in this transaction.
    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}
