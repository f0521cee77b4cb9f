//! In-memory database implementation.
//!
//! This module provides [`MemoryDatabase`], an in-memory implementation of
//! [`Database`] suitable for testing and development.
//!
//! There is no SQL engine. Each [`Statement`] is dispatched by name to a
//! handler registered with [`MemoryDatabase::register`]; the handler edits
//! plain [`MemoryTables`] and returns an [`Outcome`]. Modules that own SQL
//! (the expiring cache, the auth statements) ship their own handlers.
//!
//! # Transactions
//!
//! - **Serialized**: one transaction at a time holds the tables, which behaves
//!   like `SERIALIZABLE` at every requested isolation level
//! - **Copy-on-begin**: a transaction works on a private copy of the tables
//! - **Publish on commit**: commit swaps the copy in; rollback or drop discards it
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - Every transaction clones every table, so it is only meant for small data sets

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use fail::fail_point;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    backend::Database,
    error::{StorageError, StorageResult},
    transaction::SqlTransaction,
    types::{IsolationLevel, Row, SqlValue, Statement},
};

/// Table contents as seen by statement handlers.
///
/// Each table maps a primary key (rendered as a string) to its row.
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    tables: BTreeMap<String, BTreeMap<String, Row>>,
    sequences: BTreeMap<String, i64>,
}

impl MemoryTables {
    /// Returns a table if it has ever been written.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&BTreeMap<String, Row>> {
        self.tables.get(name)
    }

    /// Returns a table for writing, creating it when absent.
    pub fn table_mut(&mut self, name: &str) -> &mut BTreeMap<String, Row> {
        self.tables.entry(name.to_owned()).or_default()
    }

    /// Finds the first row of `table` matching `predicate`.
    pub fn find(&self, table: &str, predicate: impl Fn(&Row) -> bool) -> Option<(&str, &Row)> {
        self.tables.get(table)?.iter().find(|(_, row)| predicate(row)).map(|(k, r)| (k.as_str(), r))
    }

    /// Removes every row of `table` matching `predicate`, returning them.
    pub fn remove_where(&mut self, table: &str, predicate: impl Fn(&Row) -> bool) -> Vec<Row> {
        let Some(rows) = self.tables.get_mut(table) else {
            return Vec::new();
        };
        let doomed: Vec<String> =
            rows.iter().filter(|(_, row)| predicate(row)).map(|(k, _)| k.clone()).collect();
        doomed.into_iter().filter_map(|k| rows.remove(&k)).collect()
    }

    /// Returns the next value of a named sequence, starting at 1.
    pub fn next_id(&mut self, sequence: &str) -> i64 {
        let next = self.sequences.entry(sequence.to_owned()).or_insert(0);
        *next += 1;
        *next
    }
}

/// The result of running one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Rows returned to the caller.
    pub rows: Vec<Row>,
    /// Rows affected, reported by `execute`.
    pub affected: u64,
}

impl Outcome {
    /// An outcome that returns `rows`; the affected count is the row count.
    #[must_use]
    pub fn rows(rows: Vec<Row>) -> Self {
        let affected = rows.len() as u64;
        Self { rows, affected }
    }

    /// An outcome with no rows and `affected` rows changed.
    #[must_use]
    pub fn affected(affected: u64) -> Self {
        Self { rows: Vec::new(), affected }
    }
}

/// A statement handler.
pub type Handler =
    Arc<dyn Fn(&mut MemoryTables, &[SqlValue]) -> StorageResult<Outcome> + Send + Sync>;

/// In-memory database.
///
/// # Cloning
///
/// `MemoryDatabase` is cheaply cloneable via [`Arc`]. All clones share the
/// same tables and handlers.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryTables>>,
    handlers: Arc<RwLock<BTreeMap<String, Handler>>>,
}

impl fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("statements", &self.handlers.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MemoryDatabase {
    /// Creates an empty database with no statements registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the handler for a statement name.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&mut MemoryTables, &[SqlValue]) -> StorageResult<Outcome> + Send + Sync + 'static,
    {
        self.handlers.write().insert(name.into(), Arc::new(handler));
    }

    /// Returns a copy of the committed tables.
    ///
    /// Waits for any open transaction to finish.
    pub async fn snapshot(&self) -> MemoryTables {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    /// Transactions are fully serialized, so every isolation level behaves
    /// as serializable.
    #[tracing::instrument(skip(self), level = "trace")]
    async fn begin(&self, _level: IsolationLevel) -> StorageResult<Box<dyn SqlTransaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working, handlers: Arc::clone(&self.handlers) }))
    }

    async fn health_check(&self) -> StorageResult<()> {
        fail_point!("memory-health-check", |_| {
            Err(StorageError::connection("injected health check failure"))
        });
        Ok(())
    }
}

/// In-memory transaction.
///
/// Holds the database lock for its whole lifetime and edits a private copy
/// of the tables.
struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryTables>,
    working: MemoryTables,
    handlers: Arc<RwLock<BTreeMap<String, Handler>>>,
}

impl MemoryTransaction {
    fn run(&mut self, stmt: &Statement, params: &[SqlValue]) -> StorageResult<Outcome> {
        let handler = self.handlers.read().get(stmt.name()).cloned().ok_or_else(|| {
            StorageError::internal(format!("no handler registered for statement {stmt}"))
        })?;
        handler(&mut self.working, params)
    }
}

#[async_trait]
impl SqlTransaction for MemoryTransaction {
    async fn query(&mut self, stmt: &Statement, params: &[SqlValue]) -> StorageResult<Vec<Row>> {
        Ok(self.run(stmt, params)?.rows)
    }

    async fn execute(&mut self, stmt: &Statement, params: &[SqlValue]) -> StorageResult<u64> {
        Ok(self.run(stmt, params)?.affected)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        fail_point!("memory-commit", |_| {
            Err(StorageError::internal("injected failure before memory commit"))
        });
        let MemoryTransaction { mut guard, working, .. } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;

    const PUT: Statement = Statement::new_static("kv.put", "INSERT INTO kv (k, v) VALUES ($1, $2)");
    const GET: Statement = Statement::new_static("kv.get", "SELECT v FROM kv WHERE k = $1");

    fn kv_database() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.register("kv.put", |tables, params| {
            let key = params[0].as_str().unwrap_or_default().to_owned();
            tables.table_mut("kv").insert(key, Row::new().with("v", params[1].clone()));
            Ok(Outcome::affected(1))
        });
        db.register("kv.get", |tables, params| {
            let key = params[0].as_str().unwrap_or_default();
            let rows = tables.table("kv").and_then(|t| t.get(key)).cloned().into_iter().collect();
            Ok(Outcome::rows(rows))
        });
        db
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let db = kv_database();

        let mut tx = db.begin(IsolationLevel::Default).await.unwrap();
        tx.execute(&PUT, &["a".into(), 1_i64.into()]).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin(IsolationLevel::Default).await.unwrap();
        let row = tx.query_one(&GET, &["a".into()]).await.unwrap();
        assert_eq!(row.get_i64("v").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let db = kv_database();

        let mut tx = db.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.execute(&PUT, &["a".into(), 2_i64.into()]).await.unwrap();
        let row = tx.query_opt(&GET, &["a".into()]).await.unwrap();
        assert!(row.is_some());
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_writes() {
        let db = kv_database();

        let mut tx = db.begin(IsolationLevel::Default).await.unwrap();
        tx.execute(&PUT, &["a".into(), 1_i64.into()]).await.unwrap();
        tx.rollback().await.unwrap();

        {
            let mut tx = db.begin(IsolationLevel::Default).await.unwrap();
            tx.execute(&PUT, &["b".into(), 1_i64.into()]).await.unwrap();
        }

        let snapshot = db.snapshot().await;
        assert!(snapshot.table("kv").is_none_or(|t| t.is_empty()));
    }

    #[tokio::test]
    async fn test_query_one_without_rows_is_no_rows() {
        let db = kv_database();
        let mut tx = db.begin(IsolationLevel::Default).await.unwrap();

        let err = tx.query_one(&GET, &["missing".into()]).await.unwrap_err();
        assert!(err.is_no_rows());
        assert!(tx.query_opt(&GET, &["missing".into()]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_statement_is_internal_error() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin(IsolationLevel::Default).await.unwrap();

        let err = tx.execute(&PUT, &[]).await.unwrap_err();
        assert!(matches!(err, StorageError::Internal { .. }));
    }

    #[tokio::test]
    async fn test_transactions_are_serialized() {
        let db = kv_database();
        let first = db.begin(IsolationLevel::Default).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), db.begin(IsolationLevel::Default))
                .await;
        assert!(blocked.is_err(), "second transaction must wait for the first");

        drop(first);
        let second =
            tokio::time::timeout(Duration::from_millis(500), db.begin(IsolationLevel::Default))
                .await;
        assert!(second.is_ok());
    }

    #[test]
    fn test_remove_where_and_sequences() {
        let mut tables = MemoryTables::default();
        assert_eq!(tables.next_id("user_account"), 1);
        assert_eq!(tables.next_id("user_account"), 2);

        let t = tables.table_mut("t");
        t.insert("1".into(), Row::new().with("n", 1_i64));
        t.insert("2".into(), Row::new().with("n", 2_i64));

        let removed = tables.remove_where("t", |r| r.get_i64("n").is_ok_and(|n| n > 1));
        assert_eq!(removed.len(), 1);
        assert!(tables.find("t", |r| r.get_i64("n").is_ok_and(|n| n == 1)).is_some());
        assert!(tables.remove_where("absent", |_| true).is_empty());
    }
}
