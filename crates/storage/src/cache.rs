//! Expiring key/value cache stored in a database table.
//!
//! [`ExpiringCache`] keeps byte values in `"cache"."<table>"` with an
//! absolute expiry per entry:
//!
//! ```text
//! s_key    VARCHAR(64) PRIMARY KEY
//! a_value  BYTEA
//! t_expire BIGINT       -- milliseconds since the Unix epoch, 0 = never
//! ```
//!
//! Expiry is lazy: [`get`](ExpiringCache::get) treats an entry whose
//! `t_expire` is non-zero and not in the future as absent but never deletes
//! it. Space is reclaimed separately by [`gc`](ExpiringCache::gc), usually
//! driven by the background task from [`spawn_gc`](ExpiringCache::spawn_gc).
//!
//! Every operation has an `*_in` form that runs inside a caller's
//! transaction, so cache writes can commit or roll back together with other
//! rows.
//!
//! # Example
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//!
//! use touno_core_storage::{ExpiringCache, MemoryDatabase, clock::system_clock};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let db = MemoryDatabase::new();
//! let cache = ExpiringCache::new(Arc::new(db.clone()), "session", system_clock()).unwrap();
//! cache.register_memory_statements(&db);
//!
//! cache.set("k", b"v", Duration::from_secs(60)).await.unwrap();
//! assert_eq!(cache.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));
//! # });
//! ```

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::Database,
    clock::SharedClock,
    error::{ConfigError, StorageError, StorageResult},
    memory::{MemoryDatabase, Outcome},
    transaction::SqlTransaction,
    types::{IsolationLevel, Row, SqlValue, Statement},
};

/// Maximum key length, matching the `s_key` column width.
pub const MAX_KEY_LEN: usize = 64;

/// Default interval between garbage collection sweeps.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(10);

/// Longest table name PostgreSQL accepts without truncation.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Validates that `name` is a plain lower-case SQL identifier.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for empty, overlong, or non
/// `[a-z_][a-z0-9_]*` names.
pub fn validate_table_name(name: &str) -> Result<(), ConfigError> {
    let invalid =
        |reason: &str| ConfigError::Invalid { field: "cache_table", reason: reason.into() };

    let Some(first) = name.chars().next() else {
        return Err(invalid("must not be empty"));
    };
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid("must be at most 63 bytes"));
    }
    if !(first.is_ascii_lowercase() || first == '_') {
        return Err(invalid("must start with a lower-case letter or underscore"));
    }
    if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(invalid("may only contain lower-case letters, digits and underscores"));
    }
    Ok(())
}

#[derive(Debug)]
struct CacheStatements {
    table: String,
    init: [Statement; 3],
    select: Statement,
    upsert: Statement,
    delete: Statement,
    reset: Statement,
    gc: Statement,
}

impl CacheStatements {
    fn new(table: &str) -> Self {
        let name = |op: &str| format!("cache.{table}.{op}");
        Self {
            table: table.to_owned(),
            init: [
                Statement::new(name("init.schema"), r#"CREATE SCHEMA IF NOT EXISTS "cache""#),
                Statement::new(
                    name("init.table"),
                    format!(
                        r#"CREATE TABLE IF NOT EXISTS "cache"."{table}" (
                            s_key VARCHAR(64) PRIMARY KEY NOT NULL DEFAULT '',
                            a_value BYTEA NOT NULL,
                            t_expire BIGINT NOT NULL DEFAULT 0
                        )"#
                    ),
                ),
                Statement::new(
                    name("init.index"),
                    format!(
                        r#"CREATE INDEX IF NOT EXISTS "idx_{table}_expire" ON "cache"."{table}" (t_expire)"#
                    ),
                ),
            ],
            select: Statement::new(
                name("select"),
                format!(r#"SELECT a_value, t_expire FROM "cache"."{table}" WHERE s_key = $1"#),
            ),
            upsert: Statement::new(
                name("upsert"),
                format!(
                    r#"INSERT INTO "cache"."{table}" (s_key, a_value, t_expire) VALUES ($1, $2, $3)
                       ON CONFLICT (s_key) DO UPDATE
                       SET a_value = EXCLUDED.a_value, t_expire = EXCLUDED.t_expire"#
                ),
            ),
            delete: Statement::new(
                name("delete"),
                format!(r#"DELETE FROM "cache"."{table}" WHERE s_key = $1"#),
            ),
            reset: Statement::new(name("reset"), format!(r#"TRUNCATE TABLE "cache"."{table}""#)),
            gc: Statement::new(
                name("gc"),
                format!(r#"DELETE FROM "cache"."{table}" WHERE t_expire != 0 AND t_expire <= $1"#),
            ),
        }
    }

    fn memory_table(&self) -> String {
        format!("cache.{}", self.table)
    }
}

/// Database-backed cache with per-entry expiry.
///
/// # Cloning
///
/// Cheap; clones share the database handle and statements.
#[derive(Clone)]
pub struct ExpiringCache {
    db: Arc<dyn Database>,
    statements: Arc<CacheStatements>,
    clock: SharedClock,
}

impl std::fmt::Debug for ExpiringCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("table", &self.statements.table)
            .finish_non_exhaustive()
    }
}

impl ExpiringCache {
    /// Creates a cache over `"cache"."<table>"`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `table` is not a valid identifier.
    pub fn new(
        db: Arc<dyn Database>,
        table: &str,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        validate_table_name(table)?;
        Ok(Self { db, statements: Arc::new(CacheStatements::new(table)), clock })
    }

    /// The table name (without the `cache` schema).
    #[must_use]
    pub fn table(&self) -> &str {
        &self.statements.table
    }

    /// Creates the `cache` schema, the table and its expiry index if missing.
    #[tracing::instrument(skip(self), fields(table = %self.table()))]
    pub async fn init_schema(&self) -> StorageResult<()> {
        let mut tx = self.db.begin(IsolationLevel::Default).await?;
        for stmt in &self.statements.init {
            tx.execute(stmt, &[]).await?;
        }
        tx.commit().await
    }

    /// Reads a value in its own transaction.
    pub async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let mut tx = self.db.begin(IsolationLevel::ReadCommitted).await?;
        let value = self.get_in(tx.as_mut(), key).await?;
        tx.commit().await?;
        Ok(value)
    }

    /// Reads a value inside `tx`.
    ///
    /// Returns `None` for empty keys, missing keys, and expired entries.
    #[tracing::instrument(skip_all, fields(table = %self.table()))]
    pub async fn get_in(
        &self,
        tx: &mut dyn SqlTransaction,
        key: &str,
    ) -> StorageResult<Option<Bytes>> {
        if key.is_empty() {
            return Ok(None);
        }

        let Some(row) = tx.query_opt(&self.statements.select, &[key.into()]).await? else {
            tracing::debug!("cache miss");
            return Ok(None);
        };

        let expire = row.get_i64("t_expire")?;
        if expire != 0 && expire <= self.clock.now_millis() {
            tracing::debug!(expire, "cache entry expired");
            return Ok(None);
        }

        tracing::debug!("cache hit");
        row.get_bytes("a_value").map(Some)
    }

    /// Writes a value in its own transaction.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StorageResult<()> {
        let mut tx = self.db.begin(IsolationLevel::ReadCommitted).await?;
        self.set_in(tx.as_mut(), key, value, ttl).await?;
        tx.commit().await
    }

    /// Upserts a value inside `tx`.
    ///
    /// A zero `ttl` stores the entry without expiry. An empty key or value is
    /// accepted and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SizeLimitExceeded`] for keys longer than
    /// [`MAX_KEY_LEN`] bytes, and adapter errors verbatim.
    #[tracing::instrument(skip_all, fields(table = %self.table(), ttl = ?ttl))]
    pub async fn set_in(
        &self,
        tx: &mut dyn SqlTransaction,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StorageResult<()> {
        if key.is_empty() || value.is_empty() {
            tracing::debug!(
                empty_key = key.is_empty(),
                empty_value = value.is_empty(),
                "ignoring cache write"
            );
            return Ok(());
        }
        if key.len() > MAX_KEY_LEN {
            return Err(StorageError::size_limit_exceeded("cache key", key.len(), MAX_KEY_LEN));
        }

        let expire = self.expiry_for(ttl);
        tx.execute(&self.statements.upsert, &[key.into(), value.into(), expire.into()]).await?;
        Ok(())
    }

    /// Deletes a value in its own transaction.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut tx = self.db.begin(IsolationLevel::ReadCommitted).await?;
        self.delete_in(tx.as_mut(), key).await?;
        tx.commit().await
    }

    /// Deletes a value inside `tx`. Deleting a missing key succeeds.
    #[tracing::instrument(skip_all, fields(table = %self.table()))]
    pub async fn delete_in(&self, tx: &mut dyn SqlTransaction, key: &str) -> StorageResult<()> {
        if key.is_empty() {
            return Ok(());
        }
        let removed = tx.execute(&self.statements.delete, &[key.into()]).await?;
        tracing::debug!(removed, "cache delete");
        Ok(())
    }

    /// Removes every entry, expired or not.
    #[tracing::instrument(skip(self), fields(table = %self.table()))]
    pub async fn reset(&self) -> StorageResult<()> {
        let mut tx = self.db.begin(IsolationLevel::Default).await?;
        tx.execute(&self.statements.reset, &[]).await?;
        tx.commit().await
    }

    /// Runs one sweep, deleting entries whose expiry has passed.
    ///
    /// Returns the number of entries removed.
    #[tracing::instrument(skip(self), fields(table = %self.table()))]
    pub async fn gc(&self) -> StorageResult<u64> {
        let now = self.clock.now_millis();
        let mut tx = self.db.begin(IsolationLevel::ReadCommitted).await?;
        let removed = tx.execute(&self.statements.gc, &[now.into()]).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Starts a background task that calls [`gc`](Self::gc) every `interval`.
    ///
    /// The task stops when the returned [`GcTask`] is shut down or dropped.
    /// Sweep failures are logged and retried on the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `interval` is zero.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn spawn_gc(&self, interval: Duration) -> Result<GcTask, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "gc_interval",
                min: "1ms".into(),
                value: "0s".into(),
            });
        }

        let cache = self.clone();
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; consume it so sweeps start
            // one full interval after spawning.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => {
                        tracing::debug!(table = %cache.table(), "cache gc task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match cache.gc().await {
                            Ok(0) => {},
                            Ok(removed) => {
                                tracing::debug!(table = %cache.table(), removed, "cache gc sweep");
                            },
                            Err(e) => {
                                tracing::warn!(
                                    table = %cache.table(),
                                    error = %e,
                                    "cache gc sweep failed"
                                );
                            },
                        }
                    }
                }
            }
        });

        Ok(GcTask { token, handle: Some(handle) })
    }

    /// Registers handlers for this cache's statements on a [`MemoryDatabase`].
    pub fn register_memory_statements(&self, db: &MemoryDatabase) {
        let stmts = &self.statements;
        let table = stmts.memory_table();

        for stmt in &stmts.init {
            let table = table.clone();
            db.register(stmt.name(), move |tables, _| {
                tables.table_mut(&table);
                Ok(Outcome::default())
            });
        }

        let t = table.clone();
        db.register(stmts.select.name(), move |tables, params| {
            let key = text_param(params, 0)?;
            let row = tables.table(&t).and_then(|rows| rows.get(key)).map(|row| {
                let mut out = Row::new();
                for column in ["a_value", "t_expire"] {
                    if let Some(v) = row.get(column) {
                        out.insert(column, v.clone());
                    }
                }
                out
            });
            Ok(Outcome::rows(row.into_iter().collect()))
        });

        let t = table.clone();
        db.register(stmts.upsert.name(), move |tables, params| {
            let key = text_param(params, 0)?.to_owned();
            let row = Row::new()
                .with("s_key", key.clone())
                .with("a_value", param(params, 1)?.clone())
                .with("t_expire", param(params, 2)?.clone());
            tables.table_mut(&t).insert(key, row);
            Ok(Outcome::affected(1))
        });

        let t = table.clone();
        db.register(stmts.delete.name(), move |tables, params| {
            let key = text_param(params, 0)?;
            let removed = tables.table_mut(&t).remove(key).is_some();
            Ok(Outcome::affected(u64::from(removed)))
        });

        let t = table.clone();
        db.register(stmts.reset.name(), move |tables, _| {
            let rows = tables.table_mut(&t);
            let removed = rows.len() as u64;
            rows.clear();
            Ok(Outcome::affected(removed))
        });

        let t = table;
        db.register(stmts.gc.name(), move |tables, params| {
            let now = param(params, 0)?
                .as_i64()
                .ok_or_else(|| StorageError::internal("gc expects an integer timestamp"))?;
            let removed = tables.remove_where(&t, |row| {
                row.get_i64("t_expire").is_ok_and(|exp| exp != 0 && exp <= now)
            });
            Ok(Outcome::affected(removed.len() as u64))
        });
    }

    fn expiry_for(&self, ttl: Duration) -> i64 {
        if ttl.is_zero() {
            return 0;
        }
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_add(ttl_ms)
    }
}

fn param(params: &[SqlValue], idx: usize) -> StorageResult<&SqlValue> {
    params.get(idx).ok_or_else(|| StorageError::internal(format!("missing parameter ${}", idx + 1)))
}

fn text_param(params: &[SqlValue], idx: usize) -> StorageResult<&str> {
    param(params, idx)?
        .as_str()
        .ok_or_else(|| StorageError::internal(format!("parameter ${} must be text", idx + 1)))
}

/// Handle to the background sweep started by [`ExpiringCache::spawn_gc`].
///
/// Dropping the handle cancels the task without waiting for it.
#[derive(Debug)]
pub struct GcTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl GcTask {
    /// Cancels the task and waits for the current sweep to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "cache gc task ended abnormally");
        }
    }

    /// Returns `true` once the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for GcTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
