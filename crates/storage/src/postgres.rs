//! PostgreSQL adapter built on `tokio-postgres`.
//!
//! [`PostgresDatabase`] owns a bounded pool of connections:
//!
//! - at most `max_connections` connections exist at once; callers beyond that
//!   wait up to `acquire_timeout` and then fail with [`StorageError::Timeout`]
//! - at most `max_idle` connections are kept for reuse after a transaction
//! - connections older than `max_lifetime` are closed instead of reused, and a
//!   maintenance task prunes idle ones that age out between requests
//!
//! A transaction dropped without `commit`/`rollback` discards its connection
//! so a half-finished server-side transaction is never handed to another
//! caller; closing the connection makes the server roll it back.

use std::{
    collections::VecDeque,
    error::Error as StdError,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::{
    Client, NoTls,
    error::SqlState,
    types::{IsNull, ToSql, Type, to_sql_checked},
};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::Database,
    config::PostgresConfig,
    error::{StorageError, StorageResult},
    transaction::SqlTransaction,
    types::{IsolationLevel, Row, SqlValue, Statement},
};

/// How often the maintenance task prunes aged idle connections.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Bytes(v) => {
                let slice: &[u8] = v;
                slice.to_sql(ty, out)
            },
            SqlValue::Timestamp(v) => v.to_sql(ty, out),
            SqlValue::Uuid(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn map_pg_error(err: tokio_postgres::Error) -> StorageError {
    if err.is_closed() {
        return StorageError::connection_with_source("connection closed", err);
    }
    match err.code() {
        Some(code)
            if *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::UNIQUE_VIOLATION =>
        {
            StorageError::conflict(err.to_string())
        },
        Some(code) if *code == SqlState::QUERY_CANCELED => StorageError::timeout(),
        _ => StorageError::internal_with_source("query failed", err),
    }
}

fn convert_row(row: &tokio_postgres::Row) -> StorageResult<Row> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let decode_err = |e: tokio_postgres::Error| {
            StorageError::internal_with_source(format!("decode {name}"), e)
        };
        let value = match *column.type_() {
            Type::BOOL => SqlValue::from(row.try_get::<_, Option<bool>>(idx).map_err(decode_err)?),
            Type::INT2 => SqlValue::from(
                row.try_get::<_, Option<i16>>(idx).map_err(decode_err)?.map(i64::from),
            ),
            Type::INT4 => SqlValue::from(
                row.try_get::<_, Option<i32>>(idx).map_err(decode_err)?.map(i64::from),
            ),
            Type::INT8 => SqlValue::from(row.try_get::<_, Option<i64>>(idx).map_err(decode_err)?),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                SqlValue::from(row.try_get::<_, Option<String>>(idx).map_err(decode_err)?)
            },
            Type::BYTEA => {
                SqlValue::from(row.try_get::<_, Option<Vec<u8>>>(idx).map_err(decode_err)?)
            },
            Type::TIMESTAMPTZ => SqlValue::from(
                row.try_get::<_, Option<DateTime<Utc>>>(idx).map_err(decode_err)?,
            ),
            Type::TIMESTAMP => SqlValue::from(
                row.try_get::<_, Option<NaiveDateTime>>(idx)
                    .map_err(decode_err)?
                    .map(|t| t.and_utc()),
            ),
            Type::UUID => {
                SqlValue::from(row.try_get::<_, Option<uuid::Uuid>>(idx).map_err(decode_err)?)
            },
            ref other => {
                return Err(StorageError::serialization(format!(
                    "column {name} has unsupported type {other}"
                )));
            },
        };
        out.insert(name, value);
    }
    Ok(out)
}

struct IdleConnection {
    client: Client,
    created: Instant,
}

struct PoolInner {
    config: PostgresConfig,
    driver: tokio_postgres::Config,
    idle: Mutex<VecDeque<IdleConnection>>,
    permits: Arc<Semaphore>,
}

impl PoolInner {
    fn is_fresh(&self, created: Instant) -> bool {
        created.elapsed() < self.config.max_lifetime()
    }

    async fn connect(&self) -> StorageResult<Client> {
        let (client, connection) = self
            .driver
            .connect(NoTls)
            .await
            .map_err(|e| StorageError::connection_with_source("failed to connect", e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection terminated");
            }
        });
        Ok(client)
    }

    fn release(&self, client: Client, created: Instant) {
        if client.is_closed() || !self.is_fresh(created) {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle() {
            idle.push_back(IdleConnection { client, created });
        }
    }

    fn prune(&self) -> usize {
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|conn| !conn.client.is_closed() && self.is_fresh(conn.created));
        before - idle.len()
    }
}

/// A connection checked out of the pool, holding one permit.
struct PooledConnection {
    client: Option<Client>,
    created: Instant,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn client(&self) -> StorageResult<&Client> {
        self.client.as_ref().ok_or_else(|| StorageError::connection("connection already released"))
    }

    fn discard(&mut self) {
        self.client = None;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client, self.created);
        }
    }
}

/// Pooled PostgreSQL database.
///
/// # Cloning
///
/// Cheap; clones share the pool. The maintenance task stops when the last
/// clone is dropped.
#[derive(Clone)]
pub struct PostgresDatabase {
    pool: Arc<PoolInner>,
    _maintenance: Arc<tokio_util::sync::DropGuard>,
}

impl std::fmt::Debug for PostgresDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDatabase")
            .field("config", &self.pool.config)
            .field("idle", &self.pool.idle.lock().len())
            .finish_non_exhaustive()
    }
}

impl PostgresDatabase {
    /// Creates the pool and starts its maintenance task.
    ///
    /// No connection is opened until the first transaction.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn new(config: PostgresConfig) -> Self {
        let pool = Arc::new(PoolInner {
            driver: config.to_driver_config(),
            permits: Arc::new(Semaphore::new(config.max_connections())),
            idle: Mutex::new(VecDeque::new()),
            config,
        });

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak = Arc::downgrade(&pool);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = weak.upgrade() else { break };
                        let pruned = pool.prune();
                        if pruned > 0 {
                            tracing::debug!(pruned, "closed aged idle postgres connections");
                        }
                    }
                }
            }
        });

        Self { pool, _maintenance: Arc::new(token.drop_guard()) }
    }

    async fn acquire(&self) -> StorageResult<PooledConnection> {
        let permit = tokio::time::timeout(
            self.pool.config.acquire_timeout(),
            Arc::clone(&self.pool.permits).acquire_owned(),
        )
        .await
        .map_err(|_| StorageError::timeout())?
        .map_err(|e| StorageError::connection_with_source("pool closed", e))?;

        loop {
            let candidate = self.pool.idle.lock().pop_front();
            match candidate {
                Some(conn) if !conn.client.is_closed() && self.pool.is_fresh(conn.created) => {
                    return Ok(PooledConnection {
                        client: Some(conn.client),
                        created: conn.created,
                        pool: Arc::clone(&self.pool),
                        _permit: permit,
                    });
                },
                Some(_) => continue,
                None => break,
            }
        }

        let client = self.pool.connect().await?;
        Ok(PooledConnection {
            client: Some(client),
            created: Instant::now(),
            pool: Arc::clone(&self.pool),
            _permit: permit,
        })
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    #[tracing::instrument(skip(self))]
    async fn begin(&self, level: IsolationLevel) -> StorageResult<Box<dyn SqlTransaction>> {
        let mut conn = self.acquire().await?;
        if let Err(e) = conn.client()?.batch_execute(level.begin_statement()).await {
            conn.discard();
            return Err(map_pg_error(e));
        }
        Ok(Box::new(PostgresTransaction { conn, finished: false }))
    }

    async fn health_check(&self) -> StorageResult<()> {
        let conn = self.acquire().await?;
        conn.client()?.simple_query("SELECT 1").await.map_err(map_pg_error)?;
        Ok(())
    }
}

struct PostgresTransaction {
    conn: PooledConnection,
    finished: bool,
}

impl PostgresTransaction {
    async fn finish(mut self: Box<Self>, sql: &str) -> StorageResult<()> {
        let result = self.conn.client()?.batch_execute(sql).await;
        self.finished = true;
        if let Err(e) = result {
            self.conn.discard();
            return Err(map_pg_error(e));
        }
        Ok(())
    }
}

#[async_trait]
impl SqlTransaction for PostgresTransaction {
    #[tracing::instrument(skip(self, params), fields(stmt = %stmt.name()), level = "debug")]
    async fn query(&mut self, stmt: &Statement, params: &[SqlValue]) -> StorageResult<Vec<Row>> {
        let params: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let started = Instant::now();
        let rows = self.conn.client()?.query(stmt.sql(), &params).await.map_err(map_pg_error)?;
        tracing::debug!(
            rows = rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query"
        );
        rows.iter().map(convert_row).collect()
    }

    #[tracing::instrument(skip(self, params), fields(stmt = %stmt.name()), level = "debug")]
    async fn execute(&mut self, stmt: &Statement, params: &[SqlValue]) -> StorageResult<u64> {
        let params: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let started = Instant::now();
        let affected =
            self.conn.client()?.execute(stmt.sql(), &params).await.map_err(map_pg_error)?;
        tracing::debug!(
            affected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execute"
        );
        Ok(affected)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("discarding connection of unfinished transaction");
            self.conn.discard();
        }
    }
}
