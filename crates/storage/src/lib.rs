//! Transactional row storage and expiring cache for touno core services.
//!
//! This crate provides the [`Database`] / [`SqlTransaction`] abstraction the
//! auth layer runs on, two adapters for it, and the [`ExpiringCache`] that
//! holds per-session verification keys.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   touno-core-authn                          │
//! │        (sign-in, token verification, sign-out)              │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │        ExpiringCache         │   account / session rows     │
//! │  (get, set, delete, gc)      │                              │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │              Database / SqlTransaction traits               │
//! │     (begin, query, query_one, execute, commit, rollback)    │
//! ├──────────────────┬──────────────────────────────────────────┤
//! │  MemoryDatabase  │  PostgresDatabase (feature `postgres`)   │
//! │    (testing)     │        (production)                      │
//! └──────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//!
//! use touno_core_storage::{ExpiringCache, MemoryDatabase, clock::system_clock};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = MemoryDatabase::new();
//!     let cache = ExpiringCache::new(Arc::new(db.clone()), "session", system_clock())?;
//!     cache.register_memory_statements(&db);
//!
//!     cache.set("session-1", b"public key", Duration::from_secs(3600)).await?;
//!     assert!(cache.get("session-1").await?.is_some());
//!
//!     cache.delete("session-1").await?;
//!     assert!(cache.get("session-1").await?.is_none());
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`postgres`**: Enables [`PostgresDatabase`] on top of `tokio-postgres`.
//! - **`testutil`**: Enables the `testutil` module with a manual clock and
//!   cache factories. Enable this in `[dev-dependencies]` for integration tests.
//! - **`failpoints`**: Activates `fail` injection points in the memory adapter.

#![deny(unsafe_code)]

pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod transaction;
pub mod types;

// Re-export primary types at crate root for convenience
pub use backend::Database;
pub use bytes::Bytes;
pub use cache::{DEFAULT_GC_INTERVAL, ExpiringCache, GcTask, MAX_KEY_LEN};
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::{PostgresConfig, SslMode};
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use memory::{MemoryDatabase, MemoryTables, Outcome};
#[cfg(feature = "postgres")]
pub use postgres::PostgresDatabase;
pub use transaction::SqlTransaction;
pub use types::{AccountId, IsolationLevel, Row, SqlValue, Statement};
