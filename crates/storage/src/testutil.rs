//! Shared test utilities for storage testing.
//!
//! This module provides a controllable [`ManualClock`], a factory for
//! memory-backed [`ExpiringCache`]s, and assertion macros. It is feature-gated
//! behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! touno-core-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use touno_core_storage::testutil::{ManualClock, memory_cache};
//! ```

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::{cache::ExpiringCache, clock::Clock, memory::MemoryDatabase};

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle while the code
/// under test holds another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Creates a clock stopped at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).expect("advance duration out of range");
        let mut now = self.now.lock();
        *now += by;
    }

    /// Moves the clock backward.
    pub fn rewind(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).expect("rewind duration out of range");
        let mut now = self.now.lock();
        *now -= by;
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }

    /// Returns a shared handle usable wherever a [`SharedClock`](crate::clock::SharedClock)
    /// is expected.
    #[must_use]
    pub fn shared(&self) -> Arc<dyn Clock> {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    /// A clock stopped at 2024-01-01T00:00:00Z.
    fn default() -> Self {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid date");
        Self::new(start)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Creates a [`MemoryDatabase`] with an [`ExpiringCache`] on `table` ready to use.
///
/// # Panics
///
/// Panics if `table` is not a valid table name.
pub fn memory_cache(table: &str, clock: &ManualClock) -> (MemoryDatabase, ExpiringCache) {
    let db = MemoryDatabase::new();
    let cache =
        ExpiringCache::new(Arc::new(db.clone()), table, clock.shared()).expect("valid table name");
    cache.register_memory_statements(&db);
    (db, cache)
}

/// Assert that a [`StorageResult`](crate::StorageResult) is a
/// [`StorageError::NoRows`](crate::StorageError::NoRows).
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use touno_core_storage::{assert_no_rows, StorageError, StorageResult};
///
/// let result: StorageResult<()> = Err(StorageError::NoRows);
/// assert_no_rows!(result);
/// ```
#[macro_export]
macro_rules! assert_no_rows {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::NoRows)),
            "expected StorageError::NoRows, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::NoRows)),
            "{}: expected StorageError::NoRows, got: {:?}",
            $msg,
            $result,
        );
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let clock = ManualClock::default();
        let start = clock.now();

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - start, chrono::Duration::seconds(90));

        clock.rewind(Duration::from_secs(30));
        assert_eq!(clock.now_millis() - start.timestamp_millis(), 60_000);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let shared = clock.shared();

        clock.advance(Duration::from_secs(1));
        assert_eq!(shared.now(), clock.now());
    }
}
