//! Expiry, garbage collection and write-semantics tests for `ExpiringCache`.
//!
//! Time is driven by `ManualClock`, so expiry boundaries are exact and no
//! test sleeps past a TTL.

#![allow(clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::task::JoinSet;
use touno_core_storage::{
    Database, IsolationLevel, MemoryDatabase,
    testutil::{ManualClock, memory_cache},
};

const TABLE: &str = "session";
const MEMORY_TABLE: &str = "cache.session";

async fn stored_rows(db: &MemoryDatabase) -> usize {
    db.snapshot().await.table(MEMORY_TABLE).map_or(0, |t| t.len())
}

// ============================================================================
// Lazy expiry
// ============================================================================

/// Reads never delete: an expired entry reads as absent but stays in the table
/// until a sweep removes it.
#[tokio::test]
async fn expired_entry_is_absent_but_still_stored() {
    let clock = ManualClock::default();
    let (db, cache) = memory_cache(TABLE, &clock);

    cache.set("s1", b"key", Duration::from_secs(60)).await.expect("set");
    clock.advance(Duration::from_secs(61));

    assert_eq!(cache.get("s1").await.expect("get"), None);
    assert_eq!(stored_rows(&db).await, 1, "lazy expiry must not delete the row");
}

/// An entry written with a zero TTL never expires, and survives sweeps.
#[tokio::test]
async fn zero_ttl_never_expires() {
    let clock = ManualClock::default();
    let (_db, cache) = memory_cache(TABLE, &clock);

    cache.set("forever", b"key", Duration::ZERO).await.expect("set");
    clock.advance(Duration::from_secs(10 * 365 * 24 * 3600));

    assert_eq!(cache.gc().await.expect("gc"), 0);
    assert_eq!(cache.get("forever").await.expect("get"), Some(Bytes::from_static(b"key")));
}

// ============================================================================
// Garbage collection
// ============================================================================

#[tokio::test]
async fn gc_removes_only_expired_entries() {
    let clock = ManualClock::default();
    let (db, cache) = memory_cache(TABLE, &clock);

    cache.set("short", b"a", Duration::from_secs(10)).await.expect("set");
    cache.set("long", b"b", Duration::from_secs(3600)).await.expect("set");
    cache.set("forever", b"c", Duration::ZERO).await.expect("set");

    assert_eq!(cache.gc().await.expect("gc"), 0, "nothing has expired yet");

    clock.advance(Duration::from_secs(10));
    assert_eq!(cache.gc().await.expect("gc"), 1);
    assert_eq!(stored_rows(&db).await, 2);

    assert!(cache.get("long").await.expect("get").is_some());
    assert!(cache.get("forever").await.expect("get").is_some());
}

#[tokio::test]
async fn background_gc_sweeps_expired_entries() {
    let clock = ManualClock::default();
    let (db, cache) = memory_cache(TABLE, &clock);

    cache.set("s1", b"key", Duration::from_secs(1)).await.expect("set");
    clock.advance(Duration::from_secs(2));

    let task = cache.spawn_gc(Duration::from_millis(10)).expect("spawn gc");

    let swept = tokio::time::timeout(Duration::from_secs(5), async {
        while stored_rows(&db).await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(swept.is_ok(), "background sweep should remove the expired entry");

    task.shutdown().await;
}

#[tokio::test]
async fn dropping_gc_task_stops_the_sweep() {
    let clock = ManualClock::default();
    let (db, cache) = memory_cache(TABLE, &clock);

    drop(cache.spawn_gc(Duration::from_millis(5)).expect("spawn gc"));

    cache.set("s1", b"key", Duration::from_secs(1)).await.expect("set");
    clock.advance(Duration::from_secs(2));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(stored_rows(&db).await, 1, "a cancelled task must not sweep");
}

// ============================================================================
// Write semantics
// ============================================================================

/// Empty keys and values are accepted without writing anything.
#[tokio::test]
async fn empty_key_or_value_is_a_silent_no_op() {
    let (db, cache) = memory_cache(TABLE, &ManualClock::default());

    cache.set("", b"value", Duration::from_secs(60)).await.expect("empty key accepted");
    cache.set("k", b"", Duration::from_secs(60)).await.expect("empty value accepted");

    assert_eq!(stored_rows(&db).await, 0);
    assert_eq!(cache.get("").await.expect("get"), None);
    cache.delete("").await.expect("empty delete accepted");
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (_db, cache) = memory_cache(TABLE, &ManualClock::default());

    cache.set("s1", b"key", Duration::ZERO).await.expect("set");
    cache.delete("s1").await.expect("first delete");
    cache.delete("s1").await.expect("second delete");
    cache.delete("never-existed").await.expect("missing delete");
}

/// An upsert replaces both the value and the expiry.
#[tokio::test]
async fn upsert_replaces_value_and_expiry() {
    let clock = ManualClock::default();
    let (_db, cache) = memory_cache(TABLE, &clock);

    cache.set("s1", b"old", Duration::from_secs(5)).await.expect("set");
    cache.set("s1", b"new", Duration::ZERO).await.expect("overwrite");
    clock.advance(Duration::from_secs(60));

    assert_eq!(cache.get("s1").await.expect("get"), Some(Bytes::from_static(b"new")));
}

#[tokio::test]
async fn reset_removes_unexpired_entries() {
    let (db, cache) = memory_cache(TABLE, &ManualClock::default());

    cache.set("a", b"1", Duration::ZERO).await.expect("set");
    cache.set("b", b"2", Duration::from_secs(60)).await.expect("set");
    cache.reset().await.expect("reset");

    assert_eq!(stored_rows(&db).await, 0);
}

#[tokio::test]
async fn concurrent_writers_last_writer_wins() {
    let (_db, cache) = memory_cache(TABLE, &ManualClock::default());

    let mut set = JoinSet::new();
    for task in 0..16_u8 {
        let cache = cache.clone();
        set.spawn(async move {
            cache.set("shared", &[task + 1], Duration::ZERO).await.expect("set");
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task panicked");
    }

    let value = cache.get("shared").await.expect("get").expect("value present");
    assert_eq!(value.len(), 1);
    assert!((1..=16).contains(&value[0]), "value must come from one writer");
}

// ============================================================================
// Transactional forms
// ============================================================================

#[tokio::test]
async fn writes_in_rolled_back_transaction_are_discarded() {
    let (db, cache) = memory_cache(TABLE, &ManualClock::default());
    let database: Arc<dyn Database> = Arc::new(db.clone());

    let mut tx = database.begin(IsolationLevel::Default).await.expect("begin");
    cache.set_in(tx.as_mut(), "s1", b"key", Duration::ZERO).await.expect("set_in");
    assert!(cache.get_in(tx.as_mut(), "s1").await.expect("get_in").is_some());
    tx.rollback().await.expect("rollback");

    assert_eq!(cache.get("s1").await.expect("get"), None);
}

#[tokio::test]
async fn delete_in_commits_with_the_transaction() {
    let (db, cache) = memory_cache(TABLE, &ManualClock::default());

    cache.set("s1", b"key", Duration::ZERO).await.expect("set");

    let mut tx = db.begin(IsolationLevel::Default).await.expect("begin");
    cache.delete_in(tx.as_mut(), "s1").await.expect("delete_in");
    tx.commit().await.expect("commit");

    assert_eq!(cache.get("s1").await.expect("get"), None);
}

#[tokio::test]
async fn init_schema_creates_the_table() {
    let (db, cache) = memory_cache(TABLE, &ManualClock::default());

    cache.init_schema().await.expect("init_schema");
    cache.init_schema().await.expect("init_schema is idempotent");

    assert!(db.snapshot().await.table(MEMORY_TABLE).is_some());
}
