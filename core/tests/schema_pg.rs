//! Postgres-backed tests for the directory log schemas and the advisory
//! lock. They need a disposable database; set `SKYMIRROR_TEST_DATABASE_URL`
//! to run them, otherwise each test skips itself.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use skymirror_core::db::pglock::{AdvisoryLock, LockError};
use skymirror_core::db::{PgPool, create_pool};
use skymirror_core::plc::PlcLogEntry;
use skymirror_core::schema::{self, PlcDatabase, SchemaVersion, v1, v2};

static DB_GUARD: Mutex<()> = Mutex::const_new(());

/// The tests share fixed table names, so they take turns.
async fn test_pool() -> Option<(PgPool, MutexGuard<'static, ()>)> {
    let Ok(url) = std::env::var("SKYMIRROR_TEST_DATABASE_URL") else {
        eprintln!("SKYMIRROR_TEST_DATABASE_URL not set; skipping");
        return None;
    };
    let guard = DB_GUARD.lock().await;
    let pool = create_pool(&url, 5).await.expect("connect test database");
    Some((pool, guard))
}

async fn drop_plc_tables(pool: &PgPool) {
    for statement in [
        "DROP TABLE IF EXISTS plc_log_entries",
        "DROP TABLE IF EXISTS data",
        "DROP TABLE IF EXISTS head_timestamp",
        "DROP FUNCTION IF EXISTS v2_update_head_timestamp CASCADE",
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .expect("drop test tables");
    }
}

fn entry(did: &str, cid: &str, created_at: &str) -> PlcLogEntry {
    PlcLogEntry {
        did: did.to_string(),
        cid: cid.to_string(),
        created_at: created_at.to_string(),
        nullified: false,
        operation: serde_json::json!({"type": "plc_operation", "cid": cid}),
    }
}

async fn v2_log_len(pool: &PgPool, did: &str) -> i64 {
    sqlx::query_scalar("SELECT array_length(log, 1)::bigint FROM data WHERE did = $1")
        .bind(did)
        .fetch_one(pool)
        .await
        .expect("query log length")
}

#[tokio::test]
async fn fresh_install_detects_v2() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    drop_plc_tables(&pool).await;

    let version = schema::detect_version(&pool).await.expect("detects");
    assert_eq!(version, SchemaVersion::V2);
}

#[tokio::test]
async fn populated_v1_is_kept_until_v2_has_data() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    drop_plc_tables(&pool).await;

    let v1_db = v1::V1Database::new(pool.clone());
    v1_db.auto_migrate().await.expect("migrates v1");
    v1_db
        .append_entries(&[entry("did:plc:a", "x", "2024-01-01T00:00:00Z")])
        .await
        .expect("appends");

    assert_eq!(
        schema::detect_version(&pool).await.expect("detects"),
        SchemaVersion::V1
    );

    let v2_db = v2::V2Database::new(pool.clone(), true);
    v2_db.auto_migrate().await.expect("migrates v2");
    assert_eq!(
        schema::detect_version(&pool).await.expect("detects"),
        SchemaVersion::V1,
        "an empty v2 table must not shadow populated v1"
    );

    v2_db
        .append_entries(&[entry("did:plc:a", "x", "2024-01-01T00:00:00Z")])
        .await
        .expect("appends");
    assert_eq!(
        schema::detect_version(&pool).await.expect("detects"),
        SchemaVersion::V2
    );
}

#[tokio::test]
async fn v1_append_is_idempotent() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    drop_plc_tables(&pool).await;

    let db = v1::V1Database::new(pool.clone());
    db.auto_migrate().await.expect("migrates");

    let batch = vec![
        entry("did:plc:a", "x", "2024-01-01T00:00:00Z"),
        entry("did:plc:a", "y", "2024-01-02T00:00:00Z"),
        entry("did:plc:b", "z", "2024-01-03T00:00:00Z"),
    ];
    db.append_entries(&batch).await.expect("first pass");
    db.append_entries(&batch).await.expect("replay");

    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM plc_log_entries")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(count, 3);
    assert_eq!(
        db.head_timestamp().await.expect("head"),
        Some("2024-01-03T00:00:00Z".to_string())
    );
}

#[tokio::test]
async fn v1_last_operation_skips_nullified() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    drop_plc_tables(&pool).await;

    let db = v1::V1Database::new(pool.clone());
    db.auto_migrate().await.expect("migrates");

    let mut nullified = entry("did:plc:a", "newer", "2024-01-02T00:00:00Z");
    nullified.nullified = true;
    db.append_entries(&[
        entry("did:plc:a", "older", "2024-01-01T00:00:00Z"),
        nullified,
    ])
    .await
    .expect("appends");

    let last = db
        .last_operation_for_did("did:plc:a")
        .await
        .expect("queries")
        .expect("found");
    assert_eq!(last.cid, "older");

    assert!(db
        .last_operation_for_did("did:plc:unknown")
        .await
        .expect("queries")
        .is_none());
}

#[tokio::test]
async fn v2_append_orders_newest_first_and_advances_head() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    drop_plc_tables(&pool).await;

    let db = v2::V2Database::new(pool.clone(), true);
    db.auto_migrate().await.expect("migrates");
    assert_eq!(db.head_timestamp().await.expect("head"), None);

    db.append_entries(&[
        entry("did:plc:a", "x", "2024-01-01T00:00:00Z"),
        entry("did:plc:a", "y", "2024-01-02T00:00:00Z"),
    ])
    .await
    .expect("appends");

    let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM data")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(rows, 1);
    assert_eq!(v2_log_len(&pool, "did:plc:a").await, 2);

    let last = db
        .last_operation_for_did("did:plc:a")
        .await
        .expect("queries")
        .expect("found");
    assert_eq!(last.cid, "y");
    assert_eq!(last.did, "did:plc:a");

    assert_eq!(
        db.head_timestamp().await.expect("head"),
        Some("2024-01-02T00:00:00Z".to_string())
    );
}

#[tokio::test]
async fn v2_replayed_batch_prepends_per_array_cat() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    drop_plc_tables(&pool).await;

    let db = v2::V2Database::new(pool.clone(), true);
    db.auto_migrate().await.expect("migrates");

    let batch = vec![
        entry("did:plc:a", "x", "2024-01-01T00:00:00Z"),
        entry("did:plc:a", "y", "2024-01-02T00:00:00Z"),
    ];
    db.append_entries(&batch).await.expect("first pass");
    db.append_entries(&batch).await.expect("replay");

    // array_cat is blind to duplicates across batches; the upstream
    // pagination is what keeps replays off the happy path. The head and the
    // newest entry must still be stable.
    assert_eq!(v2_log_len(&pool, "did:plc:a").await, 4);
    assert_eq!(
        db.head_timestamp().await.expect("head"),
        Some("2024-01-02T00:00:00Z".to_string())
    );
    let last = db
        .last_operation_for_did("did:plc:a")
        .await
        .expect("queries")
        .expect("found");
    assert_eq!(last.cid, "y");
}

#[tokio::test]
async fn v2_head_updates_without_trigger() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    drop_plc_tables(&pool).await;

    let db = v2::V2Database::new(pool.clone(), false);
    db.auto_migrate().await.expect("migrates");

    db.append_entries(&[entry("did:plc:a", "x", "2024-01-05T00:00:00Z")])
        .await
        .expect("appends");
    assert_eq!(
        db.head_timestamp().await.expect("head"),
        Some("2024-01-05T00:00:00Z".to_string())
    );

    // An older batch must not regress the head.
    db.append_entries(&[entry("did:plc:b", "y", "2024-01-01T00:00:00Z")])
        .await
        .expect("appends");
    assert_eq!(
        db.head_timestamp().await.expect("head"),
        Some("2024-01-05T00:00:00Z".to_string())
    );
}

#[tokio::test]
async fn v2_migrate_repairs_duplicate_head_rows() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    drop_plc_tables(&pool).await;

    let db = v2::V2Database::new(pool.clone(), true);
    db.auto_migrate().await.expect("migrates");
    sqlx::query("INSERT INTO head_timestamp (timestamp) VALUES ('2024-01-01T00:00:00Z')")
        .execute(&pool)
        .await
        .expect("insert extra head");
    sqlx::query("INSERT INTO head_timestamp (timestamp) VALUES ('2024-02-01T00:00:00Z')")
        .execute(&pool)
        .await
        .expect("insert extra head");

    db.auto_migrate().await.expect("repairs");

    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM head_timestamp")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(count, 1);
    assert_eq!(
        db.head_timestamp().await.expect("head"),
        Some("2024-02-01T00:00:00Z".to_string())
    );
}

#[tokio::test]
async fn advisory_lock_is_exclusive_and_reentrant() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };

    let lock_id = 0x5f5f_7465;
    let mut first = AdvisoryLock::new(pool.clone(), lock_id);
    let mut second = AdvisoryLock::new(pool.clone(), lock_id);

    assert!(!first.check().await.expect("check"));
    assert!(first.try_lock().await.expect("try_lock"));
    assert!(first.check().await.expect("check"));

    assert!(!second.try_lock().await.expect("contended try_lock"));
    assert!(
        !second
            .lock_with_timeout(Duration::from_millis(200))
            .await
            .expect("timed lock"),
    );

    // Reentrant: a second hold needs a second release.
    assert!(first.try_lock().await.expect("reentrant try_lock"));
    first.unlock().await.expect("first unlock");
    assert!(first.check().await.expect("still held"));
    first.unlock().await.expect("second unlock");
    assert!(!first.check().await.expect("released"));

    assert!(second.try_lock().await.expect("now available"));
    second.unlock().await.expect("unlock");
}

#[tokio::test]
async fn unlock_without_lock_is_a_typed_error() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };

    let mut lock = AdvisoryLock::new(pool.clone(), 0x6e6f_6c6b);
    let err = lock.unlock().await.expect_err("not locked");
    assert!(matches!(
        err.downcast_ref::<LockError>(),
        Some(LockError::NotLocked)
    ));
}

#[tokio::test]
async fn reset_releases_the_lock_server_side() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };

    let lock_id = 0x7273_7464;
    let mut first = AdvisoryLock::new(pool.clone(), lock_id);
    let mut second = AdvisoryLock::new(pool.clone(), lock_id);

    assert!(first.try_lock().await.expect("try_lock"));
    assert!(!second.try_lock().await.expect("contended"));

    first.reset().await;
    assert!(!first.check().await.expect("reset clears state"));
    assert!(second.try_lock().await.expect("released by reset"));
    second.unlock().await.expect("unlock");
}
