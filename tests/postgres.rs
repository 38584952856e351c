//! PostgreSQL checks. Skipped unless `TEST_DATABASE_URL` points at a
//! disposable database.

use mdh_migrate::migrations::{UpOptions, migrate_up};
use mdh_migrate::source::MigrationSource;
use mdh_migrate::store::{MigrationStore, PgStore};
use mdh_migrate::tracking::{TrackingShape, TrackingTable};

fn database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok().filter(|u| !u.is_empty())
}

fn unique_schema() -> String {
    format!("mdh_test_{}", std::process::id())
}

#[tokio::test]
async fn test_apply_and_lock_against_postgres() {
    let Some(url) = database_url() else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return;
    };
    let schema = unique_schema();
    let tracking = TrackingTable::new(&schema, "schema_migrations").unwrap();
    let mut store = PgStore::connect(&url, tracking, false).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("001_init.sql"),
        format!("CREATE TABLE {schema}.widgets (id SERIAL PRIMARY KEY);"),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("002_broken.sql"),
        format!("CREATE TABLE {schema}.gadgets (id INT);\nSELECT * FROM {schema}.nope;"),
    )
    .unwrap();
    let source = MigrationSource::new(dir.path());

    let err = migrate_up(&mut store, &source, UpOptions::default(), |_| {})
        .await
        .unwrap_err();
    assert!(err.is_execution());

    assert_eq!(
        store.ensure_tracking_table().await.unwrap(),
        TrackingShape::Current
    );
    let records = store.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].filename, "001_init.sql");

    let gadgets: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
        .bind(format!("{schema}.gadgets"))
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(gadgets, None);

    // The lock was released at the end of the run, so it can be taken again.
    store.lock().await.unwrap();
    store.unlock().await.unwrap();

    sqlx::raw_sql(&format!("DROP SCHEMA {schema} CASCADE"))
        .execute(store.pool())
        .await
        .unwrap();
    store.close().await;
}
