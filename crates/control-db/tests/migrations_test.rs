//! Integration tests for database migrations and connection pooling.
//!
//! Each test opens its own private in-memory SQLite database, so there is
//! no shared instance to provision or tear down.

use control_db::config::DbConfig;
use control_db::pool;

/// Expected tables created by the initial migration.
const EXPECTED_TABLES: &[&str] = &[
    "control_task_events",
    "control_task_file_ownership",
    "control_tasks",
    "workers",
];

#[tokio::test]
async fn migrations_create_all_tables() {
    let temp_pool = pool::create_pool(&DbConfig::in_memory())
        .await
        .expect("pool should open");

    pool::run_migrations(&temp_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%' \
         ORDER BY name",
    )
    .fetch_all(&temp_pool)
    .await
    .expect("should list tables");

    let table_names: Vec<&str> = rows.iter().map(|(name,)| name.as_str()).collect();
    assert_eq!(
        table_names, EXPECTED_TABLES,
        "migration should create exactly the expected tables"
    );

    temp_pool.close().await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let temp_pool = pool::create_pool(&DbConfig::in_memory())
        .await
        .expect("pool should open");

    pool::run_migrations(&temp_pool, pool::default_migrations_path())
        .await
        .expect("first migration run should succeed");
    pool::run_migrations(&temp_pool, pool::default_migrations_path())
        .await
        .expect("second migration run should succeed (idempotent)");

    for table in EXPECTED_TABLES {
        let query = format!("SELECT COUNT(*) FROM {table}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(&temp_pool)
            .await
            .unwrap_or_else(|e| panic!("failed to count {table}: {e}"));
        assert_eq!(count.0, 0, "table {table} should be empty after migrations");
    }

    temp_pool.close().await;
}

#[tokio::test]
async fn pool_creates_and_destroys_cleanly() {
    let temp_pool = pool::create_pool(&DbConfig::in_memory())
        .await
        .expect("pool should open");

    pool::run_migrations(&temp_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    let one: (i32,) = sqlx::query_as("SELECT 1")
        .fetch_one(&temp_pool)
        .await
        .expect("simple query should work");
    assert_eq!(one.0, 1);

    temp_pool.close().await;
}

#[tokio::test]
async fn table_counts_returns_expected_tables() {
    let temp_pool = pool::create_pool(&DbConfig::in_memory())
        .await
        .expect("pool should open");

    pool::run_migrations(&temp_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    let counts = pool::table_counts(&temp_pool)
        .await
        .expect("table_counts should succeed");

    assert_eq!(counts.len(), EXPECTED_TABLES.len());
    for (name, count) in &counts {
        assert_eq!(*count, 0, "table {name} should be empty");
    }

    temp_pool.close().await;
}

#[tokio::test]
async fn ensure_database_exists_is_idempotent() {
    let config = DbConfig::in_memory();

    pool::ensure_database_exists(&config)
        .await
        .expect("first ensure should succeed");
    pool::ensure_database_exists(&config)
        .await
        .expect("second ensure should succeed (idempotent)");
}
