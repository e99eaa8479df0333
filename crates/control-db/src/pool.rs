use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::DbConfig;

/// Create a connection pool with sensible defaults.
///
/// An in-memory database is capped at a single connection: SQLite hands out
/// a fresh, empty database per new `:memory:` connection, so every caller
/// must share the same one.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    let options: SqliteConnectOptions = config
        .connect_url()
        .parse()
        .with_context(|| format!("invalid database path {:?}", config.db_path))?;
    let options = options.create_if_missing(true).foreign_keys(true);

    let max_connections = if config.is_in_memory() { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path))?;
    Ok(pool)
}

/// Run all pending migrations from the given directory against the pool.
///
/// Uses a runtime `Migrator` so that no database file is required at compile
/// time (unlike the `sqlx::migrate!()` macro).
pub async fn run_migrations(pool: &SqlitePool, migrations_dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| {
            format!(
                "failed to load migrations from {}",
                migrations_dir.display()
            )
        })?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied successfully");
    Ok(())
}

/// Ensure the target database file exists.
///
/// With SQLite this is implicit in `create_pool` (via `create_if_missing`),
/// so this is a thin, idempotent wrapper kept for symmetry with the
/// startup sequence other storage backends require.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let pool = create_pool(config).await?;
    pool.close().await;
    Ok(())
}

/// Return the row count for every user-defined table in the database.
///
/// Useful for a boot-time diagnostic log line.
pub async fn table_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%' \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    let mut counts = Vec::with_capacity(tables.len());
    for (table_name,) in &tables {
        // Table names come from sqlite_master so they are safe identifiers.
        let query = format!("SELECT COUNT(*) FROM {table_name}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table_name}"))?;
        counts.push((table_name.clone(), count.0));
    }
    Ok(counts)
}

/// Return the default path to the migrations directory shipped with
/// `control-db`.
///
/// At runtime this resolves relative to this crate's source tree via the
/// `CARGO_MANIFEST_DIR` compile-time env.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}
