//! Shared test utilities for control-plane integration tests.
//!
//! Every test gets its own private in-memory SQLite database with
//! migrations applied. Unlike the Postgres-backed services this crate used
//! to support, there is no shared server to provision: each call to
//! [`create_test_db`] is fully isolated and needs no teardown.

use control_db::config::DbConfig;
use control_db::pool;
use sqlx::SqlitePool;

/// Create a fresh in-memory database with migrations applied.
pub async fn create_test_db() -> SqlitePool {
    let pool = pool::create_pool(&DbConfig::in_memory())
        .await
        .expect("failed to open in-memory test database");
    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");
    pool
}

/// No-op kept for parity with the teardown step external databases need.
///
/// An in-memory pool's last connection closing drops the whole database, so
/// there is nothing to clean up explicitly; callers can just let the pool
/// go out of scope.
pub async fn drop_test_db(_pool: &SqlitePool) {}
