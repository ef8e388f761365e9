//! Job persistence for docjobs.
//!
//! [`JobStore`] is the storage contract; [`MemoryJobStore`] backs
//! single-process deployments and tests, [`PgJobStore`] the `jobs` table.

use sqlx::postgres::PgPoolOptions;

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
pub use store::{
    update_with, JobQuery, JobStats, JobStore, StoreError, WriteOutcome, DEFAULT_LIMIT,
    MAX_LIMIT,
};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Apply the embedded migrations under `crates/db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
