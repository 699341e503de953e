//! Record stores for jobq.
//!
//! Provides the in-process [`MemoryJobStore`] and the PostgreSQL-backed
//! [`PgJobStore`], both implementing [`jobq_core::JobStore`].

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::{DbError, DbResult};
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use jobq_config::DatabaseConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Create a new database connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;
    info!(max_connections = config.max_connections, "Database pool ready");
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
