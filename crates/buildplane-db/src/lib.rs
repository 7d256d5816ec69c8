//! Storage layer for Buildplane.
//!
//! Provides the store traits the control plane is written against, an
//! in-memory implementation and a PostgreSQL implementation.

pub mod error;
#[cfg(feature = "fixtures")]
pub mod fixtures;
pub mod store;

pub use error::{DbError, DbResult};
pub use store::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
