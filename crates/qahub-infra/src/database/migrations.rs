//! Embedded schema migrations

use crate::Result;
use sqlx::PgPool;
use tracing::info;

/// Apply all pending migrations from `migrations/`
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}
