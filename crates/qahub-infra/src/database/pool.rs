//! Connection pool setup

use crate::{InfraError, Result};
use qahub_core::DatabaseConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

/// Connection attempts made before startup gives up
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_INITIAL_DELAY: Duration = Duration::from_millis(500);
const CONNECT_MAX_DELAY: Duration = Duration::from_secs(8);

/// Create a Postgres pool, retrying the first connection with exponential backoff
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    if config.max_connections == 0 || config.min_connections > config.max_connections {
        return Err(InfraError::Configuration(format!(
            "invalid pool size: min {} max {}",
            config.min_connections, config.max_connections
        )));
    }

    let options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(10));

    let mut delay = CONNECT_INITIAL_DELAY;
    let mut attempt = 1;
    loop {
        match options.clone().connect(&config.url).await {
            Ok(pool) => {
                info!(
                    max_connections = config.max_connections,
                    "Connected to Postgres"
                );
                return Ok(pool);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Postgres connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(CONNECT_MAX_DELAY);
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Round-trip a trivial query
pub async fn check_connection(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
