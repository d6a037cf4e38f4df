//! Infrastructure adapters for qahub
//!
//! Currently a single one: the Postgres-backed webhook store, which is the
//! store to use whenever more than one scheduler process shares a backlog.

pub mod database;

pub use database::{
    migrations::run_migrations,
    pool::{check_connection, create_pool},
    store::PgWebhookStore,
};

use qahub_webhook::WebhookError;

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<InfraError> for WebhookError {
    fn from(err: InfraError) -> Self {
        WebhookError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InfraError>;
