//! Application state and initialization

use anyhow::{Context, Result};
use qahub_core::{AppConfig, StoreBackend, SystemClock};
use qahub_infra::{create_pool, run_migrations, PgWebhookStore};
use qahub_webhook::{
    ConfigStore, DeliveryStore, HttpDispatcher, InMemoryWebhookStore, RetryPolicy,
    RetryScheduler, UrlValidator, WebhookDiagnostics,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::Args;
use crate::server::Server;

/// Shared state of the diagnostics endpoints
#[derive(Clone)]
pub struct AppState {
    pub configs: Arc<dyn ConfigStore>,
    pub diagnostics: Arc<WebhookDiagnostics>,
    pub scheduler: Arc<RetryScheduler>,
}

struct Stores {
    configs: Arc<dyn ConfigStore>,
    deliveries: Arc<dyn DeliveryStore>,
}

async fn open_stores(config: &AppConfig) -> Result<Stores> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; deliveries are lost on restart and not shared between processes");
            let store = Arc::new(InMemoryWebhookStore::new());
            Ok(Stores {
                configs: store.clone(),
                deliveries: store,
            })
        }
        StoreBackend::Postgres => {
            let pool = create_pool(&config.database)
                .await
                .context("Failed to connect to Postgres")?;
            run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            let store = Arc::new(PgWebhookStore::new(pool));
            Ok(Stores {
                configs: store.clone(),
                deliveries: store,
            })
        }
    }
}

/// Main application
pub struct App {
    config: AppConfig,
    state: AppState,
}

impl App {
    /// Load configuration and wire all components
    pub async fn build(args: Args) -> Result<Self> {
        let mut config = AppConfig::load_from_file(args.config_path()?)
            .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
        if let Some(port) = args.port {
            config.server.port = port;
        }
        config.validate().context("Invalid configuration")?;

        let stores = open_stores(&config).await?;
        let validator = Arc::new(UrlValidator::new(&config.safety));
        let dispatcher = Arc::new(
            HttpDispatcher::new(&config.delivery, validator.clone())
                .context("Failed to build HTTP dispatcher")?,
        );

        let scheduler = Arc::new(RetryScheduler::new(
            stores.deliveries.clone(),
            dispatcher,
            validator,
            RetryPolicy::from_config(&config.delivery),
            config.scheduler.clone(),
            Arc::new(SystemClock),
        ));

        let state = AppState {
            configs: stores.configs,
            diagnostics: Arc::new(WebhookDiagnostics::new(stores.deliveries)),
            scheduler,
        };

        info!(
            backend = ?config.store.backend,
            max_attempts = config.delivery.max_attempts,
            "Application components initialized"
        );

        Ok(Self { config, state })
    }

    /// Run the scheduler and the diagnostics server until a shutdown signal
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();

        let scheduler_task = {
            let scheduler = self.state.scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        let signal_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Shutdown signal received");
                shutdown.cancel();
            })
        };

        let server = Server::new(self.config.server.address(), self.state);
        let served = server.run(shutdown.clone()).await;

        // A failed server takes the scheduler down with it
        shutdown.cancel();
        signal_task.abort();
        scheduler_task
            .await
            .context("Retry scheduler task panicked")?;

        served
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
