mod app;
mod cli;
mod server;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use crate::app::App;
use crate::cli::Args;
use crate::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // QAHUB_* overrides may live in a local .env during development
    dotenv::dotenv().ok();

    // Parse command line arguments
    let args = Args::parse();

    // Logging comes first so configuration errors go through it
    init_telemetry(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        json_logs = args.json_logs,
        "Starting qahub webhook daemon"
    );

    // Wire stores, dispatcher and scheduler, then serve until SIGINT/SIGTERM
    let outcome = match App::build(args).await {
        Ok(app) => app.run().await,
        Err(e) => Err(e.context("Webhook daemon failed to start")),
    };

    match &outcome {
        Ok(()) => info!("Webhook daemon stopped"),
        Err(e) => error!(error = %format!("{e:#}"), "Webhook daemon stopped with an error"),
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Args::command().debug_assert()
    }
}
