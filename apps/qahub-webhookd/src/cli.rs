//! Command-line argument parsing

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "qahub-webhookd",
    about = "qahub outbound webhook delivery daemon",
    version,
    long_about = "Claims due webhook deliveries, sends them to subscriber endpoints \
                  under the URL safety policy and retries failures with backoff."
)]
pub struct Args {
    /// Path to configuration file (environment variables prefixed QAHUB__ override it)
    #[arg(
        short,
        long,
        env = "QAHUB_CONFIG",
        default_value = "config/qahub-webhookd.toml"
    )]
    pub config: PathBuf,

    /// Diagnostics HTTP port, overrides server.port from the configuration
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: String,

    /// Enable JSON log format (useful for production)
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,
}

impl Args {
    /// Config path as accepted by the `config` crate
    pub fn config_path(&self) -> anyhow::Result<&str> {
        self.config
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("config path is not valid UTF-8: {:?}", self.config))
    }
}
