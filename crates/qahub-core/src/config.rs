use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Keys that are read from the environment as comma separated lists
const LIST_KEYS: [&str; 3] = [
    "safety.blocked_host_suffixes",
    "safety.blocked_hostnames",
    "safety.blocked_ports",
];

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub delivery: DeliveryConfig,
    pub scheduler: SchedulerConfig,
    pub safety: SafetyConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("QAHUB")
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(environment(prefix))
            .build()?;
        config.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(environment("QAHUB"))
            .build()?;
        config.try_deserialize()
    }

    /// Reject combinations the scheduler cannot run safely
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate(&self.delivery)
    }
}

fn environment(prefix: &str) -> Environment {
    LIST_KEYS.iter().fold(
        Environment::with_prefix(prefix)
            .separator("__")
            .list_separator(",")
            .try_parsing(true),
        |env, key| env.with_list_parse_key(key),
    )
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }

    pub fn with_pool_size(mut self, min: u32, max: u32) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new(default_database_url())
    }
}

fn default_database_url() -> String {
    "postgres://localhost/qahub".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

/// Which delivery store implementation backs the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

/// Store selection
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
}

/// Per-attempt delivery policy
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_response_body_bytes")]
    pub max_response_body_bytes: usize,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl DeliveryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base_secs: u64, cap_secs: u64) -> Self {
        self.backoff_base_secs = base_secs;
        self.backoff_cap_secs = cap_secs;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            jitter_factor: default_jitter_factor(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_response_body_bytes: default_max_response_body_bytes(),
            max_redirects: default_max_redirects(),
            signature_header: default_signature_header(),
            user_agent: default_user_agent(),
        }
    }
}

pub fn default_max_attempts() -> u32 {
    5
}

pub fn default_backoff_base_secs() -> u64 {
    30
}

pub fn default_backoff_cap_secs() -> u64 {
    3600 // 1 hour
}

pub fn default_jitter_factor() -> f64 {
    0.2
}

pub fn default_request_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    5
}

pub fn default_max_response_body_bytes() -> usize {
    4096
}

fn default_max_redirects() -> usize {
    3
}

fn default_signature_header() -> String {
    "X-Signature".to_string()
}

fn default_user_agent() -> String {
    format!("qahub-webhook/{}", env!("CARGO_PKG_VERSION"))
}

/// Retry scheduler loop settings
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_store_error_backoff_ms")]
    pub store_error_backoff_ms: u64,
}

impl SchedulerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn store_error_backoff(&self) -> Duration {
        Duration::from_millis(self.store_error_backoff_ms)
    }

    /// Longest a claimed row can wait for a worker slot and then run its attempt
    pub fn worst_case_hold(&self, delivery: &DeliveryConfig) -> Duration {
        let rounds = self.batch_size.div_ceil(self.concurrency.max(1));
        delivery.request_timeout() * u32::try_from(rounds).unwrap_or(u32::MAX)
    }

    /// The lease must outlive every attempt of a batch, otherwise the reaper
    /// hands a row that is still in flight to another dispatcher
    pub fn validate(&self, delivery: &DeliveryConfig) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.concurrency == 0 {
            return Err(ConfigError::Message(
                "scheduler.batch_size and scheduler.concurrency must be at least 1".to_string(),
            ));
        }

        let hold = self.worst_case_hold(delivery);
        if self.lease_timeout() <= hold {
            return Err(ConfigError::Message(format!(
                "scheduler.lease_timeout_secs ({}) must exceed {}s, the request timeout of {}s \
                 times {} dispatch rounds per batch",
                self.lease_timeout_secs,
                hold.as_secs(),
                delivery.request_timeout_secs,
                self.batch_size.div_ceil(self.concurrency),
            )));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_timeout_secs: default_lease_timeout_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            store_error_backoff_ms: default_store_error_backoff_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_concurrency() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lease_timeout_secs() -> u64 {
    120
}

fn default_reaper_interval_secs() -> u64 {
    30
}

fn default_store_error_backoff_ms() -> u64 {
    5000
}

/// Deny-lists consulted by the URL safety validator
#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_blocked_host_suffixes")]
    pub blocked_host_suffixes: Vec<String>,
    #[serde(default = "default_blocked_hostnames")]
    pub blocked_hostnames: Vec<String>,
    #[serde(default = "default_blocked_ports")]
    pub blocked_ports: Vec<u16>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            blocked_host_suffixes: default_blocked_host_suffixes(),
            blocked_hostnames: default_blocked_hostnames(),
            blocked_ports: default_blocked_ports(),
        }
    }
}

pub fn default_blocked_host_suffixes() -> Vec<String> {
    [".local", ".internal", ".localhost", ".svc.cluster.local"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn default_blocked_hostnames() -> Vec<String> {
    [
        "localhost",
        "metadata.google.internal",
        "metadata.goog",
        "metadata.azure.com",
        "instance-data",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// SSH, SMTP, DNS, RPC, SMB, databases, caches, brokers and admin consoles
pub fn default_blocked_ports() -> Vec<u16> {
    vec![
        22, 23, 25, 53, 111, 135, 139, 445, 1433, 1521, 2375, 2376, 2379, 3306, 5432, 5672,
        5984, 6379, 9042, 9200, 9300, 11211, 15672, 27017,
    ]
}

/// Operator diagnostics server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_creation() {
        let config = DatabaseConfig::new("postgres://localhost".to_string()).with_pool_size(5, 20);

        assert_eq!(config.url, "postgres://localhost");
        assert_eq!(config.min_connections, 5);
        assert_eq!(config.max_connections, 20);
    }

    #[test]
    fn test_delivery_defaults() {
        let config = DeliveryConfig::default();

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.backoff_base(), Duration::from_secs(30));
        assert_eq!(config.backoff_cap(), Duration::from_secs(3600));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.signature_header, "X-Signature");
        assert!((config.jitter_factor - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_scheduler_builders() {
        let config = SchedulerConfig::default()
            .with_batch_size(10)
            .with_concurrency(2);

        assert_eq!(config.batch_size, 10);
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.lease_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_defaults_pass_validation() {
        let config = AppConfig::load_from_env("QAHUB_UNSET_PREFIX_FOR_TEST").unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(
            config.scheduler.worst_case_hold(&config.delivery),
            Duration::from_secs(70)
        );
    }

    #[test]
    fn test_lease_must_outlive_request_timeout() {
        let scheduler = SchedulerConfig {
            lease_timeout_secs: 30,
            ..SchedulerConfig::default().with_batch_size(1).with_concurrency(1)
        };

        let slow = DeliveryConfig::default().with_request_timeout(Duration::from_secs(30));
        assert!(scheduler.validate(&slow).is_err());

        let fast = DeliveryConfig::default().with_request_timeout(Duration::from_secs(29));
        assert!(scheduler.validate(&fast).is_ok());
    }

    #[test]
    fn test_lease_accounts_for_queued_rows() {
        // 50 rows through one worker: the last waits behind 49 attempts
        let serial = SchedulerConfig::default().with_concurrency(1);
        let err = serial.validate(&DeliveryConfig::default()).unwrap_err();

        assert!(err.to_string().contains("lease_timeout_secs (120)"));
        assert!(SchedulerConfig::default()
            .with_concurrency(0)
            .validate(&DeliveryConfig::default())
            .is_err());
    }

    #[test]
    fn test_safety_defaults_cover_common_internal_ports() {
        let safety = SafetyConfig::default();

        for port in [22, 3306, 5432, 6379, 27017] {
            assert!(safety.blocked_ports.contains(&port), "port {port}");
        }
        assert!(!safety.blocked_ports.contains(&80));
        assert!(!safety.blocked_ports.contains(&443));
        assert!(safety
            .blocked_host_suffixes
            .contains(&".svc.cluster.local".to_string()));
    }

    #[test]
    fn test_load_from_env_uses_defaults() {
        let config = AppConfig::load_from_env("QAHUB_UNSET_PREFIX_FOR_TEST").unwrap();

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.delivery.max_attempts, 5);
        assert_eq!(config.scheduler.batch_size, 50);
        assert_eq!(config.server.address(), "0.0.0.0:8081");
    }
}
