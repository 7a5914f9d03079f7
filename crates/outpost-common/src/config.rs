//! Configuration for Outpost

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Sending limits and worker pool
    #[serde(default)]
    pub sending: SendingConfig,

    /// Delivery retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Downstream SMTP relay
    #[serde(default)]
    pub smtp: SmtpRelayConfig,

    /// Event destinations
    #[serde(default)]
    pub events: EventsConfig,

    /// Identity verification
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Management API throttling
    #[serde(default)]
    pub management: ManagementConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname used in generated Message-ID headers
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind address
    #[serde(default = "default_api_bind")]
    pub bind: String,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "memory" or "postgres"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long a query waits for a free connection
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

fn default_db_backend() -> String {
    "memory".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Sending limits, queue and worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingConfig {
    /// Whether the account may send at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Recipients allowed in the rolling 24 hour window
    #[serde(default = "default_max_24_hour_send")]
    pub max_24_hour_send: u64,

    /// Messages per second; 0 disables the rate check
    #[serde(default = "default_max_send_rate")]
    pub max_send_rate: f64,

    /// Maximum recipients per message (To + Cc + Bcc)
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Maximum serialized message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Bounded dispatch queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long an enqueue may wait on a full queue before failing
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,

    /// Number of concurrent delivery workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Timeout for a single delivery attempt
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// How long finished messages stay queryable (and accept complaints)
    #[serde(default = "default_message_retention_hours")]
    pub message_retention_hours: u64,
}

impl Default for SendingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_24_hour_send: default_max_24_hour_send(),
            max_send_rate: default_max_send_rate(),
            max_recipients: default_max_recipients(),
            max_message_size: default_max_message_size(),
            queue_capacity: default_queue_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            workers: default_workers(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            message_retention_hours: default_message_retention_hours(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_24_hour_send() -> u64 {
    50_000
}

fn default_max_send_rate() -> f64 {
    14.0
}

fn default_max_recipients() -> usize {
    50
}

fn default_max_message_size() -> usize {
    10 * 1024 * 1024 // 10 MB
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_enqueue_timeout_ms() -> u64 {
    250
}

fn default_workers() -> usize {
    16
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

fn default_message_retention_hours() -> u64 {
    72
}

/// Retry policy for transient delivery failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum delivery attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Randomization of the delay, as a fraction (0.1 = +-10%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    8
}

fn default_base_delay_ms() -> u64 {
    60_000 // 1 minute
}

fn default_max_delay_ms() -> u64 {
    4 * 60 * 60 * 1000 // 4 hours
}

fn default_jitter() -> f64 {
    0.1
}

/// Downstream SMTP relay used by the delivery workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpRelayConfig {
    #[serde(default = "default_hostname")]
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Implicit TLS
    #[serde(default)]
    pub use_tls: bool,

    /// STARTTLS upgrade
    #[serde(default = "default_true")]
    pub use_starttls: bool,
}

impl Default for SmtpRelayConfig {
    fn default() -> Self {
        Self {
            host: default_hostname(),
            port: default_smtp_port(),
            username: None,
            password: None,
            use_tls: false,
            use_starttls: true,
        }
    }
}

fn default_smtp_port() -> u16 {
    25
}

/// Event destination delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Webhook endpoint per destination target (SNS topic, Firehose
    /// stream or CloudWatch namespace)
    #[serde(default)]
    pub endpoints: HashMap<String, String>,

    /// Secret for the X-Outpost-Signature header
    pub signing_secret: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_event_timeout_ms")]
    pub timeout_ms: u64,

    /// Capacity of the in-process subscription channel
    #[serde(default = "default_subscription_capacity")]
    pub subscription_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            signing_secret: None,
            timeout_ms: default_event_timeout_ms(),
            subscription_capacity: default_subscription_capacity(),
        }
    }
}

fn default_event_timeout_ms() -> u64 {
    5_000
}

fn default_subscription_capacity() -> usize {
    1024
}

/// Identity verification poller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Seconds between poller passes
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Hours after which a pending identity is marked failed
    #[serde(default = "default_pending_expiry_hours")]
    pub pending_expiry_hours: i64,

    /// TXT record label prefix for domain verification
    #[serde(default = "default_txt_prefix")]
    pub txt_record_prefix: String,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            pending_expiry_hours: default_pending_expiry_hours(),
            txt_record_prefix: default_txt_prefix(),
        }
    }
}

fn default_poll_interval() -> u64 {
    300
}

fn default_pending_expiry_hours() -> i64 {
    72
}

fn default_txt_prefix() -> String {
    "_outpost".to_string()
}

/// Management API throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// Calls per second per operation; 0 disables throttling
    #[serde(default = "default_management_rate")]
    pub calls_per_second: f64,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            calls_per_second: default_management_rate(),
        }
    }
}

fn default_management_rate() -> f64 {
    1.0
}

impl Config {
    /// Load configuration from a TOML file, with `OUTPOST__SECTION__KEY`
    /// environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix("OUTPOST").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from `OUTPOST_CONFIG` or the default locations,
    /// falling back to defaults when no file exists
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var("OUTPOST_CONFIG") {
            return Self::from_file(Path::new(&path));
        }

        let paths = [
            PathBuf::from("./outpost.toml"),
            PathBuf::from("/etc/outpost/outpost.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        tracing::warn!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.sending.workers == 0 {
            return Err(crate::Error::Config("sending.workers must be > 0".into()));
        }
        if self.sending.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "sending.queue_capacity must be > 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config("retry.max_attempts must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(crate::Error::Config("retry.jitter must be in [0, 1)".into()));
        }
        if self.database.backend == "postgres" && self.database.url.is_none() {
            return Err(crate::Error::Config(
                "database.url is required for the postgres backend".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sending.max_recipients, 50);
        assert_eq!(config.sending.max_message_size, 10 * 1024 * 1024);
        assert_eq!(config.database.backend, "memory");
        assert_eq!(config.management.calls_per_second, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "mail.example.com"

[sending]
max_24_hour_send = 500
workers = 4

[retry]
max_attempts = 3

[events.endpoints]
"arn:sns:bounces" = "https://hooks.example.com/bounces"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.hostname, "mail.example.com");
        assert_eq!(config.sending.max_24_hour_send, 500);
        assert_eq!(config.sending.workers, 4);
        assert_eq!(config.sending.max_recipients, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(
            config.events.endpoints.get("arn:sns:bounces").map(String::as_str),
            Some("https://hooks.example.com/bounces")
        );
    }

    #[test]
    fn test_validate_rejects_postgres_without_url() {
        let mut config = Config::default();
        config.database.backend = "postgres".to_string();
        assert!(config.validate().is_err());
    }
}
