use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_CURRENCY: &str = "EUR";
const DEFAULT_EVENT_BUFFER: usize = 256;
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
const CONFIG_DIR: &str = "config";

/// Application configuration with validation.
///
/// Values are loaded from `config/default.toml`, an optional
/// `config/{environment}.toml` overlay, and `APP_*` environment variables,
/// in that order of precedence.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1, message = "database_url must not be empty"))]
    pub database_url: String,

    /// Deployment environment name ("development", "test", "production")
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Log filter passed to tracing-subscriber
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// ISO currency code used for new orders
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Payment gateway API secret key
    #[serde(default)]
    pub gateway_secret_key: Option<String>,

    /// Shared secret for verifying webhook signatures
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Maximum accepted age of a signed webhook timestamp
    #[serde(default = "default_webhook_tolerance")]
    pub payment_webhook_tolerance_secs: u64,

    /// Buffer size of the in-process event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer_size: usize,

    /// Database pool sizing
    #[serde(default = "default_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub db_min_connections: u32,
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_webhook_tolerance() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

impl AppConfig {
    /// Builds a minimal configuration programmatically (used by tests and
    /// embedding callers that do not read config files).
    pub fn new(database_url: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            environment: environment.into(),
            log_level: default_log_level(),
            currency: default_currency(),
            gateway_secret_key: None,
            payment_webhook_secret: None,
            payment_webhook_tolerance_secs: default_webhook_tolerance(),
            event_buffer_size: default_event_buffer(),
            db_max_connections: default_max_connections(),
            db_min_connections: default_min_connections(),
        }
    }

    /// Loads configuration from files and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

        let mut builder = Config::builder()
            .add_source(File::from(Path::new(CONFIG_DIR).join("default")).required(false))
            .add_source(File::from(Path::new(CONFIG_DIR).join(&environment)).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"));

        builder = builder.set_default("environment", environment)?;

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
