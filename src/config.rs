//! Application configuration module
//! Handles environment variable loading, validation, and application settings

use std::env;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub notify: NotifyConfig,
    pub reconcile: ReconcileConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL, used to build per-channel gateway
    /// callback URLs (`{base}/webhooks/order/{channel_id}`).
    pub public_base_url: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_secs: u64,
}

/// Redis configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Merchant notification dispatcher configuration
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// How often the dispatcher polls for due tasks.
    pub interval_secs: u64,
    /// Maximum tasks fetched per polling cycle.
    pub batch_size: i64,
    /// Maximum concurrent in-flight webhook deliveries.
    pub concurrency: usize,
    /// Per-delivery HTTP timeout.
    pub request_timeout_secs: u64,
    /// How long the per-task distributed lock is held at most.
    pub lock_ttl_secs: u64,
}

/// Reconciliation sweep configuration
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Interval of the order expiry + active sync sweep.
    pub order_interval_secs: u64,
    /// Interval of the waiting-refund sync sweep.
    pub refund_interval_secs: u64,
    /// Only orders created within this many minutes are actively re-queried.
    pub order_sync_window_mins: i64,
    /// Maximum rows processed per sweep cycle.
    pub batch_size: i64,
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

fn required(var: &str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingVar(var.to_string()))
}

fn parsed_or<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            cache: CacheConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            notify: NotifyConfig::from_env()?,
            reconcile: ReconcileConfig::from_env()?,
        })
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parsed_or("PORT", 8080_u16)?;
        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", host, port))
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            host,
            port,
            public_base_url,
        })
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: required("DATABASE_URL")?,
            max_connections: parsed_or("DATABASE_MAX_CONNECTIONS", 20)?,
            min_connections: parsed_or("DATABASE_MIN_CONNECTIONS", 5)?,
            connection_timeout_secs: parsed_or("DATABASE_CONNECT_TIMEOUT_SECS", 30)?,
        })
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            max_connections: parsed_or("REDIS_MAX_CONNECTIONS", 20)?,
        })
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "plain".to_string())
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        };
        Ok(Self {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format,
        })
    }
}

impl NotifyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            interval_secs: parsed_or("NOTIFY_INTERVAL_SECS", 10)?,
            batch_size: parsed_or("NOTIFY_BATCH_SIZE", 100)?,
            concurrency: parsed_or("NOTIFY_CONCURRENCY", 8)?,
            request_timeout_secs: parsed_or("NOTIFY_REQUEST_TIMEOUT_SECS", 10)?,
            lock_ttl_secs: parsed_or("NOTIFY_LOCK_TTL_SECS", 30)?,
        })
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            order_interval_secs: parsed_or("RECONCILE_ORDER_INTERVAL_SECS", 60)?,
            refund_interval_secs: parsed_or("RECONCILE_REFUND_INTERVAL_SECS", 60)?,
            order_sync_window_mins: parsed_or("RECONCILE_ORDER_SYNC_WINDOW_MINS", 10)?,
            batch_size: parsed_or("RECONCILE_BATCH_SIZE", 100)?,
        })
    }
}
