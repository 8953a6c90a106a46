//! Application configuration module
//! Loads settings from the environment (and `.env`), validates them and
//! derives the explicit config structs handed to the engine and workers.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::payments::providers::PayPalConfig;
use crate::services::payment_sync::PaymentSyncConfig;
use crate::services::reconciliation_engine::EngineConfig;
use crate::services::webhook_processor::WebhookProcessorConfig;
use crate::workers::reconciliation_scanner::ScannerConfig;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheSettings,
    pub logging: LoggingConfig,
    pub paypal: PayPalSettings,
    pub reconciliation: ReconciliationConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub redis_url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

#[derive(Debug, Clone)]
pub struct PayPalSettings {
    pub api: PayPalConfig,
    /// Accepted drift of `PAYPAL-TRANSMISSION-TIME`, in seconds.
    pub clock_skew: u64,
}

/// Timing and batching knobs of the reconciliation core. All durations are
/// seconds.
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub payable_ttl: u64,
    pub scan_interval: u64,
    pub scan_batch_size: u32,
    pub scan_enabled: bool,
    pub webhook_replay_ttl: u64,
    pub webhook_processing_ceiling: u64,
    pub checkout_registration_ttl: u64,
    pub auto_refund_enabled: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            payable_ttl: 15 * 60,
            scan_interval: 60,
            scan_batch_size: 200,
            scan_enabled: true,
            webhook_replay_ttl: 4 * 24 * 3600,
            webhook_processing_ceiling: 5 * 60,
            checkout_registration_ttl: 10 * 60,
            auto_refund_enabled: true,
        }
    }
}

fn var_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        _ => Ok(default),
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            cache: CacheSettings::from_env()?,
            logging: LoggingConfig::from_env()?,
            paypal: PayPalSettings::from_env()?,
            reconciliation: ReconciliationConfig::from_env()?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.database.validate()?;
        self.cache.validate()?;
        self.logging.validate()?;
        self.paypal.validate()?;
        self.reconciliation.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: var_or("SERVER_PORT", 8000)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: var_or("DB_MAX_CONNECTIONS", 20)?,
            min_connections: var_or("DB_MIN_CONNECTIONS", 5)?,
            connection_timeout: var_or("DB_CONNECTION_TIMEOUT", 30)?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CacheSettings {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            max_connections: var_or("CACHE_MAX_CONNECTIONS", 10)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("CACHE_MAX_CONNECTIONS".to_string()));
        }

        Ok(())
    }

    #[cfg(feature = "cache")]
    pub fn to_pool_config(&self) -> crate::cache::CacheConfig {
        crate::cache::CacheConfig {
            redis_url: self.redis_url.clone(),
            max_connections: self.max_connections,
            ..Default::default()
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl PayPalSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api = PayPalConfig::from_env()
            .map_err(|e| ConfigError::MissingVariable(e.to_string()))?;
        Ok(PayPalSettings {
            api,
            clock_skew: var_or("PAYPAL_WEBHOOK_CLOCK_SKEW_SECS", 300)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue(
                "PAYPAL_BASE_URL must be a valid URL".to_string(),
            ));
        }
        if self.api.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("PAYPAL_TIMEOUT_SECS".to_string()));
        }
        if self.api.webhook_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            return Err(ConfigError::MissingVariable("PAYPAL_WEBHOOK_ID".to_string()));
        }

        Ok(())
    }

    pub fn webhook_config(&self) -> WebhookProcessorConfig {
        WebhookProcessorConfig {
            clock_skew: chrono::Duration::seconds(self.clock_skew as i64),
        }
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(ReconciliationConfig {
            payable_ttl: var_or("PAYABLE_TTL_SECS", d.payable_ttl)?,
            scan_interval: var_or("RECONCILE_SCAN_INTERVAL_SECS", d.scan_interval)?,
            scan_batch_size: var_or("RECONCILE_SCAN_BATCH_SIZE", d.scan_batch_size)?,
            scan_enabled: var_or("RECONCILE_SCAN_ENABLED", d.scan_enabled)?,
            webhook_replay_ttl: var_or("WEBHOOK_REPLAY_TTL_SECS", d.webhook_replay_ttl)?,
            webhook_processing_ceiling: var_or(
                "WEBHOOK_PROCESSING_TTL_CEILING_SECS",
                d.webhook_processing_ceiling,
            )?,
            checkout_registration_ttl: var_or(
                "CHECKOUT_REGISTRATION_TTL_SECS",
                d.checkout_registration_ttl,
            )?,
            auto_refund_enabled: var_or("AUTO_REFUND_ENABLED", d.auto_refund_enabled)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.payable_ttl == 0 {
            return Err(ConfigError::ValidationFailed(
                "PAYABLE_TTL_SECS must be positive".to_string(),
            ));
        }
        if self.scan_interval == 0 {
            return Err(ConfigError::ValidationFailed(
                "RECONCILE_SCAN_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        if self.webhook_replay_ttl == 0 || self.webhook_processing_ceiling == 0 {
            return Err(ConfigError::ValidationFailed(
                "webhook dedupe TTLs must be positive".to_string(),
            ));
        }
        if self.checkout_registration_ttl == 0 {
            return Err(ConfigError::ValidationFailed(
                "CHECKOUT_REGISTRATION_TTL_SECS must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            payable_ttl: chrono::Duration::seconds(self.payable_ttl as i64),
        }
    }

    /// Batch size is clamped to `1..=200` by the scanner itself.
    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            poll_interval: Duration::from_secs(self.scan_interval),
            batch_size: self.scan_batch_size,
            enabled: self.scan_enabled,
        }
    }

    pub fn sync_config(&self) -> PaymentSyncConfig {
        PaymentSyncConfig {
            auto_refund_enabled: self.auto_refund_enabled,
        }
    }

    pub fn webhook_replay_ttl(&self) -> Duration {
        Duration::from_secs(self.webhook_replay_ttl)
    }

    pub fn webhook_processing_ceiling(&self) -> Duration {
        Duration::from_secs(self.webhook_processing_ceiling)
    }

    pub fn checkout_registration_ttl(&self) -> Duration {
        Duration::from_secs(self.checkout_registration_ttl)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_pool_bounds() {
        let config = DatabaseConfig {
            url: "postgres://localhost/shop".to_string(),
            max_connections: 5,
            min_connections: 10,
            connection_timeout: 30,
            idle_timeout: None,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconciliation_defaults() {
        let config = ReconciliationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine_config().payable_ttl, chrono::Duration::minutes(15));

        let scanner = config.scanner_config();
        assert_eq!(scanner.poll_interval, Duration::from_secs(60));
        assert_eq!(scanner.batch_size, 200);
        assert_eq!(config.webhook_replay_ttl(), Duration::from_secs(345_600));
        assert_eq!(config.webhook_processing_ceiling(), Duration::from_secs(300));
        assert_eq!(config.checkout_registration_ttl(), Duration::from_secs(600));
        assert!(config.sync_config().auto_refund_enabled);
    }

    #[test]
    fn test_zero_payable_ttl_is_rejected() {
        let config = ReconciliationConfig {
            payable_ttl: 0,
            ..Default::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_paypal_requires_webhook_id() {
        let settings = PayPalSettings {
            api: PayPalConfig::default(),
            clock_skew: 300,
        };

        assert!(settings.validate().is_err());
        let settings = PayPalSettings {
            api: PayPalConfig {
                webhook_id: Some("WH-1".to_string()),
                ..PayPalConfig::default()
            },
            clock_skew: 300,
        };
        assert!(settings.validate().is_ok());
        assert_eq!(settings.webhook_config().clock_skew, chrono::Duration::minutes(5));
    }
}
