//! Payment ledger storage: entities, store ports and their adapters.

pub mod entities;
pub mod error;
pub mod memory;
pub mod order_ledger;
pub mod payment_attempt_repository;
#[cfg(feature = "database")]
pub mod postgres;
pub mod refund_attempt_repository;
pub mod transaction;

pub use memory::MemoryLedger;
#[cfg(feature = "database")]
pub use postgres::PgLedger;
pub use transaction::{LedgerStore, PaymentTx};

#[cfg(feature = "database")]
pub use pool::*;

#[cfg(feature = "database")]
mod pool {
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use std::time::Duration;
    use tracing::{error as log_error, info, warn};

    use super::error::DatabaseError;
    use crate::config::DatabaseConfig;

    /// Database pool configuration
    #[derive(Debug, Clone)]
    pub struct PoolConfig {
        pub max_connections: u32,
        pub min_connections: u32,
        pub connection_timeout: Duration,
        pub idle_timeout: Duration,
        pub max_lifetime: Duration,
    }

    impl Default for PoolConfig {
        fn default() -> Self {
            Self {
                max_connections: 20,
                min_connections: 5,
                connection_timeout: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(600),
                max_lifetime: Duration::from_secs(1800),
            }
        }
    }

    impl From<&DatabaseConfig> for PoolConfig {
        fn from(config: &DatabaseConfig) -> Self {
            Self {
                max_connections: config.max_connections,
                min_connections: config.min_connections,
                connection_timeout: Duration::from_secs(config.connection_timeout),
                idle_timeout: Duration::from_secs(config.idle_timeout.unwrap_or(600)),
                ..Default::default()
            }
        }
    }

    /// Initialize the database connection pool
    pub async fn init_pool(
        database_url: &str,
        config: Option<PoolConfig>,
    ) -> Result<PgPool, DatabaseError> {
        let config = config.unwrap_or_default();

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connection_timeout = ?config.connection_timeout,
            "Initializing database pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connection_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| {
                log_error!("Failed to initialize database pool: {}", e);
                DatabaseError::from_sqlx(e)
            })?;

        pool.acquire().await.map_err(|e| {
            log_error!("Failed to acquire test connection: {}", e);
            DatabaseError::from_sqlx(e)
        })?;

        info!("Database pool initialized successfully");
        Ok(pool)
    }

    pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| {
            warn!("Health check failed: {}", e);
            DatabaseError::from_sqlx(e)
        })?;

        Ok(())
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| {
                log_error!("Failed to run migrations: {}", e);
                DatabaseError::new(super::error::DatabaseErrorKind::QueryError {
                    message: e.to_string(),
                })
            })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn pool_config_follows_database_settings() {
            let config = PoolConfig::from(&DatabaseConfig {
                url: "postgres://localhost/shop".to_string(),
                max_connections: 8,
                min_connections: 2,
                connection_timeout: 5,
                idle_timeout: None,
            });
            assert_eq!(config.max_connections, 8);
            assert_eq!(config.connection_timeout, Duration::from_secs(5));
            assert_eq!(config.idle_timeout, Duration::from_secs(600));
        }

        #[tokio::test]
        #[ignore] // Requires DATABASE_URL
        async fn test_pool_initialization() {
            let url = std::env::var("DATABASE_URL").unwrap();
            let pool = init_pool(&url, None).await.unwrap();
            health_check(&pool).await.unwrap();
        }
    }
}
