use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub warehouse: WarehouseConfig,
    pub query: QueryConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerSettings,
    pub cache: CacheConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL; without one, queries run on the analytical engine
    #[serde(default)]
    pub url: Option<String>,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseConfig {
    /// Root directory of `<namespace>/<table>/` Parquet tables
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    pub threshold: u32,
    pub reset_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub result_ttl_secs: u64,
    pub result_max_entries: usize,
    pub snapshot_max_age_secs: u64,
    pub snapshot_retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

/// Environment variables and the settings they override
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("DATABASE_URL", "database.url"),
    ("POSTGRES_POOL_SIZE", "database.pool_size"),
    ("WAREHOUSE_PATH", "warehouse.path"),
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("QUERY_TIMEOUT", "query.timeout_secs"),
    ("MAX_RETRIES", "retry.max_attempts"),
    ("RETRY_BASE_DELAY_MS", "retry.base_delay_ms"),
    ("RETRY_MAX_DELAY_MS", "retry.max_delay_ms"),
    ("BREAKER_THRESHOLD", "breaker.threshold"),
    ("BREAKER_RESET_TIMEOUT", "breaker.reset_timeout_secs"),
    ("CACHE_TTL", "cache.result_ttl_secs"),
    ("METRICS_INTERVAL", "metrics.interval_secs"),
    ("RUST_LOG", "logging.level"),
    ("RUST_LOG_STYLE", "logging.style"),
];

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("database.pool_size", 5)?
            .set_default("warehouse.path", "./warehouse")?
            .set_default("query.timeout_secs", 300)?
            .set_default("retry.max_attempts", 3)?
            .set_default("retry.base_delay_ms", 1000)?
            .set_default("retry.max_delay_ms", 10_000)?
            .set_default("retry.jitter", false)?
            .set_default("breaker.threshold", 5)?
            .set_default("breaker.reset_timeout_secs", 60)?
            .set_default("cache.result_ttl_secs", 300)?
            .set_default("cache.result_max_entries", 1000)?
            .set_default("cache.snapshot_max_age_secs", 60)?
            .set_default("cache.snapshot_retention_secs", 300)?
            .set_default("metrics.interval_secs", 60)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?;

        // Load from environment variables
        for (var, key) in ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(*key, value)?;
            }
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the execution layer cannot run with
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let invalid = |msg: &str| Err(config::ConfigError::Message(msg.to_string()));

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.breaker.threshold == 0 {
            return invalid("breaker.threshold must be at least 1");
        }
        if self.cache.result_max_entries == 0 {
            return invalid("cache.result_max_entries must be at least 1");
        }
        if self.cache.snapshot_max_age_secs > self.cache.snapshot_retention_secs {
            return invalid("cache.snapshot_max_age_secs must not exceed cache.snapshot_retention_secs");
        }
        if self.database.pool_size == 0 {
            return invalid("database.pool_size must be at least 1");
        }
        if self.metrics.interval_secs == 0 {
            return invalid("metrics.interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
