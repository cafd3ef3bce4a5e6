//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (FEDINBOX__*, override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub polling: PollingConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Operational HTTP server (health + metrics)
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Background scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Run the polling loop in this process
    pub enabled: bool,
    /// Delay before the first scan after startup
    pub startup_delay_seconds: u64,
    /// Pause between two subscriptions, and after a pass that found work
    pub between_subscriptions_millis: u64,
    /// Lower bound of the randomized sleep after a full scan
    pub min_idle_seconds: u64,
    /// Upper bound of the randomized sleep after a full scan
    pub max_idle_seconds: u64,
    /// How often the durable task queue is drained
    pub task_queue_interval_seconds: u64,
    /// Number of in-process workers for fire-and-forget tasks
    pub background_workers: usize,
}

impl SchedulerConfig {
    pub fn between_subscriptions(&self) -> Duration {
        Duration::from_millis(self.between_subscriptions_millis)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_delay_seconds: 10,
            between_subscriptions_millis: 1_000,
            min_idle_seconds: 60,
            max_idle_seconds: 300,
            task_queue_interval_seconds: 30,
            background_workers: 4,
        }
    }
}

/// Polling cadence, backoff and import limits
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Re-verification interval for ActivityPub subscriptions (default: 30 days)
    pub activitypub_hours: i64,
    /// Re-verification interval for WebSub subscriptions (default: 7 days)
    pub websub_hours: i64,
    /// Polling interval for RSS subscriptions (default: 24 hours)
    pub rss_hours: i64,
    /// Backoff unit after the first failure
    pub backoff_base_minutes: i64,
    /// Exponent cap: the longest backoff is base * 2^max_exponent
    pub backoff_max_exponent: u32,
    /// Hard cap of items imported per Connect
    pub import_limit: usize,
    /// Items marked read when a subscription imports for the first time
    pub bootstrap_read_count: usize,
    /// Maximum hops followed when collapsing activity chains
    pub max_chain_depth: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            activitypub_hours: 24 * 30,
            websub_hours: 24 * 7,
            rss_hours: 24,
            backoff_base_minutes: 2,
            backoff_max_exponent: 7,
            import_limit: 256,
            bootstrap_read_count: 6,
            max_chain_depth: 16,
        }
    }
}

/// Outbound federation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Public base URL of this server (used for WebSub callbacks)
    pub base_url: String,
    /// User-Agent sent with every remote request
    pub user_agent: String,
    /// Per-request timeout for remote fetches
    pub request_timeout_seconds: u64,
    /// Requested WebSub lease
    pub websub_lease_seconds: u64,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// WebSub callback URL for one subscription
    pub fn websub_callback(&self, subscription_id: &str) -> String {
        format!(
            "{}/websub/{}",
            self.base_url.trim_end_matches('/'),
            subscription_id
        )
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDINBOX__*)
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("database.path", "data/fedinbox.db")?
            .set_default("scheduler.enabled", true)?
            .set_default("scheduler.startup_delay_seconds", 10)?
            .set_default("scheduler.between_subscriptions_millis", 1000)?
            .set_default("scheduler.min_idle_seconds", 60)?
            .set_default("scheduler.max_idle_seconds", 300)?
            .set_default("scheduler.task_queue_interval_seconds", 30)?
            .set_default("scheduler.background_workers", 4)?
            .set_default("polling.activitypub_hours", 720)?
            .set_default("polling.websub_hours", 168)?
            .set_default("polling.rss_hours", 24)?
            .set_default("polling.backoff_base_minutes", 2)?
            .set_default("polling.backoff_max_exponent", 7)?
            .set_default("polling.import_limit", 256)?
            .set_default("polling.bootstrap_read_count", 6)?
            .set_default("polling.max_chain_depth", 16)?
            .set_default("federation.base_url", "http://localhost:8080")?
            .set_default("federation.user_agent", "fedinbox/0.1.0")?
            .set_default("federation.request_timeout_seconds", 30)?
            .set_default("federation.websub_lease_seconds", 864000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDINBOX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.scheduler.min_idle_seconds > self.scheduler.max_idle_seconds {
            return Err(AppError::Config(
                "scheduler.min_idle_seconds must not exceed scheduler.max_idle_seconds"
                    .to_string(),
            ));
        }

        for (name, hours) in [
            ("polling.activitypub_hours", self.polling.activitypub_hours),
            ("polling.websub_hours", self.polling.websub_hours),
            ("polling.rss_hours", self.polling.rss_hours),
            ("polling.backoff_base_minutes", self.polling.backoff_base_minutes),
        ] {
            if hours <= 0 {
                return Err(AppError::Config(format!("{name} must be greater than 0")));
            }
        }

        if self.polling.backoff_max_exponent > 16 {
            return Err(AppError::Config(
                "polling.backoff_max_exponent must be at most 16".to_string(),
            ));
        }

        if self.federation.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "federation.request_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        match url::Url::parse(&self.federation.base_url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => {
                return Err(AppError::Config(
                    "federation.base_url must be an absolute http(s) URL".to_string(),
                ));
            }
        }

        Ok(())
    }
}
