use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::coordination::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Use LISTEN/NOTIFY to wake subscribers early (polling always remains)
    #[serde(default = "default_true")]
    pub listen_notifications: bool,
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://ibc_dev@localhost/ibc_dev".to_string(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            listen_notifications: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NodeConfig {
    /// Stable node identifier; generated per process when absent
    #[serde(default)]
    pub id: Option<String>,
}

impl NodeConfig {
    /// Resolve the node id, deriving `<hostname>-<8 hex>` when not configured.
    pub fn resolve_id(&self) -> String {
        match &self.id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string());
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("{}-{}", host, &suffix[..8])
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ElectionConfig {
    /// Name of the lock that backs the gateway-leader role
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
    /// Lease length in milliseconds
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// Renewal interval; a third of the TTL when unset
    #[serde(default)]
    pub renew_interval_ms: Option<u64>,
    /// How long before the local lease deadline the controller is stopped
    /// when renewal has not succeeded; a tenth of the TTL when unset
    #[serde(default)]
    pub stop_margin_ms: Option<u64>,
    /// Delay between acquisition attempts while follower
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Random jitter added to each acquisition delay
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
}

fn default_lock_name() -> String {
    "gateway-leader".to_string()
}

fn default_lease_ttl_ms() -> u64 {
    10_000
}

fn default_retry_interval_ms() -> u64 {
    1_000
}

fn default_retry_jitter_ms() -> u64 {
    500
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lock_name: default_lock_name(),
            lease_ttl_ms: default_lease_ttl_ms(),
            renew_interval_ms: None,
            stop_margin_ms: None,
            retry_interval_ms: default_retry_interval_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
        }
    }
}

impl ElectionConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms.unwrap_or(self.lease_ttl_ms / 3))
    }

    pub fn stop_margin(&self) -> Duration {
        Duration::from_millis(self.stop_margin_ms.unwrap_or(self.lease_ttl_ms / 10))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A node is dead once its heartbeat is older than this
    #[serde(default = "default_dead_threshold_ms")]
    pub dead_threshold_ms: u64,
    /// Dead nodes are deleted after this long without a heartbeat
    #[serde(default = "default_prune_after_ms")]
    pub prune_after_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    2_000
}

fn default_dead_threshold_ms() -> u64 {
    10_000
}

fn default_prune_after_ms() -> u64 {
    3_600_000
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            dead_threshold_ms: default_dead_threshold_ms(),
            prune_after_ms: default_prune_after_ms(),
        }
    }
}

impl MembershipConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn dead_threshold(&self) -> Duration {
        Duration::from_millis(self.dead_threshold_ms)
    }

    pub fn prune_after(&self) -> Duration {
        Duration::from_millis(self.prune_after_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PubSubConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum messages fetched per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Messages older than this may be pruned
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Cursors touched within this window hold back pruning
    #[serde(default = "default_active_subscriber_secs")]
    pub active_subscriber_secs: u64,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_batch_size() -> u32 {
    100
}

fn default_retention_secs() -> u64 {
    86_400
}

fn default_active_subscriber_secs() -> u64 {
    3_600
}

fn default_prune_interval_secs() -> u64 {
    300
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            retention_secs: default_retention_secs(),
            active_subscriber_secs: default_active_subscriber_secs(),
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

impl PubSubConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn active_subscriber_window(&self) -> Duration {
        Duration::from_secs(self.active_subscriber_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Bounded queue length per local subscriber
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Handler attempts per message before the registration stops
    #[serde(default = "default_max_handler_attempts")]
    pub max_handler_attempts: u32,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_handler_attempts() -> u32 {
    5
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_handler_attempts: default_max_handler_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("database.url", "postgres://ibc_dev@localhost/ibc_dev")?
            .set_default("database.max_connections", 5)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("IBC_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (IBC_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("IBC")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration with every default applied, pointing at `database_url`
    pub fn with_database_url(database_url: &str) -> Self {
        Self {
            database: DatabaseConfig {
                url: database_url.to_string(),
                ..DatabaseConfig::default()
            },
            node: NodeConfig::default(),
            election: ElectionConfig::default(),
            membership: MembershipConfig::default(),
            pubsub: PubSubConfig::default(),
            dispatcher: DispatcherConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.database.url.starts_with("postgres://")
            && !self.database.url.starts_with("postgresql://")
        {
            errors.push(format!(
                "database.url '{}' must begin with postgres://",
                self.database.url
            ));
        }

        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be positive".to_string());
        }

        if self.election.lock_name.trim().is_empty() {
            errors.push("election.lock_name must not be empty".to_string());
        }

        if self.election.lease_ttl_ms == 0 {
            errors.push("election.lease_ttl_ms must be positive".to_string());
        }

        let renew = self.election.renew_interval();
        if renew.is_zero() || renew * 2 >= self.election.lease_ttl() {
            errors.push(format!(
                "election renew interval {:?} must be positive and below half the lease TTL {:?}",
                renew,
                self.election.lease_ttl()
            ));
        }

        let margin = self.election.stop_margin();
        if margin.is_zero() || renew + margin >= self.election.lease_ttl() {
            errors.push(format!(
                "election stop margin {:?} must be positive and leave room for renewal every {:?} within the lease TTL {:?}",
                margin,
                renew,
                self.election.lease_ttl()
            ));
        }

        if self.membership.heartbeat_interval_ms == 0 {
            errors.push("membership.heartbeat_interval_ms must be positive".to_string());
        }

        if self.membership.dead_threshold_ms <= self.membership.heartbeat_interval_ms * 2 {
            errors.push(
                "membership.dead_threshold_ms must exceed two heartbeat intervals".to_string(),
            );
        }

        if self.membership.prune_after_ms < self.membership.dead_threshold_ms {
            errors.push("membership.prune_after_ms must not be below dead_threshold_ms".to_string());
        }

        if self.pubsub.batch_size == 0 {
            errors.push("pubsub.batch_size must be positive".to_string());
        }

        if self.pubsub.poll_interval_ms == 0 {
            errors.push("pubsub.poll_interval_ms must be positive".to_string());
        }

        if self.pubsub.retention_secs == 0 {
            errors.push("pubsub.retention_secs must be positive".to_string());
        }

        if self.pubsub.active_subscriber_secs == 0 {
            errors.push("pubsub.active_subscriber_secs must be positive".to_string());
        }

        if self.pubsub.prune_interval_secs == 0 {
            errors.push("pubsub.prune_interval_secs must be positive".to_string());
        }

        if self.dispatcher.queue_capacity == 0 {
            errors.push("dispatcher.queue_capacity must be positive".to_string());
        }

        if self.dispatcher.max_handler_attempts == 0 {
            errors.push("dispatcher.max_handler_attempts must be positive".to_string());
        }

        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
