//! Configuration for the settlement node

use message_bus::{ClientConfig, NatsConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settlement node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Broker connection
    pub broker: BrokerConfig,

    /// Reward calculation consumer
    pub reward_calculation: RewardCalculationConfig,

    /// Reward distribution consumer
    pub reward_distribution: RewardDistributionConfig,

    /// Reconciliation consumer
    pub reconciliation: ReconciliationConfig,

    /// Market pricing consumer
    pub market_pricing: MarketPricingConfig,

    /// Market volume consumer
    pub market_volume: MarketVolumeConfig,

    /// Ledger persistence consumer
    pub ledger_persistence: PoolConfig,

    /// Ledger audit consumer
    pub ledger_audit: LedgerAuditConfig,

    /// Overall shutdown deadline in seconds (default: 30)
    pub shutdown_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "settlement-node".to_string(),
            broker: BrokerConfig::default(),
            reward_calculation: RewardCalculationConfig::default(),
            reward_distribution: RewardDistributionConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            market_pricing: MarketPricingConfig::default(),
            market_volume: MarketVolumeConfig::default(),
            ledger_persistence: PoolConfig::with_workers(3, 2),
            ledger_audit: LedgerAuditConfig::default(),
            shutdown_timeout_seconds: 30,
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Use the in-process broker instead of NATS
    pub in_memory: bool,

    /// NATS transport settings
    pub nats: NatsConfig,

    /// Pool size and reconnect backoff
    pub client: ClientConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            in_memory: false,
            nats: NatsConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

/// Worker pool sizing shared by every consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Broker-level delivery handlers on the queue
    pub delivery_workers: usize,

    /// Processing workers draining the internal queue
    pub processing_workers: usize,

    /// Internal work queue capacity
    pub queue_capacity: usize,

    /// Per-item processing deadline in milliseconds (default: 30s)
    pub processing_timeout_ms: u64,

    /// Retry store capacity
    pub retry_capacity: usize,

    /// Re-enqueue attempts before an item is dropped
    pub max_retry_attempts: u32,

    /// Retry scavenger period in milliseconds (default: 5s)
    pub retry_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            delivery_workers: 3,
            processing_workers: 5,
            queue_capacity: 1000,
            processing_timeout_ms: 30_000,
            retry_capacity: 500,
            max_retry_attempts: 5,
            retry_interval_ms: 5_000,
        }
    }
}

impl PoolConfig {
    /// Default sizing with explicit worker counts
    pub fn with_workers(delivery_workers: usize, processing_workers: usize) -> Self {
        Self {
            delivery_workers,
            processing_workers,
            ..Default::default()
        }
    }

    /// Per-item deadline
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    /// Scavenger period
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Reject sizes that would stall the pool
    pub fn validate(&self) -> crate::Result<()> {
        if self.processing_workers == 0 || self.delivery_workers == 0 {
            return Err(crate::Error::Config("worker counts must be positive".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(crate::Error::Config("queue_capacity must be positive".to_string()));
        }
        if self.retry_interval_ms == 0 {
            return Err(crate::Error::Config("retry_interval_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// Reward calculation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardCalculationConfig {
    /// Worker pool
    pub pool: PoolConfig,

    /// Processed-block TTL in seconds (default: 1 hour)
    pub processed_ttl_seconds: u64,

    /// Processed-block sweep period in seconds (default: 5 minutes)
    pub cleanup_interval_seconds: u64,
}

impl Default for RewardCalculationConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            processed_ttl_seconds: 3_600,
            cleanup_interval_seconds: 300,
        }
    }
}

/// Reward distribution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardDistributionConfig {
    /// Worker pool; retry capacity defaults to half the queue
    pub pool: PoolConfig,

    /// Processed-reward TTL in seconds (default: 24 hours)
    pub processed_ttl_seconds: u64,

    /// Processed-reward sweep period in seconds (default: 5 minutes)
    pub cleanup_interval_seconds: u64,
}

impl Default for RewardDistributionConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            pool: PoolConfig {
                retry_capacity: pool.queue_capacity / 2,
                ..pool
            },
            processed_ttl_seconds: 86_400,
            cleanup_interval_seconds: 300,
        }
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Worker pool
    pub pool: PoolConfig,

    /// Reconcile every block number divisible by this (default: 50)
    pub checkpoint_interval: i64,

    /// Discrepancies kept in memory
    pub max_discrepancies: usize,

    /// Blocks kept on the manual-review list
    pub max_manual_review: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::with_workers(5, 3),
            checkpoint_interval: 50,
            max_discrepancies: 100_000,
            max_manual_review: 1_000,
        }
    }
}

/// Market pricing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketPricingConfig {
    /// Worker pool
    pub pool: PoolConfig,

    /// Blocks kept in the price cache
    pub price_cache_capacity: usize,

    /// Ticks loaded into the cache at start
    pub initial_cache_load: usize,
}

impl Default for MarketPricingConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::with_workers(3, 3),
            price_cache_capacity: 10_000,
            initial_cache_load: 1_000,
        }
    }
}

/// Market volume configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketVolumeConfig {
    /// Worker pool
    pub pool: PoolConfig,

    /// Block IDs remembered for duplicate suppression
    pub processed_capacity: usize,

    /// Aggregate every block ID divisible by this (default: 100)
    pub aggregation_window: i64,
}

impl Default for MarketVolumeConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::with_workers(2, 2),
            processed_capacity: 100_000,
            aggregation_window: 100,
        }
    }
}

/// Ledger audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerAuditConfig {
    /// Worker pool
    pub pool: PoolConfig,

    /// Audit records kept in memory
    pub max_records: usize,
}

impl Default for LedgerAuditConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::with_workers(3, 2),
            max_records: 10_000,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(url) = std::env::var("SETTLEMENT_NATS_URL") {
            config.broker.nats.url = url;
        }

        if let Ok(value) = std::env::var("SETTLEMENT_IN_MEMORY_BROKER") {
            config.broker.in_memory = parse_env("SETTLEMENT_IN_MEMORY_BROKER", &value)?;
        }

        if let Ok(value) = std::env::var("SETTLEMENT_POOL_SIZE") {
            config.broker.client.pool_size = parse_env("SETTLEMENT_POOL_SIZE", &value)?;
        }

        if let Ok(value) = std::env::var("SETTLEMENT_SHUTDOWN_TIMEOUT") {
            config.shutdown_timeout_seconds = parse_env("SETTLEMENT_SHUTDOWN_TIMEOUT", &value)?;
        }

        if let Ok(value) = std::env::var("SETTLEMENT_CHECKPOINT_INTERVAL") {
            config.reconciliation.checkpoint_interval =
                parse_env("SETTLEMENT_CHECKPOINT_INTERVAL", &value)?;
        }

        if let Ok(value) = std::env::var("SETTLEMENT_REWARD_TTL") {
            config.reward_distribution.processed_ttl_seconds =
                parse_env("SETTLEMENT_REWARD_TTL", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every pool and interval
    pub fn validate(&self) -> crate::Result<()> {
        self.reward_calculation.pool.validate()?;
        self.reward_distribution.pool.validate()?;
        self.reconciliation.pool.validate()?;
        self.market_pricing.pool.validate()?;
        self.market_volume.pool.validate()?;
        self.ledger_persistence.validate()?;
        self.ledger_audit.pool.validate()?;

        if self.reconciliation.checkpoint_interval <= 0 {
            return Err(crate::Error::Config(
                "checkpoint_interval must be positive".to_string(),
            ));
        }
        if self.market_volume.aggregation_window <= 0 {
            return Err(crate::Error::Config(
                "aggregation_window must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Overall shutdown deadline
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {}='{}': {}", name, value, e)))
}
