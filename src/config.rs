//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (bearer tokens) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`. Every section has defaults, so
//! an empty file is a valid single-host setup.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::engine::aggregator::AggregatorSettings;
use crate::engine::reconciler::ReconcilerSettings;
use crate::market::TierValues;
use crate::types::TierAmounts;

/// Upper bound on executor attempts per batch; the backoff doubles each time.
const MAX_RETRY_ATTEMPTS: u32 = 16;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub ops: OpsConfig,
    pub database: DatabaseConfig,
    pub aggregator: AggregatorConfig,
    pub reconciler: ReconcilerConfig,
    pub tiers: TiersConfig,
    pub allocation: AllocationConfig,
    pub settlement: SettlementConfig,
    pub orders: OrdersConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OpsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub queue_url: String,
    pub portfolio_url: String,
    pub assets_url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            queue_url: "sqlite://data/queue.db".into(),
            portfolio_url: "sqlite://data/portfolio.db".into(),
            assets_url: "sqlite://data/assets.db".into(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AggregatorConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    /// Total executor attempts per batch.
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            batch_size: 10,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl AggregatorConfig {
    pub fn settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            batch_size: self.batch_size,
            retry_attempts: self.retry_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    pub pull_limit: usize,
    pub dedup_window_secs: i64,
    /// Base URL of an order process publishing `/api/v1/tier-status`.
    /// Without it the local tier book is the source of truth.
    pub market_feed_url: Option<String>,
    pub market_feed_timeout_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            pull_limit: 500,
            dedup_window_secs: 3600,
            market_feed_url: None,
            market_feed_timeout_secs: 10,
        }
    }
}

impl ReconcilerConfig {
    pub fn settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            pull_limit: self.pull_limit,
            dedup_window: chrono::Duration::seconds(self.dedup_window_secs),
        }
    }
}

/// Initial tier book.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TiersConfig {
    pub tier1_pool: Decimal,
    pub tier2_pool: Decimal,
    pub tier3_pool: Decimal,
    pub tier1_market_value: Decimal,
    pub tier2_market_value: Decimal,
    pub tier3_market_value: Decimal,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            tier1_pool: Decimal::from(1_000_000),
            tier2_pool: Decimal::from(2_000_000),
            tier3_pool: Decimal::from(500_000),
            tier1_market_value: Decimal::ZERO,
            tier2_market_value: Decimal::ZERO,
            tier3_market_value: Decimal::ZERO,
        }
    }
}

impl TiersConfig {
    pub fn values(&self) -> TierValues {
        TierValues::new(
            TierAmounts::new(self.tier1_pool, self.tier2_pool, self.tier3_pool),
            TierAmounts::new(
                self.tier1_market_value,
                self.tier2_market_value,
                self.tier3_market_value,
            ),
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AllocationConfig {
    /// Tier allocation collaborator. Without it every request gets the
    /// default split.
    pub url: Option<String>,
    pub timeout_secs: u64,
    /// Fallback split in whole percent; must sum to 100.
    pub default_split: [u32; 3],
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 10,
            default_split: [30, 50, 20],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SettlementConfig {
    pub url: String,
    pub timeout_secs: u64,
    /// Env var holding a bearer token for the executor, if it needs one.
    pub token_env: Option<String>,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8081/process".into(),
            timeout_secs: 30,
            token_env: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OrdersConfig {
    /// Fixed RNG seed for reproducible fills. Entropy when unset.
    pub seed: Option<u64>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.aggregator.batch_size == 0 {
            bail!("aggregator.batch_size must be at least 1");
        }
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&self.aggregator.retry_attempts) {
            bail!("aggregator.retry_attempts must be between 1 and {MAX_RETRY_ATTEMPTS}");
        }
        if self.reconciler.pull_limit == 0 {
            bail!("reconciler.pull_limit must be at least 1");
        }
        if self.allocation.default_split.iter().sum::<u32>() != 100 {
            bail!(
                "allocation.default_split must sum to 100 (got {:?})",
                self.allocation.default_split
            );
        }
        if !self.tiers.values().pools.is_non_negative() {
            bail!("tier pools must be non-negative");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
