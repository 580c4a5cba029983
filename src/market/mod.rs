//! Tier book and market value feeds.
//!
//! The tier book holds, per tier, the pool (book value) and the market
//! value. The reconciler derives drift from it; the order engine checks
//! BUY orders against the pools and refreshes the market values after
//! every executed order.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::collaborators::CollaboratorError;
use crate::types::{Tier, TierAmounts};

/// Pool and market value per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TierValues {
    pub pools: TierAmounts,
    pub market_values: TierAmounts,
}

impl TierValues {
    pub fn new(pools: TierAmounts, market_values: TierAmounts) -> Self {
        Self { pools, market_values }
    }

    /// `(market − book) / book` per tier; zero for an empty pool.
    pub fn drift(&self) -> TierAmounts {
        self.pools.map(|tier, book| {
            if book.is_zero() {
                Decimal::ZERO
            } else {
                (self.market_values.get(tier) - book) / book
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolFields {
    #[serde(rename = "TIER1", default, skip_serializing_if = "Option::is_none")]
    pub tier1: Option<Decimal>,
    #[serde(rename = "TIER2", default, skip_serializing_if = "Option::is_none")]
    pub tier2: Option<Decimal>,
    #[serde(rename = "TIER3", default, skip_serializing_if = "Option::is_none")]
    pub tier3: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketValueFields {
    #[serde(rename = "TIER1_MV", default, skip_serializing_if = "Option::is_none")]
    pub tier1: Option<Decimal>,
    #[serde(rename = "TIER2_MV", default, skip_serializing_if = "Option::is_none")]
    pub tier2: Option<Decimal>,
    #[serde(rename = "TIER3_MV", default, skip_serializing_if = "Option::is_none")]
    pub tier3: Option<Decimal>,
}

/// Body of `/api/v1/tier-status`. Fully populated on reads; any subset of
/// the six numbers on updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TierStatus {
    #[serde(default)]
    pub tier_pools: PoolFields,
    #[serde(default)]
    pub tier_market_values: MarketValueFields,
}

impl From<TierValues> for TierStatus {
    fn from(v: TierValues) -> Self {
        TierStatus {
            tier_pools: PoolFields {
                tier1: Some(v.pools.tier1),
                tier2: Some(v.pools.tier2),
                tier3: Some(v.pools.tier3),
            },
            tier_market_values: MarketValueFields {
                tier1: Some(v.market_values.tier1),
                tier2: Some(v.market_values.tier2),
                tier3: Some(v.market_values.tier3),
            },
        }
    }
}

impl TierStatus {
    fn pool(&self, tier: Tier) -> Option<Decimal> {
        match tier {
            Tier::One => self.tier_pools.tier1,
            Tier::Two => self.tier_pools.tier2,
            Tier::Three => self.tier_pools.tier3,
        }
    }

    fn market_value(&self, tier: Tier) -> Option<Decimal> {
        match tier {
            Tier::One => self.tier_market_values.tier1,
            Tier::Two => self.tier_market_values.tier2,
            Tier::Three => self.tier_market_values.tier3,
        }
    }

    /// Overwrite the fields present in `self`, keep the rest of `base`.
    pub fn apply_to(&self, base: TierValues) -> TierValues {
        TierValues {
            pools: base.pools.map(|t, v| self.pool(t).unwrap_or(v)),
            market_values: base.market_values.map(|t, v| self.market_value(t).unwrap_or(v)),
        }
    }

    /// All six numbers, or `None` if any is missing.
    pub fn complete(&self) -> Option<TierValues> {
        let mut values = TierValues::default();
        for tier in Tier::ALL {
            values.pools.set(tier, self.pool(tier)?);
            values.market_values.set(tier, self.market_value(tier)?);
        }
        Some(values)
    }

    pub fn has_negative(&self) -> bool {
        Tier::ALL.iter().any(|t| {
            self.pool(*t).is_some_and(|v| v.is_sign_negative() && !v.is_zero())
                || self.market_value(*t).is_some_and(|v| v.is_sign_negative() && !v.is_zero())
        })
    }
}

// ---------------------------------------------------------------------------
// Shared book
// ---------------------------------------------------------------------------

/// Process-local tier values shared between loops and the ops API.
#[derive(Debug, Clone, Default)]
pub struct SharedTierBook {
    inner: Arc<RwLock<TierValues>>,
}

impl SharedTierBook {
    pub fn new(initial: TierValues) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn snapshot(&self) -> TierValues {
        *self.inner.read().await
    }

    /// Partial overwrite; returns the new values.
    pub async fn update(&self, patch: &TierStatus) -> TierValues {
        let mut guard = self.inner.write().await;
        *guard = patch.apply_to(*guard);
        debug!(pools = %guard.pools, market = %guard.market_values, "Tier book updated");
        *guard
    }

    pub async fn set_market_values(&self, market_values: TierAmounts) -> TierValues {
        let mut guard = self.inner.write().await;
        guard.market_values = market_values;
        *guard
    }

    /// Replace the book with the feed's values. On failure the last known
    /// values are kept and the error is returned.
    pub async fn refresh_from(&self, feed: &dyn MarketFeed) -> Result<TierValues, CollaboratorError> {
        match feed.fetch().await {
            Ok(values) => {
                *self.inner.write().await = values;
                Ok(values)
            }
            Err(e) => {
                warn!(error = %e, "Market feed unavailable, keeping last known tier values");
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Feeds
// ---------------------------------------------------------------------------

/// Source of current tier pools and market values.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn fetch(&self) -> Result<TierValues, CollaboratorError>;
}

/// Fixed values.
#[derive(Debug, Clone, Copy)]
pub struct StaticFeed(pub TierValues);

#[async_trait]
impl MarketFeed for StaticFeed {
    async fn fetch(&self) -> Result<TierValues, CollaboratorError> {
        Ok(self.0)
    }
}

/// Reads the tier status published by an order process.
pub struct HttpMarketFeed {
    http: Client,
    url: String,
}

impl HttpMarketFeed {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build market feed HTTP client")?;
        Ok(Self {
            http,
            url: format!("{}/api/v1/tier-status", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl MarketFeed for HttpMarketFeed {
    async fn fetch(&self) -> Result<TierValues, CollaboratorError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(CollaboratorError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::from_status(status, &text));
        }

        let body: TierStatus = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Rejected(format!("unreadable tier status: {e}")))?;
        body.complete()
            .ok_or_else(|| CollaboratorError::Rejected("incomplete tier status".into()))
    }
}
