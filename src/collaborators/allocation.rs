//! Tier allocation collaborator client and the fallback split.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{AllocationRequest, CollaboratorError, TierAllocator};
use crate::types::TierAmounts;

#[derive(Debug, Deserialize)]
struct AllocationResponse {
    tier1: Decimal,
    tier2: Decimal,
    tier3: Decimal,
}

pub struct HttpTierAllocator {
    http: Client,
    url: String,
}

impl HttpTierAllocator {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build allocation HTTP client")?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl TierAllocator for HttpTierAllocator {
    async fn allocate(&self, request: &AllocationRequest) -> Result<TierAmounts, CollaboratorError> {
        let response = self
            .http
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(CollaboratorError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::from_status(status, &text));
        }

        let body: AllocationResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Rejected(format!("unreadable allocation: {e}")))?;

        let split = TierAmounts::new(body.tier1, body.tier2, body.tier3);
        debug!(uuid = %request.uuid, split = %split, "Allocation received");
        Ok(split)
    }
}

/// Split `amount` by whole-number percentages. Tiers 1 and 2 are rounded to
/// cents; tier 3 takes the remainder so the split always sums to `amount`.
pub fn default_split(amount: Decimal, percents: [u32; 3]) -> TierAmounts {
    let share = |p: u32| (amount * Decimal::from(p) / Decimal::ONE_HUNDRED).round_dp(2);
    let tier1 = share(percents[0]);
    let tier2 = share(percents[1]);
    TierAmounts::new(tier1, tier2, amount - tier1 - tier2)
}

/// A split is usable when no tier is negative and it sums to `amount`.
pub fn is_valid_split(amount: Decimal, split: &TierAmounts) -> bool {
    split.is_non_negative() && split.total() == amount
}
