//! Order execution engine.
//!
//! Decides BUY/SELL orders against tier inventory with a probabilistic fill
//! model. Every decision carries the probability and the random draw that
//! produced it, and is appended to the order log so a fill or rejection can
//! be explained after the fact.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::market::SharedTierBook;
use crate::storage::assets::OrderAuditRecord;
use crate::storage::AssetStore;
use crate::types::{Asset, EngineError, EngineResult, OrderSide, Tier, MAX_AMOUNT};

const MIN_PROBABILITY: f64 = 0.05;
const MAX_PROBABILITY: f64 = 0.95;
const LIQUIDITY_RANGE: (f64, f64) = (0.7, 1.0);

// ---------------------------------------------------------------------------
// Randomness
// ---------------------------------------------------------------------------

/// Uniform draws for the fill model.
pub trait RandomSource: Send + Sync {
    /// A value in `[low, high]`.
    fn uniform(&self, low: f64, high: f64) -> f64;
}

/// `StdRng`-backed source.
pub struct StdRandom {
    rng: Mutex<StdRng>,
}

impl StdRandom {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for StdRandom {
    fn uniform(&self, low: f64, high: f64) -> f64 {
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        if low >= high {
            return low;
        }
        rng.gen_range(low..=high)
    }
}

/// Replays a fixed script of unit draws, each scaled into the requested
/// range. Repeats the last value once the script is exhausted.
pub struct ScriptedRandom {
    draws: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
}

impl ScriptedRandom {
    pub fn new(draws: impl IntoIterator<Item = f64>) -> Self {
        Self {
            draws: Mutex::new(draws.into_iter().collect()),
            last: Mutex::new(0.5),
        }
    }
}

impl RandomSource for ScriptedRandom {
    fn uniform(&self, low: f64, high: f64) -> f64 {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(next) = self.draws.lock().unwrap_or_else(|p| p.into_inner()).pop_front() {
            *last = next.clamp(0.0, 1.0);
        }
        low + (high - low) * *last
    }
}

// ---------------------------------------------------------------------------
// Fill model
// ---------------------------------------------------------------------------

/// Probability that an order fills, before clamping to `[0.05, 0.95]`:
/// `price_factor · volume_factor · liquidity`.
pub fn execution_probability(
    price: Decimal,
    amount: Decimal,
    market_price: Decimal,
    market_amount: Decimal,
    liquidity: f64,
) -> f64 {
    let price = price.to_f64().unwrap_or(0.0);
    let amount = amount.to_f64().unwrap_or(0.0);
    let market_price = market_price.to_f64().unwrap_or(0.0);
    let market_amount = market_amount.to_f64().unwrap_or(0.0);

    let price_factor = if market_price > 0.0 {
        (1.0 - 2.0 * (price - market_price).abs() / market_price).max(0.1)
    } else {
        0.1
    };

    let hi = amount.max(market_amount);
    let volume_factor = if hi > 0.0 {
        (amount.min(market_amount) / hi).max(0.2)
    } else {
        0.2
    };

    (price_factor * volume_factor * liquidity).clamp(MIN_PROBABILITY, MAX_PROBABILITY)
}

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderRequest {
    pub asset_id: String,
    pub tier_number: u8,
    pub asset_name: String,
    #[serde(alias = "amount_trade")]
    pub amount_traded: Decimal,
    pub price: Decimal,
    #[serde(alias = "purpose")]
    pub side: OrderSide,
}

impl OrderRequest {
    fn validate(&self) -> EngineResult<Tier> {
        let tier = Tier::try_from(self.tier_number)?;
        if self.asset_id.trim().is_empty() {
            return Err(EngineError::Validation("asset_id is required".into()));
        }
        if self.asset_name.trim().is_empty() {
            return Err(EngineError::Validation("asset_name is required".into()));
        }
        if self.amount_traded <= Decimal::ZERO || self.price <= Decimal::ZERO {
            return Err(EngineError::Validation(
                "amount and price must be positive".into(),
            ));
        }
        if self.amount_traded > MAX_AMOUNT || self.price > MAX_AMOUNT {
            return Err(EngineError::Validation(format!(
                "amount and price must not exceed {MAX_AMOUNT}"
            )));
        }
        Ok(tier)
    }

    /// `amount_traded * price`.
    fn notional(&self) -> EngineResult<Decimal> {
        self.amount_traded.checked_mul(self.price).ok_or_else(|| {
            EngineError::Validation(format!(
                "order value {} x {} overflows",
                self.amount_traded, self.price
            ))
        })
    }
}

/// Business reasons an order did not fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRejection {
    InsufficientFunds,
    InsufficientAssets,
    AssetNotFound,
    OrderRejected,
    /// The asset changed between the decision and the inventory write.
    Conflict,
    /// The inventory write failed.
    StorageError,
}

impl OrderRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderRejection::InsufficientFunds => "insufficient_funds",
            OrderRejection::InsufficientAssets => "insufficient_assets",
            OrderRejection::AssetNotFound => "asset_not_found",
            OrderRejection::OrderRejected => "order_rejected",
            OrderRejection::Conflict => "conflict",
            OrderRejection::StorageError => "storage_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OrderOutcome {
    Executed {
        order_id: String,
        asset_id: String,
        asset_name: String,
        tier_number: u8,
        side: OrderSide,
        amount_traded: Decimal,
        price_executed: Decimal,
        total_value: Decimal,
        new_amount: Decimal,
        execution_probability: f64,
        draw: f64,
        timestamp: DateTime<Utc>,
    },
    Failed {
        order_id: String,
        asset_id: String,
        tier_number: u8,
        side: OrderSide,
        error: OrderRejection,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_probability: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        draw: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        required: Option<Decimal>,
        #[serde(skip_serializing_if = "Option::is_none")]
        available: Option<Decimal>,
        timestamp: DateTime<Utc>,
    },
}

impl OrderOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, OrderOutcome::Executed { .. })
    }

    pub fn rejection(&self) -> Option<OrderRejection> {
        match self {
            OrderOutcome::Failed { error, .. } => Some(*error),
            OrderOutcome::Executed { .. } => None,
        }
    }

    pub fn execution_probability(&self) -> Option<f64> {
        match self {
            OrderOutcome::Executed { execution_probability, .. } => Some(*execution_probability),
            OrderOutcome::Failed { execution_probability, .. } => *execution_probability,
        }
    }
}

/// Probability and draw for one decision.
#[derive(Debug, Clone, Copy)]
struct Decision {
    probability: f64,
    draw: f64,
}

impl Decision {
    fn fills(&self) -> bool {
        self.draw <= self.probability
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct OrderEngine {
    assets: AssetStore,
    book: SharedTierBook,
    random: Arc<dyn RandomSource>,
}

impl OrderEngine {
    pub fn new(assets: AssetStore, book: SharedTierBook, random: Arc<dyn RandomSource>) -> Self {
        Self { assets, book, random }
    }

    /// Decide and apply one order. Business rejections, including a lost
    /// compare-and-swap, come back as `OrderOutcome::Failed`; `Err` is
    /// reserved for invalid input and infrastructure failures. Once a
    /// decision is drawn it always reaches the order log.
    pub async fn execute(&self, request: &OrderRequest) -> EngineResult<OrderOutcome> {
        let tier = request.validate()?;
        info!(
            asset_id = %request.asset_id,
            side = %request.side,
            tier = %tier,
            amount = %request.amount_traded,
            price = %request.price,
            "Processing order"
        );

        let outcome = match request.side {
            OrderSide::Buy => self.buy(request, tier).await?,
            OrderSide::Sell => self.sell(request, tier).await?,
        };

        self.audit(request, tier, &outcome).await;

        if outcome.is_executed() {
            match self.assets.market_values().await {
                Ok(values) => {
                    self.book.set_market_values(values).await;
                }
                Err(e) => warn!(error = %e, "Failed to refresh tier market values"),
            }
        }

        match &outcome {
            OrderOutcome::Executed { new_amount, execution_probability, .. } => info!(
                asset_id = %request.asset_id,
                new_amount = %new_amount,
                probability = format!("{:.2}", execution_probability),
                "Order executed"
            ),
            OrderOutcome::Failed { error, message, .. } => info!(
                asset_id = %request.asset_id,
                reason = error.as_str(),
                %message,
                "Order not executed"
            ),
        }
        Ok(outcome)
    }

    fn decide(&self, request: &OrderRequest, market_price: Decimal, market_amount: Decimal) -> Decision {
        let liquidity = self.random.uniform(LIQUIDITY_RANGE.0, LIQUIDITY_RANGE.1);
        let probability = execution_probability(
            request.price,
            request.amount_traded,
            market_price,
            market_amount,
            liquidity,
        );
        let draw = self.random.uniform(0.0, 1.0);
        Decision { probability, draw }
    }

    async fn buy(&self, request: &OrderRequest, tier: Tier) -> EngineResult<OrderOutcome> {
        let required = request.notional()?;
        let available = self.book.snapshot().await.pools.get(tier);
        if required > available {
            return Ok(failed(request, OrderRejection::InsufficientFunds, None)
                .with_amounts(required, available)
                .message(format!(
                    "insufficient funds in {tier} pool: required {required}, available {available}"
                ))
                .build());
        }

        let existing = self.assets.get(&request.asset_id).await?;
        let (market_price, market_amount, new_amount) = match &existing {
            Some(asset) if asset.tier != tier => {
                return Err(EngineError::Validation(format!(
                    "asset {} is held in {}, not {tier}",
                    asset.asset_id, asset.tier
                )));
            }
            Some(asset) => {
                let new_amount = asset.amount.checked_add(request.amount_traded).ok_or_else(|| {
                    EngineError::Validation(format!("holding of {} would overflow", asset.asset_id))
                })?;
                (asset.price_per_unit, asset.amount, new_amount)
            }
            None => (request.price, request.amount_traded, request.amount_traded),
        };

        let decision = self.decide(request, market_price, market_amount);
        if !decision.fills() {
            return Ok(rejected_by_market(request, decision));
        }

        let write = match existing {
            Some(asset) => {
                self.assets
                    .compare_and_set_amount(&asset.asset_id, asset.amount, new_amount)
                    .await
            }
            None => {
                self.assets
                    .insert(&Asset {
                        asset_id: request.asset_id.clone(),
                        tier,
                        name: request.asset_name.clone(),
                        amount: request.amount_traded,
                        price_per_unit: request.price,
                        last_updated: Utc::now(),
                    })
                    .await
            }
        };

        self.finish(request, tier, decision, write, new_amount, required).await
    }

    async fn sell(&self, request: &OrderRequest, tier: Tier) -> EngineResult<OrderOutcome> {
        let Some(asset) = self.assets.get(&request.asset_id).await? else {
            return Ok(failed(request, OrderRejection::AssetNotFound, None)
                .message(format!("asset {} not found", request.asset_id))
                .build());
        };

        let required = request.notional()?;
        let available = asset.market_value().ok_or_else(|| {
            EngineError::Decode(format!("market value of {} overflows", asset.asset_id))
        })?;
        if required > available {
            return Ok(failed(request, OrderRejection::InsufficientAssets, None)
                .with_amounts(required, available)
                .message(format!(
                    "insufficient assets to sell: required {required}, available {available}"
                ))
                .build());
        }

        let decision = self.decide(request, asset.price_per_unit, asset.amount);
        if !decision.fills() {
            return Ok(rejected_by_market(request, decision));
        }

        let new_amount = asset.amount - request.amount_traded;
        if new_amount < Decimal::ZERO {
            return Ok(failed(request, OrderRejection::InsufficientAssets, Some(decision))
                .with_amounts(request.amount_traded, asset.amount)
                .message(format!(
                    "cannot sell {} units, only {} held",
                    request.amount_traded, asset.amount
                ))
                .build());
        }

        let write = self
            .assets
            .compare_and_set_amount(&asset.asset_id, asset.amount, new_amount)
            .await;
        self.finish(request, tier, decision, write, new_amount, required).await
    }

    /// Turn the inventory write that follows a fill decision into an
    /// outcome. A store failure is audited with the decision before it
    /// propagates.
    async fn finish(
        &self,
        request: &OrderRequest,
        tier: Tier,
        decision: Decision,
        write: EngineResult<()>,
        new_amount: Decimal,
        total_value: Decimal,
    ) -> EngineResult<OrderOutcome> {
        match write {
            Ok(()) => Ok(executed(request, decision, new_amount, total_value)),
            Err(EngineError::ConcurrentUpdate(asset_id)) => {
                warn!(%asset_id, "Asset changed under the order, not applied");
                Ok(failed(request, OrderRejection::Conflict, Some(decision))
                    .message(format!(
                        "asset {asset_id} changed while the order was being decided; retry"
                    ))
                    .build())
            }
            Err(e) => {
                let outcome = failed(request, OrderRejection::StorageError, Some(decision))
                    .message(e.to_string())
                    .build();
                self.audit(request, tier, &outcome).await;
                Err(e)
            }
        }
    }

    async fn audit(&self, request: &OrderRequest, tier: Tier, outcome: &OrderOutcome) {
        let (order_id, status, error, probability, draw, timestamp) = match outcome {
            OrderOutcome::Executed { order_id, execution_probability, draw, timestamp, .. } => {
                (order_id, "executed", None, Some(*execution_probability), Some(*draw), *timestamp)
            }
            OrderOutcome::Failed { order_id, error, execution_probability, draw, timestamp, .. } => (
                order_id,
                "failed",
                Some(error.as_str().to_string()),
                *execution_probability,
                *draw,
                *timestamp,
            ),
        };

        let record = OrderAuditRecord {
            order_id: order_id.clone(),
            asset_id: request.asset_id.clone(),
            tier,
            side: request.side,
            amount_traded: request.amount_traded,
            price: request.price,
            status: status.to_string(),
            error,
            execution_probability: probability,
            draw,
            created_at: timestamp,
        };
        if let Err(e) = self.assets.record_order(&record).await {
            error!(order_id = %record.order_id, error = %e, "Failed to write order audit record");
        }
    }
}

fn executed(
    request: &OrderRequest,
    decision: Decision,
    new_amount: Decimal,
    total_value: Decimal,
) -> OrderOutcome {
    OrderOutcome::Executed {
        order_id: Uuid::new_v4().to_string(),
        asset_id: request.asset_id.clone(),
        asset_name: request.asset_name.clone(),
        tier_number: request.tier_number,
        side: request.side,
        amount_traded: request.amount_traded,
        price_executed: request.price,
        total_value,
        new_amount,
        execution_probability: decision.probability,
        draw: decision.draw,
        timestamp: Utc::now(),
    }
}

fn rejected_by_market(request: &OrderRequest, decision: Decision) -> OrderOutcome {
    failed(request, OrderRejection::OrderRejected, Some(decision))
        .message(format!(
            "order rejected by market conditions (probability {:.2}, draw {:.2})",
            decision.probability, decision.draw
        ))
        .build()
}

fn failed(request: &OrderRequest, error: OrderRejection, decision: Option<Decision>) -> FailedBuilder {
    FailedBuilder {
        request: request.clone(),
        error,
        decision,
        message: String::new(),
        required: None,
        available: None,
    }
}

struct FailedBuilder {
    request: OrderRequest,
    error: OrderRejection,
    decision: Option<Decision>,
    message: String,
    required: Option<Decimal>,
    available: Option<Decimal>,
}

impl FailedBuilder {
    fn with_amounts(mut self, required: Decimal, available: Decimal) -> Self {
        self.required = Some(required);
        self.available = Some(available);
        self
    }

    fn message(mut self, message: String) -> Self {
        self.message = message;
        self
    }

    fn build(self) -> OrderOutcome {
        OrderOutcome::Failed {
            order_id: Uuid::new_v4().to_string(),
            asset_id: self.request.asset_id,
            tier_number: self.request.tier_number,
            side: self.request.side,
            error: self.error,
            message: self.message,
            execution_probability: self.decision.map(|d| d.probability),
            draw: self.decision.map(|d| d.draw),
            required: self.required,
            available: self.available,
            timestamp: Utc::now(),
        }
    }
}
