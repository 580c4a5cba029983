//! Shared types for the TIERFLOW engine.
//!
//! These types form the data model used across all modules: the queue
//! state machine, the portfolio ledger, tier inventory and the ephemeral
//! netted batch. Storage, collaborator and engine modules depend on them
//! without depending on each other.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Tiers
// ---------------------------------------------------------------------------

/// One of the three liquidity/risk buckets (1 = most liquid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    One,
    Two,
    Three,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::One, Tier::Two, Tier::Three];

    /// Tier number as stored and exchanged on the wire (1..=3).
    pub fn number(self) -> u8 {
        match self {
            Tier::One => 1,
            Tier::Two => 2,
            Tier::Three => 3,
        }
    }
}

impl TryFrom<u8> for Tier {
    type Error = EngineError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(Tier::One),
            2 => Ok(Tier::Two),
            3 => Ok(Tier::Three),
            other => Err(EngineError::Validation(format!(
                "tier number must be 1, 2 or 3 (got {other})"
            ))),
        }
    }
}

impl From<Tier> for u8 {
    fn from(t: Tier) -> u8 {
        t.number()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TIER{}", self.number())
    }
}

/// Largest single amount accepted at intake, per tier in the queue, and
/// per order leg. Keeps sums and products far inside `Decimal` range.
pub const MAX_AMOUNT: Decimal = dec!(1000000000000);

/// A dollar amount per tier. Used for queue rows, net deltas, allocation
/// splits and portfolio legs alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TierAmounts {
    pub tier1: Decimal,
    pub tier2: Decimal,
    pub tier3: Decimal,
}

impl TierAmounts {
    pub const ZERO: TierAmounts = TierAmounts {
        tier1: Decimal::ZERO,
        tier2: Decimal::ZERO,
        tier3: Decimal::ZERO,
    };

    pub fn new(tier1: Decimal, tier2: Decimal, tier3: Decimal) -> Self {
        Self { tier1, tier2, tier3 }
    }

    pub fn get(&self, tier: Tier) -> Decimal {
        match tier {
            Tier::One => self.tier1,
            Tier::Two => self.tier2,
            Tier::Three => self.tier3,
        }
    }

    pub fn set(&mut self, tier: Tier, value: Decimal) {
        match tier {
            Tier::One => self.tier1 = value,
            Tier::Two => self.tier2 = value,
            Tier::Three => self.tier3 = value,
        }
    }

    /// Apply `f` to every tier, passing the tier alongside its amount.
    pub fn map(&self, mut f: impl FnMut(Tier, Decimal) -> Decimal) -> Self {
        let mut out = TierAmounts::ZERO;
        for tier in Tier::ALL {
            out.set(tier, f(tier, self.get(tier)));
        }
        out
    }

    /// Σ tier_i. Totals are always derived, never stored independently.
    pub fn total(&self) -> Decimal {
        self.tier1 + self.tier2 + self.tier3
    }

    pub fn checked_add(&self, rhs: &TierAmounts) -> Option<TierAmounts> {
        Some(TierAmounts::new(
            self.tier1.checked_add(rhs.tier1)?,
            self.tier2.checked_add(rhs.tier2)?,
            self.tier3.checked_add(rhs.tier3)?,
        ))
    }

    pub fn checked_total(&self) -> Option<Decimal> {
        self.tier1.checked_add(self.tier2)?.checked_add(self.tier3)
    }

    /// Every tier within `[-MAX_AMOUNT, MAX_AMOUNT]`.
    pub fn is_bounded(&self) -> bool {
        Tier::ALL.iter().all(|t| self.get(*t).abs() <= MAX_AMOUNT)
    }

    pub fn is_non_negative(&self) -> bool {
        Tier::ALL.iter().all(|t| !self.get(*t).is_sign_negative())
    }

    pub fn is_zero(&self) -> bool {
        Tier::ALL.iter().all(|t| self.get(*t).is_zero())
    }
}

impl Add for TierAmounts {
    type Output = TierAmounts;

    fn add(self, rhs: TierAmounts) -> TierAmounts {
        self.map(|t, v| v + rhs.get(t))
    }
}

impl Sub for TierAmounts {
    type Output = TierAmounts;

    fn sub(self, rhs: TierAmounts) -> TierAmounts {
        self.map(|t, v| v - rhs.get(t))
    }
}

impl Neg for TierAmounts {
    type Output = TierAmounts;

    fn neg(self) -> TierAmounts {
        self.map(|_, v| -v)
    }
}

impl fmt::Display for TierAmounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T1={} T2={} T3={}", self.tier1, self.tier2, self.tier3)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What a settlement intent does with the account's money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Purpose {
    Invest,
    Withdraw,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Invest => "INVEST",
            Purpose::Withdraw => "WITHDRAW",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Purpose {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INVEST" => Ok(Purpose::Invest),
            "WITHDRAW" => Ok(Purpose::Withdraw),
            _ => Err(EngineError::Validation(format!(
                "purpose must be INVEST or WITHDRAW (got {s:?})"
            ))),
        }
    }
}

/// Queue row lifecycle.
///
/// ```text
/// PENDING ──claim──▶ PROCESSING ──resolve──▶ COMPLETED
///    │  ▲                         └─resolve──▶ FAILED
///    │  └───────────retry────────────────────────┘
///    └──cancel──▶ CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::Processing,
        QueueStatus::Completed,
        QueueStatus::Failed,
        QueueStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "PENDING",
            QueueStatus::Processing => "PROCESSING",
            QueueStatus::Completed => "COMPLETED",
            QueueStatus::Failed => "FAILED",
            QueueStatus::Cancelled => "CANCELLED",
        }
    }

    /// Whether the state machine permits `self → next`.
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Pending)
                | (Pending, Cancelled)
        )
    }

    /// Terminal outcome of a batch: only COMPLETED or FAILED.
    pub fn is_batch_outcome(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::Decode(format!("unknown queue status {s:?}")))
    }
}

/// Ledger classification of a portfolio transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Invest,
    Withdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Invest => "INVEST",
            TransactionType::Withdrawal => "WITHDRAWAL",
        }
    }
}

impl From<Purpose> for TransactionType {
    fn from(p: Purpose) -> Self {
        match p {
            Purpose::Invest => TransactionType::Invest,
            Purpose::Withdraw => TransactionType::Withdrawal,
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INVEST" => Ok(TransactionType::Invest),
            "WITHDRAWAL" => Ok(TransactionType::Withdrawal),
            other => Err(EngineError::Decode(format!("unknown transaction type {other:?}"))),
        }
    }
}

/// Order direction for the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// A settlement intent in the queue store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Idempotency key, immutable once enqueued.
    pub uuid: Uuid,
    pub account_id: String,
    pub tiers: TierAmounts,
    pub purpose: Purpose,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// Signed contribution to a batch's net delta.
    pub fn signed_tiers(&self) -> TierAmounts {
        match self.purpose {
            Purpose::Invest => self.tiers,
            Purpose::Withdraw => -self.tiers,
        }
    }
}

/// An account's position in the portfolio ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: String,
    pub account_id: String,
    /// Cost basis: dollars contributed per tier.
    pub allocation: TierAmounts,
    /// Mark-to-market value per tier.
    pub value: TierAmounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Portfolio {
    pub fn total_allocation(&self) -> Decimal {
        self.allocation.total()
    }

    pub fn total_value(&self) -> Decimal {
        self.value.total()
    }
}

/// Ledger mirror of one queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioTransaction {
    pub id: String,
    pub portfolio_id: String,
    pub kind: TransactionType,
    /// Signed per-tier change (negative for withdrawals).
    pub changes: TierAmounts,
    pub total_amount: Decimal,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A held asset in tier inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: String,
    pub tier: Tier,
    pub name: String,
    pub amount: Decimal,
    pub price_per_unit: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl Asset {
    /// `amount * price_per_unit`, or `None` when the product overflows.
    pub fn market_value(&self) -> Option<Decimal> {
        self.amount.checked_mul(self.price_per_unit)
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Netted view of one aggregator batch. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TierDeltaBatch {
    pub uuids: Vec<Uuid>,
    pub net: TierAmounts,
}

impl TierDeltaBatch {
    /// Net INVEST against WITHDRAW per tier.
    pub fn from_entries(entries: &[QueueEntry]) -> EngineResult<Self> {
        let mut net = TierAmounts::ZERO;
        for entry in entries {
            net = net.checked_add(&entry.signed_tiers()).ok_or_else(|| {
                EngineError::Validation(format!("batch net overflows at entry {}", entry.uuid))
            })?;
        }
        Ok(Self {
            uuids: entries.iter().map(|e| e.uuid).collect(),
            net,
        })
    }

    pub fn len(&self) -> usize {
        self.uuids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uuids.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for TIERFLOW stores and engines.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Duplicate key: queue entry {0} already exists")]
    DuplicateKey(Uuid),

    #[error("Invalid transition for {uuid}: {from} -> {to}")]
    InvalidTransition {
        uuid: Uuid,
        from: QueueStatus,
        to: QueueStatus,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Partial resolve: expected {expected} PROCESSING rows, updated {updated}")]
    PartialResolve { expected: usize, updated: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Concurrent update on asset {0}")]
    ConcurrentUpdate(String),

    #[error("Corrupt row: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
