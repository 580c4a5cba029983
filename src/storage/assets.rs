//! Tier asset inventory and the order audit log.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::debug;

use super::{decode_decimal, encode_decimal, from_micros, now, to_micros};
use crate::types::{Asset, EngineError, EngineResult, OrderSide, Tier, TierAmounts};

const ASSET_COLUMNS: &str = "asset_id, tier_number, asset_name, amount, price_per_unit, last_updated";

/// One row of the order audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderAuditRecord {
    pub order_id: String,
    pub asset_id: String,
    pub tier: Tier,
    pub side: OrderSide,
    pub amount_traded: Decimal,
    pub price: Decimal,
    pub status: String,
    pub error: Option<String>,
    pub execution_probability: Option<f64>,
    pub draw: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AssetStore {
    pool: SqlitePool,
}

impl AssetStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get(&self, asset_id: &str) -> EngineResult<Option<Asset>> {
        let row = sqlx::query(&format!("SELECT {ASSET_COLUMNS} FROM assets WHERE asset_id = ?"))
            .bind(asset_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(asset_from_row).transpose()
    }

    /// Insert a new holding. A racing insert of the same id or name
    /// surfaces as `ConcurrentUpdate`.
    pub async fn insert(&self, asset: &Asset) -> EngineResult<()> {
        let res = sqlx::query(
            "INSERT INTO assets (asset_id, tier_number, asset_name, amount, price_per_unit, last_updated) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&asset.asset_id)
        .bind(asset.tier.number() as i64)
        .bind(&asset.name)
        .bind(encode_decimal(asset.amount))
        .bind(encode_decimal(asset.price_per_unit))
        .bind(to_micros(asset.last_updated))
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(EngineError::ConcurrentUpdate(asset.asset_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Set `amount` to `new_amount` only if it still equals `expected`.
    pub async fn compare_and_set_amount(
        &self,
        asset_id: &str,
        expected: Decimal,
        new_amount: Decimal,
    ) -> EngineResult<()> {
        if new_amount.is_sign_negative() && !new_amount.is_zero() {
            return Err(EngineError::Validation(format!(
                "asset {asset_id} amount would become negative ({new_amount})"
            )));
        }

        let updated = sqlx::query(
            "UPDATE assets SET amount = ?, last_updated = ? WHERE asset_id = ? AND amount = ?",
        )
        .bind(encode_decimal(new_amount))
        .bind(to_micros(now()))
        .bind(asset_id)
        .bind(encode_decimal(expected))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(EngineError::ConcurrentUpdate(asset_id.to_string()));
        }
        debug!(asset_id, %expected, %new_amount, "Asset amount updated");
        Ok(())
    }

    pub async fn list_by_tier(&self, tier: Tier) -> EngineResult<Vec<Asset>> {
        let rows = sqlx::query(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets WHERE tier_number = ? ORDER BY asset_id"
        ))
        .bind(tier.number() as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(asset_from_row).collect()
    }

    /// Σ amount × price_per_unit per tier.
    pub async fn market_values(&self) -> EngineResult<TierAmounts> {
        let rows = sqlx::query(&format!("SELECT {ASSET_COLUMNS} FROM assets"))
            .fetch_all(&self.pool)
            .await?;

        let mut values = TierAmounts::ZERO;
        for row in &rows {
            let asset = asset_from_row(row)?;
            let total = asset
                .market_value()
                .and_then(|v| values.get(asset.tier).checked_add(v))
                .ok_or_else(|| {
                    EngineError::Decode(format!("market value of {} overflows", asset.asset_id))
                })?;
            values.set(asset.tier, total);
        }
        Ok(values)
    }

    pub async fn record_order(&self, record: &OrderAuditRecord) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO order_log (order_id, asset_id, tier_number, side, amount_traded, price, \
             status, error, execution_probability, draw, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.order_id)
        .bind(&record.asset_id)
        .bind(record.tier.number() as i64)
        .bind(record.side.as_str())
        .bind(encode_decimal(record.amount_traded))
        .bind(encode_decimal(record.price))
        .bind(&record.status)
        .bind(&record.error)
        .bind(record.execution_probability)
        .bind(record.draw)
        .bind(to_micros(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent audit records first.
    pub async fn list_order_log(&self, limit: usize) -> EngineResult<Vec<OrderAuditRecord>> {
        let rows = sqlx::query(
            "SELECT order_id, asset_id, tier_number, side, amount_traded, price, status, error, \
             execution_probability, draw, created_at FROM order_log \
             ORDER BY created_at DESC, order_id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(audit_from_row).collect()
    }
}

fn tier_from_row(row: &SqliteRow) -> EngineResult<Tier> {
    let n: i64 = row.try_get("tier_number")?;
    u8::try_from(n)
        .ok()
        .and_then(|n| Tier::try_from(n).ok())
        .ok_or_else(|| EngineError::Decode(format!("bad tier number {n}")))
}

fn asset_from_row(row: &SqliteRow) -> EngineResult<Asset> {
    Ok(Asset {
        asset_id: row.try_get("asset_id")?,
        tier: tier_from_row(row)?,
        name: row.try_get("asset_name")?,
        amount: decode_decimal(&row.try_get::<String, _>("amount")?)?,
        price_per_unit: decode_decimal(&row.try_get::<String, _>("price_per_unit")?)?,
        last_updated: from_micros(row.try_get("last_updated")?)?,
    })
}

fn audit_from_row(row: &SqliteRow) -> EngineResult<OrderAuditRecord> {
    let side: String = row.try_get("side")?;
    let side = match side.as_str() {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        other => return Err(EngineError::Decode(format!("bad order side {other:?}"))),
    };
    Ok(OrderAuditRecord {
        order_id: row.try_get("order_id")?,
        asset_id: row.try_get("asset_id")?,
        tier: tier_from_row(row)?,
        side,
        amount_traded: decode_decimal(&row.try_get::<String, _>("amount_traded")?)?,
        price: decode_decimal(&row.try_get::<String, _>("price")?)?,
        status: row.try_get("status")?,
        error: row.try_get("error")?,
        execution_probability: row.try_get("execution_probability")?,
        draw: row.try_get("draw")?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}
