//! Portfolio ledger store.
//!
//! Reads that the reconciler needs inside its per-row transaction are free
//! functions over a `SqliteConnection`, so the ledger upsert and the
//! portfolio scaling commit together.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{Sqlite, SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::{decode_decimal, encode_decimal, from_micros, now, to_micros};
use crate::types::{
    EngineError, EngineResult, Portfolio, PortfolioTransaction, QueueStatus, TierAmounts,
    TransactionType,
};

const PORTFOLIO_COLUMNS: &str = "id, account_id, \
    tier1_allocation, tier2_allocation, tier3_allocation, \
    tier1_value, tier2_value, tier3_value, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, portfolio_id, transaction_type, \
    tier1_change, tier2_change, tier3_change, total_amount, status, created_at, updated_at";

/// Result of the idempotent ledger upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted { id: String },
    Updated { id: String, previous: QueueStatus },
}

#[derive(Debug, Clone)]
pub struct PortfolioStore {
    pool: SqlitePool,
}

impl PortfolioStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> EngineResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn find_by_account(&self, account_id: &str) -> EngineResult<Option<Portfolio>> {
        let mut conn = self.pool.acquire().await?;
        find_by_account(&mut conn, account_id).await
    }

    pub async fn list_transactions(
        &self,
        portfolio_id: &str,
    ) -> EngineResult<Vec<PortfolioTransaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM portfolio_transactions \
             WHERE portfolio_id = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(portfolio_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    /// Last fully reconciled `updated_at`, or the epoch on a fresh store.
    pub async fn load_watermark(&self) -> EngineResult<DateTime<Utc>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT watermark FROM reconciler_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((micros,)) => from_micros(micros),
            None => Ok(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    pub async fn store_watermark(&self, watermark: DateTime<Utc>) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO reconciler_state (id, watermark, updated_at) VALUES (1, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET watermark = excluded.watermark, \
             updated_at = excluded.updated_at",
        )
        .bind(to_micros(watermark))
        .bind(to_micros(now()))
        .execute(&self.pool)
        .await?;
        debug!(%watermark, "Watermark stored");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connection-scoped operations
// ---------------------------------------------------------------------------

pub async fn find_by_account(
    conn: &mut SqliteConnection,
    account_id: &str,
) -> EngineResult<Option<Portfolio>> {
    let row = sqlx::query(&format!(
        "SELECT {PORTFOLIO_COLUMNS} FROM portfolio WHERE account_id = ?"
    ))
    .bind(account_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(portfolio_from_row).transpose()
}

/// Create an all-zero portfolio for `account_id`.
pub async fn create_empty(conn: &mut SqliteConnection, account_id: &str) -> EngineResult<Portfolio> {
    let ts = now();
    let portfolio = Portfolio {
        id: Uuid::new_v4().to_string(),
        account_id: account_id.to_string(),
        allocation: TierAmounts::ZERO,
        value: TierAmounts::ZERO,
        created_at: ts,
        updated_at: ts,
    };

    sqlx::query(
        "INSERT INTO portfolio (id, account_id, created_at, updated_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&portfolio.id)
    .bind(&portfolio.account_id)
    .bind(to_micros(ts))
    .bind(to_micros(ts))
    .execute(&mut *conn)
    .await?;

    info!(account_id, portfolio_id = %portfolio.id, "Created portfolio");
    Ok(portfolio)
}

/// Persist allocation and value legs. Totals are recomputed from the legs.
pub async fn save_legs(conn: &mut SqliteConnection, portfolio: &Portfolio) -> EngineResult<()> {
    let a = &portfolio.allocation;
    let v = &portfolio.value;
    let updated = sqlx::query(
        "UPDATE portfolio SET \
         tier1_allocation = ?, tier2_allocation = ?, tier3_allocation = ?, \
         tier1_value = ?, tier2_value = ?, tier3_value = ?, \
         total_allocation = ?, total_value = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(encode_decimal(a.tier1))
    .bind(encode_decimal(a.tier2))
    .bind(encode_decimal(a.tier3))
    .bind(encode_decimal(v.tier1))
    .bind(encode_decimal(v.tier2))
    .bind(encode_decimal(v.tier3))
    .bind(encode_decimal(a.total()))
    .bind(encode_decimal(v.total()))
    .bind(to_micros(now()))
    .bind(&portfolio.id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(EngineError::NotFound(format!("portfolio {}", portfolio.id)));
    }
    Ok(())
}

/// Update the status of a matching transaction created within `window`,
/// or insert a new one. Matching is on `(portfolio_id, type, total_amount)`.
pub async fn upsert_transaction(
    conn: &mut SqliteConnection,
    portfolio_id: &str,
    kind: TransactionType,
    changes: TierAmounts,
    status: QueueStatus,
    window: Duration,
) -> EngineResult<UpsertOutcome> {
    let ts = now();
    let total = encode_decimal(changes.total());

    let existing: Option<(String, String)> = sqlx::query_as(
        "SELECT id, status FROM portfolio_transactions \
         WHERE portfolio_id = ? AND transaction_type = ? AND total_amount = ? \
         AND created_at >= ? ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(portfolio_id)
    .bind(kind.as_str())
    .bind(&total)
    .bind(to_micros(ts - window))
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((id, previous)) = existing {
        let previous: QueueStatus = previous.parse()?;
        sqlx::query("UPDATE portfolio_transactions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(to_micros(ts))
            .bind(&id)
            .execute(&mut *conn)
            .await?;
        debug!(transaction_id = %id, %previous, %status, "Updated ledger transaction");
        return Ok(UpsertOutcome::Updated { id, previous });
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO portfolio_transactions \
         (id, portfolio_id, transaction_type, tier1_change, tier2_change, tier3_change, \
          total_amount, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(portfolio_id)
    .bind(kind.as_str())
    .bind(encode_decimal(changes.tier1))
    .bind(encode_decimal(changes.tier2))
    .bind(encode_decimal(changes.tier3))
    .bind(&total)
    .bind(status.as_str())
    .bind(to_micros(ts))
    .bind(to_micros(ts))
    .execute(&mut *conn)
    .await?;
    debug!(transaction_id = %id, %status, "Inserted ledger transaction");
    Ok(UpsertOutcome::Inserted { id })
}

/// Record that queue intent `uuid` has been applied to `portfolio_id`.
///
/// Returns false when it already was.
pub async fn mark_reconciled(
    conn: &mut SqliteConnection,
    uuid: Uuid,
    portfolio_id: &str,
) -> EngineResult<bool> {
    let inserted = sqlx::query(
        "INSERT INTO reconciled_entries (uuid, portfolio_id, reconciled_at) VALUES (?, ?, ?) \
         ON CONFLICT (uuid) DO NOTHING",
    )
    .bind(uuid.to_string())
    .bind(portfolio_id)
    .bind(to_micros(now()))
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(inserted == 1)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn amounts(row: &SqliteRow, cols: [&str; 3]) -> EngineResult<TierAmounts> {
    Ok(TierAmounts::new(
        decode_decimal(&row.try_get::<String, _>(cols[0])?)?,
        decode_decimal(&row.try_get::<String, _>(cols[1])?)?,
        decode_decimal(&row.try_get::<String, _>(cols[2])?)?,
    ))
}

fn portfolio_from_row(row: &SqliteRow) -> EngineResult<Portfolio> {
    Ok(Portfolio {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        allocation: amounts(row, ["tier1_allocation", "tier2_allocation", "tier3_allocation"])?,
        value: amounts(row, ["tier1_value", "tier2_value", "tier3_value"])?,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> EngineResult<PortfolioTransaction> {
    let kind: String = row.try_get("transaction_type")?;
    let status: String = row.try_get("status")?;
    Ok(PortfolioTransaction {
        id: row.try_get("id")?,
        portfolio_id: row.try_get("portfolio_id")?,
        kind: kind.parse()?,
        changes: amounts(row, ["tier1_change", "tier2_change", "tier3_change"])?,
        total_amount: decode_decimal(&row.try_get::<String, _>("total_amount")?)?,
        status: status.parse()?,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}
