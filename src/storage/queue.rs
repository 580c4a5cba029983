//! Queue store: durable settlement intents and their status transitions.
//!
//! The uuid unique constraint is the only idempotency guard in the system:
//! a caller retrying a request must reuse its uuid and will get
//! `DuplicateKey` back instead of a second row.
//!
//! Every write stamps `updated_at` from `queue_clock` inside its own
//! transaction. SQLite admits one writer at a time, so a row committed
//! after a reader saw stamp `t` always carries a stamp above `t`, which is
//! what lets the reconciler page by watermark.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{Sqlite, SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{decode_decimal, encode_decimal, from_micros, now, to_micros};
use crate::types::{
    EngineError, EngineResult, Purpose, QueueEntry, QueueStatus, TierAmounts, MAX_AMOUNT,
};

const ENTRY_COLUMNS: &str = "id, uuid, account_id, tier1, tier2, tier3, purpose, status, \
                             created_at, updated_at, processed_at";

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone)]
pub struct QueueStore {
    pool: SqlitePool,
}

impl QueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new PENDING intent.
    pub async fn enqueue(
        &self,
        uuid: Uuid,
        account_id: &str,
        tiers: TierAmounts,
        purpose: Purpose,
    ) -> EngineResult<QueueEntry> {
        if account_id.trim().is_empty() {
            return Err(EngineError::Validation("account id is required".into()));
        }
        if !tiers.is_non_negative() {
            return Err(EngineError::Validation(format!(
                "tier amounts must be non-negative ({tiers})"
            )));
        }
        if !tiers.is_bounded() {
            return Err(EngineError::Validation(format!(
                "tier amounts must not exceed {MAX_AMOUNT} ({tiers})"
            )));
        }

        let mut tx = self.pool.begin().await?;
        let ts = next_stamp(&mut tx).await?;
        let res = sqlx::query(
            "INSERT INTO queue (uuid, account_id, tier1, tier2, tier3, purpose, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'PENDING', ?, ?)",
        )
        .bind(uuid.to_string())
        .bind(account_id)
        .bind(encode_decimal(tiers.tier1))
        .bind(encode_decimal(tiers.tier2))
        .bind(encode_decimal(tiers.tier3))
        .bind(purpose.as_str())
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await;

        match res {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                warn!(%uuid, "Rejected duplicate enqueue");
                return Err(EngineError::DuplicateKey(uuid));
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit().await?;
        let ts = from_micros(ts)?;

        info!(%uuid, account_id, purpose = %purpose, tiers = %tiers, "Enqueued settlement intent");

        Ok(QueueEntry {
            uuid,
            account_id: account_id.to_string(),
            tiers,
            purpose,
            status: QueueStatus::Pending,
            created_at: ts,
            updated_at: ts,
            processed_at: None,
        })
    }

    pub async fn get(&self, uuid: Uuid) -> EngineResult<Option<QueueEntry>> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM queue WHERE uuid = ?"))
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn count_pending(&self) -> EngineResult<u64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue WHERE status = 'PENDING'")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Atomically move exactly `limit` oldest PENDING rows to PROCESSING,
    /// or none when fewer are pending.
    ///
    /// Selection and update are one statement, so two concurrent callers can
    /// never claim overlapping rows. Returned oldest first.
    pub async fn claim_batch(&self, limit: usize) -> EngineResult<Vec<QueueEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let ts = next_stamp(&mut tx).await?;
        let rows = sqlx::query(&format!(
            "UPDATE queue SET status = 'PROCESSING', updated_at = ? \
             WHERE id IN (SELECT id FROM queue WHERE status = 'PENDING' \
                          ORDER BY created_at ASC, id ASC LIMIT ?) \
             RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(ts)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        if rows.len() < limit {
            tx.rollback().await?;
            debug!(requested = limit, pending = rows.len(), "Short batch left pending");
            return Ok(Vec::new());
        }

        let mut claimed = rows
            .iter()
            .map(|r| Ok((r.try_get::<i64, _>("id")?, entry_from_row(r)?)))
            .collect::<EngineResult<Vec<_>>>()?;
        tx.commit().await?;
        // RETURNING order is unspecified.
        claimed.sort_by(|(a_id, a), (b_id, b)| {
            a.created_at.cmp(&b.created_at).then(a_id.cmp(b_id))
        });

        debug!(requested = limit, claimed = claimed.len(), "Claimed batch");
        Ok(claimed.into_iter().map(|(_, e)| e).collect())
    }

    /// Move every uuid in the batch from PROCESSING to `status` in one
    /// all-or-nothing update. Returns the number of rows resolved.
    pub async fn resolve_batch(&self, uuids: &[Uuid], status: QueueStatus) -> EngineResult<u64> {
        if !status.is_batch_outcome() {
            return Err(EngineError::Validation(format!(
                "a batch can only resolve to COMPLETED or FAILED (got {status})"
            )));
        }
        let unique: HashSet<Uuid> = uuids.iter().copied().collect();
        if unique.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let ts = next_stamp(&mut tx).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE queue SET status = ");
        qb.push_bind(status.as_str())
            .push(", updated_at = ")
            .push_bind(ts)
            .push(", processed_at = ")
            .push_bind(ts)
            .push(" WHERE status = 'PROCESSING' AND uuid IN (");
        let mut list = qb.separated(", ");
        for uuid in &unique {
            list.push_bind(uuid.to_string());
        }
        list.push_unseparated(")");

        let updated = qb.build().execute(&mut *tx).await?.rows_affected();
        if updated != unique.len() as u64 {
            tx.rollback().await?;
            return Err(EngineError::PartialResolve {
                expected: unique.len(),
                updated,
            });
        }
        tx.commit().await?;

        info!(count = updated, status = %status, "Resolved batch");
        Ok(updated)
    }

    /// FAILED → PENDING, so the intent rejoins the next batch.
    pub async fn retry(&self, uuid: Uuid) -> EngineResult<QueueEntry> {
        self.transition(uuid, QueueStatus::Failed, QueueStatus::Pending).await
    }

    /// PENDING → CANCELLED.
    pub async fn cancel(&self, uuid: Uuid) -> EngineResult<QueueEntry> {
        self.transition(uuid, QueueStatus::Pending, QueueStatus::Cancelled).await
    }

    async fn transition(
        &self,
        uuid: Uuid,
        from: QueueStatus,
        to: QueueStatus,
    ) -> EngineResult<QueueEntry> {
        debug_assert!(from.can_transition_to(to));

        let mut tx = self.pool.begin().await?;
        let ts = next_stamp(&mut tx).await?;
        let updated = sqlx::query(
            "UPDATE queue SET status = ?, updated_at = ? WHERE uuid = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(ts)
        .bind(uuid.to_string())
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM queue WHERE uuid = ?"))
            .bind(uuid.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let entry = row
            .as_ref()
            .map(entry_from_row)
            .transpose()?
            .ok_or_else(|| EngineError::NotFound(format!("queue entry {uuid}")))?;

        if updated == 0 {
            return Err(EngineError::InvalidTransition {
                uuid,
                from: entry.status,
                to,
            });
        }
        tx.commit().await?;

        info!(%uuid, from = %from, to = %to, "Queue entry transitioned");
        Ok(entry)
    }

    /// Rows changed strictly after `watermark`, oldest change first.
    ///
    /// A page is cut at the `updated_at` of its `limit`-th row and includes
    /// every row sharing that timestamp, so a batch resolved in one statement
    /// is never split across pages.
    pub async fn updated_since(
        &self,
        watermark: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<QueueEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mark = to_micros(watermark);
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM queue WHERE updated_at > ? \
             AND updated_at <= COALESCE(\
                 (SELECT updated_at FROM queue WHERE updated_at > ? \
                  ORDER BY updated_at ASC, id ASC LIMIT 1 OFFSET ?), \
                 9223372036854775807) \
             ORDER BY updated_at ASC, id ASC"
        ))
        .bind(mark)
        .bind(mark)
        .bind(limit as i64 - 1)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn stats(&self) -> EngineResult<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, n) in rows {
            let n = n.max(0) as u64;
            stats.total += n;
            match status.parse::<QueueStatus>()? {
                QueueStatus::Pending => stats.pending = n,
                QueueStatus::Processing => stats.processing = n,
                QueueStatus::Completed => stats.completed = n,
                QueueStatus::Failed => stats.failed = n,
                QueueStatus::Cancelled => stats.cancelled = n,
            }
        }
        Ok(stats)
    }
}

/// Issue the next `updated_at` stamp: wall-clock microseconds, bumped past
/// the last issued stamp when the clock has not moved or went backwards.
///
/// Must be the first write of the caller's transaction so the stamp is
/// taken while holding the database write lock.
async fn next_stamp(conn: &mut SqliteConnection) -> EngineResult<i64> {
    let (stamp,): (i64,) = sqlx::query_as(
        "INSERT INTO queue_clock (id, last) VALUES (1, ?) \
         ON CONFLICT (id) DO UPDATE SET last = MAX(last + 1, excluded.last) \
         RETURNING last",
    )
    .bind(to_micros(now()))
    .fetch_one(&mut *conn)
    .await?;
    Ok(stamp)
}

fn entry_from_row(row: &SqliteRow) -> EngineResult<QueueEntry> {
    let uuid_text: String = row.try_get("uuid")?;
    let uuid = Uuid::parse_str(&uuid_text)
        .map_err(|e| EngineError::Decode(format!("bad uuid {uuid_text:?}: {e}")))?;
    let purpose_text: String = row.try_get("purpose")?;
    let status_text: String = row.try_get("status")?;
    let processed_at: Option<i64> = row.try_get("processed_at")?;

    Ok(QueueEntry {
        uuid,
        account_id: row.try_get("account_id")?,
        tiers: TierAmounts::new(
            decode_decimal(&row.try_get::<String, _>("tier1")?)?,
            decode_decimal(&row.try_get::<String, _>("tier2")?)?,
            decode_decimal(&row.try_get::<String, _>("tier3")?)?,
        ),
        purpose: purpose_text
            .parse()
            .map_err(|_| EngineError::Decode(format!("bad purpose {purpose_text:?}")))?,
        status: status_text.parse()?,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
        processed_at: processed_at.map(from_micros).transpose()?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
