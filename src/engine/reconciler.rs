//! Consistency reconciler.
//!
//! Pulls queue rows changed since the watermark and mirrors them into the
//! portfolio ledger. The first COMPLETED sighting of each queue uuid scales
//! the portfolio by the current tier drift. Applied uuids are recorded in
//! the same transaction, so re-running a pass over the same rows changes
//! nothing.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::guard::CycleGuard;
use crate::market::{MarketFeed, SharedTierBook};
use crate::storage::portfolio::{self as ledger, UpsertOutcome};
use crate::storage::{PortfolioStore, QueueStore};
use crate::types::{
    EngineResult, Portfolio, Purpose, QueueEntry, QueueStatus, TierAmounts, TransactionType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub pull_limit: usize,
    pub dedup_window: Duration,
}

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub pulled: usize,
    pub portfolios_created: usize,
    pub transactions_inserted: usize,
    pub transactions_updated: usize,
    pub scaled: usize,
    pub skipped: usize,
    pub errors: usize,
    /// Watermark after the pass.
    pub watermark: DateTime<Utc>,
    pub watermark_advanced: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Busy,
    Completed(ReconcileReport),
}

enum RowResult {
    Skipped,
    Applied {
        created: bool,
        upsert: UpsertOutcome,
        scaled: bool,
    },
}

pub struct Reconciler {
    queue: QueueStore,
    portfolios: PortfolioStore,
    book: SharedTierBook,
    feed: Option<Arc<dyn MarketFeed>>,
    settings: ReconcilerSettings,
    guard: CycleGuard,
}

impl Reconciler {
    pub fn new(
        queue: QueueStore,
        portfolios: PortfolioStore,
        book: SharedTierBook,
        feed: Option<Arc<dyn MarketFeed>>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            queue,
            portfolios,
            book,
            feed,
            settings,
            guard: CycleGuard::new(),
        }
    }

    pub fn guard(&self) -> &CycleGuard {
        &self.guard
    }

    /// Run one pass unless one is already in flight.
    pub async fn run_cycle(&self) -> EngineResult<ReconcileOutcome> {
        self.run_cycle_from(None).await
    }

    /// Run one pass, first rewinding the watermark to `since` if given.
    /// The rewind happens under the same guard as the pass, so a
    /// concurrent pass can neither skip it nor overwrite it.
    pub async fn run_cycle_from(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> EngineResult<ReconcileOutcome> {
        let Some(_token) = self.guard.try_enter() else {
            debug!("Reconciler pass already running, skipping");
            return Ok(ReconcileOutcome::Busy);
        };

        if let Some(since) = since {
            self.rewind_watermark(since).await?;
        }

        if let Some(feed) = &self.feed {
            // Failure keeps the last known values.
            let _ = self.book.refresh_from(feed.as_ref()).await;
        }
        let drift = self.book.snapshot().await.drift();

        let watermark = self.portfolios.load_watermark().await?;
        let rows = self.queue.updated_since(watermark, self.settings.pull_limit).await?;

        let mut report = ReconcileReport {
            pulled: rows.len(),
            watermark,
            ..Default::default()
        };

        for entry in &rows {
            match self.apply_row(entry, &drift).await {
                Ok(RowResult::Skipped) => report.skipped += 1,
                Ok(RowResult::Applied { created, upsert, scaled }) => {
                    if created {
                        report.portfolios_created += 1;
                    }
                    match upsert {
                        UpsertOutcome::Inserted { .. } => report.transactions_inserted += 1,
                        UpsertOutcome::Updated { .. } => report.transactions_updated += 1,
                    }
                    if scaled {
                        report.scaled += 1;
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    error!(uuid = %entry.uuid, account_id = %entry.account_id, error = %e, "Failed to reconcile row");
                }
            }
        }

        let newest = rows.iter().map(|e| e.updated_at).max();
        match newest {
            Some(newest) if report.errors == 0 => {
                self.portfolios.store_watermark(newest).await?;
                report.watermark = newest;
                report.watermark_advanced = true;
            }
            Some(_) => {
                warn!(errors = report.errors, %watermark, "Reconcile pass had errors, watermark held");
            }
            None => {}
        }

        if report.pulled > 0 {
            info!(
                pulled = report.pulled,
                inserted = report.transactions_inserted,
                updated = report.transactions_updated,
                scaled = report.scaled,
                skipped = report.skipped,
                errors = report.errors,
                watermark = %report.watermark,
                "Reconcile pass complete"
            );
        }
        Ok(ReconcileOutcome::Completed(report))
    }

    /// Move the watermark back so the next pass replays everything after
    /// `to`.
    pub async fn rewind_watermark(&self, to: DateTime<Utc>) -> EngineResult<()> {
        self.portfolios.store_watermark(to).await?;
        warn!(watermark = %to, "Reconciler watermark rewound");
        Ok(())
    }

    async fn apply_row(&self, entry: &QueueEntry, drift: &TierAmounts) -> EngineResult<RowResult> {
        let mut tx = self.portfolios.begin().await?;

        let mut created = false;
        let portfolio = match ledger::find_by_account(&mut tx, &entry.account_id).await? {
            Some(p) => p,
            None if entry.status == QueueStatus::Completed && entry.purpose == Purpose::Invest => {
                created = true;
                ledger::create_empty(&mut tx, &entry.account_id).await?
            }
            None => {
                warn!(uuid = %entry.uuid, account_id = %entry.account_id, status = %entry.status, "No portfolio for account, skipping");
                return Ok(RowResult::Skipped);
            }
        };

        let upsert = ledger::upsert_transaction(
            &mut tx,
            &portfolio.id,
            TransactionType::from(entry.purpose),
            entry.signed_tiers(),
            entry.status,
            self.settings.dedup_window,
        )
        .await?;

        let scaled = entry.status == QueueStatus::Completed
            && ledger::mark_reconciled(&mut tx, entry.uuid, &portfolio.id).await?;
        if scaled {
            let next = apply_completed(&portfolio, entry.purpose, entry.tiers, drift);
            ledger::save_legs(&mut tx, &next).await?;
            debug!(
                uuid = %entry.uuid,
                allocation = %next.allocation,
                value = %next.value,
                "Portfolio scaled"
            );
        }

        tx.commit().await?;
        Ok(RowResult::Applied { created, upsert, scaled })
    }
}

/// Portfolio after one completed intent.
///
/// INVEST adds to the cost basis and marks the grown value by drift.
/// WITHDRAW takes from value and marks the shrunk cost basis by inverse
/// drift.
pub fn apply_completed(
    portfolio: &Portfolio,
    purpose: Purpose,
    tiers: TierAmounts,
    drift: &TierAmounts,
) -> Portfolio {
    let one = rust_decimal::Decimal::ONE;
    let mut next = portfolio.clone();
    match purpose {
        Purpose::Invest => {
            next.allocation = portfolio.allocation + tiers;
            next.value = (portfolio.value + tiers).map(|t, v| v * (one + drift.get(t)));
        }
        Purpose::Withdraw => {
            next.value = portfolio.value - tiers;
            next.allocation = (portfolio.allocation - tiers).map(|t, v| v * (one - drift.get(t)));
        }
    }
    next
}
