//! Reconciler replay, restart and paging behaviour.

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use tierflow::engine::reconciler::{ReconcileOutcome, ReconcileReport, Reconciler, ReconcilerSettings};
use tierflow::types::{Purpose, TierAmounts, TransactionType};

use crate::mock_executor::{flat, ten_percent_up, Harness, MockExecutor};

async fn pass(reconciler: &Reconciler) -> ReconcileReport {
    match reconciler.run_cycle().await.unwrap() {
        ReconcileOutcome::Completed(r) => r,
        ReconcileOutcome::Busy => panic!("unexpected busy"),
    }
}

/// Submit and settle one intent on its own.
async fn settle_one(h: &Harness, account: &str, amount: Decimal, purpose: Purpose) {
    h.submit(account, amount, purpose).await;
    h.aggregator(MockExecutor::completing(), 1).run_cycle().await.unwrap();
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_watermark() {
    let h = Harness::new(flat()).await;
    settle_one(&h, "acct-restart", dec!(100), Purpose::Invest).await;

    let first = pass(&h.reconciler()).await;
    assert_eq!(first.pulled, 1);
    assert!(first.watermark_advanced);

    // New instance, same ledger: nothing left to pull.
    let second = pass(&h.reconciler()).await;
    assert_eq!(second.pulled, 0);
    assert_eq!(second.watermark, first.watermark);

    settle_one(&h, "acct-restart", dec!(250), Purpose::Invest).await;
    let third = pass(&h.reconciler()).await;
    assert_eq!(third.pulled, 1);
    assert_eq!(third.scaled, 1);

    let portfolio = h.portfolios.find_by_account("acct-restart").await.unwrap().unwrap();
    assert_eq!(portfolio.total_allocation(), dec!(350));
}

#[tokio::test]
async fn test_rewind_replays_without_rescaling() {
    let h = Harness::new(ten_percent_up()).await;
    settle_one(&h, "acct-replay", dec!(1000), Purpose::Invest).await;
    settle_one(&h, "acct-replay", dec!(300), Purpose::Withdraw).await;

    let reconciler = h.reconciler();
    let first = pass(&reconciler).await;
    assert_eq!(first.scaled, 2);
    let before = h.portfolios.find_by_account("acct-replay").await.unwrap().unwrap();

    let epoch = Utc.timestamp_opt(0, 0).unwrap();
    reconciler.rewind_watermark(epoch).await.unwrap();
    let replay = pass(&reconciler).await;
    assert_eq!(replay.pulled, 2);
    assert_eq!(replay.transactions_updated, 2);
    assert_eq!(replay.transactions_inserted, 0);
    assert_eq!(replay.scaled, 0);

    let after = h.portfolios.find_by_account("acct-replay").await.unwrap().unwrap();
    assert_eq!(after.allocation, before.allocation);
    assert_eq!(after.value, before.value);
    assert_eq!(h.portfolios.list_transactions(&after.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_pending_mirror_then_completion_scales_once() {
    let h = Harness::new(flat()).await;
    settle_one(&h, "acct-mirror", dec!(1000), Purpose::Invest).await;
    let reconciler = h.reconciler();
    pass(&reconciler).await;

    // Seen while still PENDING: mirrored, not applied.
    h.submit("acct-mirror", dec!(500), Purpose::Invest).await;
    let pending = pass(&reconciler).await;
    assert_eq!(pending.transactions_inserted, 1);
    assert_eq!(pending.scaled, 0);
    let portfolio = h.portfolios.find_by_account("acct-mirror").await.unwrap().unwrap();
    assert_eq!(portfolio.total_allocation(), dec!(1000));

    h.aggregator(MockExecutor::completing(), 1).run_cycle().await.unwrap();
    let completed = pass(&reconciler).await;
    assert_eq!(completed.transactions_updated, 1);
    assert_eq!(completed.scaled, 1);

    let portfolio = h.portfolios.find_by_account("acct-mirror").await.unwrap().unwrap();
    assert_eq!(portfolio.total_allocation(), dec!(1500));
    assert_eq!(h.portfolios.list_transactions(&portfolio.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_withdraw_is_recorded_with_negative_changes() {
    let h = Harness::new(flat()).await;
    settle_one(&h, "acct-w", dec!(1000), Purpose::Invest).await;
    settle_one(&h, "acct-w", dec!(400), Purpose::Withdraw).await;
    pass(&h.reconciler()).await;

    let portfolio = h.portfolios.find_by_account("acct-w").await.unwrap().unwrap();
    assert_eq!(portfolio.allocation, TierAmounts::new(dec!(180), dec!(300), dec!(120)));
    assert_eq!(portfolio.total_value(), dec!(600));

    let txs = h.portfolios.list_transactions(&portfolio.id).await.unwrap();
    let withdraw = txs
        .iter()
        .find(|t| t.kind == TransactionType::Withdrawal)
        .unwrap();
    assert_eq!(withdraw.total_amount, dec!(-400));
    assert_eq!(withdraw.changes.tier2, dec!(-200));
}

#[tokio::test]
async fn test_withdraw_for_unknown_account_is_skipped_not_failed() {
    let h = Harness::new(flat()).await;
    settle_one(&h, "acct-ghost", dec!(100), Purpose::Withdraw).await;

    let report = pass(&h.reconciler()).await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.errors, 0);
    assert!(report.watermark_advanced);
    assert!(h.portfolios.find_by_account("acct-ghost").await.unwrap().is_none());
}

fn small_pages(h: &Harness) -> Reconciler {
    Reconciler::new(
        h.queue.clone(),
        h.portfolios.clone(),
        h.book.clone(),
        None,
        ReconcilerSettings {
            pull_limit: 3,
            dedup_window: chrono::Duration::seconds(3600),
        },
    )
}

#[tokio::test]
async fn test_backlog_drains_across_pages() {
    let h = Harness::new(flat()).await;
    let mut expected = Decimal::ZERO;
    for i in 1..=7 {
        let amount = Decimal::from(i * 100);
        expected += amount;
        settle_one(&h, "acct-page", amount, Purpose::Invest).await;
    }

    let reconciler = small_pages(&h);
    let mut pulled = 0;
    for _ in 0..10 {
        let report = pass(&reconciler).await;
        if report.pulled == 0 {
            break;
        }
        pulled += report.pulled;
    }
    assert_eq!(pulled, 7);

    let portfolio = h.portfolios.find_by_account("acct-page").await.unwrap().unwrap();
    assert_eq!(portfolio.total_allocation(), expected);
}

#[tokio::test]
async fn test_page_never_splits_a_settled_batch() {
    let h = Harness::new(flat()).await;
    for i in 1..=7 {
        h.submit("acct-batch", Decimal::from(i * 100), Purpose::Invest).await;
    }
    // One resolve stamps all seven rows with the same updated_at.
    h.aggregator(MockExecutor::completing(), 7).run_cycle().await.unwrap();

    let report = pass(&small_pages(&h)).await;
    assert_eq!(report.pulled, 7);
    assert_eq!(report.scaled, 7);
}

#[tokio::test]
async fn test_equal_amount_intents_in_one_batch_both_land() {
    let h = Harness::new(flat()).await;
    h.submit("acct-twice", dec!(1000), Purpose::Invest).await;
    h.submit("acct-twice", dec!(1000), Purpose::Invest).await;
    h.aggregator(MockExecutor::completing(), 2).run_cycle().await.unwrap();

    let report = pass(&h.reconciler()).await;
    assert_eq!(report.pulled, 2);
    assert_eq!(report.scaled, 2);

    let portfolio = h.portfolios.find_by_account("acct-twice").await.unwrap().unwrap();
    assert_eq!(portfolio.total_allocation(), dec!(2000));
    assert_eq!(portfolio.value, TierAmounts::new(dec!(600), dec!(1000), dec!(400)));
}
