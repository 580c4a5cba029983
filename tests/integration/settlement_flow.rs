//! Intake → aggregator → reconciler, end to end.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use tierflow::collaborators::CollaboratorError;
use tierflow::engine::aggregator::AggregatorOutcome;
use tierflow::engine::intake::Intake;
use tierflow::engine::reconciler::ReconcileOutcome;
use tierflow::storage::{self, AssetStore, PortfolioStore, QueueStore, StoreKind};
use tierflow::types::{EngineError, Purpose, QueueStatus, TierAmounts};

use crate::mock_executor::{flat, ten_percent_up, Harness, MockExecutor};

fn settled(outcome: AggregatorOutcome) -> (Vec<Uuid>, TierAmounts, QueueStatus, u32) {
    match outcome {
        AggregatorOutcome::Settled { uuids, net, status, attempts } => (uuids, net, status, attempts),
        other => panic!("expected a settled batch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_batch_settles_and_reaches_the_ledger() {
    let h = Harness::new(flat()).await;
    let executor = MockExecutor::completing();
    let aggregator = h.aggregator(executor.clone(), 10);

    let mut expected = Decimal::ZERO;
    for i in 0..10 {
        let amount = dec!(1000) + Decimal::from(i * 10);
        expected += amount;
        h.submit("acct-flow", amount, Purpose::Invest).await;
    }

    let (uuids, net, status, attempts) = settled(aggregator.run_cycle().await.unwrap());
    assert_eq!(uuids.len(), 10);
    assert_eq!(status, QueueStatus::Completed);
    assert_eq!(attempts, 1);
    assert_eq!(net.total(), expected);
    assert_eq!(executor.calls(), vec![net]);

    let report = match h.reconciler().run_cycle().await.unwrap() {
        ReconcileOutcome::Completed(r) => r,
        ReconcileOutcome::Busy => panic!("unexpected busy"),
    };
    assert_eq!(report.pulled, 10);
    assert_eq!(report.portfolios_created, 1);
    assert_eq!(report.transactions_inserted, 10);
    assert_eq!(report.scaled, 10);
    assert!(report.watermark_advanced);

    let portfolio = h.portfolios.find_by_account("acct-flow").await.unwrap().unwrap();
    assert_eq!(portfolio.total_allocation(), expected);
    // Flat market: value tracks cost basis exactly.
    assert_eq!(portfolio.total_value(), expected);

    let txs = h.portfolios.list_transactions(&portfolio.id).await.unwrap();
    assert_eq!(txs.len(), 10);
    assert!(txs.iter().all(|t| t.status == QueueStatus::Completed));
}

#[tokio::test]
async fn test_single_invest_marked_to_market() {
    let h = Harness::new(ten_percent_up()).await;
    let aggregator = h.aggregator(MockExecutor::completing(), 1);

    h.submit("acct-mtm", dec!(5000), Purpose::Invest).await;
    settled(aggregator.run_cycle().await.unwrap());
    h.reconciler().run_cycle().await.unwrap();

    let portfolio = h.portfolios.find_by_account("acct-mtm").await.unwrap().unwrap();
    assert_eq!(portfolio.allocation, TierAmounts::new(dec!(1500), dec!(2500), dec!(1000)));
    assert_eq!(portfolio.total_allocation(), dec!(5000));
    assert_eq!(portfolio.total_value(), dec!(5500));
}

#[tokio::test]
async fn test_offsetting_batch_sends_zero_net() {
    let h = Harness::new(flat()).await;
    let executor = MockExecutor::completing();
    let aggregator = h.aggregator(executor.clone(), 4);

    h.submit("acct-a", dec!(100), Purpose::Invest).await;
    h.submit("acct-b", dec!(100), Purpose::Withdraw).await;
    h.submit("acct-c", dec!(250), Purpose::Invest).await;
    h.submit("acct-d", dec!(250), Purpose::Withdraw).await;

    let (_, net, status, _) = settled(aggregator.run_cycle().await.unwrap());
    assert!(net.is_zero());
    assert_eq!(status, QueueStatus::Completed);
    assert_eq!(executor.calls().len(), 1);
}

#[tokio::test]
async fn test_failed_batch_recovers_after_manual_retry() {
    let h = Harness::new(flat()).await;
    let executor = MockExecutor::scripted([Ok(QueueStatus::Failed)]);
    let aggregator = h.aggregator(executor.clone(), 2);
    let reconciler = h.reconciler();

    let a = h.submit("acct-retry", dec!(100), Purpose::Invest).await;
    let b = h.submit("acct-retry", dec!(200), Purpose::Invest).await;

    let (_, _, status, _) = settled(aggregator.run_cycle().await.unwrap());
    assert_eq!(status, QueueStatus::Failed);

    // A FAILED invest never opens a portfolio.
    reconciler.run_cycle().await.unwrap();
    assert!(h.portfolios.find_by_account("acct-retry").await.unwrap().is_none());

    for id in [a, b] {
        let entry = h.queue.retry(id).await.unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
    }

    let (_, _, status, _) = settled(aggregator.run_cycle().await.unwrap());
    assert_eq!(status, QueueStatus::Completed);
    assert_eq!(executor.calls().len(), 2);

    reconciler.run_cycle().await.unwrap();
    let portfolio = h.portfolios.find_by_account("acct-retry").await.unwrap().unwrap();
    assert_eq!(portfolio.total_allocation(), dec!(300));
}

#[tokio::test]
async fn test_transient_errors_retry_with_the_same_net() {
    let h = Harness::new(flat()).await;
    let executor = MockExecutor::scripted([
        Err(CollaboratorError::Transient("timeout".into())),
        Err(CollaboratorError::Transient("connection reset".into())),
    ]);
    let aggregator = h.aggregator(executor.clone(), 1);
    h.submit("acct-t", dec!(100), Purpose::Invest).await;

    let (_, net, status, attempts) = settled(aggregator.run_cycle().await.unwrap());
    assert_eq!(status, QueueStatus::Completed);
    assert_eq!(attempts, 3);
    assert_eq!(executor.calls(), vec![net, net, net]);
}

#[tokio::test]
async fn test_rows_claimed_before_a_crash_are_not_reclaimed() {
    let h = Harness::new(flat()).await;
    for _ in 0..3 {
        h.submit("acct-crash", dec!(100), Purpose::Invest).await;
    }
    // A previous process claimed the rows and died before resolving them.
    let claimed = h.queue.claim_batch(3).await.unwrap();
    assert_eq!(claimed.len(), 3);

    let executor = MockExecutor::completing();
    let outcome = h.aggregator(executor.clone(), 1).run_cycle().await.unwrap();
    assert_eq!(outcome, AggregatorOutcome::Idle { pending: 0 });
    assert!(executor.calls().is_empty());

    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.processing, 3);
}

#[tokio::test]
async fn test_cancelled_entry_never_settles() {
    let h = Harness::new(flat()).await;
    let executor = MockExecutor::completing();
    let aggregator = h.aggregator(executor.clone(), 1);

    let id = h.submit("acct-cancel", dec!(100), Purpose::Invest).await;
    h.queue.cancel(id).await.unwrap();

    let outcome = aggregator.run_cycle().await.unwrap();
    assert_eq!(outcome, AggregatorOutcome::Idle { pending: 0 });
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_stores_can_share_one_database_file() {
    let path = std::env::temp_dir().join(format!("tierflow-{}.db", Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());

    let queue = QueueStore::new(storage::connect(&url, 2, StoreKind::Queue).await.unwrap());
    let portfolios =
        PortfolioStore::new(storage::connect(&url, 2, StoreKind::Portfolio).await.unwrap());
    let assets = AssetStore::new(storage::connect(&url, 2, StoreKind::Assets).await.unwrap());

    let id = Uuid::new_v4();
    queue
        .enqueue(id, "acct-file", TierAmounts::new(dec!(1), dec!(2), dec!(3)), Purpose::Invest)
        .await
        .unwrap();
    assert!(queue.get(id).await.unwrap().is_some());
    assert!(portfolios.find_by_account("acct-file").await.unwrap().is_none());
    assert!(assets.market_values().await.unwrap().is_zero());

    // Reopening applies no migration twice.
    storage::connect(&url, 1, StoreKind::Queue).await.unwrap();

    queue.pool().close().await;
    portfolios.pool().close().await;
    assets.pool().close().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_withdrawal_is_bounded_by_reconciled_value() {
    let h = Harness::new(ten_percent_up()).await;
    h.submit("acct-cap", dec!(1000), Purpose::Invest).await;
    h.aggregator(MockExecutor::completing(), 1).run_cycle().await.unwrap();
    h.reconciler().run_cycle().await.unwrap();

    // Marked to market: 1000 invested is worth 1100.
    let intake = Intake::new(h.queue.clone(), None, [30, 50, 20])
        .with_balance_check(h.portfolios.clone());
    let over = intake
        .submit(Uuid::new_v4(), "acct-cap", dec!(1100.01), Purpose::Withdraw)
        .await;
    assert!(matches!(over, Err(EngineError::Validation(_))));
    assert_eq!(h.queue.stats().await.unwrap().total, 1);

    intake
        .submit(Uuid::new_v4(), "acct-cap", dec!(1100), Purpose::Withdraw)
        .await
        .unwrap();
    assert_eq!(h.queue.stats().await.unwrap().pending, 1);
}
