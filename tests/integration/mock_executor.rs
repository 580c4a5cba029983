//! Mock collaborators for integration testing.
//!
//! Provides a deterministic `SettlementExecutor` that replays scripted
//! verdicts and records every net delta it was asked to apply, plus a
//! harness bundling in-memory stores.

use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use tierflow::collaborators::{CollaboratorError, SettlementExecutor};
use tierflow::engine::aggregator::{Aggregator, AggregatorSettings};
use tierflow::engine::intake::Intake;
use tierflow::engine::reconciler::{Reconciler, ReconcilerSettings};
use tierflow::market::{SharedTierBook, TierValues};
use tierflow::storage::{connect_in_memory, PortfolioStore, QueueStore, StoreKind};
use tierflow::types::{Purpose, QueueStatus, TierAmounts};

/// A scripted settlement executor.
///
/// Verdicts are consumed in order; once the script runs out every call
/// answers COMPLETED.
#[derive(Default)]
pub struct MockExecutor {
    script: Mutex<VecDeque<Result<QueueStatus, CollaboratorError>>>,
    calls: Mutex<Vec<TierAmounts>>,
}

impl MockExecutor {
    pub fn completing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(
        verdicts: impl IntoIterator<Item = Result<QueueStatus, CollaboratorError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(verdicts.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Net deltas received, one per attempt.
    pub fn calls(&self) -> Vec<TierAmounts> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SettlementExecutor for MockExecutor {
    async fn execute(&self, net: TierAmounts) -> Result<QueueStatus, CollaboratorError> {
        self.calls.lock().unwrap().push(net);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(QueueStatus::Completed))
    }
}

/// Queue, ledger and tier book wired the way the `all` role wires them.
pub struct Harness {
    pub queue: QueueStore,
    pub portfolios: PortfolioStore,
    pub book: SharedTierBook,
    pub intake: Intake,
}

impl Harness {
    pub async fn new(values: TierValues) -> Self {
        let queue = QueueStore::new(connect_in_memory(StoreKind::Queue).await.unwrap());
        let portfolios =
            PortfolioStore::new(connect_in_memory(StoreKind::Portfolio).await.unwrap());
        Self {
            intake: Intake::new(queue.clone(), None, [30, 50, 20]),
            queue,
            portfolios,
            book: SharedTierBook::new(values),
        }
    }

    pub fn aggregator(&self, executor: Arc<MockExecutor>, batch_size: usize) -> Aggregator {
        Aggregator::new(
            self.queue.clone(),
            executor,
            AggregatorSettings {
                batch_size,
                retry_attempts: 3,
                retry_base_delay: Duration::from_millis(1),
            },
        )
    }

    /// A fresh reconciler over the same stores, as after a restart.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.queue.clone(),
            self.portfolios.clone(),
            self.book.clone(),
            None,
            ReconcilerSettings {
                pull_limit: 500,
                dedup_window: chrono::Duration::seconds(3600),
            },
        )
    }

    pub async fn submit(&self, account: &str, amount: rust_decimal::Decimal, purpose: Purpose) -> Uuid {
        let id = Uuid::new_v4();
        self.intake.submit(id, account, amount, purpose).await.unwrap();
        id
    }
}

/// Book 1000 per tier, market 10% above in every tier.
pub fn ten_percent_up() -> TierValues {
    let pools = TierAmounts::new(dec!(1000), dec!(1000), dec!(1000));
    TierValues::new(pools, pools.map(|_, v| v * dec!(1.1)))
}

/// Market equal to book: zero drift.
pub fn flat() -> TierValues {
    let pools = TierAmounts::new(dec!(1000), dec!(1000), dec!(1000));
    TierValues::new(pools, pools)
}
