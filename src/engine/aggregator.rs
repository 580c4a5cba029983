//! Batch aggregator.
//!
//! Each cycle claims one batch of PENDING intents, nets INVEST against
//! WITHDRAW per tier, sends the net to the settlement executor and resolves
//! every row in the batch to the executor's verdict. Rows share one fate.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::guard::CycleGuard;
use crate::collaborators::{CollaboratorError, SettlementExecutor};
use crate::storage::QueueStore;
use crate::types::{EngineResult, QueueStatus, TierAmounts, TierDeltaBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorSettings {
    pub batch_size: usize,
    /// Total executor attempts per batch, including the first.
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
}

/// What one aggregator cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorOutcome {
    /// Another cycle was already running.
    Busy,
    /// Fewer than `batch_size` rows were pending.
    Idle { pending: u64 },
    Settled {
        uuids: Vec<Uuid>,
        net: TierAmounts,
        status: QueueStatus,
        attempts: u32,
    },
    /// The executor answered but the rows could not be resolved; they are
    /// left PROCESSING.
    ResolveFailed {
        uuids: Vec<Uuid>,
        status: QueueStatus,
        error: String,
    },
}

pub struct Aggregator {
    queue: QueueStore,
    executor: Arc<dyn SettlementExecutor>,
    settings: AggregatorSettings,
    guard: CycleGuard,
}

impl Aggregator {
    pub fn new(
        queue: QueueStore,
        executor: Arc<dyn SettlementExecutor>,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            queue,
            executor,
            settings,
            guard: CycleGuard::new(),
        }
    }

    pub fn guard(&self) -> &CycleGuard {
        &self.guard
    }

    /// Run one cycle unless one is already in flight.
    pub async fn run_cycle(&self) -> EngineResult<AggregatorOutcome> {
        let Some(_token) = self.guard.try_enter() else {
            debug!("Aggregator cycle already running, skipping");
            return Ok(AggregatorOutcome::Busy);
        };

        let pending = self.queue.count_pending().await?;
        if pending < self.settings.batch_size as u64 {
            debug!(pending, batch_size = self.settings.batch_size, "Waiting for a full batch");
            return Ok(AggregatorOutcome::Idle { pending });
        }

        // All or nothing: a cancel racing the count leaves everything PENDING.
        let entries = self.queue.claim_batch(self.settings.batch_size).await?;
        if entries.is_empty() {
            let pending = self.queue.count_pending().await?;
            debug!(pending, "Batch shrank before it could be claimed");
            return Ok(AggregatorOutcome::Idle { pending });
        }

        let batch = match TierDeltaBatch::from_entries(&entries) {
            Ok(batch) => batch,
            Err(e) => {
                let uuids: Vec<Uuid> = entries.iter().map(|entry| entry.uuid).collect();
                error!(error = %e, size = uuids.len(), "Batch cannot be netted, failing it");
                self.queue.resolve_batch(&uuids, QueueStatus::Failed).await?;
                return Err(e);
            }
        };
        info!(size = batch.len(), net = %batch.net, "Settling batch");

        let (status, attempts) = self.settle(batch.net).await;

        match self.queue.resolve_batch(&batch.uuids, status).await {
            Ok(_) => {
                info!(size = batch.len(), %status, attempts, "Batch resolved");
                Ok(AggregatorOutcome::Settled {
                    uuids: batch.uuids,
                    net: batch.net,
                    status,
                    attempts,
                })
            }
            Err(e) => {
                error!(
                    size = batch.len(),
                    %status,
                    error = %e,
                    uuids = ?batch.uuids,
                    "Executor answered but batch could not be resolved; rows left PROCESSING"
                );
                Ok(AggregatorOutcome::ResolveFailed {
                    uuids: batch.uuids,
                    status,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Call the executor with bounded retries. Returns the verdict and the
    /// number of attempts made.
    async fn settle(&self, net: TierAmounts) -> (QueueStatus, u32) {
        let max_attempts = self.settings.retry_attempts.max(1);

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self
                    .settings
                    .retry_base_delay
                    .saturating_mul(2u32.saturating_pow(attempt - 2));
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying settlement");
                tokio::time::sleep(delay).await;
            }

            match self.executor.execute(net).await {
                Ok(status) => return (status, attempt),
                Err(CollaboratorError::Rejected(reason)) => {
                    warn!(attempt, %reason, "Settlement rejected, failing batch");
                    return (QueueStatus::Failed, attempt);
                }
                Err(CollaboratorError::Transient(reason)) => {
                    warn!(attempt, max_attempts, %reason, "Transient settlement failure");
                }
            }
        }

        warn!(attempts = max_attempts, "Settlement retries exhausted, failing batch");
        (QueueStatus::Failed, max_attempts)
    }
}
