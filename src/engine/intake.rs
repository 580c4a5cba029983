//! Request intake: validate, split across tiers, enqueue.
//!
//! When the process can see the portfolio ledger, a WITHDRAW larger than
//! the account's current total value is refused before it is queued.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::allocation::is_valid_split;
use crate::collaborators::{default_split, AllocationRequest, TierAllocator};
use crate::storage::{PortfolioStore, QueueStore};
use crate::types::{EngineError, EngineResult, Purpose, QueueEntry, MAX_AMOUNT};

pub struct Intake {
    queue: QueueStore,
    allocator: Option<Arc<dyn TierAllocator>>,
    fallback_percents: [u32; 3],
    portfolios: Option<PortfolioStore>,
}

impl Intake {
    pub fn new(
        queue: QueueStore,
        allocator: Option<Arc<dyn TierAllocator>>,
        fallback_percents: [u32; 3],
    ) -> Self {
        Self {
            queue,
            allocator,
            fallback_percents,
            portfolios: None,
        }
    }

    /// Check withdrawals against the portfolio ledger.
    pub fn with_balance_check(mut self, portfolios: PortfolioStore) -> Self {
        self.portfolios = Some(portfolios);
        self
    }

    /// Accept a request. Validation failures never reach the queue; a
    /// reused uuid yields `DuplicateKey`.
    pub async fn submit(
        &self,
        uuid: Uuid,
        account_id: &str,
        amount: Decimal,
        purpose: Purpose,
    ) -> EngineResult<QueueEntry> {
        if account_id.trim().is_empty() {
            return Err(EngineError::Validation("account id is required".into()));
        }
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "amount must be positive (got {amount})"
            )));
        }
        if amount > MAX_AMOUNT {
            return Err(EngineError::Validation(format!(
                "amount must not exceed {MAX_AMOUNT} (got {amount})"
            )));
        }
        if purpose == Purpose::Withdraw {
            self.check_balance(account_id, amount).await?;
        }

        let fallback = default_split(amount, self.fallback_percents);
        let split = match &self.allocator {
            None => fallback,
            Some(allocator) => {
                let request = AllocationRequest {
                    uuid,
                    account_id: account_id.to_string(),
                    amount,
                    purpose,
                };
                match allocator.allocate(&request).await {
                    Ok(split) if is_valid_split(amount, &split) => split,
                    Ok(split) => {
                        warn!(%uuid, %amount, split = %split, "Allocation does not sum to amount, using default split");
                        fallback
                    }
                    Err(e) => {
                        warn!(%uuid, error = %e, "Allocation failed, using default split");
                        fallback
                    }
                }
            }
        };

        let entry = self.queue.enqueue(uuid, account_id, split, purpose).await?;
        info!(%uuid, account_id, %amount, purpose = %purpose, "Request accepted");
        Ok(entry)
    }

    /// An account without a portfolio has nothing to withdraw.
    async fn check_balance(&self, account_id: &str, amount: Decimal) -> EngineResult<()> {
        let Some(portfolios) = &self.portfolios else {
            return Ok(());
        };
        let available = portfolios
            .find_by_account(account_id)
            .await?
            .map(|p| p.total_value())
            .unwrap_or(Decimal::ZERO);
        if amount > available {
            warn!(account_id, %amount, %available, "Withdrawal exceeds portfolio value");
            return Err(EngineError::Validation(format!(
                "withdrawal of {amount} exceeds portfolio value {available}"
            )));
        }
        Ok(())
    }
}
