//! External HTTP collaborators.
//!
//! Defines the `SettlementExecutor` and `TierAllocator` traits consumed by
//! the engine and their reqwest-backed clients. The engine only ever sees
//! the traits, so tests substitute mocks.

pub mod allocation;
pub mod settlement;

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::types::{Purpose, QueueStatus, TierAmounts};

pub use allocation::{default_split, HttpTierAllocator};
pub use settlement::HttpSettlementExecutor;

/// Failure talking to a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Timeout, connection failure or 5xx. Worth retrying.
    #[error("Transient collaborator failure: {0}")]
    Transient(String),

    /// The collaborator answered and refused, or answered garbage.
    #[error("Collaborator rejected request: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Transient(_))
    }

    /// Classify a transport-level reqwest failure.
    pub fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            CollaboratorError::Transient(e.to_string())
        } else if e.status().is_some_and(|s| s.is_server_error()) {
            CollaboratorError::Transient(e.to_string())
        } else {
            CollaboratorError::Rejected(e.to_string())
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let msg = format!("HTTP {status}: {body}");
        if status.is_server_error() {
            CollaboratorError::Transient(msg)
        } else {
            CollaboratorError::Rejected(msg)
        }
    }
}

/// Applies a netted batch to the tier pools.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettlementExecutor: Send + Sync {
    /// Returns COMPLETED or FAILED as decided by the executor.
    async fn execute(&self, net: TierAmounts) -> Result<QueueStatus, CollaboratorError>;
}

/// Body sent to the allocation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationRequest {
    pub uuid: Uuid,
    #[serde(rename = "accountid")]
    pub account_id: String,
    pub amount: Decimal,
    pub purpose: Purpose,
}

/// Splits a request amount across the three tiers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TierAllocator: Send + Sync {
    async fn allocate(&self, request: &AllocationRequest) -> Result<TierAmounts, CollaboratorError>;
}
