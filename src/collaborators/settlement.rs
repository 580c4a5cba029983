//! Settlement executor client.
//!
//! POSTs a batch's net tier deltas as `{T1, T2, T3}` and reads back
//! `{status}`. One call per invocation; retry policy lives with the caller.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{CollaboratorError, SettlementExecutor};
use crate::types::{QueueStatus, TierAmounts};

#[derive(Debug, Serialize)]
struct SettlementRequest {
    #[serde(rename = "T1")]
    t1: Decimal,
    #[serde(rename = "T2")]
    t2: Decimal,
    #[serde(rename = "T3")]
    t3: Decimal,
}

#[derive(Debug, Deserialize)]
struct SettlementResponse {
    #[serde(default)]
    status: Option<String>,
}

pub struct HttpSettlementExecutor {
    http: Client,
    url: String,
    token: Option<SecretString>,
}

impl HttpSettlementExecutor {
    pub fn new(url: String, timeout: Duration, token: Option<SecretString>) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build settlement HTTP client")?;
        Ok(Self { http, url, token })
    }
}

#[async_trait]
impl SettlementExecutor for HttpSettlementExecutor {
    async fn execute(&self, net: TierAmounts) -> Result<QueueStatus, CollaboratorError> {
        let body = SettlementRequest {
            t1: net.tier1,
            t2: net.tier2,
            t3: net.tier3,
        };

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(CollaboratorError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, body = %text, "Settlement executor returned error");
            return Err(CollaboratorError::from_status(status, &text));
        }

        let parsed: SettlementResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Rejected(format!("unreadable response: {e}")))?;

        let outcome = parsed
            .status
            .as_deref()
            .and_then(|s| s.parse::<QueueStatus>().ok())
            .filter(|s| s.is_batch_outcome())
            .ok_or_else(|| {
                CollaboratorError::Rejected(format!("unexpected status {:?}", parsed.status))
            })?;

        debug!(net = %net, %outcome, "Settlement executor responded");
        Ok(outcome)
    }
}
