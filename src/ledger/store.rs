use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::upstream::endpoint_url;

/// key: ledger-mutation -> debit/credit request forwarded to the atomic store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerMutation {
    pub user_id: String,
    pub amount: f64,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// key: ledger-outcome -> result of a single debit/credit
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LedgerOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_before: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_after: Option<f64>,
    /// The store recognised the idempotency key and did not apply the mutation again.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

impl LedgerOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// key: ledger-store -> external atomic balance store
///
/// Implementations must apply each mutation atomically and deduplicate on
/// `idempotency_key`. `Err` means the store could not be reached or answered
/// garbage; a refused mutation is an `Ok` outcome with `success == false`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// `None` when the store has no record of the user.
    async fn balance(&self, user_id: &str) -> Result<Option<f64>>;
    async fn debit(&self, mutation: &LedgerMutation) -> Result<LedgerOutcome>;
    async fn credit(&self, mutation: &LedgerMutation) -> Result<LedgerOutcome>;
}

pub struct HttpLedgerStore {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: f64,
}

impl HttpLedgerStore {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build ledger client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            auth_token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        endpoint_url(&self.base_url, segments)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            request.bearer_auth(token)
        } else {
            request
        }
    }

    async fn mutate(&self, path: &str, mutation: &LedgerMutation) -> Result<LedgerOutcome> {
        let response = self
            .auth(self.client.post(self.endpoint(&[path])?))
            .json(mutation)
            .send()
            .await
            .with_context(|| format!("failed to reach ledger store for {path}"))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            let detail = response.text().await.unwrap_or_default();
            return Ok(LedgerOutcome {
                duplicate: true,
                ..LedgerOutcome::failed(non_empty(detail, "duplicate idempotency key"))
            });
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Ok(LedgerOutcome::failed(non_empty(
                detail,
                &format!("ledger store answered {status}"),
            )));
        }

        response
            .json::<LedgerOutcome>()
            .await
            .context("failed to decode ledger store response")
    }
}

fn non_empty(detail: String, fallback: &str) -> String {
    let trimmed = detail.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl LedgerStore for HttpLedgerStore {
    async fn balance(&self, user_id: &str) -> Result<Option<f64>> {
        let response = self
            .auth(self.client.get(self.endpoint(&["balances", user_id])?))
            .send()
            .await
            .context("failed to reach ledger store for balance")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: BalanceResponse = response
            .error_for_status()
            .context("ledger store rejected balance read")?
            .json()
            .await
            .context("failed to decode balance response")?;
        Ok(Some(parsed.balance))
    }

    async fn debit(&self, mutation: &LedgerMutation) -> Result<LedgerOutcome> {
        self.mutate("debit", mutation).await
    }

    async fn credit(&self, mutation: &LedgerMutation) -> Result<LedgerOutcome> {
        self.mutate("credit", mutation).await
    }
}
