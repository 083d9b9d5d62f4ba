use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// key: usage-meter -> cumulative upstream spend reader
///
/// The provider exposes spend-to-date only, never a per-call cost.
#[async_trait]
pub trait UsageMeter: Send + Sync {
    async fn get_usage(&self, identity: &str) -> Result<f64>;
}

pub struct HttpUsageMeter {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    usage: f64,
}

impl HttpUsageMeter {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build usage meter client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            auth_token,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/usage", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl UsageMeter for HttpUsageMeter {
    async fn get_usage(&self, identity: &str) -> Result<f64> {
        let mut request = self
            .client
            .get(self.endpoint())
            .query(&[("identity", identity)]);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let parsed: UsageResponse = request
            .send()
            .await
            .context("failed to reach usage meter")?
            .error_for_status()
            .context("usage meter rejected request")?
            .json()
            .await
            .context("failed to decode usage response")?;
        if !parsed.usage.is_finite() {
            anyhow::bail!("usage meter returned a non-finite reading");
        }
        Ok(parsed.usage)
    }
}
