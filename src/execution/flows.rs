use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;

use crate::extractor::UPSTREAM_IDENTITY_HEADER;
use crate::upstream::endpoint_url;

/// key: flow-executor -> paid upstream operation; the result is opaque here
#[async_trait]
pub trait FlowExecutor: Send + Sync {
    async fn execute(&self, identity: &str, flow_ref: &str, payload: &Value) -> Result<Value>;
}

pub struct HttpFlowExecutor {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpFlowExecutor {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build flow provider client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            auth_token,
        })
    }

    fn endpoint(&self, flow_ref: &str) -> Result<Url> {
        endpoint_url(&self.base_url, &["run", flow_ref])
    }
}

#[async_trait]
impl FlowExecutor for HttpFlowExecutor {
    async fn execute(&self, identity: &str, flow_ref: &str, payload: &Value) -> Result<Value> {
        let mut request = self
            .client
            .post(self.endpoint(flow_ref)?)
            .header(UPSTREAM_IDENTITY_HEADER, identity)
            .json(payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .context("failed to reach flow provider")?
            .error_for_status()
            .context("flow provider rejected execution")?;
        response
            .json::<Value>()
            .await
            .context("failed to decode flow result")
    }
}
