use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::ledger::CreditsLedgerClient;
use crate::pricing::{PricingConfig, PricingConfigStore};

/// key: affordability-outcome -> gate verdict with top-up detail
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AffordabilityOutcome {
    pub app_id: String,
    pub user_id: String,
    pub allowed: bool,
    pub required: f64,
    pub available: f64,
    pub shortage: f64,
}

/// key: affordability-gate -> advisory pre-execution balance check
///
/// Nothing is reserved. Two concurrent requests can both pass; the ledger's
/// atomic debit is the only authority that can refuse the second charge.
#[derive(Clone)]
pub struct AffordabilityGate {
    configs: Arc<PricingConfigStore>,
    ledger: CreditsLedgerClient,
}

impl AffordabilityGate {
    pub fn new(configs: Arc<PricingConfigStore>, ledger: CreditsLedgerClient) -> Self {
        Self { configs, ledger }
    }

    pub async fn check(&self, app_id: &str, user_id: &str) -> Result<AffordabilityOutcome> {
        let config = self.configs.load(app_id).await?;
        Ok(self.check_with(&config, app_id, user_id).await)
    }

    /// Same as [`check`](Self::check) against a snapshot the caller already loaded.
    pub async fn check_with(
        &self,
        config: &PricingConfig,
        app_id: &str,
        user_id: &str,
    ) -> AffordabilityOutcome {
        let required = config.affordability_threshold(app_id).max(0.0);
        let available = self.ledger.get_balance(user_id).await;
        evaluate(app_id, user_id, required, available)
    }
}

/// A zero threshold always passes, whatever the balance.
fn evaluate(app_id: &str, user_id: &str, required: f64, available: f64) -> AffordabilityOutcome {
    let ungated = required <= 0.0;
    AffordabilityOutcome {
        app_id: app_id.to_string(),
        user_id: user_id.to_string(),
        allowed: ungated || available >= required,
        required,
        available,
        shortage: if ungated {
            0.0
        } else {
            (required - available).max(0.0)
        },
    }
}
