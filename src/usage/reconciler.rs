use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::{CreditsLedgerClient, LedgerOutcome};
use crate::pricing::PricingConfig;

use super::meter::UsageMeter;

/// key: reconcile-budget -> warm-up, attempt count and spacing of usage polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub warmup: Duration,
    pub attempts: u32,
    pub interval: Duration,
}

impl PollBudget {
    pub fn from_millis(warmup_ms: u64, attempts: u32, interval_ms: u64) -> Self {
        Self {
            warmup: Duration::from_millis(warmup_ms),
            attempts: attempts.max(1),
            interval: Duration::from_millis(interval_ms),
        }
    }

    pub fn immediate(attempts: u32) -> Self {
        Self::from_millis(0, attempts, 0)
    }
}

/// When a reading above the baseline counts as the final spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilizationPolicy {
    /// Accept the first reading above the baseline. May undercount when the
    /// provider books one call in several increments.
    #[default]
    FirstIncrease,
    /// Wait for two consecutive equal readings above the baseline. If the budget
    /// runs out while the counter is still moving, the last higher reading wins.
    ConsecutiveEqual,
}

impl StabilizationPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "first_increase" | "first" => Some(Self::FirstIncrease),
            "consecutive_equal" | "stable" => Some(Self::ConsecutiveEqual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingStatus {
    Pending,
    Ready,
    Unavailable,
}

impl PricingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingStatus::Pending => "pending",
            PricingStatus::Ready => "ready",
            PricingStatus::Unavailable => "unavailable",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PricingStatus::Pending),
            "ready" => Some(PricingStatus::Ready),
            "unavailable" => Some(PricingStatus::Unavailable),
            _ => None,
        }
    }
}

/// key: usage-measurement -> outcome of one bounded polling run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageMeasurement {
    pub status: PricingStatus,
    pub usage_before: f64,
    pub usage_now: Option<f64>,
    pub delta: Option<f64>,
    pub attempts: u32,
    pub reason: Option<String>,
}

impl UsageMeasurement {
    fn ready(usage_before: f64, usage_now: f64, attempts: u32) -> Self {
        Self {
            status: PricingStatus::Ready,
            usage_before,
            usage_now: Some(usage_now),
            delta: Some(usage_now - usage_before),
            attempts,
            reason: None,
        }
    }

    fn unavailable(
        usage_before: f64,
        usage_now: Option<f64>,
        attempts: u32,
        reason: String,
    ) -> Self {
        Self {
            status: PricingStatus::Unavailable,
            usage_before,
            usage_now,
            delta: None,
            attempts,
            reason: Some(reason),
        }
    }
}

/// key: pricing-report -> `pricing` block returned to callers and persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingReport {
    pub status: PricingStatus,
    pub usage_before_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_after_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_cost_credits: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usd_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markup_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_price_usd: Option<f64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debit: Option<LedgerOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl PricingReport {
    pub fn pending(usage_before: f64, reconciliation_id: Uuid) -> Self {
        Self {
            status: PricingStatus::Pending,
            usage_before_usd: usage_before,
            usage_after_usd: None,
            actual_cost_usd: None,
            actual_cost_credits: None,
            usd_multiplier: None,
            markup_percent: None,
            public_price_usd: None,
            attempts: 0,
            debit: None,
            reconciliation_id: Some(reconciliation_id),
            note: None,
        }
    }

    pub fn from_measurement(measurement: &UsageMeasurement, config: &PricingConfig) -> Self {
        let delta = measurement.delta;
        Self {
            status: measurement.status,
            usage_before_usd: measurement.usage_before,
            usage_after_usd: measurement.usage_now,
            actual_cost_usd: delta,
            actual_cost_credits: delta.map(|d| config.cost_credits(d)),
            usd_multiplier: delta.map(|_| config.usd_multiplier()),
            markup_percent: delta.map(|_| config.markup_percent()),
            public_price_usd: delta.map(|d| config.public_price_usd(d)),
            attempts: measurement.attempts,
            debit: None,
            reconciliation_id: None,
            note: measurement.reason.clone(),
        }
    }

    pub fn debited(&self) -> bool {
        self.debit.as_ref().map(|d| d.success).unwrap_or(false)
    }
}

/// key: pending-charge -> one paid execution awaiting its debit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCharge {
    pub id: Uuid,
    pub user_id: String,
    pub app_id: String,
    pub upstream_identity: String,
    pub flow_ref: String,
    pub usage_before: f64,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

impl PendingCharge {
    /// Stable across retries and crash replays of the same execution.
    pub fn debit_key(&self) -> String {
        format!(
            "execute:{}:{}:{}:{:.6}",
            self.app_id, self.user_id, self.idempotency_key, self.usage_before
        )
    }

    pub fn debit_reason(&self) -> String {
        format!("flow_execution:{}", self.flow_ref)
    }
}

/// key: usage-reconciler -> delta measurement and conversion to credits
#[derive(Clone)]
pub struct UsageReconciler {
    meter: Arc<dyn UsageMeter>,
    policy: StabilizationPolicy,
}

impl UsageReconciler {
    pub fn new(meter: Arc<dyn UsageMeter>, policy: StabilizationPolicy) -> Self {
        Self { meter, policy }
    }

    /// Baseline read taken immediately before dispatching a paid operation.
    pub async fn read_usage(&self, identity: &str) -> Result<f64> {
        self.meter.get_usage(identity).await
    }

    /// Polls sequentially until the counter moves past `usage_before` or the
    /// budget is spent. Never cancelled from outside.
    pub async fn measure(
        &self,
        identity: &str,
        usage_before: f64,
        budget: PollBudget,
    ) -> UsageMeasurement {
        if !budget.warmup.is_zero() {
            sleep(budget.warmup).await;
        }

        let mut last_reading = None;
        let mut candidate: Option<f64> = None;
        for attempt in 1..=budget.attempts {
            if attempt > 1 && !budget.interval.is_zero() {
                sleep(budget.interval).await;
            }
            let usage_now = match self.meter.get_usage(identity).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(?err, %identity, attempt, "usage read failed");
                    continue;
                }
            };
            debug!(%identity, attempt, usage_before, usage_now, "usage polled");
            last_reading = Some(usage_now);

            if usage_now < usage_before {
                return UsageMeasurement::unavailable(
                    usage_before,
                    Some(usage_now),
                    attempt,
                    format!("usage counter moved backwards ({usage_before} -> {usage_now})"),
                );
            }
            if usage_now > usage_before {
                match self.policy {
                    StabilizationPolicy::FirstIncrease => {
                        return UsageMeasurement::ready(usage_before, usage_now, attempt);
                    }
                    StabilizationPolicy::ConsecutiveEqual => {
                        if candidate == Some(usage_now) {
                            return UsageMeasurement::ready(usage_before, usage_now, attempt);
                        }
                        candidate = Some(usage_now);
                    }
                }
            }
        }

        if let Some(usage_now) = candidate {
            return UsageMeasurement::ready(usage_before, usage_now, budget.attempts);
        }
        UsageMeasurement::unavailable(
            usage_before,
            last_reading,
            budget.attempts,
            format!(
                "usage did not advance within {} attempts",
                budget.attempts
            ),
        )
    }

    /// Measures and prices without touching the ledger.
    pub async fn reconcile(
        &self,
        identity: &str,
        usage_before: f64,
        budget: PollBudget,
        config: &PricingConfig,
    ) -> PricingReport {
        let measurement = self.measure(identity, usage_before, budget).await;
        PricingReport::from_measurement(&measurement, config)
    }

    /// Measures, prices and debits `charge` exactly once.
    pub async fn settle(
        &self,
        charge: &PendingCharge,
        budget: PollBudget,
        config: &PricingConfig,
        ledger: &CreditsLedgerClient,
    ) -> PricingReport {
        let mut report = self
            .reconcile(&charge.upstream_identity, charge.usage_before, budget, config)
            .await;
        report.reconciliation_id = Some(charge.id);

        if report.status != PricingStatus::Ready {
            warn!(
                reconciliation = %charge.id,
                user_id = %charge.user_id,
                app_id = %charge.app_id,
                usage_before = charge.usage_before,
                usage_now = report.usage_after_usd,
                "usage reconciliation unavailable; no debit issued"
            );
            return report;
        }

        let credits = report.actual_cost_credits.unwrap_or(0.0);
        if credits <= 0.0 {
            report.note = Some("nothing to charge".to_string());
            return report;
        }

        let key = charge.debit_key();
        let outcome = ledger
            .debit(&charge.user_id, credits, &charge.debit_reason(), Some(&key))
            .await;
        info!(
            reconciliation = %charge.id,
            user_id = %charge.user_id,
            app_id = %charge.app_id,
            cost_usd = report.actual_cost_usd.unwrap_or(0.0),
            credits,
            debited = outcome.success,
            "usage reconciled"
        );
        report.debit = Some(outcome);
        report
    }
}
