use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::CreditsLedgerClient;
use crate::pricing::{PricingConfig, PricingConfigStore, RolloutInterval};

use super::models::{
    ActiveSubscription, EntryOutcome, RolloutEntry, RolloutRun, RolloutRunType,
};
use super::store::{RolloutAuditSink, SubscriptionSource};

pub const ROLLOUT_REASON: &str = "monthly_rollout";

const DEFAULT_CONCURRENCY: usize = 8;

/// key: rollout-credit-plan -> per-subscriber arithmetic before the balance clamp
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreditPlan {
    pub base_amount: f64,
    pub percentage: f64,
    pub cap: Option<f64>,
    pub to_credit: f64,
}

/// Computes the amount owed to one subscriber.
///
/// `current_balance` only matters when a cap applies; pass `None` to get the
/// unclamped amount.
pub fn plan_credit(
    config: &PricingConfig,
    subscription: &ActiveSubscription,
    current_balance: Option<f64>,
) -> CreditPlan {
    let base_amount = if config.rollout_credits_per_period > 0.0 {
        config.rollout_credits_per_period
    } else {
        subscription.credits_per_month
    };
    let percentage = subscription
        .plan
        .rollout_percentage
        .unwrap_or(config.rollout_percentage);
    let cap = subscription
        .plan
        .max_credits_rollover
        .or(config.rollout_max_credits_rollover);

    let mut to_credit = (base_amount * percentage / 100.0).round();
    if !to_credit.is_finite() || to_credit < 0.0 {
        to_credit = 0.0;
    }
    if let (Some(cap), Some(balance)) = (cap, current_balance) {
        if balance + to_credit > cap {
            to_credit = (cap - balance).max(0.0);
        }
    }

    CreditPlan {
        base_amount,
        percentage,
        cap,
        to_credit,
    }
}

/// Period label used in rollout idempotency keys.
pub fn period_key(interval: RolloutInterval, now: DateTime<Utc>) -> String {
    match interval {
        RolloutInterval::Monthly => now.format("%Y-%m").to_string(),
        RolloutInterval::Weekly => {
            let week = now.iso_week();
            format!("{}-W{:02}", week.year(), week.week())
        }
        RolloutInterval::Daily => now.format("%Y-%m-%d").to_string(),
    }
}

/// key: rollout-engine -> subscription credit replenishment
#[derive(Clone)]
pub struct RolloutEngine {
    configs: Arc<PricingConfigStore>,
    ledger: CreditsLedgerClient,
    subscriptions: Arc<dyn SubscriptionSource>,
    audit: Arc<dyn RolloutAuditSink>,
    concurrency: usize,
}

impl RolloutEngine {
    pub fn new(
        configs: Arc<PricingConfigStore>,
        ledger: CreditsLedgerClient,
        subscriptions: Arc<dyn SubscriptionSource>,
        audit: Arc<dyn RolloutAuditSink>,
    ) -> Self {
        Self {
            configs,
            ledger,
            subscriptions,
            audit,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn configs(&self) -> &Arc<PricingConfigStore> {
        &self.configs
    }

    pub fn audit(&self) -> &Arc<dyn RolloutAuditSink> {
        &self.audit
    }

    pub async fn run(&self, app_id: &str, dry_run: bool) -> Result<RolloutRun> {
        let run_type = if dry_run {
            RolloutRunType::DryRun
        } else {
            RolloutRunType::Manual
        };
        self.run_as(app_id, run_type, Utc::now()).await
    }

    pub async fn run_as(
        &self,
        app_id: &str,
        run_type: RolloutRunType,
        now: DateTime<Utc>,
    ) -> Result<RolloutRun> {
        let config = self.configs.load(app_id).await?;
        let subscriptions = self
            .subscriptions
            .list_active_subscriptions(app_id)
            .await
            .with_context(|| format!("failed to list subscribers for {app_id}"))?;
        let period = period_key(config.rollout_interval, now);

        let entries: Vec<RolloutEntry> = stream::iter(subscriptions)
            .map(|subscription| {
                let config = config.clone();
                let period = period.clone();
                async move {
                    self.process_subscriber(app_id, &config, &period, run_type, subscription)
                        .await
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut run = RolloutRun {
            id: Uuid::new_v4(),
            app_id: app_id.to_string(),
            run_type,
            period_key: period,
            users_processed: entries.len() as i32,
            users_successful: 0,
            users_failed: 0,
            users_skipped: 0,
            total_credits_accredited: 0.0,
            success: true,
            config_snapshot: serde_json::to_value(&*config)?,
            timestamp: now,
            entries: Vec::new(),
        };
        for entry in &entries {
            match entry.outcome {
                EntryOutcome::Credited | EntryOutcome::Preview => {
                    run.users_successful += 1;
                    run.total_credits_accredited += entry.to_credit;
                }
                EntryOutcome::Skipped | EntryOutcome::AlreadyCredited => run.users_skipped += 1,
                EntryOutcome::Failed => run.users_failed += 1,
            }
        }
        run.success = run.users_failed == 0;
        run.entries = entries;

        if let Err(err) = self.audit.record_run(&run).await {
            warn!(?err, %app_id, run = %run.id, "failed to persist rollout audit record");
        }

        info!(
            %app_id,
            run_type = run.run_type.as_str(),
            period = %run.period_key,
            processed = run.users_processed,
            successful = run.users_successful,
            failed = run.users_failed,
            skipped = run.users_skipped,
            total = run.total_credits_accredited,
            "rollout finished"
        );
        Ok(run)
    }

    async fn process_subscriber(
        &self,
        app_id: &str,
        config: &PricingConfig,
        period: &str,
        run_type: RolloutRunType,
        subscription: ActiveSubscription,
    ) -> RolloutEntry {
        let unclamped = plan_credit(config, &subscription, None);
        let current_balance = match unclamped.cap {
            Some(_) => Some(self.ledger.get_balance(&subscription.user_id).await),
            None => None,
        };
        let plan = plan_credit(config, &subscription, current_balance);

        let mut entry = RolloutEntry {
            user_id: subscription.user_id,
            base_amount: plan.base_amount,
            percentage: plan.percentage,
            cap: plan.cap,
            current_balance,
            to_credit: plan.to_credit,
            outcome: EntryOutcome::Skipped,
            error: None,
        };
        if plan.to_credit <= 0.0 {
            return entry;
        }
        if run_type.is_dry_run() {
            entry.outcome = EntryOutcome::Preview;
            return entry;
        }

        let key = format!("rollout:{app_id}:{period}:{}", entry.user_id);
        let outcome = self
            .ledger
            .credit(&entry.user_id, plan.to_credit, ROLLOUT_REASON, Some(&key))
            .await;
        entry.outcome = if outcome.success {
            EntryOutcome::Credited
        } else if outcome.duplicate {
            EntryOutcome::AlreadyCredited
        } else {
            entry.error = outcome.error;
            EntryOutcome::Failed
        };
        entry
    }
}
