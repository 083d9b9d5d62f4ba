#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credit_broker::execution::{ExecutionOrchestrator, FlowExecutor};
use credit_broker::gate::AffordabilityGate;
use credit_broker::ledger::{CreditsLedgerClient, LedgerMutation, LedgerOutcome, LedgerStore};
use credit_broker::pricing::{
    PricingConfig, PricingConfigRepository, PricingConfigStore, StoredPricingConfig,
};
use credit_broker::rollout::{
    ActiveSubscription, RolloutAuditSink, RolloutEngine, RolloutRun, RolloutRunType,
    SubscriptionSource,
};
use credit_broker::usage::{
    start_reconciliation_worker, PendingCharge, PendingReconciliationStore, PollBudget,
    PricingReport, PricingStatus, ReconciliationRecord, Settlement, StabilizationPolicy,
    UsageMeter, UsageReconciler,
};
use credit_broker::AppServices;
use serde_json::Value;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryConfigs {
    configs: Mutex<HashMap<String, StoredPricingConfig>>,
}

impl MemoryConfigs {
    pub fn with(app_id: &str, config: PricingConfig) -> Self {
        let repo = Self::default();
        repo.configs.lock().unwrap().insert(
            app_id.to_string(),
            StoredPricingConfig {
                app_id: app_id.to_string(),
                version: 1,
                updated_at: Utc::now(),
                config,
            },
        );
        repo
    }
}

#[async_trait]
impl PricingConfigRepository for MemoryConfigs {
    async fn get_config(&self, app_id: &str) -> Result<Option<StoredPricingConfig>> {
        Ok(self.configs.lock().unwrap().get(app_id).cloned())
    }

    async fn put_config(&self, app_id: &str, config: &PricingConfig) -> Result<StoredPricingConfig> {
        let mut configs = self.configs.lock().unwrap();
        let version = configs.get(app_id).map(|c| c.version + 1).unwrap_or(1);
        let stored = StoredPricingConfig {
            app_id: app_id.to_string(),
            version,
            updated_at: Utc::now(),
            config: config.clone(),
        };
        configs.insert(app_id.to_string(), stored.clone());
        Ok(stored)
    }
}

/// Atomic in-memory ledger that deduplicates idempotency keys.
#[derive(Default)]
pub struct MemoryLedger {
    pub balances: Mutex<HashMap<String, f64>>,
    pub keys: Mutex<HashSet<String>>,
    pub debits: Mutex<Vec<LedgerMutation>>,
    pub credits: Mutex<Vec<LedgerMutation>>,
    pub unreachable_users: Mutex<HashSet<String>>,
}

impl MemoryLedger {
    pub fn with_balances(balances: &[(&str, f64)]) -> Self {
        let ledger = Self::default();
        {
            let mut map = ledger.balances.lock().unwrap();
            for (user, balance) in balances {
                map.insert(user.to_string(), *balance);
            }
        }
        ledger
    }

    pub fn balance_of(&self, user_id: &str) -> f64 {
        self.balances
            .lock()
            .unwrap()
            .get(user_id)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn fail_for(&self, user_id: &str) {
        self.unreachable_users
            .lock()
            .unwrap()
            .insert(user_id.to_string());
    }

    fn apply(&self, mutation: &LedgerMutation, sign: f64) -> Result<LedgerOutcome> {
        if self.unreachable_users.lock().unwrap().contains(&mutation.user_id) {
            bail!("ledger store unreachable");
        }
        if let Some(key) = &mutation.idempotency_key {
            if !self.keys.lock().unwrap().insert(key.clone()) {
                return Ok(LedgerOutcome {
                    duplicate: true,
                    ..LedgerOutcome::failed("duplicate idempotency key")
                });
            }
        }
        let mut balances = self.balances.lock().unwrap();
        let balance = balances.entry(mutation.user_id.clone()).or_insert(0.0);
        let before = *balance;
        *balance += sign * mutation.amount;
        Ok(LedgerOutcome {
            success: true,
            transaction_id: Some(Uuid::new_v4().to_string()),
            balance_before: Some(before),
            balance_after: Some(*balance),
            ..LedgerOutcome::default()
        })
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn balance(&self, user_id: &str) -> Result<Option<f64>> {
        if self.unreachable_users.lock().unwrap().contains(user_id) {
            bail!("ledger store unreachable");
        }
        Ok(self.balances.lock().unwrap().get(user_id).copied())
    }

    async fn debit(&self, mutation: &LedgerMutation) -> Result<LedgerOutcome> {
        let outcome = self.apply(mutation, -1.0)?;
        if outcome.success {
            self.debits.lock().unwrap().push(mutation.clone());
        }
        Ok(outcome)
    }

    async fn credit(&self, mutation: &LedgerMutation) -> Result<LedgerOutcome> {
        let outcome = self.apply(mutation, 1.0)?;
        if outcome.success {
            self.credits.lock().unwrap().push(mutation.clone());
        }
        Ok(outcome)
    }
}

/// Returns queued readings in order, then keeps repeating the last one.
#[derive(Default)]
pub struct ScriptedMeter {
    readings: Mutex<HashMap<String, VecDeque<f64>>>,
    last: Mutex<HashMap<String, f64>>,
}

impl ScriptedMeter {
    pub fn with(identity: &str, readings: &[f64]) -> Self {
        let meter = Self::default();
        meter.push(identity, readings);
        meter
    }

    pub fn push(&self, identity: &str, readings: &[f64]) {
        self.readings
            .lock()
            .unwrap()
            .entry(identity.to_string())
            .or_default()
            .extend(readings.iter().copied());
    }
}

#[async_trait]
impl UsageMeter for ScriptedMeter {
    async fn get_usage(&self, identity: &str) -> Result<f64> {
        let next = self
            .readings
            .lock()
            .unwrap()
            .get_mut(identity)
            .and_then(VecDeque::pop_front);
        let mut last = self.last.lock().unwrap();
        match next {
            Some(value) => {
                last.insert(identity.to_string(), value);
                Ok(value)
            }
            None => last
                .get(identity)
                .copied()
                .ok_or_else(|| anyhow!("no usage recorded for {identity}")),
        }
    }
}

pub struct StaticFlows {
    pub result: Option<Value>,
    pub calls: Mutex<Vec<String>>,
}

impl StaticFlows {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            result: None,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl FlowExecutor for StaticFlows {
    async fn execute(&self, _identity: &str, flow_ref: &str, _payload: &Value) -> Result<Value> {
        self.calls.lock().unwrap().push(flow_ref.to_string());
        self.result
            .clone()
            .ok_or_else(|| anyhow!("flow provider answered 500"))
    }
}

#[derive(Default)]
pub struct MemoryPending {
    pub records: Mutex<HashMap<Uuid, ReconciliationRecord>>,
}

#[async_trait]
impl PendingReconciliationStore for MemoryPending {
    async fn insert_pending(&self, charge: &PendingCharge) -> Result<()> {
        self.records.lock().unwrap().insert(
            charge.id,
            ReconciliationRecord {
                charge: charge.clone(),
                status: PricingStatus::Pending,
                report: None,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn resolve(&self, id: Uuid, report: &PricingReport) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown reconciliation {id}"))?;
        record.status = report.status;
        record.report = Some(report.clone());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<PendingCharge>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|record| record.status == PricingStatus::Pending)
            .take(limit as usize)
            .map(|record| record.charge.clone())
            .collect())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<ReconciliationRecord>> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }
}

#[derive(Default)]
pub struct MemorySubscriptions {
    pub subscriptions: Vec<ActiveSubscription>,
}

#[async_trait]
impl SubscriptionSource for MemorySubscriptions {
    async fn list_active_subscriptions(&self, _app_id: &str) -> Result<Vec<ActiveSubscription>> {
        Ok(self.subscriptions.clone())
    }
}

#[derive(Default)]
pub struct MemoryAudit {
    pub runs: Mutex<Vec<RolloutRun>>,
    pub broken: bool,
}

#[async_trait]
impl RolloutAuditSink for MemoryAudit {
    async fn record_run(&self, run: &RolloutRun) -> Result<()> {
        if self.broken {
            bail!("audit store unavailable");
        }
        let mut stored = run.clone();
        stored.entries.clear();
        self.runs.lock().unwrap().push(stored);
        Ok(())
    }

    async fn recent_runs(&self, app_id: &str, limit: i64) -> Result<Vec<RolloutRun>> {
        let runs = self.runs.lock().unwrap();
        Ok(runs
            .iter()
            .rev()
            .filter(|run| run.app_id == app_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn last_run_at(
        &self,
        app_id: &str,
        run_type: RolloutRunType,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .filter(|run| run.app_id == app_id && run.run_type == run_type)
            .map(|run| run.timestamp)
            .max())
    }
}

pub fn subscriber(user_id: &str, credits_per_month: f64) -> ActiveSubscription {
    ActiveSubscription {
        user_id: user_id.to_string(),
        plan_id: Some(Uuid::new_v4()),
        credits_per_month,
        plan: Default::default(),
    }
}

pub fn config_store(repo: MemoryConfigs) -> Arc<PricingConfigStore> {
    Arc::new(PricingConfigStore::new(Arc::new(repo), Duration::ZERO))
}

pub fn rollout_engine(
    configs: Arc<PricingConfigStore>,
    ledger: Arc<MemoryLedger>,
    subscriptions: MemorySubscriptions,
    audit: Arc<MemoryAudit>,
) -> RolloutEngine {
    RolloutEngine::new(
        configs,
        CreditsLedgerClient::new(ledger),
        Arc::new(subscriptions),
        audit,
    )
}

/// Everything a router test needs, wired with in-memory collaborators.
pub struct Harness {
    pub services: AppServices,
    pub ledger: Arc<MemoryLedger>,
    pub meter: Arc<ScriptedMeter>,
    pub flows: Arc<StaticFlows>,
    pub pending: Arc<MemoryPending>,
    pub audit: Arc<MemoryAudit>,
}

impl Harness {
    pub fn new(
        app_id: &str,
        config: PricingConfig,
        ledger: MemoryLedger,
        meter: ScriptedMeter,
        flows: StaticFlows,
    ) -> Self {
        Self::with_subscriptions(app_id, config, ledger, meter, flows, Vec::new())
    }

    pub fn with_subscriptions(
        app_id: &str,
        config: PricingConfig,
        ledger: MemoryLedger,
        meter: ScriptedMeter,
        flows: StaticFlows,
        subscriptions: Vec<ActiveSubscription>,
    ) -> Self {
        let configs = config_store(MemoryConfigs::with(app_id, config));
        let ledger = Arc::new(ledger);
        let meter = Arc::new(meter);
        let flows = Arc::new(flows);
        let pending = Arc::new(MemoryPending::default());
        let audit = Arc::new(MemoryAudit::default());

        let client = CreditsLedgerClient::new(ledger.clone());
        let reconciler = UsageReconciler::new(meter.clone(), StabilizationPolicy::FirstIncrease);
        let gate = AffordabilityGate::new(configs.clone(), client.clone());
        let handle = start_reconciliation_worker(
            Settlement {
                reconciler: reconciler.clone(),
                ledger: client.clone(),
                configs: configs.clone(),
                store: pending.clone(),
                budget: PollBudget::immediate(5),
            },
            2,
        );
        let orchestrator = Arc::new(ExecutionOrchestrator::new(
            configs.clone(),
            gate.clone(),
            client.clone(),
            flows.clone(),
            reconciler,
            pending.clone(),
            handle,
            PollBudget::immediate(5),
        ));
        let rollout = rollout_engine(
            configs.clone(),
            ledger.clone(),
            MemorySubscriptions { subscriptions },
            audit.clone(),
        );

        Self {
            services: AppServices {
                configs,
                ledger: client,
                gate,
                orchestrator,
                rollout,
            },
            ledger,
            meter,
            flows,
            pending,
            audit,
        }
    }
}
