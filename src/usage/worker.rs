use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ledger::CreditsLedgerClient;
use crate::pricing::PricingConfigStore;

use super::reconciler::{PendingCharge, PollBudget, PricingReport, PricingStatus, UsageReconciler};

/// key: reconciliation-record -> persisted state of a background charge
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationRecord {
    #[serde(flatten)]
    pub charge: PendingCharge,
    pub status: PricingStatus,
    pub report: Option<PricingReport>,
    pub updated_at: DateTime<Utc>,
}

/// key: pending-reconciliation-store -> survives restarts so no charge is dropped
#[async_trait]
pub trait PendingReconciliationStore: Send + Sync {
    async fn insert_pending(&self, charge: &PendingCharge) -> Result<()>;
    async fn resolve(&self, id: Uuid, report: &PricingReport) -> Result<()>;
    async fn list_pending(&self, limit: i64) -> Result<Vec<PendingCharge>>;
    async fn fetch(&self, id: Uuid) -> Result<Option<ReconciliationRecord>>;
}

#[derive(Clone)]
pub struct PgPendingReconciliationStore {
    pool: PgPool,
}

impl PgPendingReconciliationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct PendingRow {
    id: Uuid,
    user_id: String,
    app_id: String,
    upstream_identity: String,
    flow_ref: String,
    usage_before: f64,
    idempotency_key: String,
    status: String,
    report: Option<Json<PricingReport>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PendingRow {
    fn charge(&self) -> PendingCharge {
        PendingCharge {
            id: self.id,
            user_id: self.user_id.clone(),
            app_id: self.app_id.clone(),
            upstream_identity: self.upstream_identity.clone(),
            flow_ref: self.flow_ref.clone(),
            usage_before: self.usage_before,
            idempotency_key: self.idempotency_key.clone(),
            created_at: self.created_at,
        }
    }
}

const PENDING_COLUMNS: &str = "id, user_id, app_id, upstream_identity, flow_ref, usage_before, \
     idempotency_key, status, report, created_at, updated_at";

#[async_trait]
impl PendingReconciliationStore for PgPendingReconciliationStore {
    async fn insert_pending(&self, charge: &PendingCharge) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_reconciliations (
                id,
                user_id,
                app_id,
                upstream_identity,
                flow_ref,
                usage_before,
                idempotency_key,
                status,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(charge.id)
        .bind(&charge.user_id)
        .bind(&charge.app_id)
        .bind(&charge.upstream_identity)
        .bind(&charge.flow_ref)
        .bind(charge.usage_before)
        .bind(&charge.idempotency_key)
        .bind(charge.created_at)
        .execute(&self.pool)
        .await
        .context("failed to persist pending reconciliation")?;
        Ok(())
    }

    async fn resolve(&self, id: Uuid, report: &PricingReport) -> Result<()> {
        sqlx::query(
            "UPDATE pending_reconciliations SET status = $2, report = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(report.status.as_str())
        .bind(Json(report))
        .execute(&self.pool)
        .await
        .context("failed to resolve pending reconciliation")?;
        Ok(())
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<PendingCharge>> {
        let rows = sqlx::query_as::<_, PendingRow>(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_reconciliations WHERE status = 'pending' ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list pending reconciliations")?;
        Ok(rows.iter().map(PendingRow::charge).collect())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<ReconciliationRecord>> {
        let row = sqlx::query_as::<_, PendingRow>(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_reconciliations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load reconciliation")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status = PricingStatus::from_str(&row.status)
            .ok_or_else(|| anyhow!("unknown reconciliation status: {}", row.status))?;
        Ok(Some(ReconciliationRecord {
            charge: row.charge(),
            status,
            report: row.report.map(|report| report.0),
            updated_at: row.updated_at,
        }))
    }
}

/// key: reconciliation-settlement -> everything a background job needs
#[derive(Clone)]
pub struct Settlement {
    pub reconciler: UsageReconciler,
    pub ledger: CreditsLedgerClient,
    pub configs: Arc<PricingConfigStore>,
    pub store: Arc<dyn PendingReconciliationStore>,
    pub budget: PollBudget,
}

impl Settlement {
    async fn run(&self, charge: PendingCharge) {
        let config = match self.configs.load(&charge.app_id).await {
            Ok(config) => config,
            Err(err) => {
                error!(
                    ?err,
                    reconciliation = %charge.id,
                    app_id = %charge.app_id,
                    "pricing config unavailable; reconciliation left pending for replay"
                );
                return;
            }
        };

        let report = self
            .reconciler
            .settle(&charge, self.budget, &config, &self.ledger)
            .await;
        if report.status == PricingStatus::Ready && report.debit.as_ref().is_some_and(|d| !d.success)
        {
            warn!(
                reconciliation = %charge.id,
                user_id = %charge.user_id,
                "debit failed after execution; needs manual follow-up"
            );
        }
        if let Err(err) = self.store.resolve(charge.id, &report).await {
            error!(
                ?err,
                reconciliation = %charge.id,
                status = report.status.as_str(),
                "failed to record reconciliation outcome"
            );
        }
    }
}

/// key: reconciliation-handle -> non-blocking enqueue interface
///
/// Dispatch never waits on the worker pool; the pending row is the durable
/// copy and the sweep re-dispatches anything still unresolved.
#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: UnboundedSender<PendingCharge>,
    in_flight: Arc<DashMap<Uuid, ()>>,
}

impl ReconciliationHandle {
    /// Returns `false` when the charge is already queued or polling.
    pub fn dispatch(&self, charge: PendingCharge) -> Result<bool> {
        let id = charge.id;
        if self.in_flight.insert(id, ()).is_some() {
            return Ok(false);
        }
        if let Err(err) = self.sender.send(charge) {
            self.in_flight.remove(&id);
            return Err(anyhow!("failed to enqueue usage reconciliation: {err}"));
        }
        Ok(true)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Consumes dispatched charges with at most `workers` polling concurrently.
pub fn start_reconciliation_worker(settlement: Settlement, workers: usize) -> ReconciliationHandle {
    let (tx, mut rx) = unbounded_channel::<PendingCharge>();
    let in_flight = Arc::new(DashMap::new());
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let jobs = in_flight.clone();
    tokio::spawn(async move {
        while let Some(charge) = rx.recv().await {
            let permits = permits.clone();
            let settlement = settlement.clone();
            let jobs = jobs.clone();
            tokio::spawn(async move {
                let id = charge.id;
                if let Ok(_permit) = permits.acquire_owned().await {
                    settlement.run(charge).await;
                }
                jobs.remove(&id);
            });
        }
    });

    ReconciliationHandle {
        sender: tx,
        in_flight,
    }
}

/// Re-dispatches unresolved reconciliations; returns how many were newly queued.
pub async fn replay_pending(
    store: &dyn PendingReconciliationStore,
    handle: &ReconciliationHandle,
) -> Result<usize> {
    let pending = store.list_pending(1_000).await?;
    let mut count = 0;
    for charge in pending {
        if handle.dispatch(charge)? {
            count += 1;
        }
    }
    if count > 0 {
        info!(count, "replayed pending usage reconciliations");
    }
    Ok(count)
}

/// key: reconciliation-sweep -> periodic replay of rows left pending
///
/// The first tick fires immediately, which covers rows a previous process left behind.
pub fn spawn_replay_sweep(
    store: Arc<dyn PendingReconciliationStore>,
    handle: ReconciliationHandle,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = replay_pending(store.as_ref(), &handle).await {
                warn!(?err, "pending reconciliation sweep failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerMutation, LedgerOutcome, LedgerStore};
    use crate::pricing::{PricingConfig, PricingConfigRepository, StoredPricingConfig};
    use crate::usage::{StabilizationPolicy, UsageMeter};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryPending {
        records: Mutex<HashMap<Uuid, ReconciliationRecord>>,
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
            if let Some(record) = self.records.lock().unwrap().get_mut(&id) {
                record.status = report.status;
                record.report = Some(report.clone());
            }
            Ok(())
        }
        async fn list_pending(&self, _limit: i64) -> Result<Vec<PendingCharge>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.status == PricingStatus::Pending)
                .map(|r| r.charge.clone())
                .collect())
        }
        async fn fetch(&self, id: Uuid) -> Result<Option<ReconciliationRecord>> {
            Ok(self.records.lock().unwrap().get(&id).cloned())
        }
    }

    struct RisingMeter;

    #[async_trait]
    impl UsageMeter for RisingMeter {
        async fn get_usage(&self, _identity: &str) -> Result<f64> {
            Ok(1.25)
        }
    }

    #[derive(Default)]
    struct KeyedLedger {
        debits: AtomicUsize,
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LedgerStore for KeyedLedger {
        async fn balance(&self, _user_id: &str) -> Result<Option<f64>> {
            Ok(Some(0.0))
        }
        async fn debit(&self, mutation: &LedgerMutation) -> Result<LedgerOutcome> {
            self.debits.fetch_add(1, Ordering::SeqCst);
            self.keys
                .lock()
                .unwrap()
                .push(mutation.idempotency_key.clone().unwrap_or_default());
            Ok(LedgerOutcome {
                success: true,
                ..LedgerOutcome::default()
            })
        }
        async fn credit(&self, _mutation: &LedgerMutation) -> Result<LedgerOutcome> {
            unreachable!()
        }
    }

    struct DefaultConfigs;

    #[async_trait]
    impl PricingConfigRepository for DefaultConfigs {
        async fn get_config(&self, _app_id: &str) -> Result<Option<StoredPricingConfig>> {
            Ok(None)
        }
        async fn put_config(
            &self,
            _app_id: &str,
            _config: &PricingConfig,
        ) -> Result<StoredPricingConfig> {
            unreachable!()
        }
    }

    struct FlakyConfigs {
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl PricingConfigRepository for FlakyConfigs {
        async fn get_config(&self, _app_id: &str) -> Result<Option<StoredPricingConfig>> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("config store unavailable");
            }
            Ok(None)
        }
        async fn put_config(
            &self,
            _app_id: &str,
            _config: &PricingConfig,
        ) -> Result<StoredPricingConfig> {
            unreachable!()
        }
    }

    fn settlement(
        store: Arc<MemoryPending>,
        ledger: Arc<KeyedLedger>,
        configs: Arc<dyn PricingConfigRepository>,
        budget: PollBudget,
    ) -> Settlement {
        Settlement {
            reconciler: UsageReconciler::new(Arc::new(RisingMeter), StabilizationPolicy::default()),
            ledger: CreditsLedgerClient::new(ledger),
            configs: Arc::new(PricingConfigStore::new(configs, Duration::ZERO)),
            store,
            budget,
        }
    }

    fn charge() -> PendingCharge {
        PendingCharge {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            app_id: "app-1".into(),
            upstream_identity: "u1".into(),
            flow_ref: "flow".into(),
            usage_before: 1.0,
            idempotency_key: "req-9".into(),
            created_at: Utc::now(),
        }
    }

    async fn wait_for(store: &MemoryPending, id: Uuid) -> Option<ReconciliationRecord> {
        for _ in 0..100 {
            let record = store.fetch(id).await.unwrap().unwrap();
            if record.status != PricingStatus::Pending {
                return Some(record);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn replayed_charge_is_settled_and_resolved() {
        let store = Arc::new(MemoryPending::default());
        let ledger_store = Arc::new(KeyedLedger::default());
        let settlement = settlement(
            store.clone(),
            ledger_store.clone(),
            Arc::new(DefaultConfigs),
            PollBudget::immediate(1),
        );
        let charge = charge();
        store.insert_pending(&charge).await.unwrap();

        let handle = start_reconciliation_worker(settlement, 2);
        let replayed = replay_pending(store.as_ref(), &handle).await.unwrap();
        assert_eq!(replayed, 1);

        let record = wait_for(&store, charge.id)
            .await
            .expect("reconciliation resolved");
        assert_eq!(record.status, PricingStatus::Ready);
        let report = record.report.unwrap();
        assert_eq!(report.actual_cost_usd, Some(0.25));
        assert!(report.debited());
        assert_eq!(ledger_store.debits.load(Ordering::SeqCst), 1);
        assert_eq!(*ledger_store.keys.lock().unwrap(), vec![charge.debit_key()]);
    }

    #[tokio::test]
    async fn dispatch_never_waits_on_busy_workers() {
        let store = Arc::new(MemoryPending::default());
        let slow = PollBudget::from_millis(60_000, 1, 0);
        let handle = start_reconciliation_worker(
            settlement(store, Arc::default(), Arc::new(DefaultConfigs), slow),
            8,
        );

        let queued = tokio::time::timeout(Duration::from_millis(500), async {
            let mut queued = 0;
            for _ in 0..400 {
                if handle.dispatch(charge()).unwrap() {
                    queued += 1;
                }
                tokio::task::yield_now().await;
            }
            queued
        })
        .await
        .expect("dispatch blocked behind busy workers");
        assert_eq!(queued, 400);
        assert_eq!(handle.in_flight(), 400);
    }

    #[tokio::test]
    async fn in_flight_charge_is_not_dispatched_twice() {
        let store = Arc::new(MemoryPending::default());
        let slow = PollBudget::from_millis(60_000, 1, 0);
        let handle = start_reconciliation_worker(
            settlement(store.clone(), Arc::default(), Arc::new(DefaultConfigs), slow),
            2,
        );
        let charge = charge();
        store.insert_pending(&charge).await.unwrap();

        assert!(handle.dispatch(charge.clone()).unwrap());
        assert!(!handle.dispatch(charge).unwrap());
        assert_eq!(replay_pending(store.as_ref(), &handle).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_retries_charge_left_pending() {
        let store = Arc::new(MemoryPending::default());
        let ledger_store = Arc::new(KeyedLedger::default());
        let configs = Arc::new(FlakyConfigs {
            failures_left: AtomicUsize::new(1),
        });
        let handle = start_reconciliation_worker(
            settlement(store.clone(), ledger_store.clone(), configs, PollBudget::immediate(1)),
            2,
        );
        let charge = charge();
        store.insert_pending(&charge).await.unwrap();

        assert_eq!(replay_pending(store.as_ref(), &handle).await.unwrap(), 1);
        for _ in 0..100 {
            if handle.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.in_flight(), 0);
        let record = store.fetch(charge.id).await.unwrap().unwrap();
        assert_eq!(record.status, PricingStatus::Pending);
        assert_eq!(ledger_store.debits.load(Ordering::SeqCst), 0);

        assert_eq!(replay_pending(store.as_ref(), &handle).await.unwrap(), 1);
        let record = wait_for(&store, charge.id)
            .await
            .expect("swept reconciliation resolved");
        assert_eq!(record.status, PricingStatus::Ready);
        assert_eq!(ledger_store.debits.load(Ordering::SeqCst), 1);
    }
}
