use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::CallerContext;
use crate::gate::AffordabilityGate;
use crate::ledger::CreditsLedgerClient;
use crate::pricing::{PricingConfig, PricingConfigStore};
use crate::usage::{
    PendingCharge, PendingReconciliationStore, PollBudget, PricingReport, ReconciliationHandle,
    ReconciliationRecord, UsageReconciler,
};

use super::flows::FlowExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Reconcile and debit before responding.
    Sync,
    /// Respond with `pricing.status = pending` and settle in the background.
    FastReturn,
}

impl ExecutionMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sync" | "synchronous" => Some(Self::Sync),
            "fast" | "fast_return" | "async" => Some(Self::FastReturn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub flow_ref: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub flow_ref: String,
    pub app_id: String,
    pub mode: ExecutionMode,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub result: Value,
    pub pricing: PricingReport,
    pub flow: FlowSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PricingStatusResponse {
    Measured(PricingReport),
    Recorded(ReconciliationRecord),
}

/// key: execution-orchestrator -> gate, execute, reconcile, debit
pub struct ExecutionOrchestrator {
    configs: Arc<PricingConfigStore>,
    gate: AffordabilityGate,
    ledger: CreditsLedgerClient,
    flows: Arc<dyn FlowExecutor>,
    reconciler: UsageReconciler,
    pending: Arc<dyn PendingReconciliationStore>,
    reconciliations: ReconciliationHandle,
    sync_budget: PollBudget,
}

impl ExecutionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        configs: Arc<PricingConfigStore>,
        gate: AffordabilityGate,
        ledger: CreditsLedgerClient,
        flows: Arc<dyn FlowExecutor>,
        reconciler: UsageReconciler,
        pending: Arc<dyn PendingReconciliationStore>,
        reconciliations: ReconciliationHandle,
        sync_budget: PollBudget,
    ) -> Self {
        Self {
            configs,
            gate,
            ledger,
            flows,
            reconciler,
            pending,
            reconciliations,
            sync_budget,
        }
    }

    /// Runs one paid flow for `caller`.
    ///
    /// Everything after the gate runs on its own task: once the paid operation is
    /// dispatched, a caller hanging up must not stop the charge from being settled.
    pub async fn execute(
        self: &Arc<Self>,
        caller: &CallerContext,
        request: ExecuteRequest,
        mode: ExecutionMode,
    ) -> AppResult<ExecuteResponse> {
        let app_id = caller.require_app_id()?.to_string();
        if request.flow_ref.trim().is_empty() {
            return Err(AppError::BadRequest("flow_ref must not be empty".into()));
        }

        let config = self.configs.load(&app_id).await?;
        let outcome = self
            .gate
            .check_with(&config, &app_id, &caller.user_id)
            .await;
        if !outcome.allowed {
            return Err(AppError::InsufficientCredits(outcome));
        }

        let usage_before = self
            .reconciler
            .read_usage(&caller.upstream_identity)
            .await
            .map_err(|err| {
                warn!(?err, user_id = %caller.user_id, %app_id, "usage baseline unavailable");
                AppError::BadGateway("usage baseline unavailable; execution not started".into())
            })?;

        let orchestrator = Arc::clone(self);
        let caller = caller.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .run_paid(caller, app_id, request, mode, config, usage_before)
                .await
        });
        task.await
            .map_err(|err| AppError::Message(format!("execution task failed: {err}")))?
    }

    async fn run_paid(
        &self,
        caller: CallerContext,
        app_id: String,
        request: ExecuteRequest,
        mode: ExecutionMode,
        config: Arc<PricingConfig>,
        usage_before: f64,
    ) -> AppResult<ExecuteResponse> {
        let started = Instant::now();
        let result = self
            .flows
            .execute(&caller.upstream_identity, &request.flow_ref, &request.payload)
            .await
            .map_err(|err| {
                warn!(?err, user_id = %caller.user_id, %app_id, flow = %request.flow_ref, "flow execution failed");
                AppError::BadGateway(format!("flow execution failed: {err:#}"))
            })?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let charge = PendingCharge {
            id: Uuid::new_v4(),
            user_id: caller.user_id.clone(),
            app_id: app_id.clone(),
            upstream_identity: caller.upstream_identity.clone(),
            flow_ref: request.flow_ref.clone(),
            usage_before,
            idempotency_key: caller.idempotency_key.clone(),
            created_at: Utc::now(),
        };

        let pricing = match mode {
            ExecutionMode::Sync => {
                self.reconciler
                    .settle(&charge, self.sync_budget, &config, &self.ledger)
                    .await
            }
            ExecutionMode::FastReturn => self.defer(charge).await,
        };

        info!(
            user_id = %caller.user_id,
            %app_id,
            flow = %request.flow_ref,
            duration_ms,
            pricing = pricing.status.as_str(),
            "flow executed"
        );

        Ok(ExecuteResponse {
            result,
            pricing,
            flow: FlowSummary {
                flow_ref: request.flow_ref,
                app_id,
                mode,
                duration_ms,
            },
        })
    }

    /// Persists the charge before handing it to the worker so the sweep can replay it.
    async fn defer(&self, charge: PendingCharge) -> PricingReport {
        let report = PricingReport::pending(charge.usage_before, charge.id);
        if let Err(err) = self.pending.insert_pending(&charge).await {
            error!(
                ?err,
                reconciliation = %charge.id,
                user_id = %charge.user_id,
                "failed to persist pending reconciliation; settling in memory only"
            );
        }
        let id = charge.id;
        if let Err(err) = self.reconciliations.dispatch(charge) {
            error!(?err, reconciliation = %id, "failed to dispatch usage reconciliation; left for the sweep");
        }
        report
    }

    /// Re-measures against a baseline the caller got from a fast-return response.
    /// Read-only: the background job owns the debit.
    pub async fn measure_since(
        &self,
        caller: &CallerContext,
        usage_before: f64,
    ) -> AppResult<PricingReport> {
        if !usage_before.is_finite() || usage_before < 0.0 {
            return Err(AppError::BadRequest(
                "usage_before must be a non-negative number".into(),
            ));
        }
        let app_id = caller.require_app_id()?;
        let config = self.configs.load(app_id).await?;
        Ok(self
            .reconciler
            .reconcile(&caller.upstream_identity, usage_before, self.sync_budget, &config)
            .await)
    }

    pub async fn reconciliation(
        &self,
        caller: &CallerContext,
        id: Uuid,
    ) -> AppResult<ReconciliationRecord> {
        match self.pending.fetch(id).await? {
            Some(record) if record.charge.user_id == caller.user_id => Ok(record),
            _ => Err(AppError::NotFound),
        }
    }
}
