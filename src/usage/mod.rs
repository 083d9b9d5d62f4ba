pub mod meter;
pub mod reconciler;
pub mod worker;

pub use meter::{HttpUsageMeter, UsageMeter};
pub use reconciler::{
    PendingCharge, PollBudget, PricingReport, PricingStatus, StabilizationPolicy,
    UsageMeasurement, UsageReconciler,
};
pub use worker::{
    replay_pending, spawn_replay_sweep, start_reconciliation_worker, PendingReconciliationStore,
    PgPendingReconciliationStore, ReconciliationHandle, ReconciliationRecord, Settlement,
};
