pub mod api;
pub mod engine;
pub mod models;
pub mod scheduler;
pub mod store;

pub use engine::{period_key, plan_credit, CreditPlan, RolloutEngine, ROLLOUT_REASON};
pub use models::{
    ActiveSubscription, EntryOutcome, PlanOverrides, RolloutEntry, RolloutRun, RolloutRunType,
};
pub use scheduler::{process_tick as run_rollout_tick, scheduled_instant, spawn as spawn_rollout_scheduler};
pub use store::{PgRolloutAuditSink, PgSubscriptionSource, RolloutAuditSink, SubscriptionSource};
