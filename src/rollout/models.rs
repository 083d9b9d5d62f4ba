use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// key: rollout-plan-overrides -> plan-level values win over the global config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanOverrides {
    pub rollout_percentage: Option<f64>,
    pub max_credits_rollover: Option<f64>,
}

/// key: rollout-subscription -> active subscriber joined with its plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSubscription {
    pub user_id: String,
    pub plan_id: Option<Uuid>,
    pub credits_per_month: f64,
    pub plan: PlanOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutRunType {
    DryRun,
    Manual,
    Scheduled,
}

impl RolloutRunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutRunType::DryRun => "dry_run",
            RolloutRunType::Manual => "manual",
            RolloutRunType::Scheduled => "scheduled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "dry_run" => Some(RolloutRunType::DryRun),
            "manual" => Some(RolloutRunType::Manual),
            "scheduled" => Some(RolloutRunType::Scheduled),
            _ => None,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, RolloutRunType::DryRun)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOutcome {
    Credited,
    /// Dry run: would have been credited.
    Preview,
    Skipped,
    /// The ledger already holds this period's credit for the user.
    AlreadyCredited,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutEntry {
    pub user_id: String,
    pub base_amount: f64,
    pub percentage: f64,
    pub cap: Option<f64>,
    pub current_balance: Option<f64>,
    pub to_credit: f64,
    pub outcome: EntryOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// key: rollout-run -> append-only audit record, one per invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutRun {
    pub id: Uuid,
    pub app_id: String,
    pub run_type: RolloutRunType,
    pub period_key: String,
    pub users_processed: i32,
    pub users_successful: i32,
    pub users_failed: i32,
    pub users_skipped: i32,
    pub total_credits_accredited: f64,
    pub success: bool,
    pub config_snapshot: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<RolloutEntry>,
}
