use std::collections::BTreeMap;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// key: pricing-fixed-cost -> monthly overhead line item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedCost {
    pub name: String,
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RolloutInterval {
    Daily,
    Weekly,
    #[default]
    Monthly,
}

impl RolloutInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutInterval::Daily => "daily",
            RolloutInterval::Weekly => "weekly",
            RolloutInterval::Monthly => "monthly",
        }
    }
}

/// key: pricing-config -> per-application snapshot
///
/// Derived multipliers are never stored; every accessor recomputes them from the
/// raw fields so a replaced snapshot can never carry a stale multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub monthly_revenue_target: f64,
    pub usd_to_credits_rate: f64,
    pub target_margin_multiplier: f64,
    pub fixed_monthly_costs: Vec<FixedCost>,
    pub minimum_operation_cost_credits: f64,
    /// Base USD cost per flow key. Keyed by application id it is also the
    /// minimum balance the affordability gate demands.
    pub flow_costs: BTreeMap<String, f64>,
    pub signup_initial_credits: f64,
    pub signup_initial_credits_cost: f64,
    pub rollout_enabled: bool,
    pub rollout_interval: RolloutInterval,
    /// `0` means no override: each subscriber gets its plan's monthly credits.
    pub rollout_credits_per_period: f64,
    pub rollout_max_credits_rollover: Option<f64>,
    pub rollout_percentage: f64,
    /// `HH:MM`, UTC.
    pub rollout_scheduler_time: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            monthly_revenue_target: 1_000.0,
            usd_to_credits_rate: 100.0,
            target_margin_multiplier: 1.5,
            fixed_monthly_costs: Vec::new(),
            minimum_operation_cost_credits: 1.0,
            flow_costs: BTreeMap::new(),
            signup_initial_credits: 100.0,
            signup_initial_credits_cost: 1.0,
            rollout_enabled: false,
            rollout_interval: RolloutInterval::Monthly,
            rollout_credits_per_period: 0.0,
            rollout_max_credits_rollover: None,
            rollout_percentage: 100.0,
            rollout_scheduler_time: "00:00".to_string(),
        }
    }
}

impl PricingConfig {
    pub fn fixed_costs_total(&self) -> f64 {
        self.fixed_monthly_costs.iter().map(|item| item.cost).sum()
    }

    /// `1 + fixed/target`. A non-positive revenue target contributes no overhead;
    /// that is a policy choice, not an error.
    pub fn overhead_multiplier(&self) -> f64 {
        if self.monthly_revenue_target <= 0.0 {
            return 1.0;
        }
        1.0 + self.fixed_costs_total() / self.monthly_revenue_target
    }

    pub fn margin_multiplier(&self) -> f64 {
        self.target_margin_multiplier
    }

    pub fn usd_multiplier(&self) -> f64 {
        self.overhead_multiplier() * self.margin_multiplier()
    }

    pub fn markup_percent(&self) -> f64 {
        (self.usd_multiplier() - 1.0) * 100.0
    }

    pub fn final_credit_multiplier(&self) -> f64 {
        self.usd_multiplier() * self.usd_to_credits_rate
    }

    /// Credits charged for an operation whose upstream cost was `base_usd`.
    pub fn cost_credits(&self, base_usd: f64) -> f64 {
        let base_usd = if base_usd.is_finite() { base_usd.max(0.0) } else { 0.0 };
        (base_usd * self.final_credit_multiplier()).max(self.minimum_operation_cost_credits)
    }

    /// USD price a customer pays for `base_usd` of upstream spend.
    pub fn public_price_usd(&self, base_usd: f64) -> f64 {
        base_usd * self.usd_multiplier()
    }

    /// Minimum balance required to run anything under `app_id`; `0.0` when unset.
    pub fn affordability_threshold(&self, app_id: &str) -> f64 {
        self.flow_costs.get(app_id).copied().unwrap_or(0.0)
    }

    pub fn scheduler_time(&self) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(self.rollout_scheduler_time.trim(), "%H:%M").ok()
    }

    /// Rejects snapshots an administrator must not be able to activate.
    pub fn validate(&self) -> Result<(), String> {
        let scalars = [
            ("monthly_revenue_target", self.monthly_revenue_target),
            ("usd_to_credits_rate", self.usd_to_credits_rate),
            ("target_margin_multiplier", self.target_margin_multiplier),
            (
                "minimum_operation_cost_credits",
                self.minimum_operation_cost_credits,
            ),
            ("signup_initial_credits", self.signup_initial_credits),
            ("signup_initial_credits_cost", self.signup_initial_credits_cost),
            ("rollout_credits_per_period", self.rollout_credits_per_period),
            ("rollout_percentage", self.rollout_percentage),
        ];
        for (field, value) in scalars {
            ensure_non_negative(field, value)?;
        }
        if let Some(cap) = self.rollout_max_credits_rollover {
            ensure_non_negative("rollout_max_credits_rollover", cap)?;
        }
        if self.rollout_percentage > 1_000.0 {
            return Err("rollout_percentage must not exceed 1000".to_string());
        }
        for item in &self.fixed_monthly_costs {
            if item.name.trim().is_empty() {
                return Err("fixed_monthly_costs entries need a name".to_string());
            }
            ensure_non_negative(&format!("fixed_monthly_costs.{}", item.name), item.cost)?;
        }
        for (key, cost) in &self.flow_costs {
            ensure_non_negative(&format!("flow_costs.{key}"), *cost)?;
        }
        if self.scheduler_time().is_none() {
            return Err(format!(
                "rollout_scheduler_time `{}` is not HH:MM",
                self.rollout_scheduler_time
            ));
        }
        Ok(())
    }

    pub fn breakdown(&self) -> PricingBreakdown {
        let flow_estimates = self
            .flow_costs
            .iter()
            .map(|(key, usd)| {
                (
                    key.clone(),
                    FlowEstimate {
                        base_cost_usd: *usd,
                        public_price_usd: self.public_price_usd(*usd),
                        cost_credits: self.cost_credits(*usd),
                    },
                )
            })
            .collect();
        PricingBreakdown {
            fixed_costs_total: self.fixed_costs_total(),
            monthly_revenue_target: self.monthly_revenue_target,
            overhead_multiplier: self.overhead_multiplier(),
            margin_multiplier: self.margin_multiplier(),
            usd_multiplier: self.usd_multiplier(),
            markup_percent: self.markup_percent(),
            usd_to_credits_rate: self.usd_to_credits_rate,
            final_credit_multiplier: self.final_credit_multiplier(),
            minimum_operation_cost_credits: self.minimum_operation_cost_credits,
            signup_initial_credits: self.signup_initial_credits,
            signup_initial_credits_cost: self.signup_initial_credits_cost,
            flow_estimates,
        }
    }
}

fn ensure_non_negative(field: &str, value: f64) -> Result<(), String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("{field} must be a finite, non-negative number"));
    }
    Ok(())
}

/// key: pricing-breakdown -> derived view for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct PricingBreakdown {
    pub fixed_costs_total: f64,
    pub monthly_revenue_target: f64,
    pub overhead_multiplier: f64,
    pub margin_multiplier: f64,
    pub usd_multiplier: f64,
    pub markup_percent: f64,
    pub usd_to_credits_rate: f64,
    pub final_credit_multiplier: f64,
    pub minimum_operation_cost_credits: f64,
    pub signup_initial_credits: f64,
    pub signup_initial_credits_cost: f64,
    pub flow_estimates: BTreeMap<String, FlowEstimate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowEstimate {
    pub base_cost_usd: f64,
    pub public_price_usd: f64,
    pub cost_credits: f64,
}
