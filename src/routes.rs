use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};

use crate::execution::{self, ExecutionOrchestrator};
use crate::gate::AffordabilityGate;
use crate::ledger::{self, CreditsLedgerClient};
use crate::pricing::{self, PricingConfigStore};
use crate::rollout::{self, RolloutEngine};

/// key: app-services -> shared handles injected into every handler
#[derive(Clone)]
pub struct AppServices {
    pub configs: Arc<PricingConfigStore>,
    pub ledger: CreditsLedgerClient,
    pub gate: AffordabilityGate,
    pub orchestrator: Arc<ExecutionOrchestrator>,
    pub rollout: RolloutEngine,
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/execute", post(execution::api::execute))
        .route("/api/pricing-status", get(execution::api::pricing_status))
        .route("/api/credits/balance", get(ledger::api::get_balance))
        .route("/api/credits/signup-grant", post(ledger::api::signup_grant))
        .route(
            "/api/apps/:app_id/pricing-config",
            get(pricing::api::get_pricing_config).put(pricing::api::put_pricing_config),
        )
        .route(
            "/api/apps/:app_id/pricing-breakdown",
            get(pricing::api::pricing_breakdown),
        )
        .route(
            "/api/apps/:app_id/affordability",
            get(ledger::api::check_affordability),
        )
        .route("/api/apps/:app_id/rollout/run", post(rollout::api::run_rollout))
        .route(
            "/api/apps/:app_id/rollout/preview",
            get(rollout::api::preview_rollout),
        )
        .route(
            "/api/apps/:app_id/rollout/runs",
            get(rollout::api::list_rollout_runs),
        )
}

/// API routes with every service attached as an extension.
pub fn app(services: AppServices) -> Router {
    api_routes()
        .layer(Extension(services.configs))
        .layer(Extension(services.ledger))
        .layer(Extension(services.gate))
        .layer(Extension(services.orchestrator))
        .layer(Extension(services.rollout))
}
