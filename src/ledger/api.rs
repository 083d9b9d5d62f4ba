use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    Json,
};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::extractor::CallerContext;
use crate::gate::{AffordabilityGate, AffordabilityOutcome};
use crate::pricing::PricingConfigStore;

use super::{CreditsLedgerClient, LedgerOutcome};

pub const SIGNUP_GRANT_REASON: &str = "signup_bonus";

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub user_id: String,
    pub balance: f64,
}

/// key: credits-api -> fail-open balance read
pub async fn get_balance(
    Extension(ledger): Extension<CreditsLedgerClient>,
    caller: CallerContext,
) -> Json<BalanceResponse> {
    let balance = ledger.get_balance(&caller.user_id).await;
    Json(BalanceResponse {
        user_id: caller.user_id,
        balance,
    })
}

pub async fn check_affordability(
    Extension(gate): Extension<AffordabilityGate>,
    caller: CallerContext,
    Path(app_id): Path<String>,
) -> AppResult<Json<AffordabilityOutcome>> {
    let outcome = gate.check(&app_id, &caller.user_id).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
pub struct SignupGrantResponse {
    pub app_id: String,
    pub user_id: String,
    pub credits: f64,
    pub accounting_cost: f64,
    pub ledger: Option<LedgerOutcome>,
}

/// key: credits-api -> one-time onboarding grant, deduplicated per app and user
pub async fn signup_grant(
    Extension(ledger): Extension<CreditsLedgerClient>,
    Extension(configs): Extension<Arc<PricingConfigStore>>,
    caller: CallerContext,
) -> AppResult<Json<SignupGrantResponse>> {
    let app_id = caller.require_app_id()?.to_string();
    let config = configs.load(&app_id).await?;
    let credits = config.signup_initial_credits;
    let mut response = SignupGrantResponse {
        app_id: app_id.clone(),
        user_id: caller.user_id.clone(),
        credits,
        accounting_cost: config.signup_initial_credits_cost,
        ledger: None,
    };
    if credits <= 0.0 {
        return Ok(Json(response));
    }

    let key = format!("signup:{app_id}:{}", caller.user_id);
    let outcome = ledger
        .credit(&caller.user_id, credits, SIGNUP_GRANT_REASON, Some(&key))
        .await;
    if !outcome.success && !outcome.duplicate {
        return Err(AppError::BadGateway(
            outcome
                .error
                .unwrap_or_else(|| "signup grant failed".to_string()),
        ));
    }
    response.ledger = Some(outcome);
    Ok(Json(response))
}
