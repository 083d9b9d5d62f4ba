use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::CallerContext;

use super::{
    ExecuteRequest, ExecuteResponse, ExecutionMode, ExecutionOrchestrator, PricingStatusResponse,
};

#[derive(Debug, Deserialize)]
pub struct ExecuteQuery {
    #[serde(default)]
    pub mode: Option<String>,
}

/// key: execute-api -> paid flow execution
pub async fn execute(
    Extension(orchestrator): Extension<Arc<ExecutionOrchestrator>>,
    caller: CallerContext,
    Query(query): Query<ExecuteQuery>,
    Json(payload): Json<ExecuteRequest>,
) -> AppResult<Json<ExecuteResponse>> {
    let mode = match query.mode.as_deref() {
        Some(raw) => ExecutionMode::parse(raw)
            .ok_or_else(|| AppError::BadRequest(format!("unknown execution mode `{raw}`")))?,
        None => *config::EXECUTION_DEFAULT_MODE,
    };
    orchestrator
        .execute(&caller, payload, mode)
        .await
        .map(Json)
}

#[derive(Debug, Deserialize)]
pub struct PricingStatusQuery {
    #[serde(default)]
    pub usage_before: Option<f64>,
    #[serde(default)]
    pub reconciliation_id: Option<Uuid>,
}

/// key: pricing-status-api -> companion poll for fast-return executions
pub async fn pricing_status(
    Extension(orchestrator): Extension<Arc<ExecutionOrchestrator>>,
    caller: CallerContext,
    Query(query): Query<PricingStatusQuery>,
) -> AppResult<Json<PricingStatusResponse>> {
    if let Some(id) = query.reconciliation_id {
        let record = orchestrator.reconciliation(&caller, id).await?;
        return Ok(Json(PricingStatusResponse::Recorded(record)));
    }
    let usage_before = query.usage_before.ok_or_else(|| {
        AppError::BadRequest("usage_before or reconciliation_id is required".into())
    })?;
    let report = orchestrator.measure_since(&caller, usage_before).await?;
    Ok(Json(PricingStatusResponse::Measured(report)))
}
