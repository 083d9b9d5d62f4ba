use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use serde::Deserialize;

use crate::error::AppResult;
use crate::extractor::AdminAccess;

use super::{RolloutEngine, RolloutRun};

const DEFAULT_HISTORY_LIMIT: i64 = 20;
const MAX_HISTORY_LIMIT: i64 = 100;

#[derive(Debug, Default, Deserialize)]
pub struct RolloutRunRequest {
    #[serde(default)]
    pub dry_run: bool,
}

/// key: rollout-api -> manual trigger, body optional
pub async fn run_rollout(
    _admin: AdminAccess,
    Extension(engine): Extension<RolloutEngine>,
    Path(app_id): Path<String>,
    request: Option<Json<RolloutRunRequest>>,
) -> AppResult<Json<RolloutRun>> {
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let run = engine.run(&app_id, request.dry_run).await?;
    Ok(Json(run))
}

/// Dry run; entries expose subscriber balances, so admin only.
pub async fn preview_rollout(
    _admin: AdminAccess,
    Extension(engine): Extension<RolloutEngine>,
    Path(app_id): Path<String>,
) -> AppResult<Json<RolloutRun>> {
    let run = engine.run(&app_id, true).await?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
pub struct RolloutHistoryQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list_rollout_runs(
    _admin: AdminAccess,
    Extension(engine): Extension<RolloutEngine>,
    Path(app_id): Path<String>,
    Query(query): Query<RolloutHistoryQuery>,
) -> AppResult<Json<Vec<RolloutRun>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let runs = engine.audit().recent_runs(&app_id, limit).await?;
    Ok(Json(runs))
}
