use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::gate::AffordabilityOutcome;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("insufficient credits for {}: {} required, {} available", .0.app_id, .0.required, .0.available)]
    InsufficientCredits(AffordabilityOutcome),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("{0}")]
    Message(String),
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Message(format!("{err:#}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::InsufficientCredits(outcome) = &self {
            tracing::info!(
                app_id = %outcome.app_id,
                user_id = %outcome.user_id,
                required = outcome.required,
                available = outcome.available,
                "execution blocked by affordability gate"
            );
            let body = json!({
                "error_type": "insufficient_credits",
                "message": self.to_string(),
                "minimum_required": outcome.required,
                "available_credits": outcome.available,
                "shortage": outcome.shortage,
                "app_id": outcome.app_id,
            });
            return (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response();
        }

        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::BadGateway(_) | AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Db(_) | AppError::Message(_) | AppError::InsufficientCredits(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
