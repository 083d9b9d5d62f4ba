use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const APP_ID_HEADER: &str = "x-app-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const UPSTREAM_IDENTITY_HEADER: &str = "x-upstream-identity";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Caller identity as forwarded by the session layer in front of this service.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub user_id: String,
    pub app_id: Option<String>,
    /// Client supplied, or generated per request when absent.
    pub idempotency_key: String,
    /// Identity the upstream provider meters spend against.
    pub upstream_identity: String,
}

impl CallerContext {
    pub fn require_app_id(&self) -> AppResult<&str> {
        self.app_id
            .as_deref()
            .ok_or_else(|| AppError::BadRequest("Missing X-App-Id header".into()))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let user_id = header_value(headers, USER_ID_HEADER)
            .ok_or((StatusCode::UNAUTHORIZED, "Missing X-User-Id header".into()))?;
        let app_id = header_value(headers, APP_ID_HEADER);
        let idempotency_key = header_value(headers, IDEMPOTENCY_KEY_HEADER)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let upstream_identity =
            header_value(headers, UPSTREAM_IDENTITY_HEADER).unwrap_or_else(|| user_id.clone());
        Ok(CallerContext {
            user_id,
            app_id,
            idempotency_key,
            upstream_identity,
        })
    }
}

/// Guard for administrative endpoints. Open when `ADMIN_API_TOKEN` is unset.
pub struct AdminAccess;

#[async_trait]
impl<S> FromRequestParts<S> for AdminAccess
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(expected) = crate::config::ADMIN_API_TOKEN.as_deref() else {
            return Ok(AdminAccess);
        };
        match header_value(&parts.headers, ADMIN_TOKEN_HEADER) {
            Some(token) if token == expected => Ok(AdminAccess),
            Some(_) => Err((StatusCode::FORBIDDEN, "Invalid admin token".into())),
            None => Err((StatusCode::UNAUTHORIZED, "Missing admin token".into())),
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
