use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::extractor::AdminAccess;

use super::{PricingBreakdown, PricingConfig, PricingConfigStore, StoredPricingConfig};

/// key: pricing-config-envelope -> active snapshot, `version` absent when defaulted
#[derive(Debug, Serialize)]
pub struct PricingConfigEnvelope {
    pub app_id: String,
    pub version: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub config: PricingConfig,
    pub breakdown: PricingBreakdown,
}

impl PricingConfigEnvelope {
    fn stored(stored: StoredPricingConfig) -> Self {
        let breakdown = stored.config.breakdown();
        Self {
            app_id: stored.app_id,
            version: Some(stored.version),
            updated_at: Some(stored.updated_at),
            config: stored.config,
            breakdown,
        }
    }
}

pub async fn get_pricing_config(
    Extension(configs): Extension<Arc<PricingConfigStore>>,
    Path(app_id): Path<String>,
) -> AppResult<Json<PricingConfigEnvelope>> {
    let envelope = match configs.stored(&app_id).await? {
        Some(stored) => PricingConfigEnvelope::stored(stored),
        None => {
            let config = PricingConfig::default();
            PricingConfigEnvelope {
                app_id,
                version: None,
                updated_at: None,
                breakdown: config.breakdown(),
                config,
            }
        }
    };
    Ok(Json(envelope))
}

pub async fn put_pricing_config(
    _admin: AdminAccess,
    Extension(configs): Extension<Arc<PricingConfigStore>>,
    Path(app_id): Path<String>,
    Json(config): Json<PricingConfig>,
) -> AppResult<Json<PricingConfigEnvelope>> {
    config.validate().map_err(AppError::BadRequest)?;
    let stored = configs.replace(&app_id, config).await?;
    Ok(Json(PricingConfigEnvelope::stored(stored)))
}

pub async fn pricing_breakdown(
    Extension(configs): Extension<Arc<PricingConfigStore>>,
    Path(app_id): Path<String>,
) -> AppResult<Json<PricingBreakdown>> {
    let config = configs.load(&app_id).await?;
    Ok(Json(config.breakdown()))
}
