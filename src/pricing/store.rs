use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};

use super::model::PricingConfig;

/// key: pricing-config-record -> persisted snapshot with replace-on-write version
#[derive(Debug, Clone, Serialize)]
pub struct StoredPricingConfig {
    pub app_id: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub config: PricingConfig,
}

/// key: pricing-config-repository -> backing store contract
#[async_trait]
pub trait PricingConfigRepository: Send + Sync {
    async fn get_config(&self, app_id: &str) -> Result<Option<StoredPricingConfig>>;
    async fn put_config(&self, app_id: &str, config: &PricingConfig)
        -> Result<StoredPricingConfig>;
}

#[derive(Clone)]
pub struct PgPricingConfigRepository {
    pool: PgPool,
}

impl PgPricingConfigRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct PricingConfigRow {
    app_id: String,
    version: i64,
    updated_at: DateTime<Utc>,
    config: Json<PricingConfig>,
}

impl From<PricingConfigRow> for StoredPricingConfig {
    fn from(row: PricingConfigRow) -> Self {
        Self {
            app_id: row.app_id,
            version: row.version,
            updated_at: row.updated_at,
            config: row.config.0,
        }
    }
}

#[async_trait]
impl PricingConfigRepository for PgPricingConfigRepository {
    async fn get_config(&self, app_id: &str) -> Result<Option<StoredPricingConfig>> {
        let row = sqlx::query_as::<_, PricingConfigRow>(
            "SELECT app_id, version, updated_at, config FROM pricing_configs WHERE app_id = $1",
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load pricing config")?;
        Ok(row.map(Into::into))
    }

    async fn put_config(
        &self,
        app_id: &str,
        config: &PricingConfig,
    ) -> Result<StoredPricingConfig> {
        let row = sqlx::query_as::<_, PricingConfigRow>(
            r#"
            INSERT INTO pricing_configs (app_id, config, version, updated_at)
            VALUES ($1, $2, 1, NOW())
            ON CONFLICT (app_id)
            DO UPDATE SET
                config = EXCLUDED.config,
                version = pricing_configs.version + 1,
                updated_at = NOW()
            RETURNING app_id, version, updated_at, config
            "#,
        )
        .bind(app_id)
        .bind(Json(config))
        .fetch_one(&self.pool)
        .await
        .context("failed to replace pricing config")?;
        Ok(row.into())
    }
}

struct CachedConfig {
    config: Arc<PricingConfig>,
    loaded_at: Instant,
}

/// key: pricing-config-store -> snapshot loader with bounded staleness
///
/// With a zero TTL every `load` goes to the repository, so each orchestration
/// entry sees the latest administrative write.
pub struct PricingConfigStore {
    repository: Arc<dyn PricingConfigRepository>,
    cache: DashMap<String, CachedConfig>,
    ttl: Duration,
}

impl PricingConfigStore {
    pub fn new(repository: Arc<dyn PricingConfigRepository>, ttl: Duration) -> Self {
        Self {
            repository,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Active snapshot for `app_id`, falling back to defaults when none was saved.
    pub async fn load(&self, app_id: &str) -> Result<Arc<PricingConfig>> {
        if !self.ttl.is_zero() {
            if let Some(entry) = self.cache.get(app_id) {
                if entry.loaded_at.elapsed() < self.ttl {
                    return Ok(entry.config.clone());
                }
            }
        }

        let config = match self.repository.get_config(app_id).await? {
            Some(stored) => stored.config,
            None => {
                debug!(%app_id, "no pricing config stored; using defaults");
                PricingConfig::default()
            }
        };
        let config = Arc::new(config);
        if !self.ttl.is_zero() {
            self.cache.insert(
                app_id.to_string(),
                CachedConfig {
                    config: config.clone(),
                    loaded_at: Instant::now(),
                },
            );
        }
        Ok(config)
    }

    pub async fn stored(&self, app_id: &str) -> Result<Option<StoredPricingConfig>> {
        self.repository.get_config(app_id).await
    }

    pub async fn replace(&self, app_id: &str, config: PricingConfig) -> Result<StoredPricingConfig> {
        let stored = self.repository.put_config(app_id, &config).await?;
        self.cache.remove(app_id);
        info!(%app_id, version = stored.version, "pricing config replaced");
        Ok(stored)
    }

    /// Persists defaults for `app_id` unless an administrator already saved a config.
    pub async fn ensure_defaults(&self, app_id: &str) -> Result<StoredPricingConfig> {
        if let Some(existing) = self.repository.get_config(app_id).await? {
            return Ok(existing);
        }
        self.replace(app_id, PricingConfig::default()).await
    }
}
