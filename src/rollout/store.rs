use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::models::{ActiveSubscription, PlanOverrides, RolloutRun, RolloutRunType};

/// key: rollout-subscription-source -> active subscribers for an application
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn list_active_subscriptions(&self, app_id: &str) -> Result<Vec<ActiveSubscription>>;
}

/// key: rollout-audit-sink -> append-only run history
#[async_trait]
pub trait RolloutAuditSink: Send + Sync {
    async fn record_run(&self, run: &RolloutRun) -> Result<()>;
    async fn recent_runs(&self, app_id: &str, limit: i64) -> Result<Vec<RolloutRun>>;
    async fn last_run_at(
        &self,
        app_id: &str,
        run_type: RolloutRunType,
    ) -> Result<Option<DateTime<Utc>>>;
}

#[derive(Clone)]
pub struct PgSubscriptionSource {
    pool: PgPool,
}

impl PgSubscriptionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    user_id: String,
    plan_id: Uuid,
    credits_per_month: f64,
    rollout_percentage: Option<f64>,
    max_credits_rollover: Option<f64>,
}

#[async_trait]
impl SubscriptionSource for PgSubscriptionSource {
    async fn list_active_subscriptions(&self, app_id: &str) -> Result<Vec<ActiveSubscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT
                s.user_id,
                s.plan_id,
                COALESCE(s.credits_per_month, p.credits_per_month) AS credits_per_month,
                p.rollout_percentage,
                p.max_credits_rollover
            FROM credit_subscriptions s
            JOIN credit_plans p ON p.id = s.plan_id
            WHERE s.app_id = $1
              AND s.status IN ('active', 'trialing')
            ORDER BY s.created_at ASC
            "#,
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list active subscriptions")?;

        Ok(rows
            .into_iter()
            .map(|row| ActiveSubscription {
                user_id: row.user_id,
                plan_id: Some(row.plan_id),
                credits_per_month: row.credits_per_month,
                plan: PlanOverrides {
                    rollout_percentage: row.rollout_percentage,
                    max_credits_rollover: row.max_credits_rollover,
                },
            })
            .collect())
    }
}

#[derive(Clone)]
pub struct PgRolloutAuditSink {
    pool: PgPool,
}

impl PgRolloutAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct RolloutRunRow {
    id: Uuid,
    app_id: String,
    run_type: String,
    period_key: String,
    users_processed: i32,
    users_successful: i32,
    users_failed: i32,
    users_skipped: i32,
    total_credits_accredited: f64,
    success: bool,
    config_snapshot: Json<Value>,
    created_at: DateTime<Utc>,
}

#[async_trait]
impl RolloutAuditSink for PgRolloutAuditSink {
    async fn record_run(&self, run: &RolloutRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rollout_runs (
                id,
                app_id,
                run_type,
                period_key,
                users_processed,
                users_successful,
                users_failed,
                users_skipped,
                total_credits_accredited,
                success,
                config_snapshot,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(run.id)
        .bind(&run.app_id)
        .bind(run.run_type.as_str())
        .bind(&run.period_key)
        .bind(run.users_processed)
        .bind(run.users_successful)
        .bind(run.users_failed)
        .bind(run.users_skipped)
        .bind(run.total_credits_accredited)
        .bind(run.success)
        .bind(Json(&run.config_snapshot))
        .bind(run.timestamp)
        .execute(&self.pool)
        .await
        .context("failed to record rollout run")?;
        Ok(())
    }

    async fn recent_runs(&self, app_id: &str, limit: i64) -> Result<Vec<RolloutRun>> {
        let rows = sqlx::query_as::<_, RolloutRunRow>(
            "SELECT * FROM rollout_runs WHERE app_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(app_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list rollout runs")?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let run_type = RolloutRunType::from_str(&row.run_type)
                .ok_or_else(|| anyhow!("unknown rollout run type: {}", row.run_type))?;
            runs.push(RolloutRun {
                id: row.id,
                app_id: row.app_id,
                run_type,
                period_key: row.period_key,
                users_processed: row.users_processed,
                users_successful: row.users_successful,
                users_failed: row.users_failed,
                users_skipped: row.users_skipped,
                total_credits_accredited: row.total_credits_accredited,
                success: row.success,
                config_snapshot: row.config_snapshot.0,
                timestamp: row.created_at,
                entries: Vec::new(),
            });
        }
        Ok(runs)
    }

    async fn last_run_at(
        &self,
        app_id: &str,
        run_type: RolloutRunType,
    ) -> Result<Option<DateTime<Utc>>> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM rollout_runs WHERE app_id = $1 AND run_type = $2",
        )
        .bind(app_id)
        .bind(run_type.as_str())
        .fetch_one(&self.pool)
        .await
        .context("failed to load last rollout run")?;
        Ok(last)
    }
}
