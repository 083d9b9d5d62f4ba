use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::config;
use crate::pricing::{PricingConfig, RolloutInterval};

use super::engine::RolloutEngine;
use super::models::RolloutRunType;

/// key: rollout-scheduler -> periodic replenishment for configured apps
pub fn spawn(engine: RolloutEngine, app_ids: Vec<String>) {
    if app_ids.is_empty() {
        info!("no rollout applications configured; scheduler disabled");
        return;
    }
    let interval = TokioDuration::from_secs(*config::ROLLOUT_SCAN_INTERVAL_SECS);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = process_tick(&engine, &app_ids, Utc::now()).await {
                warn!(?err, "rollout scheduler tick failed");
            }
        }
    });
}

/// key: rollout-scheduler -> tick handler, returns the number of runs started
pub async fn process_tick(
    engine: &RolloutEngine,
    app_ids: &[String],
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut started = 0;
    for app_id in app_ids {
        let config = match engine.configs().load(app_id).await {
            Ok(config) => config,
            Err(err) => {
                warn!(?err, %app_id, "failed to load pricing config for rollout");
                continue;
            }
        };
        if !config.rollout_enabled {
            continue;
        }
        let Some(instant) = scheduled_instant(&config, now) else {
            warn!(
                %app_id,
                time = %config.rollout_scheduler_time,
                "invalid rollout scheduler time"
            );
            continue;
        };
        if now < instant {
            debug!(%app_id, %instant, "rollout not due yet");
            continue;
        }

        let last = engine
            .audit()
            .last_run_at(app_id, RolloutRunType::Scheduled)
            .await?;
        if matches!(last, Some(last) if last >= instant) {
            debug!(%app_id, %instant, "scheduled rollout already ran this period");
            continue;
        }

        match engine.run_as(app_id, RolloutRunType::Scheduled, now).await {
            Ok(run) => {
                started += 1;
                info!(%app_id, run = %run.id, period = %run.period_key, "scheduled rollout completed");
            }
            Err(err) => warn!(?err, %app_id, "scheduled rollout failed"),
        }
    }
    Ok(started)
}

/// Scheduled instant of the period containing `now`, or `None` when the
/// configured time does not parse.
pub fn scheduled_instant(config: &PricingConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let time = config.scheduler_time()?;
    let today = now.date_naive();
    let day = match config.rollout_interval {
        RolloutInterval::Daily => today,
        RolloutInterval::Weekly => {
            today - Duration::days(i64::from(today.weekday().num_days_from_monday()))
        }
        RolloutInterval::Monthly => NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?,
    };
    Some(Utc.from_utc_datetime(&day.and_time(time)))
}
