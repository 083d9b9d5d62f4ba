use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use credit_broker::config;
use credit_broker::execution::{ExecutionOrchestrator, HttpFlowExecutor};
use credit_broker::gate::AffordabilityGate;
use credit_broker::ledger::{CreditsLedgerClient, HttpLedgerStore};
use credit_broker::pricing::{PgPricingConfigRepository, PricingConfigStore};
use credit_broker::rollout::{
    spawn_rollout_scheduler, PgRolloutAuditSink, PgSubscriptionSource, RolloutEngine,
};
use credit_broker::usage::{
    spawn_replay_sweep, start_reconciliation_worker, HttpUsageMeter, PendingReconciliationStore,
    PgPendingReconciliationStore, Settlement, UsageReconciler,
};
use credit_broker::{app, AppServices};

async fn root() -> &'static str {
    "Credit Broker API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let configs = Arc::new(PricingConfigStore::new(
        Arc::new(PgPricingConfigRepository::new(pool.clone())),
        Duration::from_secs(*config::PRICING_CONFIG_CACHE_TTL_SECS),
    ));
    if let Some(app_id) = config::DEFAULT_APP_ID.as_deref() {
        configs.ensure_defaults(app_id).await?;
    }

    let ledger = CreditsLedgerClient::new(Arc::new(HttpLedgerStore::new(
        config::LEDGER_STORE_URL.as_str(),
        config::LEDGER_STORE_TOKEN.clone(),
    )?));
    let meter = Arc::new(HttpUsageMeter::new(
        config::USAGE_METER_URL.as_str(),
        config::USAGE_METER_TOKEN.clone(),
    )?);
    let flows = Arc::new(HttpFlowExecutor::new(
        config::FLOW_PROVIDER_URL.as_str(),
        config::FLOW_PROVIDER_TOKEN.clone(),
        Duration::from_secs(*config::FLOW_PROVIDER_TIMEOUT_SECS),
    )?);
    let reconciler = UsageReconciler::new(meter, *config::RECONCILE_STABILIZATION);
    let gate = AffordabilityGate::new(configs.clone(), ledger.clone());

    let pending: Arc<dyn PendingReconciliationStore> =
        Arc::new(PgPendingReconciliationStore::new(pool.clone()));
    let reconciliations = start_reconciliation_worker(
        Settlement {
            reconciler: reconciler.clone(),
            ledger: ledger.clone(),
            configs: configs.clone(),
            store: pending.clone(),
            budget: *config::RECONCILE_ASYNC_BUDGET,
        },
        *config::RECONCILE_WORKERS,
    );

    let pending_sweep = pending.clone();
    let sweep_handle = reconciliations.clone();
    let orchestrator = Arc::new(ExecutionOrchestrator::new(
        configs.clone(),
        gate.clone(),
        ledger.clone(),
        flows,
        reconciler,
        pending,
        reconciliations,
        *config::RECONCILE_SYNC_BUDGET,
    ));

    let rollout = RolloutEngine::new(
        configs.clone(),
        ledger.clone(),
        Arc::new(PgSubscriptionSource::new(pool.clone())),
        Arc::new(PgRolloutAuditSink::new(pool.clone())),
    )
    .with_concurrency(*config::ROLLOUT_CONCURRENCY);
    spawn_rollout_scheduler(rollout.clone(), config::ROLLOUT_APP_IDS.clone());

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let router = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(app(AppServices {
            configs,
            ledger,
            gate,
            orchestrator,
            rollout,
        }))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    spawn_replay_sweep(
        pending_sweep,
        sweep_handle,
        Duration::from_secs(*config::RECONCILE_SWEEP_INTERVAL_SECS),
    );
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}
