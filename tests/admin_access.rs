mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{subscriber, Harness, MemoryLedger, ScriptedMeter, StaticFlows};
use credit_broker::app;
use credit_broker::pricing::PricingConfig;
use serde_json::json;
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "ops-secret";

// Every test in this binary runs with the same admin token configured.
fn harness() -> Harness {
    std::env::set_var("ADMIN_API_TOKEN", ADMIN_TOKEN);
    Harness::with_subscriptions(
        "app-1",
        PricingConfig {
            rollout_max_credits_rollover: Some(5_000.0),
            ..PricingConfig::default()
        },
        MemoryLedger::with_balances(&[("alice", 1_234.0)]),
        ScriptedMeter::default(),
        StaticFlows::ok(json!(null)),
        vec![subscriber("alice", 100.0)],
    )
}

fn request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("x-admin-token", token);
    }
    builder.body(Body::empty()).unwrap()
}

async fn status_of(harness: &Harness, request: Request<Body>) -> StatusCode {
    app(harness.services.clone())
        .oneshot(request)
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn rollout_preview_requires_admin_token() {
    let harness = harness();
    let uri = "/api/apps/app-1/rollout/preview";

    assert_eq!(
        status_of(&harness, request("GET", uri, None)).await,
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        status_of(&harness, request("GET", uri, Some("guess"))).await,
        StatusCode::FORBIDDEN
    );
    assert!(harness.audit.runs.lock().unwrap().is_empty());

    assert_eq!(
        status_of(&harness, request("GET", uri, Some(ADMIN_TOKEN))).await,
        StatusCode::OK
    );
    assert_eq!(harness.audit.runs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rollout_history_and_run_require_admin_token() {
    let harness = harness();

    assert_eq!(
        status_of(&harness, request("GET", "/api/apps/app-1/rollout/runs", None)).await,
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        status_of(&harness, request("POST", "/api/apps/app-1/rollout/run", None)).await,
        StatusCode::UNAUTHORIZED
    );
    assert!(harness.ledger.credits.lock().unwrap().is_empty());

    assert_eq!(
        status_of(
            &harness,
            request("GET", "/api/apps/app-1/rollout/runs", Some(ADMIN_TOKEN))
        )
        .await,
        StatusCode::OK
    );
}
