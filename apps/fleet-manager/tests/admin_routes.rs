mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use fleet_manager::routes::router;
use http_body_util::BodyExt;
use panel_client::{InstanceId, MockReply};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let f = fleet(settings());
    let app = router(f.state.clone());

    let response = app.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");

    fleet_manager::metrics::RECONCILE_PASSES.inc();
    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("fleet_reconcile_passes_total"));
}

#[tokio::test(start_paused = true)]
async fn roster_bootstrap_and_queues_are_exposed() {
    let f = fleet(settings());
    healthy_panel(&f.mock);
    let a = InstanceId::new("A");
    f.mock.respond(DISCOVERY, listing(&[("A", "Generic", true)]));
    f.mock.push_for(&a, UPDATES, MockReply::Json(console(&[(1, "Console", "seed")])));
    f.mock.push_for(&a, UPDATES, MockReply::Json(console(&[(2, "Console", "Server started")])));
    f.state.startup().await.unwrap();
    let app = router(f.state.clone());

    let roster = body_json(app.clone().oneshot(get("/instances")).await.unwrap()).await;
    assert_eq!(roster["instances"][0]["instance_id"], "A");
    assert_eq!(roster["instances"][0]["bootstrap_phase"], "ready");
    assert_eq!(roster["instances"][0]["stream_state"], "running");

    let status = body_json(app.clone().oneshot(get("/instances/A/bootstrap")).await.unwrap()).await;
    assert_eq!(status["phase"], "ready");
    assert_eq!(status["has_required_session_permissions"], true);

    let response = app.clone().oneshot(get("/instances/A/console/next")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let response = app.clone().oneshot(get("/instances/A/console/next")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"Server started".to_vec());

    let response = app.oneshot(get("/instances/A/chat/next")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test(start_paused = true)]
async fn stream_control_and_commands() {
    let f = fleet(settings());
    healthy_panel(&f.mock);
    f.mock.respond(DISCOVERY, listing(&[("A", "Generic", true), ("B", "Generic", false)]));
    f.state.startup().await.unwrap();
    let app = router(f.state.clone());

    let response = app.clone().oneshot(post("/instances/A/stream/stop", json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["stream_state"], "stopped");

    let response = app.clone().oneshot(post("/instances/A/stream/start", json!({}))).await.unwrap();
    assert_eq!(body_json(response).await["stream_state"], "running");

    let response = app.clone().oneshot(post("/instances/B/stream/start", json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(post("/instances/A/console", json!({"message": "list"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let sent = f.mock.calls_for(&InstanceId::new("A"), "Core/SendConsoleMessage");
    assert_eq!(sent[0].body["message"], "list");

    let response = app
        .clone()
        .oneshot(post("/instances/A/action", json!({"action": "restart"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(f.mock.calls_for(&InstanceId::new("A"), "Core/Restart").len(), 1);

    let response = app.oneshot(get("/instances/nope/bootstrap")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
