// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{header, Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value as Json};
use tower::ServiceExt as _; // for `oneshot`

use confidence_engine::{api, ConfidenceEngine, ConfidenceResult, EngineConfig};

const BODY_LIMIT: usize = 1024 * 1024;

fn engine_with(cfg: EngineConfig) -> Arc<ConfidenceEngine> {
    Arc::new(ConfidenceEngine::new(cfg).expect("engine"))
}

fn test_router() -> (Arc<ConfidenceEngine>, Router) {
    let engine = engine_with(EngineConfig::default());
    (engine.clone(), api::create_router(engine))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Json>) -> (StatusCode, Option<Json>, http::HeaderMap) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(b) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(b.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("build request");

    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("read body");
    let json = serde_json::from_slice(&bytes).ok();
    (status, json, headers)
}

fn features() -> Json {
    json!({
        "categories": [{ "name": "docs", "confidence": 0.9 }],
        "created_at": "2025-09-01T00:00:00Z"
    })
}

#[tokio::test]
async fn health_returns_ok() {
    let (_, app) = test_router();
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn score_without_record_leaves_history_empty() {
    let (engine, app) = test_router();
    let (status, body, _) = send(&app, "POST", "/entities/doc-1/score", Some(features())).await;
    assert_eq!(status, StatusCode::OK);
    let body = body.unwrap();
    assert_eq!(body["entity_id"], "doc-1");
    assert_eq!(body["strategy"], "weighted_average");
    assert!(body.get("sequence").is_none());
    let overall = body["overall"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&overall));
    assert!(engine.history("doc-1").is_empty());
}

#[tokio::test]
async fn score_and_record_then_read_back() {
    let (_, app) = test_router();
    for expected in 0..2u64 {
        let (status, body, _) = send(&app, "POST", "/entities/doc-1/score?record=true", Some(features())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.unwrap()["sequence"], expected);
    }

    let (status, body, _) = send(&app, "GET", "/entities/doc-1/history", None).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.unwrap();
    assert_eq!(entries.as_array().unwrap().len(), 2);
    assert_eq!(entries[1]["sequence"], 1);

    let (status, body, _) = send(&app, "GET", "/entities/doc-1/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["count"], 2);

    let (status, body, _) = send(&app, "GET", "/entities/doc-1/convergence", None).await;
    assert_eq!(status, StatusCode::OK);
    let state = body.unwrap();
    assert_eq!(state["entity_id"], "doc-1");
    assert!(state["phase"].is_string());

    let (status, body, _) = send(&app, "GET", "/entities/doc-1/prediction?target=0.95", None).await;
    assert_eq!(status, StatusCode::OK);
    let report = body.unwrap();
    assert_eq!(report["target"], 0.95);
    assert_eq!(report["per_strategy"].as_array().unwrap().len(), 4);
    assert_eq!(report["ensemble"]["strategy"], "ensemble");

    let (status, _, _) = send(&app, "POST", "/entities/doc-1/reset", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn unknown_entities_are_not_found() {
    let (engine, app) = test_router();
    let (status, body, _) = send(&app, "POST", "/entities/ghost/reset", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.unwrap()["error"].as_str().unwrap().contains("ghost"));

    let (status, _, _) = send(&app, "GET", "/entities/ghost/stats", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body, _) = send(&app, "GET", "/entities/ghost/history", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap(), json!([]));

    let (status, body, _) = send(&app, "DELETE", "/entities/ghost", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["released"], false);
    assert_eq!(engine.tracked_entities(), 0);
}

#[tokio::test]
async fn record_enforces_expected_sequence() {
    let (_, app) = test_router();
    let result = ConfidenceResult {
        entity_id: "doc-2".into(),
        overall: 0.7,
        dimensions: BTreeMap::new(),
        strategy: "weighted_average".into(),
        degraded: false,
        missing: Vec::new(),
        weights_version: 0,
        timestamp: Utc::now(),
    };
    let payload = json!({ "result": result, "expected_sequence": 0 });

    let (status, body, _) = send(&app, "POST", "/entities/doc-2/record", Some(payload.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body.unwrap()["sequence"], 0);

    // a retried call with the same expectation is a conflict, not a duplicate
    let (status, _, _) = send(&app, "POST", "/entities/doc-2/record", Some(payload)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, _) = send(
        &app,
        "POST",
        "/entities/other/record",
        Some(json!({ "result": result })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn record_rejects_overall_outside_unit_interval() {
    let (engine, app) = test_router();
    let result = ConfidenceResult {
        entity_id: "doc-9".into(),
        overall: 7.5,
        dimensions: BTreeMap::new(),
        strategy: "weighted_average".into(),
        degraded: false,
        missing: Vec::new(),
        weights_version: 0,
        timestamp: Utc::now(),
    };
    let (status, body, _) = send(&app, "POST", "/entities/doc-9/record", Some(json!({ "result": result }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.unwrap()["error"].as_str().unwrap().contains("outside [0, 1]"));

    let (_, body, _) = send(&app, "GET", "/entities/doc-9/history", None).await;
    assert_eq!(body.unwrap(), json!([]));
    assert!(!engine.classify("doc-9").has_converged);
}

#[tokio::test]
async fn events_signal_backpressure_with_retry_after() {
    let mut cfg = EngineConfig::default();
    cfg.stream.max_buffered_events = 2;
    let engine = engine_with(cfg);
    let app = api::create_router(engine.clone());

    let event = json!({ "kind": "edit", "content_delta": 12 });
    for _ in 0..2 {
        let (status, _, _) = send(&app, "POST", "/entities/doc-3/events", Some(event.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    let (status, body, headers) = send(&app, "POST", "/entities/doc-3/events", Some(event)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "1");
    assert!(body.unwrap()["error"].as_str().unwrap().contains("occupancy"));

    let (status, body, _) = send(&app, "POST", "/entities/doc-3/flush", None).await;
    assert_eq!(status, StatusCode::OK);
    let windows = body.unwrap();
    let total: u64 = windows
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["aggregate"]["event_count"].as_u64().unwrap())
        .sum();
    assert_eq!(total, 2);
    assert_eq!(engine.stream().buffered_events(), 0);
}

#[tokio::test]
async fn feedback_publishes_new_weights() {
    let (_, app) = test_router();
    let (status, body, _) = send(&app, "GET", "/weights", None).await;
    assert_eq!(status, StatusCode::OK);
    let before = body.unwrap();
    assert_eq!(before["version"], 0);

    let batch = json!([{
        "entity_id": "doc-4",
        "predicted_confidence": 0.4,
        "actual_confidence": 0.9,
        "dimensions": { "semantic": 0.9, "categorical": 0.2, "structural": 0.5, "temporal": 0.5 }
    }]);
    let (status, body, _) = send(&app, "POST", "/feedback", Some(batch)).await;
    assert_eq!(status, StatusCode::OK);
    let after = body.unwrap();
    assert_eq!(after["version"], 1);
    let sum: f64 = after["weights"].as_object().unwrap().values().map(|v| v.as_f64().unwrap()).sum();
    assert!((sum - 1.0).abs() < 1e-9);
    assert_ne!(before["weights"], after["weights"]);
}

#[tokio::test]
async fn delete_stops_tracking() {
    let (engine, app) = test_router();
    send(&app, "POST", "/entities/doc-5/score?record=true", Some(features())).await;
    assert_eq!(engine.tracked_entities(), 1);

    let (status, body, _) = send(&app, "DELETE", "/entities/doc-5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["released"], true);
    assert_eq!(engine.tracked_entities(), 0);
    assert!(engine.history("doc-5").is_empty());
}
