// tests/engine_e2e.rs
//
// End-to-end flows through the engine: notifications, feedback batching,
// provider failures and the convergence webhook.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::post, Json, Router};
use chrono::{TimeZone, Utc};
use tokio::sync::{broadcast::error::TryRecvError, mpsc};

use confidence_engine::notify::webhook::{spawn_forwarder, WebhookNotifier};
use confidence_engine::{
    ConfidenceEngine, ConfidenceResult, Dimension, EngineConfig, FeatureProvider, FeatureSet, FeedbackRecord,
    Notification,
};

fn result(entity: &str, overall: f64, step: i64) -> ConfidenceResult {
    ConfidenceResult {
        entity_id: entity.into(),
        overall,
        dimensions: BTreeMap::new(),
        strategy: "weighted_average".into(),
        degraded: false,
        missing: Vec::new(),
        weights_version: 0,
        timestamp: Utc.timestamp_opt(1_750_000_000 + step, 0).unwrap(),
    }
}

fn feedback(predicted: f64, actual: f64) -> FeedbackRecord {
    FeedbackRecord {
        entity_id: "doc".into(),
        predicted_confidence: predicted,
        actual_confidence: actual,
        dimensions: Dimension::ALL.iter().map(|d| (*d, 0.5)).collect(),
    }
}

fn record_converging(e: &ConfidenceEngine, entity: &str, from_step: i64) {
    for (i, v) in [0.60, 0.83, 0.841, 0.843, 0.845].iter().enumerate() {
        e.record(entity, result(entity, *v, from_step + i as i64)).unwrap();
    }
}

#[test]
fn converged_is_announced_once() {
    let e = ConfidenceEngine::new(EngineConfig::default()).unwrap();
    let mut rx = e.subscribe();
    record_converging(&e, "doc", 0);

    let mut scored = 0;
    while let Ok(n) = rx.try_recv() {
        assert_eq!(n.kind(), "scored");
        scored += 1;
    }
    assert_eq!(scored, 5);

    assert!(e.classify("doc").has_converged);
    assert!(e.classify("doc").has_converged);
    match rx.try_recv().unwrap() {
        Notification::Converged { entity_id, state } => {
            assert_eq!(entity_id, "doc");
            assert!(state.has_converged);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    // a reset re-arms the announcement
    e.reset("doc").unwrap();
    record_converging(&e, "doc", 10);
    e.classify("doc");
    let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok()).map(|n| n.kind()).collect();
    assert_eq!(kinds.iter().filter(|k| **k == "converged").count(), 1);
}

#[test]
fn queued_feedback_applies_in_batches() {
    let mut cfg = EngineConfig::default();
    cfg.optimizer.batch_size = 2;
    let e = ConfidenceEngine::new(cfg).unwrap();
    let mut rx = e.subscribe();

    assert!(e.queue_feedback(feedback(0.5, 0.9)).is_none());
    assert_eq!(e.pending_feedback(), 1);
    let v = e.queue_feedback(feedback(0.5, 0.8)).unwrap();
    assert_eq!(v.version, 1);
    assert_eq!(e.pending_feedback(), 0);
    assert!(v.weights.is_normalized_within(e.config().weights.bounds(), 1e-9));

    match rx.try_recv().unwrap() {
        Notification::WeightsUpdated { version, .. } => assert_eq!(version, 1),
        other => panic!("unexpected {other:?}"),
    }

    // later scores carry the new version
    let r = e.score("doc", &FeatureSet::empty(Utc::now()));
    assert_eq!(r.weights_version, 1);

    assert!(e.queue_feedback(feedback(0.7, 0.6)).is_none());
    assert_eq!(e.flush_feedback().unwrap().version, 2);
    assert!(e.flush_feedback().is_none());
}

#[test]
fn concurrent_feedback_never_loses_an_update() {
    let e = Arc::new(ConfidenceEngine::new(EngineConfig::default()).unwrap());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let e = e.clone();
            std::thread::spawn(move || {
                e.submit_feedback(&[feedback(0.4, 0.4 + i as f64 * 0.05)]);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(e.weights().version, 8);
}

#[test]
fn concurrent_records_keep_sequences_dense() {
    let e = Arc::new(ConfidenceEngine::new(EngineConfig::default()).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let e = e.clone();
            std::thread::spawn(move || {
                for i in 0..20 {
                    let _ = e.record("shared", result("shared", 0.5, t * 100 + i));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let h = e.history("shared");
    assert!(!h.is_empty());
    assert!(h.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
}

struct FailingProvider;

#[async_trait::async_trait]
impl FeatureProvider for FailingProvider {
    async fn features_for(&self, _entity_id: &str) -> anyhow::Result<FeatureSet> {
        anyhow::bail!("extractor offline")
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

#[tokio::test]
async fn provider_failure_scores_missing_features() {
    let e = ConfidenceEngine::new(EngineConfig::default())
        .unwrap()
        .with_provider(Arc::new(FailingProvider));
    let r = e.score_from_provider("doc").await;
    assert_eq!(r.missing.len(), Dimension::ALL.len());
    assert!((0.0..=1.0).contains(&r.overall));
    assert!(!r.degraded);
}

#[tokio::test]
async fn webhook_receives_only_convergence() {
    let (tx, mut bodies) = mpsc::unbounded_channel::<serde_json::Value>();
    let hook = Router::new()
        .route(
            "/hook",
            post(|State(tx): State<mpsc::UnboundedSender<serde_json::Value>>, Json(v): Json<serde_json::Value>| async move {
                let _ = tx.send(v);
            }),
        )
        .with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, hook).await.unwrap();
    });

    let e = ConfidenceEngine::new(EngineConfig::default()).unwrap();
    let forwarder = spawn_forwarder(
        e.subscribe(),
        WebhookNotifier::new(format!("http://{addr}/hook")).with_timeout(2),
    );

    record_converging(&e, "doc", 0);
    e.classify("doc");

    let body = tokio::time::timeout(Duration::from_secs(5), bodies.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body["type"], "converged");
    assert_eq!(body["entity_id"], "doc");
    assert_eq!(body["state"]["has_converged"], true);

    forwarder.shutdown().await;
    assert!(bodies.try_recv().is_err());
}
