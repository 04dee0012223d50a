//! # Confidence Engine
//! One explicit instance owning weights, scorers, tracker, predictor and the
//! stream aggregator. Callers share it behind an `Arc`.
//!
//! Flow: features → `score` → `record` → `classify` → (on demand) `predict`.
//! Feedback flows into the optimizer, which publishes a new weight version
//! for subsequent `score` calls.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::features::{FeatureProvider, FeatureSet};
use crate::history::{HistoryEntry, HistoryStats};
use crate::notify::{Notification, NotificationHub};
use crate::optimizer::{FeedbackQueue, FeedbackRecord, WeightOptimizer};
use crate::predictor::{ConvergencePredictor, PredictionReport};
use crate::scoring::{short_id, ConfidenceResult, ScoringEngine};
use crate::store::{DurableStore, JsonlStore};
use crate::stream::{StreamEvent, StreamWindowAggregator, WindowAggregate};
use crate::tracker::{ConvergenceState, ConvergenceTracker};
use crate::weights::{SharedWeights, VersionedWeights};

/// A closed window and the result it produced.
#[derive(Debug, Clone, Serialize)]
pub struct WindowResult {
    pub aggregate: WindowAggregate,
    pub sequence: u64,
    pub result: ConfidenceResult,
}

pub struct ConfidenceEngine {
    config: EngineConfig,
    scoring: ScoringEngine,
    weights: SharedWeights,
    optimizer: WeightOptimizer,
    feedback: FeedbackQueue,
    // serializes read-modify-publish of the weights; scoring never takes it
    update_lock: Mutex<()>,
    tracker: ConvergenceTracker,
    predictor: ConvergencePredictor,
    stream: StreamWindowAggregator,
    hub: NotificationHub,
    provider: Option<Arc<dyn FeatureProvider>>,
}

impl std::fmt::Debug for ConfidenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfidenceEngine")
            .field("strategy", self.scoring.strategy())
            .field("weights_version", &self.weights.snapshot().version)
            .field("tracker", &self.tracker)
            .field("stream", &self.stream)
            .finish()
    }
}

impl ConfidenceEngine {
    /// Build from config; `[store] path` selects the JSONL store.
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let store: Option<Arc<dyn DurableStore>> = match &config.store.path {
            Some(dir) => Some(Arc::new(JsonlStore::open(dir)?)),
            None => None,
        };
        Self::build(config, store)
    }

    pub fn with_store(config: EngineConfig, store: Arc<dyn DurableStore>) -> anyhow::Result<Self> {
        Self::build(config, Some(store))
    }

    fn build(config: EngineConfig, store: Option<Arc<dyn DurableStore>>) -> anyhow::Result<Self> {
        config.validate()?;
        let bounds = config.weights.bounds();
        let initial = config.weights.resolve_initial()?;

        let mut tracker = ConvergenceTracker::new(config.tracker);
        if let Some(store) = store {
            tracker = tracker.with_store(store);
        }

        info!(
            target: "engine",
            strategy = config.scoring.strategy.label(),
            history_cap = config.tracker.history_cap,
            target_threshold = config.tracker.target_threshold,
            "confidence engine ready"
        );
        Ok(Self {
            scoring: ScoringEngine::with_params(config.scoring.strategy.clone(), &config.scorers),
            weights: SharedWeights::new(initial, bounds),
            optimizer: WeightOptimizer::new(config.optimizer, bounds),
            feedback: FeedbackQueue::new(),
            update_lock: Mutex::new(()),
            tracker,
            predictor: ConvergencePredictor::new(config.predictor),
            stream: StreamWindowAggregator::new(config.stream),
            hub: NotificationHub::new(config.notify.channel_capacity),
            provider: None,
            config,
        })
    }

    pub fn with_provider(mut self, provider: Arc<dyn FeatureProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn weights(&self) -> Arc<VersionedWeights> {
        self.weights.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.hub.subscribe()
    }

    pub fn tracked_entities(&self) -> usize {
        self.tracker.tracked_entities()
    }

    pub fn stream(&self) -> &StreamWindowAggregator {
        &self.stream
    }

    /// Score without recording. Pure apart from the weights snapshot.
    pub fn score(&self, entity_id: &str, features: &FeatureSet) -> ConfidenceResult {
        let snap = self.weights.snapshot();
        let mut result = self.scoring.score(entity_id, features, &snap.weights);
        result.weights_version = snap.version;
        result
    }

    /// Ask the feature provider; any failure scores an empty feature set.
    pub async fn score_from_provider(&self, entity_id: &str) -> ConfidenceResult {
        let features = match &self.provider {
            Some(p) => match p.features_for(entity_id).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(
                        target: "scoring",
                        entity_id = %short_id(entity_id),
                        provider = p.name(),
                        error = %e,
                        "feature provider failed, scoring with missing features"
                    );
                    FeatureSet::empty(Utc::now())
                }
            },
            None => FeatureSet::empty(Utc::now()),
        };
        self.score(entity_id, &features)
    }

    pub fn record(&self, entity_id: &str, result: ConfidenceResult) -> EngineResult<HistoryEntry> {
        let entry = self.tracker.record(entity_id, result)?;
        self.publish_scored(entity_id, &entry);
        Ok(entry)
    }

    /// Record only if `expected_sequence` is next; retries of an applied call are rejected.
    pub fn record_at(&self, entity_id: &str, expected_sequence: u64, result: ConfidenceResult) -> EngineResult<HistoryEntry> {
        let entry = self.tracker.record_at(entity_id, expected_sequence, result)?;
        self.publish_scored(entity_id, &entry);
        Ok(entry)
    }

    fn publish_scored(&self, entity_id: &str, entry: &HistoryEntry) {
        self.hub.publish(Notification::Scored {
            entity_id: entity_id.to_string(),
            sequence: entry.sequence,
            result: entry.result.clone(),
        });
    }

    pub fn score_and_record(&self, entity_id: &str, features: &FeatureSet) -> EngineResult<HistoryEntry> {
        let result = self.score(entity_id, features);
        self.record(entity_id, result)
    }

    pub fn history(&self, entity_id: &str) -> Vec<HistoryEntry> {
        self.tracker.history(entity_id)
    }

    pub fn stats(&self, entity_id: &str) -> Option<HistoryStats> {
        self.tracker.stats(entity_id)
    }

    pub fn classify(&self, entity_id: &str) -> ConvergenceState {
        let c = self.tracker.classify(entity_id);
        if c.just_converged {
            metrics::counter!("convergence_events_total").increment(1);
            self.hub.publish(Notification::Converged {
                entity_id: entity_id.to_string(),
                state: c.state.clone(),
            });
        }
        c.state
    }

    /// Forecast iterations to `target` (tracker threshold when absent).
    pub fn predict(&self, entity_id: &str, target: Option<f64>) -> PredictionReport {
        let target = target
            .filter(|t| t.is_finite())
            .map(|t| t.clamp(0.0, 1.0))
            .unwrap_or(self.config.tracker.target_threshold);
        let state = self.classify(entity_id);
        let values = self.tracker.values(entity_id);
        self.predictor.predict(&values, &state, target)
    }

    /// Apply one feedback batch now and publish the resulting weights.
    pub fn submit_feedback(&self, batch: &[FeedbackRecord]) -> Arc<VersionedWeights> {
        let _guard = self.update_lock.lock();
        let current = self.weights.snapshot();
        if batch.is_empty() {
            return current;
        }
        let next = self.optimizer.optimize(&current.weights, batch);
        let published = self.weights.publish(next);

        metrics::counter!("weights_updates_total").increment(1);
        metrics::gauge!("weights_version").set(published.version as f64);
        info!(
            target: "optimizer",
            version = published.version,
            batch = batch.len(),
            weights = ?published.weights.as_map(),
            "weights updated"
        );
        self.hub.publish(Notification::WeightsUpdated {
            version: published.version,
            weights: published.weights.clone(),
        });
        published
    }

    /// Buffer one record; applies a batch once `batch_size` records are queued.
    pub fn queue_feedback(&self, record: FeedbackRecord) -> Option<Arc<VersionedWeights>> {
        let batch = self.feedback.push(record, self.config.optimizer.batch_size)?;
        Some(self.submit_feedback(&batch))
    }

    /// Apply whatever is queued. `None` when nothing was pending.
    pub fn flush_feedback(&self) -> Option<Arc<VersionedWeights>> {
        let batch = self.feedback.drain();
        if batch.is_empty() {
            None
        } else {
            Some(self.submit_feedback(&batch))
        }
    }

    pub fn pending_feedback(&self) -> usize {
        self.feedback.len()
    }

    pub fn ingest_event(&self, entity_id: &str, event: StreamEvent) -> EngineResult<()> {
        self.stream.ingest(entity_id, event)
    }

    pub async fn ingest_event_with_retry(&self, entity_id: &str, event: StreamEvent, max_attempts: u32) -> EngineResult<()> {
        self.stream.ingest_with_retry(entity_id, event, max_attempts).await
    }

    fn record_windows(&self, aggregates: Vec<WindowAggregate>) -> Vec<WindowResult> {
        let mut out = Vec::with_capacity(aggregates.len());
        for aggregate in aggregates {
            match self.score_and_record(&aggregate.entity_id, &aggregate.features) {
                Ok(entry) => out.push(WindowResult {
                    sequence: entry.sequence,
                    result: entry.result,
                    aggregate,
                }),
                Err(e) => warn!(
                    target: "stream",
                    entity_id = %short_id(&aggregate.entity_id),
                    error = %e,
                    "window result not recorded"
                ),
            }
        }
        out
    }

    /// Close every buffered window of one entity now.
    pub fn flush_window(&self, entity_id: &str) -> Vec<WindowResult> {
        let aggregates = self.stream.flush(entity_id, Utc::now());
        self.record_windows(aggregates)
    }

    /// Close due windows for all entities, then collect stale buffers.
    pub fn tick_windows(&self, now: DateTime<Utc>) -> usize {
        let closed = self.record_windows(self.stream.close_due(now)).len();
        self.stream.gc(now);
        closed
    }

    pub fn reset(&self, entity_id: &str) -> EngineResult<()> {
        self.tracker.reset(entity_id)?;
        info!(target: "tracker", entity_id = %short_id(entity_id), "convergence reset");
        Ok(())
    }

    /// Stop windowing and drop the entity's history. False if nothing was tracked.
    pub fn stop_tracking(&self, entity_id: &str) -> EngineResult<bool> {
        let had_windows = self.stream.release(entity_id);
        let had_history = self.tracker.release(entity_id)?;
        Ok(had_windows || had_history)
    }
}
