// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod dimensions;
pub mod engine;
pub mod error;
pub mod features;
pub mod history;
pub mod metrics;
pub mod notify;
pub mod optimizer;
pub mod predictor;
pub mod scheduler;
pub mod scoring;
pub mod store;
pub mod stream;
pub mod tracker;
pub mod weights;

use std::sync::Arc;

use axum::Router;

// ---- Re-exports for stable public API ----
pub use crate::config::EngineConfig;
pub use crate::dimensions::Dimension;
pub use crate::engine::{ConfidenceEngine, WindowResult};
pub use crate::error::{EngineError, EngineResult};
pub use crate::features::{FeatureProvider, FeatureSet};
pub use crate::notify::Notification;
pub use crate::optimizer::FeedbackRecord;
pub use crate::predictor::{PredictionReport, PredictionResult, PredictionStrategy};
pub use crate::scoring::{ConfidenceResult, ScoringStrategy};
pub use crate::stream::{StreamEvent, WindowSpec};
pub use crate::tracker::{ConvergenceState, Phase};
pub use crate::weights::WeightVector;

/// API routes plus `/metrics`.
pub fn router(engine: Arc<ConfidenceEngine>) -> anyhow::Result<Router> {
    let metrics = crate::metrics::Metrics::init()?;
    Ok(api::create_router(engine).merge(metrics.router()))
}

/// Engine from `EngineConfig::load()` and its router.
pub fn app() -> anyhow::Result<(Arc<ConfidenceEngine>, Router)> {
    let cfg = EngineConfig::load()?;
    let engine = Arc::new(ConfidenceEngine::new(cfg)?);
    let router = router(engine.clone())?;
    Ok((engine, router))
}
