//! Error taxonomy for the confidence engine.
//!
//! Only `InvalidEntityState`, `CapacityExceeded`, `UnknownEntity`, `Config` and `Store`
//! ever leave the public API. The other variants are produced internally and folded into
//! neutral scores, `degraded` flags or prediction reasons before a caller sees anything.

use std::time::Duration;

use crate::dimensions::Dimension;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// A dimension scorer could not compute from the available features.
    #[error("missing feature for {dimension}: {detail}")]
    MissingFeature { dimension: Dimension, detail: String },

    /// Total weight was zero; the result is flagged as degraded.
    #[error("degenerate weights: total weight is zero")]
    DegenerateWeights,

    /// The predictor cannot compute iterations (flat or negative trend).
    #[error("non-convergent trend: {reason}")]
    NonConvergentTrend { reason: String },

    /// Streaming ingestion is over its backpressure threshold.
    #[error("capacity exceeded ({reason}); retry after {}ms (attempt {attempt})", retry_after.as_millis())]
    CapacityExceeded {
        retry_after: Duration,
        attempt: u32,
        reason: String,
    },

    /// A per-entity call violated the entity's ordering/consistency rules.
    #[error("invalid state for entity `{entity_id}`: {detail}")]
    InvalidEntityState { entity_id: String, detail: String },

    #[error("unknown entity `{entity_id}`")]
    UnknownEntity { entity_id: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn invalid_state(entity_id: &str, detail: impl Into<String>) -> Self {
        Self::InvalidEntityState {
            entity_id: entity_id.to_string(),
            detail: detail.into(),
        }
    }

    pub fn missing(dimension: Dimension, detail: impl Into<String>) -> Self {
        Self::MissingFeature {
            dimension,
            detail: detail.into(),
        }
    }

    /// Recoverable errors are handled inside the engine and never fail a call.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MissingFeature { .. }
                | Self::DegenerateWeights
                | Self::NonConvergentTrend { .. }
                | Self::CapacityExceeded { .. }
        )
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(format!("{e:#}"))
    }
}
