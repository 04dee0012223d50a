//! # Dimension Scorers
//! Pure functions turning raw artifact features into a `[0,1]` score per
//! confidence dimension (semantic, categorical, structural, temporal).
//!
//! A scorer that cannot compute from the available data reports a
//! `MissingFeature` error through `try_score`; `score` folds that into the
//! neutral 0.5 so a missing signal reads as "unknown", never as zero.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::features::FeatureSet;

/// Score reported when a dimension has no usable signal.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// One axis of confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Semantic,
    Categorical,
    Structural,
    Temporal,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::Semantic,
        Dimension::Categorical,
        Dimension::Structural,
        Dimension::Temporal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Semantic => "semantic",
            Dimension::Categorical => "categorical",
            Dimension::Structural => "structural",
            Dimension::Temporal => "temporal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "semantic" => Some(Dimension::Semantic),
            "categorical" => Some(Dimension::Categorical),
            "structural" => Some(Dimension::Structural),
            "temporal" => Some(Dimension::Temporal),
            _ => None,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract shared by all four scorers. Implementations hold only immutable
/// parameters, so they are safe to call concurrently.
pub trait DimensionScorer: Send + Sync {
    fn dimension(&self) -> Dimension;

    /// Compute the score or report which feature is missing.
    fn try_score(&self, features: &FeatureSet) -> EngineResult<f64>;

    /// Score with the neutral fallback applied.
    fn score(&self, features: &FeatureSet) -> f64 {
        match self.try_score(features) {
            Ok(s) if s.is_finite() => s.clamp(0.0, 1.0),
            Ok(_) => {
                debug!(target: "scoring", dimension = %self.dimension(), "non-finite score, using neutral");
                NEUTRAL_SCORE
            }
            Err(e) => {
                debug!(target: "scoring", dimension = %self.dimension(), error = %e, "missing feature, using neutral");
                NEUTRAL_SCORE
            }
        }
    }
}

/* ----------------------------
Semantic
---------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticParams {
    /// Embedding norm considered fully plausible.
    pub reference_norm: f64,
    /// Component variance at which the bell term peaks.
    pub optimal_variance: f64,
}

impl Default for SemanticParams {
    fn default() -> Self {
        Self {
            reference_norm: 1.0,
            // roughly 1/384, the component variance of a unit 384-d embedding
            optimal_variance: 0.0026,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SemanticScorer {
    pub params: SemanticParams,
}

impl DimensionScorer for SemanticScorer {
    fn dimension(&self) -> Dimension {
        Dimension::Semantic
    }

    fn try_score(&self, features: &FeatureSet) -> EngineResult<f64> {
        let emb = match features.embedding.as_deref() {
            Some(e) if !e.is_empty() => e,
            _ => return Err(EngineError::missing(Dimension::Semantic, "no embedding")),
        };
        if emb.iter().any(|x| !x.is_finite()) {
            return Err(EngineError::missing(
                Dimension::Semantic,
                "embedding has non-finite components",
            ));
        }

        let norm = emb.iter().map(|x| x * x).sum::<f64>().sqrt();
        let norm_term = if self.params.reference_norm > 0.0 {
            (norm / self.params.reference_norm).min(1.0)
        } else {
            0.0
        };

        let variance = population_variance(emb);
        let bell = if variance > 0.0 && self.params.optimal_variance > 0.0 {
            let l = (variance / self.params.optimal_variance).ln();
            (-(l * l) / 2.0).exp()
        } else {
            0.0
        };

        Ok(0.6 * norm_term + 0.4 * bell)
    }
}

/* ----------------------------
Categorical
---------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoricalParams {
    pub optimal_count: f64,
    pub sigma: f64,
}

impl Default for CategoricalParams {
    fn default() -> Self {
        Self {
            optimal_count: 3.0,
            sigma: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CategoricalScorer {
    pub params: CategoricalParams,
}

impl CategoricalScorer {
    /// Regularity of the category set: duplicates and widely spread
    /// per-category confidences both lower it.
    fn coherence(&self, features: &FeatureSet) -> f64 {
        let cats = &features.categories;
        let mut names: Vec<String> = cats.iter().map(|c| c.name.trim().to_lowercase()).collect();
        names.sort();
        names.dedup();
        let distinct_ratio = names.len() as f64 / cats.len() as f64;

        let confs: Vec<f64> = cats.iter().map(|c| c.confidence.clamp(0.0, 1.0)).collect();
        let spread = population_variance(&confs).sqrt();
        distinct_ratio * (1.0 - (2.0 * spread).min(1.0))
    }
}

impl DimensionScorer for CategoricalScorer {
    fn dimension(&self) -> Dimension {
        Dimension::Categorical
    }

    fn try_score(&self, features: &FeatureSet) -> EngineResult<f64> {
        let cats = &features.categories;
        if cats.is_empty() {
            return Err(EngineError::missing(Dimension::Categorical, "no categories"));
        }

        let n = cats.len() as f64;
        let sigma = if self.params.sigma > 0.0 { self.params.sigma } else { 1.0 };
        let diff = n - self.params.optimal_count;
        let count_term = (-(diff * diff) / (2.0 * sigma * sigma)).exp();

        let mean_conf = cats
            .iter()
            .map(|c| c.confidence.clamp(0.0, 1.0))
            .sum::<f64>()
            / n;

        Ok(0.4 * count_term + 0.4 * mean_conf + 0.2 * self.coherence(features))
    }
}

/* ----------------------------
Structural
---------------------------- */

/// Counts at which each structural signal saturates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuralParams {
    pub sections: f64,
    pub lists: f64,
    pub code_blocks: f64,
    pub formatting: f64,
}

impl Default for StructuralParams {
    fn default() -> Self {
        Self {
            sections: 5.0,
            lists: 3.0,
            code_blocks: 2.0,
            formatting: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StructuralScorer {
    pub params: StructuralParams,
}

fn saturate(count: u32, at: f64) -> f64 {
    if at <= 0.0 {
        return if count > 0 { 1.0 } else { 0.0 };
    }
    (count as f64 / at).min(1.0)
}

impl DimensionScorer for StructuralScorer {
    fn dimension(&self) -> Dimension {
        Dimension::Structural
    }

    fn try_score(&self, features: &FeatureSet) -> EngineResult<f64> {
        let s = features
            .structure
            .as_ref()
            .ok_or_else(|| EngineError::missing(Dimension::Structural, "no structural descriptors"))?;
        let p = &self.params;

        let raw = 0.30 * saturate(s.sections, p.sections)
            + 0.20 * saturate(s.lists, p.lists)
            + 0.20 * saturate(s.code_blocks, p.code_blocks)
            + 0.15 * if s.has_title { 1.0 } else { 0.0 }
            + 0.15 * saturate(s.formatting, p.formatting);

        Ok((raw * s.file_kind.modifier()).clamp(0.0, 1.0))
    }
}

/* ----------------------------
Temporal
---------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalParams {
    pub decay_per_day: f64,
    /// Share of the recency term; the rest goes to the activity ratio.
    pub recency_share: f64,
}

impl Default for TemporalParams {
    fn default() -> Self {
        Self {
            decay_per_day: 0.002,
            recency_share: 0.6,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TemporalScorer {
    pub params: TemporalParams,
}

impl DimensionScorer for TemporalScorer {
    fn dimension(&self) -> Dimension {
        Dimension::Temporal
    }

    fn try_score(&self, features: &FeatureSet) -> EngineResult<f64> {
        let created = features
            .created_at
            .ok_or_else(|| EngineError::missing(Dimension::Temporal, "no creation timestamp"))?;
        let modified = features.modified_at.unwrap_or(created);
        let now = features.observed_at;

        let total_age = (now - created).num_milliseconds().max(0) as f64 / 1000.0;
        let since_update = (now - modified).num_milliseconds().max(0) as f64 / 1000.0;

        let age_days = total_age / 86_400.0;
        let recency = (-age_days * self.params.decay_per_day).exp();
        let activity = if total_age > 0.0 {
            (1.0 - since_update / total_age).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let share = self.params.recency_share.clamp(0.0, 1.0);
        Ok(share * recency + (1.0 - share) * activity)
    }
}

/// Population variance; 0 for fewer than two values.
pub(crate) fn population_variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n
}
