//! # Scoring Engine
//! Combines dimension scores into one overall confidence value.
//!
//! Every strategy is a pure function of `(FeatureSet, weights, strategy
//! parameters)`: randomness is seeded from the strategy seed and the
//! dimension scores, never from wall-clock entropy.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::ScorerParams;
use crate::dimensions::{
    CategoricalScorer, Dimension, DimensionScorer, SemanticScorer, StructuralScorer,
    TemporalScorer, NEUTRAL_SCORE,
};
use crate::error::EngineError;
use crate::features::FeatureSet;
use crate::weights::WeightVector;

/// Selectable combination strategy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoringStrategy {
    /// `Σ(score·weight) / Σ(weight)`.
    #[default]
    WeightedAverage,
    /// Bootstrap aggregation: perturb dimension scores with bounded noise over
    /// `samples` synthetic draws, average, and penalize the spread.
    Bagging {
        samples: usize,
        noise: f64,
        seed: u64,
        variance_penalty: f64,
    },
    /// Sequential residual correction with tanh-saturated steps.
    Boosting { rounds: usize, learning_rate: f64 },
    /// Fixed pseudo-random hidden layer (tanh) with sigmoid output, blended
    /// with the weighted average. Nothing is trained.
    Perceptron { hidden: usize, seed: u64, blend: f64 },
}

impl ScoringStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            ScoringStrategy::WeightedAverage => "weighted_average",
            ScoringStrategy::Bagging { .. } => "bagging",
            ScoringStrategy::Boosting { .. } => "boosting",
            ScoringStrategy::Perceptron { .. } => "perceptron",
        }
    }

    /// Strategy with its default parameters, by label.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "weighted_average" | "weighted" => Some(ScoringStrategy::WeightedAverage),
            "bagging" => Some(ScoringStrategy::Bagging {
                samples: 16,
                noise: 0.05,
                seed: 42,
                variance_penalty: 0.5,
            }),
            "boosting" => Some(ScoringStrategy::Boosting {
                rounds: 5,
                learning_rate: 0.1,
            }),
            "perceptron" => Some(ScoringStrategy::Perceptron {
                hidden: 8,
                seed: 7,
                blend: 0.5,
            }),
            _ => None,
        }
    }
}

/// Output of one `score()` call. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceResult {
    pub entity_id: String,
    pub overall: f64,
    pub dimensions: BTreeMap<Dimension, f64>,
    pub strategy: String,
    /// Set when the overall value could not be computed normally (zero total weight).
    #[serde(default)]
    pub degraded: bool,
    /// Dimensions that fell back to the neutral score.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<Dimension>,
    #[serde(default)]
    pub weights_version: u64,
    pub timestamp: DateTime<Utc>,
}

/// Holds the four scorers and the configured strategy. Stateless between calls.
pub struct ScoringEngine {
    scorers: Vec<Box<dyn DimensionScorer>>,
    strategy: ScoringStrategy,
}

impl std::fmt::Debug for ScoringEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoringEngine")
            .field("strategy", &self.strategy)
            .field("scorers", &self.scorers.len())
            .finish()
    }
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new(ScoringStrategy::default())
    }
}

impl ScoringEngine {
    /// Engine with default-parameter scorers.
    pub fn new(strategy: ScoringStrategy) -> Self {
        Self::with_params(strategy, &ScorerParams::default())
    }

    /// Engine with configured scorer parameters.
    pub fn with_params(strategy: ScoringStrategy, params: &ScorerParams) -> Self {
        Self::with_scorers(
            strategy,
            vec![
                Box::new(SemanticScorer { params: params.semantic }),
                Box::new(CategoricalScorer { params: params.categorical }),
                Box::new(StructuralScorer { params: params.structural }),
                Box::new(TemporalScorer { params: params.temporal }),
            ],
        )
    }

    pub fn with_scorers(strategy: ScoringStrategy, scorers: Vec<Box<dyn DimensionScorer>>) -> Self {
        Self { scorers, strategy }
    }

    pub fn strategy(&self) -> &ScoringStrategy {
        &self.strategy
    }

    /// Per-dimension scores plus the dimensions that fell back to neutral.
    pub fn dimension_scores(&self, features: &FeatureSet) -> (BTreeMap<Dimension, f64>, Vec<Dimension>) {
        let mut scores = BTreeMap::new();
        let mut missing = Vec::new();
        for s in &self.scorers {
            let value = match s.try_score(features) {
                Ok(v) if v.is_finite() => v.clamp(0.0, 1.0),
                Ok(_) | Err(_) => {
                    metrics::counter!("confidence_missing_feature_total", "dimension" => s.dimension().as_str())
                        .increment(1);
                    missing.push(s.dimension());
                    s.score(features)
                }
            };
            scores.insert(s.dimension(), value);
        }
        (scores, missing)
    }

    /// Score one artifact.
    pub fn score(&self, entity_id: &str, features: &FeatureSet, weights: &WeightVector) -> ConfidenceResult {
        let (dimensions, missing) = self.dimension_scores(features);
        let (overall, degraded) = match combine(&self.strategy, &dimensions, weights) {
            Ok(v) => (v, false),
            Err(e) => {
                warn!(target: "scoring", entity_id = %short_id(entity_id), error = %e, "degraded result");
                metrics::counter!("confidence_degraded_total").increment(1);
                (0.0, true)
            }
        };
        metrics::counter!("confidence_scores_total", "strategy" => self.strategy.label()).increment(1);

        ConfidenceResult {
            entity_id: entity_id.to_string(),
            overall,
            dimensions,
            strategy: self.strategy.label().to_string(),
            degraded,
            missing,
            weights_version: 0,
            timestamp: features.observed_at,
        }
    }
}

/// Compute the overall value for already-scored dimensions.
///
/// Errors only with `DegenerateWeights`; callers map it to `overall = 0`.
pub fn combine(
    strategy: &ScoringStrategy,
    dims: &BTreeMap<Dimension, f64>,
    weights: &WeightVector,
) -> Result<f64, EngineError> {
    let base = weighted_average(dims, weights)?;
    let overall = match strategy {
        ScoringStrategy::WeightedAverage => base,
        ScoringStrategy::Bagging {
            samples,
            noise,
            seed,
            variance_penalty,
        } => bagging(dims, weights, *samples, *noise, *seed, *variance_penalty)?,
        ScoringStrategy::Boosting { rounds, learning_rate } => {
            boosting(base, dims, weights, *rounds, *learning_rate)
        }
        ScoringStrategy::Perceptron { hidden, seed, blend } => {
            let b = blend.clamp(0.0, 1.0);
            b * perceptron(dims, weights, *hidden, *seed) + (1.0 - b) * base
        }
    };
    Ok(if overall.is_finite() { overall.clamp(0.0, 1.0) } else { 0.0 })
}

pub fn weighted_average(dims: &BTreeMap<Dimension, f64>, weights: &WeightVector) -> Result<f64, EngineError> {
    let mut num = 0.0;
    let mut denom = 0.0;
    for (d, s) in dims {
        let w = weights.get(*d).max(0.0);
        num += s * w;
        denom += w;
    }
    if denom <= 0.0 {
        return Err(EngineError::DegenerateWeights);
    }
    Ok((num / denom).clamp(0.0, 1.0))
}

/// Per-call RNG seed: strategy seed mixed with the exact score bits.
fn call_seed(seed: u64, dims: &BTreeMap<Dimension, f64>) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    for (d, s) in dims {
        hasher.update(d.as_str().as_bytes());
        hasher.update(s.to_bits().to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn bagging(
    dims: &BTreeMap<Dimension, f64>,
    weights: &WeightVector,
    samples: usize,
    noise: f64,
    seed: u64,
    variance_penalty: f64,
) -> Result<f64, EngineError> {
    let k = samples.max(1);
    let amp = noise.abs().min(0.5);
    let mut rng = StdRng::seed_from_u64(call_seed(seed, dims));

    let mut draws = Vec::with_capacity(k);
    for _ in 0..k {
        let perturbed: BTreeMap<Dimension, f64> = dims
            .iter()
            .map(|(d, s)| {
                let jitter = if amp > 0.0 { rng.random_range(-amp..=amp) } else { 0.0 };
                (*d, (s + jitter).clamp(0.0, 1.0))
            })
            .collect();
        draws.push(weighted_average(&perturbed, weights)?);
    }

    let n = draws.len() as f64;
    let mean = draws.iter().sum::<f64>() / n;
    let var = draws.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    Ok(mean - variance_penalty.max(0.0) * var.sqrt())
}

fn boosting(
    base: f64,
    dims: &BTreeMap<Dimension, f64>,
    weights: &WeightVector,
    rounds: usize,
    learning_rate: f64,
) -> f64 {
    let total = weights.total();
    let mut p = base;
    // a handful of rounds is enough; more only adds rounding noise
    for _ in 0..rounds.min(32) {
        let mut step = 0.0;
        for (d, s) in dims {
            let share = if total > 0.0 { weights.get(*d) / total } else { 0.0 };
            step += share * (s - p).tanh();
        }
        p = (p + learning_rate * step).clamp(0.0, 1.0);
    }
    p
}

fn perceptron(dims: &BTreeMap<Dimension, f64>, weights: &WeightVector, hidden: usize, seed: u64) -> f64 {
    let h = hidden.clamp(1, 64);
    // weights of the fake network depend only on the seed
    let mut rng = StdRng::seed_from_u64(seed);
    let inputs: Vec<f64> = dims
        .iter()
        .map(|(d, s)| (s - NEUTRAL_SCORE) * 2.0 * weights.get(*d))
        .collect();

    let mut out = 0.0;
    for _ in 0..h {
        let mut z = rng.random_range(-0.1..=0.1);
        for x in &inputs {
            z += rng.random_range(0.5..=1.5) * x;
        }
        out += z.tanh() * rng.random_range(0.5..=1.5);
    }
    let avg = out / h as f64;
    1.0 / (1.0 + (-4.0 * avg).exp())
}

/// Entity ids can be long paths; log a short digest instead.
pub(crate) fn short_id(entity_id: &str) -> String {
    if entity_id.len() <= 64 {
        return entity_id.to_string();
    }
    let digest = Sha256::digest(entity_id.as_bytes());
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(s: f64, c: f64, st: f64, t: f64) -> BTreeMap<Dimension, f64> {
        BTreeMap::from([
            (Dimension::Semantic, s),
            (Dimension::Categorical, c),
            (Dimension::Structural, st),
            (Dimension::Temporal, t),
        ])
    }

    #[test]
    fn weighted_average_matches_hand_computation() {
        let v = weighted_average(&dims(0.8, 0.6, 0.7, 0.5), &WeightVector::default()).unwrap();
        assert!((v - 0.66).abs() < 1e-12, "got {v}");
    }

    #[test]
    fn zero_weights_are_degenerate() {
        let zero = WeightVector::from_pairs(Vec::<(Dimension, f64)>::new());
        assert_eq!(
            combine(&ScoringStrategy::WeightedAverage, &dims(0.8, 0.6, 0.7, 0.5), &zero),
            Err(EngineError::DegenerateWeights)
        );
    }

    #[test]
    fn every_strategy_stays_in_unit_interval_and_is_reproducible() {
        let w = WeightVector::default();
        for label in ["weighted_average", "bagging", "boosting", "perceptron"] {
            let s = ScoringStrategy::from_label(label).unwrap();
            for d in [dims(0.0, 0.0, 0.0, 0.0), dims(1.0, 1.0, 1.0, 1.0), dims(0.9, 0.1, 0.5, 0.3)] {
                let a = combine(&s, &d, &w).unwrap();
                let b = combine(&s, &d, &w).unwrap();
                assert!((0.0..=1.0).contains(&a), "{label}: {a}");
                assert_eq!(a.to_bits(), b.to_bits(), "{label} not reproducible");
            }
        }
    }

    #[test]
    fn bagging_penalizes_noise() {
        let w = WeightVector::default();
        let d = dims(0.8, 0.6, 0.7, 0.5);
        let noisy = ScoringStrategy::Bagging {
            samples: 32,
            noise: 0.2,
            seed: 1,
            variance_penalty: 1.0,
        };
        let v = combine(&noisy, &d, &w).unwrap();
        assert!(v < 0.66 + 0.05);
        assert!(v > 0.4);
    }

    #[test]
    fn boosting_moves_toward_dimension_scores() {
        let w = WeightVector::default();
        let d = dims(0.9, 0.9, 0.9, 0.9);
        // base already equals every score: corrections are zero
        let s = ScoringStrategy::Boosting { rounds: 5, learning_rate: 0.1 };
        assert!((combine(&s, &d, &w).unwrap() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn long_ids_are_hashed_for_logs() {
        assert_eq!(short_id("doc-1"), "doc-1");
        assert_eq!(short_id(&"x".repeat(100)).len(), 12);
    }
}
