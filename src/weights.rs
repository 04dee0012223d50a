//! Per-dimension weights with bounded renormalization and a versioned,
//! atomically swapped shared handle.
//!
//! JSON shape (weights file and API):
//! {
//!   "semantic": 0.4,
//!   "categorical": 0.2,
//!   "structural": 0.2,
//!   "temporal": 0.2
//! }

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::dimensions::Dimension;
use crate::error::{EngineError, EngineResult};

/// Clamp range applied to every weight after an update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for WeightBounds {
    fn default() -> Self {
        Self { min: 0.05, max: 0.8 }
    }
}

impl WeightBounds {
    /// Bounds must leave room for a vector of `dims` weights summing to 1.
    pub fn validate(&self, dims: usize) -> EngineResult<()> {
        let ok = self.min.is_finite()
            && self.max.is_finite()
            && self.min > 0.0
            && self.min < self.max
            && self.max <= 1.0
            && self.min * dims as f64 <= 1.0 + 1e-12
            && self.max * dims as f64 >= 1.0 - 1e-12;
        if ok {
            Ok(())
        } else {
            Err(EngineError::Config(format!(
                "weight bounds [{}, {}] cannot hold {} weights summing to 1.0",
                self.min, self.max, dims
            )))
        }
    }
}

/// Mapping dimension → weight. Not normalized by construction; the engine's
/// shared copy is always bounded and sums to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightVector {
    weights: BTreeMap<Dimension, f64>,
}

impl Default for WeightVector {
    fn default() -> Self {
        Self::from_pairs([
            (Dimension::Semantic, 0.4),
            (Dimension::Categorical, 0.2),
            (Dimension::Structural, 0.2),
            (Dimension::Temporal, 0.2),
        ])
    }
}

impl WeightVector {
    /// Build from pairs; dimensions not listed get weight 0.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Dimension, f64)>) -> Self {
        let mut weights: BTreeMap<Dimension, f64> = Dimension::ALL.iter().map(|d| (*d, 0.0)).collect();
        for (d, w) in pairs {
            weights.insert(d, w);
        }
        Self { weights }
    }

    /// Build and reject negative or non-finite entries.
    pub fn try_from_pairs(pairs: impl IntoIterator<Item = (Dimension, f64)>) -> EngineResult<Self> {
        let v = Self::from_pairs(pairs);
        if let Some((d, w)) = v.weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(EngineError::Config(format!("invalid weight {w} for {d}")));
        }
        Ok(v)
    }

    pub fn get(&self, dim: Dimension) -> f64 {
        self.weights.get(&dim).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, dim: Dimension, w: f64) {
        self.weights.insert(dim, w);
    }

    pub fn total(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Dimension, f64)> + '_ {
        self.weights.iter().map(|(d, w)| (*d, *w))
    }

    pub fn as_map(&self) -> &BTreeMap<Dimension, f64> {
        &self.weights
    }

    /// Clamp each weight into `bounds`, then renormalize to sum 1.0.
    ///
    /// Renormalizing can push a weight back out of bounds, so the residual is
    /// redistributed over the weights that still have room until both
    /// constraints hold.
    pub fn normalized_within(&self, bounds: WeightBounds) -> Self {
        let mut w: Vec<(Dimension, f64)> = self
            .weights
            .iter()
            .map(|(d, v)| (*d, if v.is_finite() { *v } else { 0.0 }))
            .collect();

        for _ in 0..32 {
            for (_, v) in w.iter_mut() {
                *v = v.clamp(bounds.min, bounds.max);
            }
            let sum: f64 = w.iter().map(|(_, v)| v).sum();
            let residual = 1.0 - sum;
            if residual.abs() < 1e-12 {
                break;
            }
            let room = |v: f64| {
                if residual > 0.0 {
                    v < bounds.max
                } else {
                    v > bounds.min
                }
            };
            let free_sum: f64 = w.iter().filter(|(_, v)| room(*v)).map(|(_, v)| v).sum();
            if free_sum <= 0.0 {
                break;
            }
            for (_, v) in w.iter_mut() {
                if room(*v) {
                    *v += residual * (*v / free_sum);
                }
            }
        }

        Self {
            weights: w.into_iter().collect(),
        }
    }

    /// True when the vector satisfies the bounded-simplex invariant.
    pub fn is_normalized_within(&self, bounds: WeightBounds, tol: f64) -> bool {
        (self.total() - 1.0).abs() <= tol
            && self
                .weights
                .values()
                .all(|w| *w >= bounds.min - tol && *w <= bounds.max + tol)
    }

    /// Load a weights file (no caching).
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("reading weights from {}", path.display()))?;
        let raw: BTreeMap<String, f64> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing weights JSON at {}", path.display()))?;
        let mut pairs = Vec::with_capacity(raw.len());
        for (k, v) in raw {
            let d = Dimension::parse(&k).ok_or_else(|| anyhow::anyhow!("unknown dimension `{k}`"))?;
            pairs.push((d, v));
        }
        Ok(Self::try_from_pairs(pairs)?)
    }
}

/// A weight vector tagged with the version it was published under.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionedWeights {
    pub version: u64,
    pub weights: WeightVector,
}

/// Shared handle to the engine's current weights.
///
/// Readers take an `Arc` snapshot and never observe a half-applied update;
/// writers build a complete new vector and swap the pointer.
#[derive(Debug, Clone)]
pub struct SharedWeights {
    inner: Arc<RwLock<Arc<VersionedWeights>>>,
    bounds: WeightBounds,
}

impl SharedWeights {
    pub fn new(initial: WeightVector, bounds: WeightBounds) -> Self {
        let weights = initial.normalized_within(bounds);
        Self {
            inner: Arc::new(RwLock::new(Arc::new(VersionedWeights { version: 0, weights }))),
            bounds,
        }
    }

    pub fn bounds(&self) -> WeightBounds {
        self.bounds
    }

    pub fn snapshot(&self) -> Arc<VersionedWeights> {
        self.inner.read().clone()
    }

    /// Publish a new vector (bounded + renormalized); returns the new version.
    pub fn publish(&self, next: WeightVector) -> Arc<VersionedWeights> {
        let weights = next.normalized_within(self.bounds);
        let mut guard = self.inner.write();
        let fresh = Arc::new(VersionedWeights {
            version: guard.version + 1,
            weights,
        });
        *guard = fresh.clone();
        fresh
    }
}
