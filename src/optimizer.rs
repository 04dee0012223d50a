//! Online weight optimization from batched feedback.
//!
//! For each feedback record `error = actual − predicted`; the gradient for a
//! dimension is the batch mean of `error · dimensionScore`. The step is either
//! the raw gradient or a momentum average of it, scaled by the learning rate.
//! The result is clamped into the weight bounds and renormalized to sum 1.0.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dimensions::Dimension;
use crate::weights::{WeightBounds, WeightVector};

/// Predicted vs. actual outcome for one scored entity. Consumed by one update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub entity_id: String,
    pub predicted_confidence: f64,
    pub actual_confidence: f64,
    pub dimensions: BTreeMap<Dimension, f64>,
}

impl FeedbackRecord {
    pub fn error(&self) -> f64 {
        self.actual_confidence - self.predicted_confidence
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerParams {
    pub learning_rate: f64,
    /// Momentum decay; `0` steps by the raw gradient.
    pub momentum: f64,
    /// Records buffered before a queued batch is applied.
    pub batch_size: usize,
    /// Period of the background flush of partially filled batches.
    pub flush_interval_secs: u64,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum: 0.9,
            batch_size: 32,
            flush_interval_secs: 60,
        }
    }
}

/// Averaged gradient of a batch. Records with non-finite values are skipped.
pub fn batch_gradient(batch: &[FeedbackRecord]) -> BTreeMap<Dimension, f64> {
    let mut grad: BTreeMap<Dimension, f64> = Dimension::ALL.iter().map(|d| (*d, 0.0)).collect();
    let mut n = 0usize;
    for rec in batch {
        let err = rec.error();
        if !err.is_finite() {
            continue;
        }
        n += 1;
        for (d, s) in &rec.dimensions {
            if s.is_finite() {
                *grad.entry(*d).or_insert(0.0) += err * s;
            }
        }
    }
    if n > 0 {
        for g in grad.values_mut() {
            *g /= n as f64;
        }
    }
    grad
}

/// Gradient-descent optimizer. Momentum state persists across batches.
#[derive(Debug)]
pub struct WeightOptimizer {
    params: OptimizerParams,
    bounds: WeightBounds,
    momentum: Mutex<BTreeMap<Dimension, f64>>,
}

impl WeightOptimizer {
    pub fn new(params: OptimizerParams, bounds: WeightBounds) -> Self {
        Self {
            params,
            bounds,
            momentum: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn params(&self) -> OptimizerParams {
        self.params
    }

    /// Propose the next weight vector. Never mutates `weights`.
    pub fn optimize(&self, weights: &WeightVector, batch: &[FeedbackRecord]) -> WeightVector {
        if batch.is_empty() {
            return weights.normalized_within(self.bounds);
        }

        let grad = batch_gradient(batch);
        let step: BTreeMap<Dimension, f64> = if self.params.momentum > 0.0 {
            let beta = self.params.momentum.min(0.999);
            let mut m = self.momentum.lock();
            for (d, g) in &grad {
                let prev = m.get(d).copied().unwrap_or(0.0);
                m.insert(*d, beta * prev + (1.0 - beta) * g);
            }
            m.clone()
        } else {
            grad
        };

        let mut next = weights.clone();
        for (d, s) in &step {
            next.set(*d, weights.get(*d) + self.params.learning_rate * s);
        }
        debug!(target: "optimizer", batch = batch.len(), ?step, "weights stepped");
        next.normalized_within(self.bounds)
    }

    pub fn reset_momentum(&self) {
        self.momentum.lock().clear();
    }
}

/// Buffers feedback until a full batch is available.
#[derive(Debug, Default)]
pub struct FeedbackQueue {
    pending: Mutex<Vec<FeedbackRecord>>,
}

impl FeedbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one record; returns the drained batch once `batch_size` is reached.
    pub fn push(&self, record: FeedbackRecord, batch_size: usize) -> Option<Vec<FeedbackRecord>> {
        let mut pending = self.pending.lock();
        pending.push(record);
        if pending.len() >= batch_size.max(1) {
            Some(std::mem::take(&mut *pending))
        } else {
            None
        }
    }

    /// Take whatever is pending (periodic flush).
    pub fn drain(&self) -> Vec<FeedbackRecord> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
