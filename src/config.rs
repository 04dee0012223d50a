// src/config.rs
//! Engine configuration: TOML file, then env overrides, then validation.
//!
//! A missing file means defaults; a malformed file or invalid bounds are
//! startup errors. Env overrides are parsed, clamped, and ignored when they
//! don't parse.

use std::path::{Path, PathBuf};
use std::{env, fs};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::dimensions::{CategoricalParams, Dimension, SemanticParams, StructuralParams, TemporalParams};
use crate::error::{EngineError, EngineResult};
use crate::optimizer::OptimizerParams;
use crate::predictor::PredictorParams;
use crate::scoring::ScoringStrategy;
use crate::stream::StreamParams;
use crate::tracker::TrackerParams;
use crate::weights::{WeightBounds, WeightVector};

pub const ENV_CONFIG_PATH: &str = "CONFIDENCE_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/engine.toml";
pub const ENV_TARGET_THRESHOLD: &str = "CONFIDENCE_TARGET_THRESHOLD";
pub const ENV_HISTORY_CAP: &str = "CONFIDENCE_HISTORY_CAP";
pub const ENV_STRATEGY: &str = "CONFIDENCE_STRATEGY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    pub initial: WeightVector,
    pub min: f64,
    pub max: f64,
    /// Optional JSON file overriding `initial`.
    pub path: Option<PathBuf>,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        let b = WeightBounds::default();
        Self {
            initial: WeightVector::default(),
            min: b.min,
            max: b.max,
            path: None,
        }
    }
}

impl WeightsConfig {
    pub fn bounds(&self) -> WeightBounds {
        WeightBounds {
            min: self.min,
            max: self.max,
        }
    }

    /// Initial vector (file wins over inline), fitted into the bounds.
    pub fn resolve_initial(&self) -> anyhow::Result<WeightVector> {
        let raw = match &self.path {
            Some(p) => WeightVector::load_file(p)?,
            None => self.initial.clone(),
        };
        Ok(raw.normalized_within(self.bounds()))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub strategy: ScoringStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerParams {
    pub semantic: SemanticParams,
    pub categorical: CategoricalParams,
    pub structural: StructuralParams,
    pub temporal: TemporalParams,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSONL directory; absent keeps history in memory only.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub channel_capacity: usize,
    pub webhook_url: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub weights: WeightsConfig,
    pub scoring: ScoringConfig,
    pub scorers: ScorerParams,
    pub optimizer: OptimizerParams,
    pub tracker: TrackerParams,
    pub predictor: PredictorParams,
    pub stream: StreamParams,
    pub store: StoreConfig,
    pub notify: NotifyConfig,
}

fn parse_unit_env(raw: Option<String>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 1.0))
}

fn parse_cap_env(raw: Option<String>) -> Option<usize> {
    raw.and_then(|s| s.trim().parse::<usize>().ok()).map(|v| v.max(1))
}

impl EngineConfig {
    /// Load from `$CONFIDENCE_CONFIG_PATH` or `config/engine.toml`, apply env, validate.
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let mut cfg = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading engine config at {}", path.display()))?;
            Self::from_toml_str(&content).with_context(|| format!("parsing engine config at {}", path.display()))?
        } else {
            tracing::info!(target: "config", path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(t) = parse_unit_env(env::var(ENV_TARGET_THRESHOLD).ok()) {
            self.tracker.target_threshold = t;
        }
        if let Some(cap) = parse_cap_env(env::var(ENV_HISTORY_CAP).ok()) {
            self.tracker.history_cap = cap;
        }
        if let Ok(raw) = env::var(ENV_STRATEGY) {
            match ScoringStrategy::from_label(&raw) {
                Some(s) => self.scoring.strategy = s,
                None => tracing::warn!(target: "config", value = %raw, "ignoring unknown {ENV_STRATEGY}"),
            }
        }
    }

    /// Fatal configuration checks.
    pub fn validate(&self) -> EngineResult<()> {
        self.weights.bounds().validate(Dimension::ALL.len())?;
        for (d, w) in self.weights.initial.iter() {
            if !w.is_finite() || w < 0.0 {
                return Err(EngineError::Config(format!("initial weight for {d} must be finite and >= 0")));
            }
        }

        let t = &self.tracker;
        if t.stability_window < 2 {
            return Err(EngineError::Config("tracker.stability_window must be >= 2".into()));
        }
        if t.history_cap == 0 {
            return Err(EngineError::Config("tracker.history_cap must be >= 1".into()));
        }
        for (name, v) in [
            ("tracker.target_threshold", t.target_threshold),
            ("tracker.max_delta", t.max_delta),
            ("tracker.min_improvement", t.min_improvement),
        ] {
            if !(v > 0.0 && v <= 1.0) {
                return Err(EngineError::Config(format!("{name} must be within (0, 1], got {v}")));
            }
        }

        let o = &self.optimizer;
        if !(o.learning_rate.is_finite() && o.learning_rate > 0.0) {
            return Err(EngineError::Config("optimizer.learning_rate must be > 0".into()));
        }
        if !(0.0..1.0).contains(&o.momentum) {
            return Err(EngineError::Config("optimizer.momentum must be within [0, 1)".into()));
        }
        if o.batch_size == 0 {
            return Err(EngineError::Config("optimizer.batch_size must be >= 1".into()));
        }

        if self.predictor.max_iterations == 0 {
            return Err(EngineError::Config("predictor.max_iterations must be >= 1".into()));
        }
        self.stream.validate()?;
        if self.notify.channel_capacity == 0 {
            return Err(EngineError::Config("notify.channel_capacity must be >= 1".into()));
        }
        Ok(())
    }
}
