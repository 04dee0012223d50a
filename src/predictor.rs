//! # Convergence Predictor
//! Forecasts how many more iterations an entity needs to reach a target score.
//!
//! Strategies operate on `distance = target − current` and the recent deltas:
//! - linear: `ceil(distance / avg_improvement)`
//! - exponential: geometric decay of improvements, projected cumulatively
//! - logarithmic: least-squares fit of `a·ln(n+1) + b`, solved for the target
//! - adaptive: whichever of the three fits the recent history best
//! - ensemble: inverse-residual weighted vote of the three
//!
//! Each result carries a 90% interval `n ± 1.645·rmse/rate`. Nothing here
//! returns an error: a forecast that cannot be made is `will_converge = false`
//! with a reason.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::history::deltas;
use crate::tracker::{ConvergenceState, Phase, RiskFlags};

pub const REASON_NO_POSITIVE_TREND: &str = "no_positive_trend";
pub const REASON_TARGET_REACHED: &str = "target_reached";
pub const REASON_INSUFFICIENT_HISTORY: &str = "insufficient_history";
pub const REASON_EXCEEDS_MAX_ITERATIONS: &str = "exceeds_max_iterations";
pub const REASON_PLATEAU_WITHOUT_TARGET: &str = "plateau_without_target";

const Z_90: f64 = 1.645;
const CEIL_TOLERANCE: f64 = 1e-9;
const RESIDUAL_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStrategy {
    Linear,
    Exponential,
    Logarithmic,
    Adaptive,
    Ensemble,
}

impl PredictionStrategy {
    pub const MODELS: [PredictionStrategy; 3] = [
        PredictionStrategy::Linear,
        PredictionStrategy::Exponential,
        PredictionStrategy::Logarithmic,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorParams {
    pub max_iterations: u32,
    /// Deltas considered "recent" for the improvement average.
    pub recent_window: usize,
}

impl Default for PredictorParams {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            recent_window: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub strategy: PredictionStrategy,
    pub estimated_iterations: Option<u32>,
    pub will_converge: bool,
    /// 90% interval on the iteration count; absent when there is no estimate.
    pub confidence_bounds: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// RMSE of the model against the history it was fitted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residual: Option<f64>,
    /// Model chosen by the adaptive strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basis: Option<PredictionStrategy>,
}

impl PredictionResult {
    fn unreachable(strategy: PredictionStrategy, reason: &str, residual: Option<f64>) -> Self {
        Self {
            strategy,
            estimated_iterations: None,
            will_converge: false,
            confidence_bounds: None,
            reason: Some(reason.to_string()),
            residual,
            basis: None,
        }
    }

    fn reached(strategy: PredictionStrategy) -> Self {
        Self {
            strategy,
            estimated_iterations: Some(0),
            will_converge: true,
            confidence_bounds: Some((0.0, 0.0)),
            reason: Some(REASON_TARGET_REACHED.to_string()),
            residual: None,
            basis: None,
        }
    }

    fn half_width(&self) -> Option<f64> {
        self.confidence_bounds.map(|(lo, hi)| (hi - lo) / 2.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionReport {
    pub entity_id: String,
    pub target: f64,
    pub current: Option<f64>,
    pub avg_improvement: Option<f64>,
    pub phase: Phase,
    pub flags: RiskFlags,
    pub per_strategy: Vec<PredictionResult>,
    pub ensemble: PredictionResult,
}

/// A fitted model: raw (fractional) iterations plus fit quality.
#[derive(Debug, Clone, Copy)]
struct Estimate {
    iterations: f64,
    rmse: f64,
    /// Average projected improvement per iteration.
    rate: f64,
}

/// `ceil(x)` with a tolerance for representation error, at least 1.
pub fn ceil_iterations(x: f64) -> u32 {
    let n = (x - CEIL_TOLERANCE).ceil().max(1.0);
    if n >= u32::MAX as f64 {
        u32::MAX
    } else {
        n as u32
    }
}

/// Linear forecast from a distance and an average improvement.
pub fn linear_iterations(distance: f64, avg_improvement: f64, max_iterations: u32) -> PredictionResult {
    if distance <= 0.0 {
        return PredictionResult::reached(PredictionStrategy::Linear);
    }
    if !(avg_improvement > 0.0) {
        return PredictionResult::unreachable(PredictionStrategy::Linear, REASON_NO_POSITIVE_TREND, None);
    }
    finish(
        PredictionStrategy::Linear,
        Estimate {
            iterations: distance / avg_improvement,
            rmse: 0.0,
            rate: avg_improvement,
        },
        max_iterations,
    )
}

fn finish(strategy: PredictionStrategy, est: Estimate, max_iterations: u32) -> PredictionResult {
    let n = ceil_iterations(est.iterations);
    let half = if est.rate > 0.0 { Z_90 * est.rmse / est.rate } else { 0.0 };
    let will_converge = n <= max_iterations;
    PredictionResult {
        strategy,
        estimated_iterations: Some(n),
        will_converge,
        confidence_bounds: Some(((n as f64 - half).max(1.0), n as f64 + half)),
        reason: (!will_converge).then(|| REASON_EXCEEDS_MAX_ITERATIONS.to_string()),
        residual: Some(est.rmse),
        basis: None,
    }
}

fn rmse(actual: &[f64], fitted: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for (a, f) in actual.iter().zip(fitted) {
        sum += (a - f) * (a - f);
        n += 1;
    }
    if n == 0 {
        0.0
    } else {
        (sum / n as f64).sqrt()
    }
}

fn nonconvergent(reason: &str) -> EngineError {
    EngineError::NonConvergentTrend {
        reason: reason.to_string(),
    }
}

fn reason_of(e: EngineError) -> String {
    match e {
        EngineError::NonConvergentTrend { reason } => reason,
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct ConvergencePredictor {
    params: PredictorParams,
}

impl Default for ConvergencePredictor {
    fn default() -> Self {
        Self::new(PredictorParams::default())
    }
}

impl ConvergencePredictor {
    pub fn new(params: PredictorParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &PredictorParams {
        &self.params
    }

    /// Values of the recent window: the last `recent_window + 1` points.
    fn recent<'a>(&self, values: &'a [f64]) -> &'a [f64] {
        let keep = self.params.recent_window.max(1) + 1;
        &values[values.len().saturating_sub(keep)..]
    }

    /// Mean of the recent deltas.
    pub fn avg_improvement(&self, values: &[f64]) -> Option<f64> {
        let d = deltas(self.recent(values));
        if d.is_empty() {
            None
        } else {
            Some(d.iter().sum::<f64>() / d.len() as f64)
        }
    }

    fn fit_linear(&self, values: &[f64], distance: f64) -> Result<Estimate, EngineError> {
        let window = self.recent(values);
        let avg = self
            .avg_improvement(values)
            .ok_or_else(|| nonconvergent(REASON_INSUFFICIENT_HISTORY))?;
        if !(avg > 0.0) {
            return Err(nonconvergent(REASON_NO_POSITIVE_TREND));
        }
        let start = window[0];
        Ok(Estimate {
            iterations: distance / avg,
            rmse: rmse(window, (0..window.len()).map(|i| start + avg * i as f64)),
            rate: avg,
        })
    }

    fn fit_exponential(&self, values: &[f64], distance: f64) -> Result<Estimate, EngineError> {
        let window = self.recent(values);
        let d = deltas(window);
        let last = *d.last().ok_or_else(|| nonconvergent(REASON_INSUFFICIENT_HISTORY))?;
        if !(last > 0.0) {
            return Err(nonconvergent(REASON_NO_POSITIVE_TREND));
        }

        // geometric mean of consecutive ratios between positive deltas
        let logs: Vec<f64> = d
            .windows(2)
            .filter(|w| w[0] > 0.0 && w[1] > 0.0)
            .map(|w| (w[1] / w[0]).ln())
            .collect();
        let decay_rate = if logs.is_empty() {
            0.0
        } else {
            logs.iter().sum::<f64>() / logs.len() as f64
        };
        let ratio = decay_rate.exp().clamp(0.01, 1.5);

        // replay the model over the window, anchored at the last observed delta
        let k = d.len();
        let mut fitted = Vec::with_capacity(window.len());
        let mut v = window[0];
        fitted.push(v);
        for j in 0..k {
            v += last * ratio.powi(j as i32 - (k as i32 - 1));
            fitted.push(v);
        }
        let err = rmse(window, fitted.into_iter());

        let mut cumulative = 0.0;
        let mut step = last;
        for n in 1..=self.params.max_iterations {
            step *= ratio;
            cumulative += step;
            if cumulative >= distance - CEIL_TOLERANCE {
                return Ok(Estimate {
                    iterations: n as f64,
                    rmse: err,
                    rate: cumulative / n as f64,
                });
            }
        }
        Err(nonconvergent(REASON_EXCEEDS_MAX_ITERATIONS))
    }

    fn fit_logarithmic(&self, values: &[f64], target: f64, distance: f64) -> Result<Estimate, EngineError> {
        if values.len() < 2 {
            return Err(nonconvergent(REASON_INSUFFICIENT_HISTORY));
        }
        let xs: Vec<f64> = (0..values.len()).map(|i| ((i + 1) as f64).ln()).collect();
        let n = xs.len() as f64;
        let mx = xs.iter().sum::<f64>() / n;
        let my = values.iter().sum::<f64>() / n;
        let mut cov = 0.0;
        let mut var = 0.0;
        for (x, y) in xs.iter().zip(values) {
            cov += (x - mx) * (y - my);
            var += (x - mx) * (x - mx);
        }
        let a = cov / var;
        let b = my - a * mx;
        if !(a > 0.0) {
            return Err(nonconvergent(REASON_NO_POSITIVE_TREND));
        }
        let err = rmse(values, xs.iter().map(|x| a * x + b));

        let exponent = (target - b) / a;
        if exponent > 700.0 {
            return Err(nonconvergent(REASON_EXCEEDS_MAX_ITERATIONS));
        }
        let position = exponent.exp() - 1.0;
        let current_position = (values.len() - 1) as f64;
        let iterations = (position - current_position).max(CEIL_TOLERANCE * 2.0);
        Ok(Estimate {
            iterations,
            rmse: err,
            rate: distance / iterations.max(1.0),
        })
    }

    /// One strategy's forecast over the active values (oldest first).
    pub fn forecast(&self, values: &[f64], target: f64, strategy: PredictionStrategy) -> PredictionResult {
        match strategy {
            PredictionStrategy::Adaptive => return self.adaptive(&self.models(values, target)),
            PredictionStrategy::Ensemble => return self.ensemble(&self.models(values, target)),
            _ => {}
        }
        let Some(current) = values.last().copied() else {
            return PredictionResult::unreachable(strategy, REASON_INSUFFICIENT_HISTORY, None);
        };
        let distance = target - current;
        if distance <= 0.0 {
            return PredictionResult::reached(strategy);
        }
        let fit = match strategy {
            PredictionStrategy::Linear => self.fit_linear(values, distance),
            PredictionStrategy::Exponential => self.fit_exponential(values, distance),
            _ => self.fit_logarithmic(values, target, distance),
        };
        match fit {
            Ok(est) => finish(strategy, est, self.params.max_iterations),
            Err(e) => PredictionResult::unreachable(strategy, &reason_of(e), None),
        }
    }

    fn models(&self, values: &[f64], target: f64) -> Vec<PredictionResult> {
        PredictionStrategy::MODELS
            .iter()
            .map(|s| self.forecast(values, target, *s))
            .collect()
    }

    /// Lowest-residual model among those that produced an estimate.
    fn adaptive(&self, models: &[PredictionResult]) -> PredictionResult {
        let best = models
            .iter()
            .filter(|m| m.estimated_iterations.is_some())
            .min_by(|a, b| {
                let ra = a.residual.unwrap_or(0.0);
                let rb = b.residual.unwrap_or(0.0);
                ra.total_cmp(&rb)
            })
            .or_else(|| models.first());
        match best {
            Some(m) => PredictionResult {
                strategy: PredictionStrategy::Adaptive,
                basis: Some(m.strategy),
                ..m.clone()
            },
            None => PredictionResult::unreachable(PredictionStrategy::Adaptive, REASON_INSUFFICIENT_HISTORY, None),
        }
    }

    fn ensemble(&self, models: &[PredictionResult]) -> PredictionResult {
        if let Some(done) = models.iter().find(|m| m.estimated_iterations == Some(0)) {
            return PredictionResult {
                strategy: PredictionStrategy::Ensemble,
                ..done.clone()
            };
        }
        let voters: Vec<&PredictionResult> = models.iter().filter(|m| m.estimated_iterations.is_some()).collect();
        if voters.is_empty() {
            let reason = models
                .iter()
                .find_map(|m| m.reason.clone())
                .unwrap_or_else(|| REASON_INSUFFICIENT_HISTORY.to_string());
            return PredictionResult::unreachable(PredictionStrategy::Ensemble, &reason, None);
        }

        let mut wsum = 0.0;
        let mut nsum = 0.0;
        let mut rsum = 0.0;
        let mut inv_var = 0.0;
        let mut exact = false;
        for m in &voters {
            let r = m.residual.unwrap_or(0.0);
            let w = 1.0 / (r + RESIDUAL_FLOOR);
            wsum += w;
            nsum += w * m.estimated_iterations.unwrap_or(0) as f64;
            rsum += w * r;
            match m.half_width() {
                Some(h) if h > 0.0 => inv_var += 1.0 / (h * h),
                _ => exact = true,
            }
        }
        let n = ceil_iterations(nsum / wsum);
        let half = if exact || inv_var == 0.0 { 0.0 } else { 1.0 / inv_var.sqrt() };
        let will_converge = n <= self.params.max_iterations;
        PredictionResult {
            strategy: PredictionStrategy::Ensemble,
            estimated_iterations: Some(n),
            will_converge,
            confidence_bounds: Some(((n as f64 - half).max(1.0), n as f64 + half)),
            reason: (!will_converge).then(|| REASON_EXCEEDS_MAX_ITERATIONS.to_string()),
            residual: Some(rsum / wsum),
            basis: None,
        }
    }

    /// Every strategy plus the ensemble, with the tracker's risk flags applied.
    pub fn predict(&self, values: &[f64], state: &ConvergenceState, target: f64) -> PredictionReport {
        let models = self.models(values, target);
        let mut per_strategy = models.clone();
        per_strategy.push(self.adaptive(&models));
        let mut ensemble = self.ensemble(&models);

        let current = values.last().copied();
        let below_target = current.map(|c| c < target).unwrap_or(true);
        let stalled = below_target
            && values.len() >= 2
            && matches!(state.phase, Phase::Plateauing | Phase::Converged);
        if stalled {
            for r in per_strategy.iter_mut().chain(std::iter::once(&mut ensemble)) {
                r.will_converge = false;
                r.reason = Some(REASON_PLATEAU_WITHOUT_TARGET.to_string());
            }
        }
        debug!(
            target: "predictor",
            entity_id = %crate::scoring::short_id(&state.entity_id),
            target_score = target,
            ensemble = ?ensemble.estimated_iterations,
            stalled,
            "prediction computed"
        );

        let mut flags = state.risk;
        flags.plateau_without_target |= stalled;
        PredictionReport {
            entity_id: state.entity_id.clone(),
            target,
            current,
            avg_improvement: self.avg_improvement(values),
            phase: state.phase,
            flags,
            per_strategy,
            ensemble,
        }
    }
}
