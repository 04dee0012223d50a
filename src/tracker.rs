//! # Convergence Tracker
//! Owns the per-entity history buffers and classifies convergence.
//!
//! Converged when any of three signals fires:
//! 1. target reached: latest overall ≥ `target_threshold`
//! 2. variance stable: variance of the last `stability_window` values < `max_delta`
//! 3. plateau: the last 3 deltas are each below `min_improvement · 0.1` in magnitude
//!
//! Converged is latched per entity until an explicit `reset`.
//!
//! Each entity sits behind its own lock: calls for one entity serialize,
//! calls for different entities do not contend.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dimensions::population_variance;
use crate::error::{EngineError, EngineResult};
use crate::history::{deltas, EntityHistory, HistoryEntry, HistoryStats, DEFAULT_HISTORY_CAP};
use crate::scoring::{short_id, ConfidenceResult};
use crate::store::DurableStore;

const PLATEAU_RUN: usize = 3;
const TREND_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    pub history_cap: usize,
    pub target_threshold: f64,
    pub stability_window: usize,
    pub max_delta: f64,
    pub min_improvement: f64,
    pub trend_window: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            history_cap: DEFAULT_HISTORY_CAP,
            target_threshold: 0.85,
            stability_window: 3,
            max_delta: 0.02,
            min_improvement: 0.01,
            trend_window: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initial,
    Improving,
    Plateauing,
    Converged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceSignal {
    TargetReached,
    VarianceStable,
    Plateau,
}

impl ConvergenceSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            ConvergenceSignal::TargetReached => "target_reached",
            ConvergenceSignal::VarianceStable => "variance_stable",
            ConvergenceSignal::Plateau => "plateau",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Accelerating,
    Decelerating,
    Stable,
}

/// Diagnostic flags surfaced with predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RiskFlags {
    /// Plateauing (or converged) without having reached the target.
    pub plateau_without_target: bool,
    /// Mean of the recent deltas is negative.
    pub regressing: bool,
    /// Recent deltas change sign more often than not.
    pub oscillating: bool,
}

/// Derived on demand from the history; never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceState {
    pub entity_id: String,
    pub has_converged: bool,
    pub phase: Phase,
    pub signal: Option<ConvergenceSignal>,
    pub stability_window: usize,
    pub reason: String,
    pub last_deltas: Vec<f64>,
    pub trend: Trend,
    pub latest: Option<f64>,
    pub risk: RiskFlags,
}

/// `classify` output plus whether this call flipped the entity to Converged.
#[derive(Debug, Clone)]
pub struct Classified {
    pub state: ConvergenceState,
    pub just_converged: bool,
}

/// Evaluate the three signals over `values` (oldest first).
pub fn detect_signal(values: &[f64], p: &TrackerParams) -> Option<ConvergenceSignal> {
    let latest = *values.last()?;
    if latest >= p.target_threshold {
        return Some(ConvergenceSignal::TargetReached);
    }
    let w = p.stability_window.max(2);
    if values.len() >= w && population_variance(&values[values.len() - w..]) < p.max_delta {
        return Some(ConvergenceSignal::VarianceStable);
    }
    let d = deltas(values);
    if d.len() >= PLATEAU_RUN
        && d[d.len() - PLATEAU_RUN..]
            .iter()
            .all(|x| x.abs() < p.min_improvement * 0.1)
    {
        return Some(ConvergenceSignal::Plateau);
    }
    None
}

/// Least-squares slope of `ys` against their index.
pub fn regression_slope(ys: &[f64]) -> Option<f64> {
    if ys.len() < 2 {
        return None;
    }
    let n = ys.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        None
    } else {
        Some(num / den)
    }
}

pub fn trend_of(d: &[f64], window: usize) -> Trend {
    let recent = &d[d.len().saturating_sub(window.max(2))..];
    match regression_slope(recent) {
        Some(s) if s > TREND_EPSILON => Trend::Accelerating,
        Some(s) if s < -TREND_EPSILON => Trend::Decelerating,
        _ => Trend::Stable,
    }
}

/// Pure classification over the values since the last reset.
pub fn classify_values(entity_id: &str, values: &[f64], latched: bool, p: &TrackerParams) -> ConvergenceState {
    let d = deltas(values);
    let recent: Vec<f64> = d[d.len().saturating_sub(PLATEAU_RUN)..].to_vec();
    let latest = values.last().copied();
    let signal = detect_signal(values, p);
    let has_converged = latched || signal.is_some();

    let mean_recent = if recent.is_empty() {
        0.0
    } else {
        recent.iter().sum::<f64>() / recent.len() as f64
    };

    let (phase, reason) = if has_converged {
        let why = match signal {
            Some(s) => s.as_str().to_string(),
            None => "latched".to_string(),
        };
        (Phase::Converged, why)
    } else if values.len() < 2 {
        (Phase::Initial, "insufficient_history".to_string())
    } else if mean_recent > p.min_improvement {
        (Phase::Improving, format!("mean_delta {:.4} > {:.4}", mean_recent, p.min_improvement))
    } else {
        (Phase::Plateauing, format!("mean_delta {:.4} <= {:.4}", mean_recent, p.min_improvement))
    };

    let below_target = latest.map(|l| l < p.target_threshold).unwrap_or(true);
    let sign_changes = recent.windows(2).filter(|w| w[0] * w[1] < 0.0).count();
    let risk = RiskFlags {
        plateau_without_target: below_target
            && (phase == Phase::Plateauing || (phase == Phase::Converged && values.len() >= 2)),
        regressing: !recent.is_empty() && mean_recent < 0.0,
        oscillating: recent.len() >= 3 && sign_changes * 2 > recent.len() - 1,
    };

    ConvergenceState {
        entity_id: entity_id.to_string(),
        has_converged,
        phase,
        signal,
        stability_window: p.stability_window,
        reason,
        last_deltas: recent,
        trend: trend_of(&d, p.trend_window),
        latest,
        risk,
    }
}

pub struct ConvergenceTracker {
    params: TrackerParams,
    entities: DashMap<String, Arc<Mutex<EntityHistory>>>,
    store: Option<Arc<dyn DurableStore>>,
}

impl std::fmt::Debug for ConvergenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergenceTracker")
            .field("params", &self.params)
            .field("entities", &self.entities.len())
            .field("durable", &self.store.is_some())
            .finish()
    }
}

impl ConvergenceTracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            params,
            entities: DashMap::new(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn params(&self) -> &TrackerParams {
        &self.params
    }

    pub fn tracked_entities(&self) -> usize {
        self.entities.len()
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.entities.iter().map(|r| r.key().clone()).collect()
    }

    fn hydrate(&self, entity_id: &str) -> EntityHistory {
        let persisted = match &self.store {
            Some(store) => store.load(entity_id).unwrap_or_else(|e| {
                warn!(target: "tracker", entity_id = %short_id(entity_id), error = %e, "history load failed, starting empty");
                Vec::new()
            }),
            None => Vec::new(),
        };
        EntityHistory::restore(self.params.history_cap, persisted)
    }

    /// Fetch or create the entity's slot, hydrating from the store on first touch.
    fn slot(&self, entity_id: &str) -> Arc<Mutex<EntityHistory>> {
        if let Some(existing) = self.entities.get(entity_id) {
            return existing.clone();
        }
        let slot = self
            .entities
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(self.hydrate(entity_id))))
            .clone();
        metrics::gauge!("tracked_entities").set(self.entities.len() as f64);
        slot
    }

    /// Like `slot`, but reads never register an entity that has no history anywhere.
    fn lookup(&self, entity_id: &str) -> Option<Arc<Mutex<EntityHistory>>> {
        if let Some(existing) = self.entities.get(entity_id) {
            return Some(existing.clone());
        }
        self.store.as_ref()?;
        let hydrated = self.hydrate(entity_id);
        if hydrated.is_empty() {
            return None;
        }
        let slot = self
            .entities
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(hydrated)))
            .clone();
        metrics::gauge!("tracked_entities").set(self.entities.len() as f64);
        Some(slot)
    }

    /// Append a result in arrival order.
    pub fn record(&self, entity_id: &str, result: ConfidenceResult) -> EngineResult<HistoryEntry> {
        self.append_with(entity_id, |h| h.prepare(entity_id, result))
    }

    /// Append only if `expected_sequence` is the entity's next sequence number.
    pub fn record_at(&self, entity_id: &str, expected_sequence: u64, result: ConfidenceResult) -> EngineResult<HistoryEntry> {
        self.append_with(entity_id, |h| h.prepare_at(entity_id, expected_sequence, result))
    }

    /// Stage an entry, persist it, then commit it to the buffer. A rejected
    /// or unpersisted entry leaves the entity as it was.
    fn append_with(
        &self,
        entity_id: &str,
        stage: impl FnOnce(&EntityHistory) -> EngineResult<HistoryEntry>,
    ) -> EngineResult<HistoryEntry> {
        loop {
            let slot = self.slot(entity_id);
            let mut h = slot.lock();
            if h.released {
                // lost a race with `release`; the next slot is fresh
                continue;
            }
            let entry = stage(&*h).inspect_err(|e| {
                metrics::counter!("history_rejected_total").increment(1);
                debug!(target: "tracker", entity_id = %short_id(entity_id), error = %e, "record rejected");
            })?;
            self.persist(entity_id, &entry)?;
            h.commit(entry.clone());
            metrics::counter!("history_records_total").increment(1);
            return Ok(entry);
        }
    }

    // called with the entity lock held so store appends keep arrival order
    fn persist(&self, entity_id: &str, entry: &HistoryEntry) -> EngineResult<()> {
        if let Some(store) = &self.store {
            store
                .append(entity_id, entry)
                .map_err(|e| EngineError::Store(format!("{e:#}")))?;
        }
        Ok(())
    }

    pub fn history(&self, entity_id: &str) -> Vec<HistoryEntry> {
        self.lookup(entity_id)
            .map(|slot| slot.lock().snapshot())
            .unwrap_or_default()
    }

    /// Overall values since the last reset, oldest first.
    pub fn values(&self, entity_id: &str) -> Vec<f64> {
        self.lookup(entity_id)
            .map(|slot| slot.lock().active_values())
            .unwrap_or_default()
    }

    pub fn stats(&self, entity_id: &str) -> Option<HistoryStats> {
        self.lookup(entity_id)?.lock().stats()
    }

    pub fn classify(&self, entity_id: &str) -> Classified {
        let Some(slot) = self.lookup(entity_id) else {
            return Classified {
                state: classify_values(entity_id, &[], false, &self.params),
                just_converged: false,
            };
        };
        let mut h = slot.lock();
        let values = h.active_values();
        let state = classify_values(entity_id, &values, h.converged, &self.params);
        let just_converged = state.has_converged && !h.converged;
        if just_converged {
            h.converged = true;
            info!(
                target: "tracker",
                entity_id = %short_id(entity_id),
                reason = %state.reason,
                latest = ?state.latest,
                "entity converged"
            );
        }
        Classified { state, just_converged }
    }

    /// Clear the Converged latch (e.g. artifact materially changed).
    pub fn reset(&self, entity_id: &str) -> EngineResult<()> {
        let slot = self.lookup(entity_id).ok_or_else(|| EngineError::UnknownEntity {
            entity_id: entity_id.to_string(),
        })?;
        slot.lock().reset();
        Ok(())
    }

    /// Drop the entity's history everywhere. Returns false if it was not tracked.
    pub fn release(&self, entity_id: &str) -> EngineResult<bool> {
        let Some(slot) = self.entities.get(entity_id).map(|r| r.value().clone()) else {
            self.forget(entity_id)?;
            return Ok(false);
        };
        // the store goes first, so a fresh slot can never hydrate what is being dropped
        let mut h = slot.lock();
        self.forget(entity_id)?;
        h.released = true;
        let removed = self.entities.remove(entity_id).is_some();
        drop(h);
        metrics::gauge!("tracked_entities").set(self.entities.len() as f64);
        Ok(removed)
    }

    fn forget(&self, entity_id: &str) -> EngineResult<()> {
        if let Some(store) = &self.store {
            store
                .release(entity_id)
                .map_err(|e| EngineError::Store(format!("{e:#}")))?;
        }
        Ok(())
    }
}
