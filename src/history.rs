//! Bounded, ordered per-entity history of confidence results.
//!
//! Ring-buffer semantics: once `cap` entries are held, the oldest is evicted
//! on every append. Sequence numbers keep counting across evictions.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::dimensions::population_variance;
use crate::error::{EngineError, EngineResult};
use crate::scoring::ConfidenceResult;

pub const DEFAULT_HISTORY_CAP: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sequence: u64,
    pub result: ConfidenceResult,
}

/// Summary statistics over the retained entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryStats {
    pub count: usize,
    pub mean: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    pub last_delta: Option<f64>,
    pub avg_improvement: Option<f64>,
}

#[derive(Debug)]
pub struct EntityHistory {
    entries: VecDeque<HistoryEntry>,
    cap: usize,
    next_sequence: u64,
    /// Entries with a smaller sequence predate the last reset.
    baseline: u64,
    /// Converged latch; cleared only by `reset`.
    pub(crate) converged: bool,
    /// Set once the entity stops being tracked; the buffer is orphaned.
    pub(crate) released: bool,
}

impl EntityHistory {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            entries: VecDeque::with_capacity(cap.min(10_000)),
            cap,
            next_sequence: 0,
            baseline: 0,
            converged: false,
            released: false,
        }
    }

    /// Rebuild from persisted entries (oldest first). Keeps the newest `cap`.
    pub fn restore(cap: usize, persisted: Vec<HistoryEntry>) -> Self {
        let mut h = Self::with_capacity(cap);
        for e in persisted {
            if e.sequence < h.next_sequence {
                continue;
            }
            h.next_sequence = e.sequence + 1;
            h.entries.push_back(e);
            if h.entries.len() > h.cap {
                h.entries.pop_front();
            }
        }
        h
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    /// Append in arrival order. Results timestamped before the latest entry
    /// are rejected; history is untouched on rejection.
    pub fn push(&mut self, entity_id: &str, result: ConfidenceResult) -> EngineResult<HistoryEntry> {
        let entry = self.prepare(entity_id, result)?;
        self.commit(entry.clone());
        Ok(entry)
    }

    /// Append only if the caller's expected sequence matches.
    pub fn push_at(&mut self, entity_id: &str, expected: u64, result: ConfidenceResult) -> EngineResult<HistoryEntry> {
        let entry = self.prepare_at(entity_id, expected, result)?;
        self.commit(entry.clone());
        Ok(entry)
    }

    /// Validate `result` and build the entry it would become, without
    /// touching the buffer.
    pub fn prepare(&self, entity_id: &str, result: ConfidenceResult) -> EngineResult<HistoryEntry> {
        if result.entity_id != entity_id {
            return Err(EngineError::invalid_state(
                entity_id,
                format!("result belongs to `{}`", result.entity_id),
            ));
        }
        if !(0.0..=1.0).contains(&result.overall) {
            return Err(EngineError::invalid_state(
                entity_id,
                format!("overall {} is outside [0, 1]", result.overall),
            ));
        }
        if let Some(last) = self.entries.back() {
            if result.timestamp < last.result.timestamp {
                return Err(EngineError::invalid_state(
                    entity_id,
                    format!(
                        "out-of-order result: {} precedes latest {}",
                        result.timestamp.to_rfc3339(),
                        last.result.timestamp.to_rfc3339()
                    ),
                ));
            }
        }

        Ok(HistoryEntry {
            sequence: self.next_sequence,
            result,
        })
    }

    pub fn prepare_at(&self, entity_id: &str, expected: u64, result: ConfidenceResult) -> EngineResult<HistoryEntry> {
        if expected != self.next_sequence {
            return Err(EngineError::invalid_state(
                entity_id,
                format!("sequence {} does not match next {}", expected, self.next_sequence),
            ));
        }
        self.prepare(entity_id, result)
    }

    /// Append an entry built by `prepare` against the current state.
    pub fn commit(&mut self, entry: HistoryEntry) {
        debug_assert_eq!(entry.sequence, self.next_sequence);
        self.next_sequence = entry.sequence + 1;
        self.entries.push_back(entry);
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn snapshot_last_n(&self, n: usize) -> Vec<HistoryEntry> {
        let start = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(start).cloned().collect()
    }

    /// Overall values recorded since the last reset, oldest first.
    pub fn active_values(&self) -> Vec<f64> {
        self.entries
            .iter()
            .filter(|e| e.sequence >= self.baseline)
            .map(|e| e.result.overall)
            .collect()
    }

    /// Clear the converged latch and start a fresh classification epoch.
    pub fn reset(&mut self) {
        self.converged = false;
        self.baseline = self.next_sequence;
    }

    pub fn stats(&self) -> Option<HistoryStats> {
        let values: Vec<f64> = self.entries.iter().map(|e| e.result.overall).collect();
        if values.is_empty() {
            return None;
        }
        let d = deltas(&values);
        let n = values.len() as f64;
        Some(HistoryStats {
            count: values.len(),
            mean: values.iter().sum::<f64>() / n,
            variance: population_variance(&values),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            last_delta: d.last().copied(),
            avg_improvement: if d.is_empty() {
                None
            } else {
                Some(d.iter().sum::<f64>() / d.len() as f64)
            },
        })
    }
}

/// Consecutive differences `v[i] − v[i−1]`.
pub fn deltas(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|w| w[1] - w[0]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn result(entity: &str, overall: f64, secs: i64) -> ConfidenceResult {
        ConfidenceResult {
            entity_id: entity.into(),
            overall,
            dimensions: BTreeMap::new(),
            strategy: "weighted_average".into(),
            degraded: false,
            missing: Vec::new(),
            weights_version: 0,
            timestamp: Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap() + Duration::seconds(secs),
        }
    }

    #[test]
    fn evicts_oldest_beyond_cap() {
        let mut h = EntityHistory::with_capacity(3);
        for i in 0..5 {
            h.push("e", result("e", i as f64 / 10.0, i)).unwrap();
        }
        let seqs: Vec<u64> = h.snapshot().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(h.next_sequence(), 5);
    }

    #[test]
    fn rejects_out_of_order_and_foreign_results() {
        let mut h = EntityHistory::with_capacity(10);
        h.push("e", result("e", 0.5, 10)).unwrap();
        assert!(h.push("e", result("e", 0.6, 5)).is_err());
        assert!(h.push("e", result("other", 0.6, 20)).is_err());
        assert!(h.push("e", result("e", 7.5, 20)).is_err());
        assert!(h.push("e", result("e", -0.1, 20)).is_err());
        assert!(h.push("e", result("e", f64::NAN, 20)).is_err());
        assert_eq!(h.len(), 1);
        assert_eq!(h.next_sequence(), 1);
    }

    #[test]
    fn prepare_leaves_buffer_untouched() {
        let mut h = EntityHistory::with_capacity(10);
        let staged = h.prepare("e", result("e", 0.5, 1)).unwrap();
        assert_eq!(staged.sequence, 0);
        assert!(h.is_empty());
        h.commit(staged);
        assert_eq!(h.next_sequence(), 1);
        assert!(h.prepare_at("e", 0, result("e", 0.6, 2)).is_err());
    }

    #[test]
    fn push_at_detects_replays() {
        let mut h = EntityHistory::with_capacity(10);
        h.push_at("e", 0, result("e", 0.5, 1)).unwrap();
        assert!(h.push_at("e", 0, result("e", 0.5, 1)).is_err());
        h.push_at("e", 1, result("e", 0.6, 2)).unwrap();
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn reset_starts_new_epoch() {
        let mut h = EntityHistory::with_capacity(10);
        h.push("e", result("e", 0.5, 1)).unwrap();
        h.converged = true;
        h.reset();
        assert!(!h.converged);
        assert!(h.active_values().is_empty());
        h.push("e", result("e", 0.7, 2)).unwrap();
        assert_eq!(h.active_values(), vec![0.7]);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn stats_over_entries() {
        let mut h = EntityHistory::with_capacity(10);
        for (i, v) in [0.2, 0.4, 0.6].iter().enumerate() {
            h.push("e", result("e", *v, i as i64)).unwrap();
        }
        let s = h.stats().unwrap();
        assert_eq!(s.count, 3);
        assert!((s.mean - 0.4).abs() < 1e-12);
        assert!((s.avg_improvement.unwrap() - 0.2).abs() < 1e-12);
        assert_eq!(s.min, 0.2);
    }

    #[test]
    fn restore_keeps_newest() {
        let entries: Vec<HistoryEntry> = (0..5)
            .map(|i| HistoryEntry {
                sequence: i,
                result: result("e", 0.1, i as i64),
            })
            .collect();
        let h = EntityHistory::restore(2, entries);
        assert_eq!(h.len(), 2);
        assert_eq!(h.next_sequence(), 5);
        assert_eq!(h.latest().unwrap().sequence, 4);
    }
}
