//! # Stream Window Aggregator
//! High-rate event input, buffered per entity into tumbling or hopping windows.
//!
//! Window starts are aligned to multiples of the hop since the Unix epoch, so
//! every entity sees the same boundaries. A window closes once its end has
//! passed; a closed window that saw events yields exactly one
//! [`WindowAggregate`], empty windows yield nothing. Events older than the
//! earliest open window are rejected, never reordered into closed windows.
//! A forced flush closes windows early; they reopen for later in-order
//! events and close again once their end passes.
//!
//! Admission is guarded by [`Backpressure`]: over the rate or occupancy
//! threshold, producers get `CapacityExceeded` with a retry delay.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::features::FeatureSet;
use crate::scoring::short_id;

/// Largest window whose length still fits in `i64` milliseconds.
pub const MAX_WINDOW_SECS: u64 = (i64::MAX / 1000) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowSpec {
    Tumbling { size_secs: u64 },
    Hopping { size_secs: u64, hop_secs: u64 },
}

impl Default for WindowSpec {
    fn default() -> Self {
        WindowSpec::Tumbling { size_secs: 60 }
    }
}

impl WindowSpec {
    pub fn size_ms(&self) -> i64 {
        match *self {
            WindowSpec::Tumbling { size_secs } | WindowSpec::Hopping { size_secs, .. } => {
                size_secs as i64 * 1000
            }
        }
    }

    pub fn hop_ms(&self) -> i64 {
        match *self {
            WindowSpec::Tumbling { size_secs } => size_secs as i64 * 1000,
            WindowSpec::Hopping { hop_secs, .. } => hop_secs as i64 * 1000,
        }
    }

    pub fn hop(&self) -> Duration {
        Duration::from_millis(self.hop_ms().max(0) as u64)
    }

    pub fn validate(&self) -> EngineResult<()> {
        let (size_secs, hop_secs) = match *self {
            WindowSpec::Tumbling { size_secs } => (size_secs, size_secs),
            WindowSpec::Hopping { size_secs, hop_secs } => (size_secs, hop_secs),
        };
        if size_secs.max(hop_secs) > MAX_WINDOW_SECS {
            return Err(EngineError::Config(format!(
                "window of {size_secs}s exceeds the {MAX_WINDOW_SECS}s limit"
            )));
        }
        match *self {
            WindowSpec::Tumbling { size_secs } if size_secs == 0 => {
                Err(EngineError::Config("tumbling window size must be > 0".into()))
            }
            WindowSpec::Hopping { size_secs, hop_secs } if hop_secs == 0 || hop_secs >= size_secs => Err(
                EngineError::Config(format!("hopping window needs 0 < hop ({hop_secs}s) < size ({size_secs}s)")),
            ),
            _ => Ok(()),
        }
    }

    /// Start of the earliest window containing `at_ms`.
    fn earliest_start(&self, at_ms: i64) -> i64 {
        let hop = self.hop_ms().max(1);
        (at_ms - self.size_ms()).div_euclid(hop) * hop + hop
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamParams {
    pub window: WindowSpec,
    /// Entity buffers without an update for this long are dropped.
    pub ttl_secs: u64,
    pub max_events_per_sec: u64,
    pub rate_threshold: f64,
    pub max_buffered_events: usize,
    pub occupancy_threshold: f64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            window: WindowSpec::default(),
            ttl_secs: 300,
            max_events_per_sec: 1000,
            rate_threshold: 0.8,
            max_buffered_events: 10_000,
            occupancy_threshold: 0.9,
            backoff_base_ms: 100,
            backoff_cap_ms: 1000,
        }
    }
}

impl StreamParams {
    pub fn validate(&self) -> EngineResult<()> {
        self.window.validate()?;
        for (name, v) in [
            ("stream.rate_threshold", self.rate_threshold),
            ("stream.occupancy_threshold", self.occupancy_threshold),
        ] {
            if !(v > 0.0 && v <= 1.0) {
                return Err(EngineError::Config(format!("{name} must be within (0, 1], got {v}")));
            }
        }
        if self.max_events_per_sec == 0 || self.max_buffered_events == 0 {
            return Err(EngineError::Config("stream capacities must be > 0".into()));
        }
        if self.ttl_secs == 0 {
            return Err(EngineError::Config("stream.ttl_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms.max(self.backoff_base_ms)),
        }
    }
}

/// Exponential backoff: `base · 2^attempt`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// One raw event for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: String,
    #[serde(default)]
    pub content_delta: i64,
    #[serde(default = "Utc::now")]
    pub at: DateTime<Utc>,
    /// Latest feature snapshot, when the producer has one.
    #[serde(default)]
    pub features: Option<FeatureSet>,
}

impl StreamEvent {
    pub fn new(kind: impl Into<String>, content_delta: i64, at: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            content_delta,
            at,
            features: None,
        }
    }

    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = Some(features);
        self
    }
}

/// Summary of one closed window, scored once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowAggregate {
    pub entity_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub event_count: usize,
    pub counts: BTreeMap<String, u64>,
    pub net_delta: i64,
    pub abs_delta: u64,
    pub mean_gap_ms: Option<f64>,
    pub max_gap_ms: Option<i64>,
    #[serde(skip)]
    pub features: FeatureSet,
}

/// Admission control shared by all entities.
#[derive(Debug)]
pub struct Backpressure {
    max_events_per_sec: u64,
    rate_threshold: f64,
    max_buffered: usize,
    occupancy_threshold: f64,
    policy: BackoffPolicy,
    buffered: AtomicUsize,
    /// `(unix second, admitted events in that second)`
    rate: Mutex<(i64, u64)>,
}

impl Backpressure {
    pub fn new(params: &StreamParams) -> Self {
        Self {
            max_events_per_sec: params.max_events_per_sec,
            rate_threshold: params.rate_threshold,
            max_buffered: params.max_buffered_events,
            occupancy_threshold: params.occupancy_threshold,
            policy: params.backoff(),
            buffered: AtomicUsize::new(0),
            rate: Mutex::new((i64::MIN, 0)),
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    pub fn occupancy(&self) -> f64 {
        self.buffered() as f64 / self.max_buffered.max(1) as f64
    }

    fn reject(&self, attempt: u32, cause: &'static str, reason: String) -> EngineError {
        metrics::counter!("stream_backpressure_total", "cause" => cause).increment(1);
        EngineError::CapacityExceeded {
            retry_after: self.policy.delay(attempt),
            attempt,
            reason,
        }
    }

    /// Admit one event or signal backpressure. Admitted events count toward the rate.
    pub fn admit(&self, now: DateTime<Utc>, attempt: u32) -> EngineResult<()> {
        let occupancy = self.occupancy();
        if occupancy >= self.occupancy_threshold {
            return Err(self.reject(
                attempt,
                "occupancy",
                format!(
                    "buffer occupancy {:.1}% at or above {:.0}%",
                    occupancy * 100.0,
                    self.occupancy_threshold * 100.0
                ),
            ));
        }

        let ceiling = self.rate_threshold * self.max_events_per_sec as f64;
        let mut rate = self.rate.lock();
        let second = now.timestamp();
        if rate.0 != second {
            *rate = (second, 0);
        }
        if rate.1 as f64 >= ceiling {
            return Err(self.reject(
                attempt,
                "rate",
                format!("ingest rate at ceiling of {ceiling:.0} events/s"),
            ));
        }
        rate.1 += 1;
        Ok(())
    }

    fn hold(&self, n: usize) {
        self.buffered.fetch_add(n, Ordering::Relaxed);
        metrics::gauge!("stream_buffered_events").set(self.buffered() as f64);
    }

    fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let _ = self
            .buffered
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| Some(b.saturating_sub(n)));
        metrics::gauge!("stream_buffered_events").set(self.buffered() as f64);
    }
}

#[derive(Debug)]
struct EntityWindows {
    /// Sorted by `at`; every event is at or after `next_start`.
    events: VecDeque<StreamEvent>,
    /// Start of the earliest window not yet closed (ms since epoch).
    next_start: i64,
    /// Latest event already emitted by a forced flush; anything earlier is late.
    flushed_through: i64,
    last_update: DateTime<Utc>,
    last_features: Option<FeatureSet>,
}

fn ms_to_time(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl EntityWindows {
    fn new(next_start: i64, now: DateTime<Utc>) -> Self {
        Self {
            events: VecDeque::new(),
            next_start,
            flushed_through: i64::MIN,
            last_update: now,
            last_features: None,
        }
    }

    /// Close every window ending at or before `limit_ms`. Returns the
    /// aggregates and how many events left the buffer.
    fn close_through(
        &mut self,
        entity_id: &str,
        spec: &WindowSpec,
        limit_ms: i64,
        now: DateTime<Utc>,
    ) -> (Vec<WindowAggregate>, usize) {
        let size = spec.size_ms();
        let hop = spec.hop_ms().max(1);
        let before = self.events.len();
        let mut out = Vec::new();

        while let Some(first) = self.events.front() {
            // skip runs of empty windows
            let earliest = spec.earliest_start(first.at.timestamp_millis());
            if earliest > self.next_start {
                self.next_start = earliest;
            }
            let end = self.next_start + size;
            if end > limit_ms {
                break;
            }
            let in_window: Vec<&StreamEvent> = self
                .events
                .iter()
                .take_while(|e| e.at.timestamp_millis() < end)
                .collect();
            if !in_window.is_empty() {
                let agg = self.aggregate(entity_id, &in_window, self.next_start, end, now);
                self.last_features = Some(agg.features.clone());
                out.push(agg);
            }
            self.next_start += hop;
            while self
                .events
                .front()
                .is_some_and(|e| e.at.timestamp_millis() < self.next_start)
            {
                self.events.pop_front();
            }
        }
        (out, before - self.events.len())
    }

    /// After a forced flush, reopen the windows still running at `now` so
    /// in-order events keep flowing into them.
    fn reopen(&mut self, spec: &WindowSpec, flushed_through: i64, now_ms: i64) {
        self.flushed_through = self.flushed_through.max(flushed_through);
        let open = spec.earliest_start(flushed_through.max(now_ms));
        if open < self.next_start {
            self.next_start = open;
        }
    }

    /// Events timestamped before this instant are late.
    fn late_before(&self) -> i64 {
        self.next_start.max(self.flushed_through)
    }

    fn aggregate(
        &self,
        entity_id: &str,
        events: &[&StreamEvent],
        start: i64,
        end: i64,
        now: DateTime<Utc>,
    ) -> WindowAggregate {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut net_delta = 0i64;
        let mut abs_delta = 0u64;
        for e in events {
            *counts.entry(e.kind.clone()).or_insert(0) += 1;
            net_delta = net_delta.saturating_add(e.content_delta);
            abs_delta = abs_delta.saturating_add(e.content_delta.unsigned_abs());
        }
        let gaps: Vec<i64> = events
            .windows(2)
            .map(|w| w[1].at.timestamp_millis() - w[0].at.timestamp_millis())
            .collect();

        let last_at = events.last().map(|e| e.at);
        let mut features = events
            .iter()
            .rev()
            .find_map(|e| e.features.clone())
            .or_else(|| self.last_features.clone())
            .unwrap_or_else(|| FeatureSet::empty(now));
        let end_time = ms_to_time(end);
        features.observed_at = end_time.min(now);
        if let Some(at) = last_at {
            features.modified_at = Some(at);
        }

        WindowAggregate {
            entity_id: entity_id.to_string(),
            start: ms_to_time(start),
            end: end_time,
            event_count: events.len(),
            counts,
            net_delta,
            abs_delta,
            mean_gap_ms: if gaps.is_empty() {
                None
            } else {
                Some(gaps.iter().sum::<i64>() as f64 / gaps.len() as f64)
            },
            max_gap_ms: gaps.iter().copied().max(),
            features,
        }
    }
}

pub struct StreamWindowAggregator {
    params: StreamParams,
    buffers: DashMap<String, Arc<Mutex<EntityWindows>>>,
    backpressure: Backpressure,
}

impl std::fmt::Debug for StreamWindowAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWindowAggregator")
            .field("window", &self.params.window)
            .field("entities", &self.buffers.len())
            .field("buffered", &self.backpressure.buffered())
            .finish()
    }
}

impl StreamWindowAggregator {
    pub fn new(params: StreamParams) -> Self {
        Self {
            backpressure: Backpressure::new(&params),
            params,
            buffers: DashMap::new(),
        }
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn backpressure(&self) -> &Backpressure {
        &self.backpressure
    }

    pub fn buffered_events(&self) -> usize {
        self.backpressure.buffered()
    }

    pub fn active_entities(&self) -> usize {
        self.buffers.len()
    }

    /// Buffer one event. `attempt` only shapes the advised retry delay.
    pub fn ingest_at(&self, entity_id: &str, event: StreamEvent, now: DateTime<Utc>, attempt: u32) -> EngineResult<()> {
        let at_ms = event.at.timestamp_millis();
        let earliest = self.params.window.earliest_start(at_ms);
        let slot = self
            .buffers
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(EntityWindows::new(earliest, now))))
            .clone();

        let mut w = slot.lock();
        if at_ms < w.late_before() {
            debug!(target: "stream", entity_id = %short_id(entity_id), at = %event.at, "late event rejected");
            return Err(EngineError::invalid_state(
                entity_id,
                format!(
                    "event at {} precedes the open window starting {}",
                    event.at.to_rfc3339(),
                    ms_to_time(w.late_before()).to_rfc3339()
                ),
            ));
        }
        // late events never count toward the rate
        self.backpressure.admit(now, attempt)?;
        if w.events.is_empty() && earliest > w.next_start {
            w.next_start = earliest;
        }
        let pos = w.events.partition_point(|e| e.at <= event.at);
        w.events.insert(pos, event);
        w.last_update = now;
        drop(w);

        self.backpressure.hold(1);
        metrics::counter!("stream_events_total").increment(1);
        Ok(())
    }

    pub fn ingest(&self, entity_id: &str, event: StreamEvent) -> EngineResult<()> {
        self.ingest_at(entity_id, event, Utc::now(), 0)
    }

    /// Retry `CapacityExceeded` with the advised backoff, up to `max_attempts`.
    pub async fn ingest_with_retry(&self, entity_id: &str, event: StreamEvent, max_attempts: u32) -> EngineResult<()> {
        let mut attempt = 0u32;
        loop {
            match self.ingest_at(entity_id, event.clone(), Utc::now(), attempt) {
                Err(EngineError::CapacityExceeded { retry_after, .. }) if attempt + 1 < max_attempts.max(1) => {
                    debug!(target: "stream", entity_id = %short_id(entity_id), attempt, ?retry_after, "backpressure, retrying");
                    tokio::time::sleep(retry_after).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn close_entity(&self, entity_id: &str, slot: &Mutex<EntityWindows>, limit_ms: Option<i64>, now: DateTime<Utc>) -> Vec<WindowAggregate> {
        let spec = self.params.window;
        let mut w = slot.lock();
        let (out, drained) = match limit_ms {
            Some(limit) => w.close_through(entity_id, &spec, limit, now),
            None => {
                let Some(last) = w.events.back().map(|e| e.at.timestamp_millis()) else {
                    return Vec::new();
                };
                let closed = w.close_through(entity_id, &spec, last.saturating_add(spec.size_ms()), now);
                w.reopen(&spec, last, now.timestamp_millis());
                closed
            }
        };
        drop(w);
        self.backpressure.release(drained);
        if !out.is_empty() {
            metrics::counter!("stream_windows_closed_total").increment(out.len() as u64);
        }
        out
    }

    /// Close every window whose end has passed, for all entities.
    pub fn close_due(&self, now: DateTime<Utc>) -> Vec<WindowAggregate> {
        let slots: Vec<(String, Arc<Mutex<EntityWindows>>)> = self
            .buffers
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        let limit = now.timestamp_millis();
        let mut out = Vec::new();
        for (id, slot) in slots {
            out.extend(self.close_entity(&id, &slot, Some(limit), now));
        }
        out
    }

    /// Force-close every window holding buffered events for one entity.
    pub fn flush(&self, entity_id: &str, now: DateTime<Utc>) -> Vec<WindowAggregate> {
        let Some(slot) = self.buffers.get(entity_id).map(|r| r.value().clone()) else {
            return Vec::new();
        };
        self.close_entity(entity_id, &slot, None, now)
    }

    /// Drop buffers without an update for `ttl_secs`. Returns how many were dropped.
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::seconds(self.params.ttl_secs as i64);
        let stale: Vec<String> = self
            .buffers
            .iter()
            .filter(|r| r.value().lock().last_update + ttl < now)
            .map(|r| r.key().clone())
            .collect();
        let mut dropped = 0;
        for id in stale {
            if let Some((_, slot)) = self.buffers.remove(&id) {
                let pending = slot.lock().events.len();
                if pending > 0 {
                    warn!(target: "stream", entity_id = %short_id(&id), pending, "dropping stale window buffer");
                }
                self.backpressure.release(pending);
                dropped += 1;
            }
        }
        if dropped > 0 {
            metrics::counter!("stream_windows_gc_total").increment(dropped as u64);
            info!(target: "stream", dropped, "stale window buffers collected");
        }
        dropped
    }

    /// Stop windowing for an entity; buffered events are discarded.
    pub fn release(&self, entity_id: &str) -> bool {
        match self.buffers.remove(entity_id) {
            Some((_, slot)) => {
                self.backpressure.release(slot.lock().events.len());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let b = BackoffPolicy::default();
        let ms: Vec<u128> = (0..6).map(|a| b.delay(a).as_millis()).collect();
        assert_eq!(ms, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn window_validation() {
        assert!(WindowSpec::Tumbling { size_secs: 0 }.validate().is_err());
        assert!(WindowSpec::Hopping { size_secs: 10, hop_secs: 10 }.validate().is_err());
        assert!(WindowSpec::Hopping { size_secs: 10, hop_secs: 5 }.validate().is_ok());
        assert!(WindowSpec::Tumbling { size_secs: u64::MAX }.validate().is_err());
        assert!(WindowSpec::Hopping { size_secs: MAX_WINDOW_SECS + 1, hop_secs: 60 }
            .validate()
            .is_err());
        assert!(WindowSpec::Tumbling { size_secs: MAX_WINDOW_SECS }.validate().is_ok());
    }

    #[test]
    fn earliest_start_is_hop_aligned() {
        let tumbling = WindowSpec::Tumbling { size_secs: 60 };
        assert_eq!(tumbling.earliest_start(125_000), 120_000);
        assert_eq!(tumbling.earliest_start(120_000), 120_000);
        let hopping = WindowSpec::Hopping { size_secs: 60, hop_secs: 20 };
        // windows [80,140), [100,160), [120,180) hold t = 125s
        assert_eq!(hopping.earliest_start(125_000), 80_000);
    }

    #[test]
    fn occupancy_triggers_backpressure() {
        let params = StreamParams {
            max_buffered_events: 10,
            ..StreamParams::default()
        };
        let agg = StreamWindowAggregator::new(params);
        for i in 0..9 {
            agg.ingest_at("e", StreamEvent::new("edit", 1, t(i)), t(i), 0).unwrap();
        }
        match agg.ingest_at("e", StreamEvent::new("edit", 1, t(9)), t(9), 2) {
            Err(EngineError::CapacityExceeded { retry_after, attempt, .. }) => {
                assert_eq!(attempt, 2);
                assert_eq!(retry_after, Duration::from_millis(400));
            }
            other => panic!("expected backpressure, got {other:?}"),
        }
        assert_eq!(agg.buffered_events(), 9);
    }

    #[test]
    fn rate_ceiling_resets_each_second() {
        let params = StreamParams {
            max_events_per_sec: 10,
            ..StreamParams::default()
        };
        let bp = Backpressure::new(&params);
        for _ in 0..8 {
            bp.admit(t(0), 0).unwrap();
        }
        assert!(bp.admit(t(0), 0).is_err());
        assert!(bp.admit(t(1), 0).is_ok());
    }

    #[test]
    fn late_events_do_not_consume_rate() {
        let params = StreamParams {
            max_events_per_sec: 10,
            ..StreamParams::default()
        };
        let agg = StreamWindowAggregator::new(params);
        agg.ingest_at("e", StreamEvent::new("edit", 1, t(70)), t(70), 0).unwrap();
        for _ in 0..10 {
            let err = agg.ingest_at("e", StreamEvent::new("edit", 1, t(30)), t(70), 0).unwrap_err();
            assert!(matches!(err, EngineError::InvalidEntityState { .. }));
        }
        for _ in 0..7 {
            agg.ingest_at("e", StreamEvent::new("edit", 1, t(70)), t(70), 0).unwrap();
        }
        assert!(matches!(
            agg.ingest_at("e", StreamEvent::new("edit", 1, t(70)), t(70), 0),
            Err(EngineError::CapacityExceeded { .. })
        ));
        assert_eq!(agg.buffered_events(), 8);
    }
}
