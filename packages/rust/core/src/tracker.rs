//! Sliding-window tracker for outbound model and embedding calls.
//!
//! Records can arrive from any thread. One mutex guards the recent-call
//! window and the cumulative counters; it is held only while pruning and
//! recording, never across the call being measured.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use docgraph_shared::TrackerConfig;
use serde::{Deserialize, Serialize};

/// Recent average latency this many times the cumulative average counts as throttled.
const LATENCY_SPIKE_FACTOR: f64 = 3.0;

/// Minimum window size before the latency heuristic applies.
const LATENCY_MIN_SAMPLES: usize = 5;

/// Kind of outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Embedding,
    Completion,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Completion => "completion",
        }
    }
}

/// One finished outbound call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub kind: CallKind,
    pub model: String,
    /// Texts embedded or mentions decided in this call.
    pub item_count: usize,
    pub stage: String,
    pub duration: Duration,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl CallRecord {
    pub fn new(kind: CallKind, model: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            item_count: 0,
            stage: stage.into(),
            duration: Duration::ZERO,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    pub fn items(mut self, item_count: usize) -> Self {
        self.item_count = item_count;
        self
    }

    pub fn took(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }
}

/// Cumulative totals for one call kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindTotals {
    pub calls: u64,
    pub items: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Point-in-time view of the tracker, as printed by `docgraph tracker`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub window_secs: u64,
    pub window_calls: usize,
    pub calls_per_minute: f64,
    pub items_per_second: f64,
    pub average_duration_ms: f64,
    pub throttled: bool,
    pub kinds: BTreeMap<String, KindTotals>,
    pub models: BTreeMap<String, u64>,
    pub stages: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct Inner {
    window: VecDeque<(Instant, CallRecord)>,
    kinds: HashMap<CallKind, KindTotals>,
    models: BTreeMap<String, u64>,
    stages: BTreeMap<String, u64>,
    total_calls: u64,
    total_duration: Duration,
}

static GLOBAL: OnceLock<CallTracker> = OnceLock::new();

/// Thread-safe call tracker.
#[derive(Debug)]
pub struct CallTracker {
    window: Duration,
    max_records: usize,
    throttle_calls_per_minute: f64,
    inner: Mutex<Inner>,
}

impl Default for CallTracker {
    fn default() -> Self {
        Self::new(&TrackerConfig::default())
    }
}

impl CallTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs.max(1)),
            max_records: config.max_window_records.max(1),
            throttle_calls_per_minute: config.throttle_calls_per_minute,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The process-wide tracker used by the model bridge.
    pub fn global() -> &'static CallTracker {
        GLOBAL.get_or_init(CallTracker::default)
    }

    /// Configure the process-wide tracker. Has no effect once it is in use.
    pub fn init_global(config: &TrackerConfig) -> &'static CallTracker {
        GLOBAL.get_or_init(|| CallTracker::new(config))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop entries that fell out of the window.
    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some((at, _)) = inner.window.front() {
            if now.saturating_duration_since(*at) > self.window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a finished call.
    pub fn record(&self, record: CallRecord) {
        self.record_at(Instant::now(), record);
    }

    pub(crate) fn record_at(&self, at: Instant, record: CallRecord) {
        let mut inner = self.lock();
        self.prune(&mut inner, at);

        let totals = inner.kinds.entry(record.kind).or_default();
        totals.calls += 1;
        totals.items += record.item_count as u64;
        totals.tokens_in += record.tokens_in;
        totals.tokens_out += record.tokens_out;
        *inner.models.entry(record.model.clone()).or_default() += 1;
        *inner.stages.entry(record.stage.clone()).or_default() += 1;
        inner.total_calls += 1;
        inner.total_duration += record.duration;

        if inner.window.len() >= self.max_records {
            inner.window.pop_front();
        }
        inner.window.push_back((at, record));
    }

    /// Run `f`, then record how long it took.
    pub fn time_call<T>(&self, record: CallRecord, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(record.took(start.elapsed()));
        out
    }

    /// Calls of `kind` (or of any kind) per minute over the window.
    pub fn calls_per_minute(&self, kind: Option<CallKind>) -> f64 {
        let mut inner = self.lock();
        self.prune(&mut inner, Instant::now());
        let calls = inner
            .window
            .iter()
            .filter(|(_, r)| kind.is_none_or(|k| r.kind == k))
            .count();
        calls as f64 * 60.0 / self.window.as_secs_f64()
    }

    /// Items (texts or mentions) per second over the window.
    pub fn items_per_second(&self) -> f64 {
        let mut inner = self.lock();
        self.prune(&mut inner, Instant::now());
        let items: usize = inner.window.iter().map(|(_, r)| r.item_count).sum();
        items as f64 / self.window.as_secs_f64()
    }

    /// Records currently inside the window.
    pub fn window_len(&self) -> usize {
        let mut inner = self.lock();
        self.prune(&mut inner, Instant::now());
        inner.window.len()
    }

    /// Whether the recent call pattern suggests the provider is throttling.
    ///
    /// True when the window's call rate exceeds the configured ceiling, or
    /// when recent calls are much slower than the long-run average.
    pub fn is_throttled(&self) -> bool {
        let mut inner = self.lock();
        self.prune(&mut inner, Instant::now());
        self.throttled_locked(&inner)
    }

    fn throttled_locked(&self, inner: &Inner) -> bool {
        let rate = inner.window.len() as f64 * 60.0 / self.window.as_secs_f64();
        if rate > self.throttle_calls_per_minute {
            return true;
        }
        if inner.window.len() < LATENCY_MIN_SAMPLES || inner.total_calls == 0 {
            return false;
        }
        let overall = inner.total_duration.as_secs_f64() / inner.total_calls as f64;
        let recent = inner
            .window
            .iter()
            .map(|(_, r)| r.duration.as_secs_f64())
            .sum::<f64>()
            / inner.window.len() as f64;
        overall > 0.0 && recent >= overall * LATENCY_SPIKE_FACTOR
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let mut inner = self.lock();
        self.prune(&mut inner, Instant::now());
        let window_secs = self.window.as_secs_f64();
        let items: usize = inner.window.iter().map(|(_, r)| r.item_count).sum();
        TrackerSnapshot {
            window_secs: self.window.as_secs(),
            window_calls: inner.window.len(),
            calls_per_minute: inner.window.len() as f64 * 60.0 / window_secs,
            items_per_second: items as f64 / window_secs,
            average_duration_ms: if inner.total_calls == 0 {
                0.0
            } else {
                inner.total_duration.as_secs_f64() * 1000.0 / inner.total_calls as f64
            },
            throttled: self.throttled_locked(&inner),
            kinds: inner
                .kinds
                .iter()
                .map(|(k, t)| (k.as_str().to_string(), t.clone()))
                .collect(),
            models: inner.models.clone(),
            stages: inner.stages.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(window_secs: u64, max: usize, ceiling: f64) -> TrackerConfig {
        TrackerConfig {
            window_secs,
            max_window_records: max,
            throttle_calls_per_minute: ceiling,
        }
    }

    fn embed(items: usize) -> CallRecord {
        CallRecord::new(CallKind::Embedding, "embed-small", "entity_clustering").items(items)
    }

    #[test]
    fn counts_calls_and_items() {
        let tracker = CallTracker::new(&config(60, 100, 1000.0));
        tracker.record(embed(10));
        tracker.record(embed(5));
        tracker.record(CallRecord::new(CallKind::Completion, "decider", "entity_resolution").items(3));

        assert_eq!(tracker.window_len(), 3);
        assert_eq!(tracker.calls_per_minute(Some(CallKind::Embedding)), 2.0);
        assert_eq!(tracker.calls_per_minute(None), 3.0);
        assert!((tracker.items_per_second() - 18.0 / 60.0).abs() < 1e-9);

        let snap = tracker.snapshot();
        assert_eq!(snap.kinds["embedding"].items, 15);
        assert_eq!(snap.kinds["completion"].calls, 1);
        assert_eq!(snap.stages["entity_clustering"], 2);
    }

    #[test]
    fn old_records_leave_the_window_but_stay_counted() {
        let tracker = CallTracker::new(&config(60, 100, 1000.0));
        let Some(old) = Instant::now().checked_sub(Duration::from_secs(120)) else {
            return;
        };
        tracker.record_at(old, embed(4));
        tracker.record(embed(1));

        assert_eq!(tracker.window_len(), 1);
        assert_eq!(tracker.snapshot().kinds["embedding"].calls, 2);
    }

    #[test]
    fn window_is_bounded() {
        let tracker = CallTracker::new(&config(60, 3, 1000.0));
        for _ in 0..10 {
            tracker.record(embed(1));
        }
        assert_eq!(tracker.window_len(), 3);
        assert_eq!(tracker.snapshot().kinds["embedding"].calls, 10);
    }

    #[test]
    fn rate_above_ceiling_is_throttled() {
        let tracker = CallTracker::new(&config(60, 100, 2.0));
        tracker.record(embed(1));
        tracker.record(embed(1));
        assert!(!tracker.is_throttled());
        tracker.record(embed(1));
        assert!(tracker.is_throttled());
    }

    #[test]
    fn latency_spike_is_throttled() {
        let tracker = CallTracker::new(&config(60, 100, 1000.0));
        let Some(old) = Instant::now().checked_sub(Duration::from_secs(300)) else {
            return;
        };
        for _ in 0..50 {
            tracker.record_at(old, embed(1).took(Duration::from_millis(10)));
        }
        for _ in 0..5 {
            tracker.record(embed(1).took(Duration::from_millis(500)));
        }
        assert!(tracker.is_throttled());
    }

    #[test]
    fn time_call_measures_the_closure() {
        let tracker = CallTracker::new(&config(60, 100, 1000.0));
        let out = tracker.time_call(embed(2), || {
            std::thread::sleep(Duration::from_millis(5));
            7
        });
        assert_eq!(out, 7);
        assert!(tracker.snapshot().average_duration_ms >= 5.0);
    }

    #[test]
    fn concurrent_recording() {
        let tracker = Arc::new(CallTracker::new(&config(60, 10_000, 1e9)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.record(embed(1));
                        let _ = tracker.calls_per_minute(None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.window_len(), 800);
        assert_eq!(tracker.snapshot().kinds["embedding"].items, 800);
    }
}
