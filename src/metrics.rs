//! Metrics surface: counters, timers, histograms, and an aggregator.
//!
//! The core never reaches for process-wide state; components receive an
//! `Arc<dyn MetricsRecorder>` and request named instruments from it. The
//! default [`NoopRecorder`] discards everything; [`AggregatingRecorder`]
//! keeps lock-free counters and bounded sample buffers and materializes
//! serializable [`MetricsSnapshot`]s on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;

const SAMPLE_BUFFER_SIZE: usize = 1000;

/// Monotonically increasing event count.
pub trait Counter: Send + Sync {
    /// Add one.
    fn increment(&self);
    /// Add an arbitrary amount.
    fn add(&self, amount: u64);
}

/// Duration recorder with percentile aggregation.
pub trait Timer: Send + Sync {
    /// Record one duration sample.
    fn record(&self, elapsed: Duration);
}

/// Value recorder with percentile aggregation.
pub trait Histogram: Send + Sync {
    /// Record one value sample.
    fn record(&self, value: u64);
}

/// Source of named instruments.
pub trait MetricsRecorder: Send + Sync {
    fn counter(&self, name: &str) -> Arc<dyn Counter>;
    fn timer(&self, name: &str) -> Arc<dyn Timer>;
    fn histogram(&self, name: &str) -> Arc<dyn Histogram>;
}

/// Recorder that discards every sample.
#[derive(Debug, Default)]
pub struct NoopRecorder;

struct NoopInstrument;

impl Counter for NoopInstrument {
    fn increment(&self) {}
    fn add(&self, _amount: u64) {}
}

impl Timer for NoopInstrument {
    fn record(&self, _elapsed: Duration) {}
}

impl Histogram for NoopInstrument {
    fn record(&self, _value: u64) {}
}

impl MetricsRecorder for NoopRecorder {
    fn counter(&self, _name: &str) -> Arc<dyn Counter> {
        Arc::new(NoopInstrument)
    }

    fn timer(&self, _name: &str) -> Arc<dyn Timer> {
        Arc::new(NoopInstrument)
    }

    fn histogram(&self, _name: &str) -> Arc<dyn Histogram> {
        Arc::new(NoopInstrument)
    }
}

/// Shared no-op recorder for components constructed without metrics.
pub fn noop_recorder() -> Arc<dyn MetricsRecorder> {
    Arc::new(NoopRecorder)
}

/// Ring buffer of the most recent samples.
///
/// Writes are lock-free; percentile reads scan the buffer.
struct SampleBuffer {
    samples: Vec<AtomicU64>,
    index: AtomicU64,
    count: AtomicU64,
}

impl SampleBuffer {
    fn new() -> Self {
        Self {
            samples: (0..SAMPLE_BUFFER_SIZE).map(|_| AtomicU64::new(0)).collect(),
            index: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn record(&self, value: u64) {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % SAMPLE_BUFFER_SIZE as u64;
        self.samples[idx as usize].store(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn distribution(&self) -> Distribution {
        let retained = (self.count.load(Ordering::Relaxed) as usize).min(SAMPLE_BUFFER_SIZE);
        let mut samples: Vec<u64> = self.samples[..retained]
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .collect();

        if samples.is_empty() {
            return Distribution::default();
        }

        samples.sort_unstable();
        let len = samples.len();
        Distribution {
            count: self.count.load(Ordering::Relaxed),
            avg: samples.iter().sum::<u64>() / len as u64,
            p50: samples[len * 50 / 100],
            p95: samples[(len * 95 / 100).min(len - 1)],
            p99: samples[(len * 99 / 100).min(len - 1)],
        }
    }
}

struct AtomicCounter(AtomicU64);

impl Counter for AtomicCounter {
    fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn add(&self, amount: u64) {
        self.0.fetch_add(amount, Ordering::Relaxed);
    }
}

struct BufferTimer(SampleBuffer);

impl Timer for BufferTimer {
    fn record(&self, elapsed: Duration) {
        self.0.record(elapsed.as_micros() as u64);
    }
}

struct BufferHistogram(SampleBuffer);

impl Histogram for BufferHistogram {
    fn record(&self, value: u64) {
        self.0.record(value);
    }
}

/// Aggregated view of one timer or histogram.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Distribution {
    /// Total samples recorded (including overwritten ones).
    pub count: u64,
    /// Mean over the retained window.
    pub avg: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

/// Serializable snapshot of every instrument the recorder has handed out.
///
/// Timer distributions are in microseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub timers: HashMap<String, Distribution>,
    pub histograms: HashMap<String, Distribution>,
}

/// Recorder that aggregates in memory and materializes snapshots.
///
/// Instrument creation takes a write lock; recording on an instrument is
/// lock-free. Share it across components with `Arc`.
#[derive(Default)]
pub struct AggregatingRecorder {
    counters: RwLock<HashMap<String, Arc<AtomicCounter>>>,
    timers: RwLock<HashMap<String, Arc<BufferTimer>>>,
    histograms: RwLock<HashMap<String, Arc<BufferHistogram>>>,
}

impl AggregatingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize the current values of every instrument.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .expect("metrics lock poisoned")
            .iter()
            .map(|(name, c)| (name.clone(), c.0.load(Ordering::Relaxed)))
            .collect();
        let timers = self
            .timers
            .read()
            .expect("metrics lock poisoned")
            .iter()
            .map(|(name, t)| (name.clone(), t.0.distribution()))
            .collect();
        let histograms = self
            .histograms
            .read()
            .expect("metrics lock poisoned")
            .iter()
            .map(|(name, h)| (name.clone(), h.0.distribution()))
            .collect();

        MetricsSnapshot {
            counters,
            timers,
            histograms,
        }
    }
}

impl MetricsRecorder for AggregatingRecorder {
    fn counter(&self, name: &str) -> Arc<dyn Counter> {
        let mut counters = self.counters.write().expect("metrics lock poisoned");
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicCounter(AtomicU64::new(0))))
            .clone()
    }

    fn timer(&self, name: &str) -> Arc<dyn Timer> {
        let mut timers = self.timers.write().expect("metrics lock poisoned");
        timers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BufferTimer(SampleBuffer::new())))
            .clone()
    }

    fn histogram(&self, name: &str) -> Arc<dyn Histogram> {
        let mut histograms = self.histograms.write().expect("metrics lock poisoned");
        histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BufferHistogram(SampleBuffer::new())))
            .clone()
    }
}
