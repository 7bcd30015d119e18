//! Latency-predicting socket decorator.
//!
//! Tracks in-flight requests and round-trip times for one socket and turns
//! them into a predicted latency the balancer can rank candidates by. The
//! predictor blends a sliding median of observed round trips with an
//! instantaneous load estimate derived from the `outstanding x elapsed`
//! integral, and decays stale predictions while the socket sits idle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::Payload;
use crate::socket::{BoxFuture, RSocket, Response};
use crate::stats::SlidingMedian;

/// Predicted latency (microseconds) for a socket that has in-flight
/// requests but no completed sample yet. Cold sockets rank pathologically
/// slow until their first round trip lands.
const STARTUP_PENALTY: f64 = 1_000_000_000.0;

/// Decay factor applied to the estimate after an idle period.
const INACTIVITY_DECAY: f64 = 0.8;

/// Options for [`WeightedSocket`].
#[derive(Debug, Clone)]
pub struct WeightedSocketOptions {
    /// Idle time after which the latency prediction decays.
    pub inactivity_period: Duration,
    /// Sliding median window (samples).
    pub window: usize,
}

impl Default for WeightedSocketOptions {
    fn default() -> Self {
        Self {
            inactivity_period: Duration::from_millis(1000),
            window: crate::stats::DEFAULT_WINDOW,
        }
    }
}

struct WeightedState {
    /// In-flight requests.
    outstanding: i64,
    /// Last send.
    stamp: Instant,
    /// Last activity (send or terminate).
    stamp0: Instant,
    /// Accumulated `outstanding x elapsed` integral, microseconds.
    duration: i64,
    /// Round-trip samples, microseconds.
    median: SlidingMedian,
    inactivity_period: Duration,
}

/// Decorator weighting one socket by observed latency and load.
pub struct WeightedSocket {
    inner: Arc<dyn RSocket>,
    state: Arc<Mutex<WeightedState>>,
}

impl WeightedSocket {
    pub fn new(inner: Arc<dyn RSocket>, options: WeightedSocketOptions) -> Self {
        let now = Instant::now();
        Self {
            inner,
            state: Arc::new(Mutex::new(WeightedState {
                outstanding: 0,
                stamp: now,
                stamp0: now,
                duration: 0,
                median: SlidingMedian::with_window(options.window),
                inactivity_period: options.inactivity_period,
            })),
        }
    }

    /// In-flight request count.
    pub fn outstanding(&self) -> i64 {
        self.state.lock().expect("lock poisoned").outstanding
    }

    /// Predicted latency in microseconds.
    ///
    /// - No samples, nothing in flight: 0, a first-request attractor.
    /// - No samples, requests in flight: startup penalty plus the backlog.
    /// - Idle past the inactivity period: the estimate decays by 0.8.
    /// - Otherwise: the median, raised by the instantaneous load estimate
    ///   when the backlog implies the socket is slower than its history.
    pub fn predicted_latency(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.state.lock().expect("lock poisoned");

        let estimate = state.median.estimate();
        if estimate == 0.0 {
            return if state.outstanding == 0 {
                0.0
            } else {
                STARTUP_PENALTY + state.outstanding as f64
            };
        }

        if state.outstanding == 0 {
            if now.saturating_duration_since(state.stamp) > state.inactivity_period {
                state.median.insert(estimate * INACTIVITY_DECAY);
                state.stamp = now;
                state.stamp0 = now;
                return state.median.estimate();
            }
            return estimate;
        }

        let elapsed = now.saturating_duration_since(state.stamp0).as_micros() as i64;
        let instantaneous = state.duration + elapsed * state.outstanding;
        estimate.max(instantaneous as f64 / state.outstanding as f64)
    }
}

impl RSocket for WeightedSocket {
    fn request(&self, request: Payload) -> Response {
        let start = Instant::now();
        {
            let mut state = self.state.lock().expect("lock poisoned");
            let elapsed = start.saturating_duration_since(state.stamp0).as_micros() as i64;
            state.duration += elapsed * state.outstanding;
            state.outstanding += 1;
            state.stamp = start;
            state.stamp0 = start;
        }

        let response = self.inner.request(request);
        let cancel = response.cancel_handle();
        let state = Arc::clone(&self.state);
        // Created before the future so a response dropped without ever being
        // polled still runs the terminate accounting.
        let guard = TerminateGuard {
            state: Arc::clone(&self.state),
            start,
        };

        Response::from_future(cancel, async move {
            let outcome = response.await;
            if outcome.is_ok() {
                let rtt = Instant::now().saturating_duration_since(start);
                state
                    .lock()
                    .expect("lock poisoned")
                    .median
                    .insert(rtt.as_micros() as f64);
            }
            drop(guard);
            outcome
        })
    }

    fn availability(&self) -> f64 {
        self.inner.availability()
    }

    fn close(&self) -> BoxFuture<()> {
        self.inner.close()
    }

    fn closed(&self) -> BoxFuture<()> {
        self.inner.closed()
    }
}

/// Terminate accounting; runs once per stream even when the caller drops
/// the response before a terminal outcome.
struct TerminateGuard {
    state: Arc<Mutex<WeightedState>>,
    start: Instant,
}

impl Drop for TerminateGuard {
    fn drop(&mut self) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("lock poisoned");
        let elapsed = now.saturating_duration_since(state.stamp0).as_micros() as i64;
        let since_start = now.saturating_duration_since(self.start).as_micros() as i64;
        state.duration += elapsed * state.outstanding - since_start;
        state.outstanding -= 1;
        state.stamp0 = now;
    }
}
