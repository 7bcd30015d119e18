//! Failure-accrual socket decorator.
//!
//! Success and failure outcomes feed a half-life EWMA; the decorated
//! availability is the EWMA scaled into the inner availability. After a
//! full effective window with no samples the EWMA snaps up by 0.5 so a
//! quarantined socket gets probed again.

use std::f64::consts::LN_2;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::Payload;
use crate::socket::{BoxFuture, RSocket, Response};
use crate::stats::Ewma;

/// Default accrual half-life.
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(30);

/// Availability floor; never fully zero so recovery probes can land.
const AVAILABILITY_EPSILON: f64 = 1e-4;

/// Decorator scaling availability by an EWMA of request outcomes.
pub struct FailureAccrualSocket {
    inner: Arc<dyn RSocket>,
    ewma: Arc<Mutex<Ewma>>,
    /// Effective window: `half_life / ln 2`.
    window: Duration,
}

impl FailureAccrualSocket {
    pub fn new(inner: Arc<dyn RSocket>) -> Self {
        Self::with_half_life(inner, DEFAULT_FAILURE_WINDOW)
    }

    pub fn with_half_life(inner: Arc<dyn RSocket>, half_life: Duration) -> Self {
        Self {
            inner,
            ewma: Arc::new(Mutex::new(Ewma::new(half_life, 1.0))),
            window: Duration::from_secs_f64(half_life.as_secs_f64() / LN_2),
        }
    }
}

impl RSocket for FailureAccrualSocket {
    fn request(&self, request: Payload) -> Response {
        let response = self.inner.request(request);
        let cancel = response.cancel_handle();
        // Records 0.0 exactly once unless a response lands first; this
        // covers error terminals and responses dropped mid-flight alike.
        let guard = AccrualGuard {
            ewma: Arc::clone(&self.ewma),
            armed: true,
        };

        Response::from_future(cancel, async move {
            let mut guard = guard;
            let outcome = response.await;
            if outcome.is_ok() {
                guard.armed = false;
                guard.ewma.lock().expect("lock poisoned").insert(1.0);
            }
            drop(guard);
            outcome
        })
    }

    fn availability(&self) -> f64 {
        let mut ewma = self.ewma.lock().expect("lock poisoned");
        if Instant::now().saturating_duration_since(ewma.last_update()) > self.window {
            // The window fully expired; allow a recovery probe.
            let snapped = (ewma.value() + 0.5).min(1.0);
            ewma.reset(snapped);
        }
        ewma.value().max(AVAILABILITY_EPSILON) * self.inner.availability()
    }

    fn close(&self) -> BoxFuture<()> {
        self.inner.close()
    }

    fn closed(&self) -> BoxFuture<()> {
        self.inner.closed()
    }
}

struct AccrualGuard {
    ewma: Arc<Mutex<Ewma>>,
    armed: bool,
}

impl Drop for AccrualGuard {
    fn drop(&mut self) {
        if self.armed {
            self.ewma.lock().expect("lock poisoned").insert(0.0);
        }
    }
}
