//! Re-enqueue (retry) filter.
//!
//! Wraps requests in a proxy stream. A terminal REJECTED, CANCELED, or
//! connection error re-issues the request on the same inner socket, bounded
//! by a per-request attempt cap and an adaptive rate cap: an EWMA of the
//! reenqueue rate shrinks the effective cap as retries become frequent, so
//! a misbehaving peer cannot trigger a retry storm.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::metrics::{noop_recorder, Counter, MetricsRecorder};
use crate::protocol::Payload;
use crate::socket::{BoxFuture, CancelHandle, RSocket, Response};
use crate::stats::SampleEwma;

/// Half-life of the reenqueue-rate EWMA, in samples.
const RATE_HALF_LIFE_SAMPLES: f64 = 50.0;

/// Options for [`ReEnqueueFilter`].
#[derive(Debug, Clone)]
pub struct ReEnqueueOptions {
    /// Hard cap on reenqueues per request.
    pub max_reenqueue: u32,
    /// Target ceiling on the fraction of terminals that are reenqueues.
    pub max_reenqueue_rate: f64,
}

impl Default for ReEnqueueOptions {
    fn default() -> Self {
        Self {
            max_reenqueue: 3,
            max_reenqueue_rate: 0.05,
        }
    }
}

/// Decorator retrying idempotent failures with adaptive rate limiting.
pub struct ReEnqueueFilter {
    inner: Arc<dyn RSocket>,
    rate: Arc<Mutex<SampleEwma>>,
    options: ReEnqueueOptions,
    reenqueues: Arc<dyn Counter>,
}

impl ReEnqueueFilter {
    pub fn new(inner: Arc<dyn RSocket>, options: ReEnqueueOptions) -> Self {
        Self::with_metrics(inner, options, &noop_recorder())
    }

    pub fn with_metrics(
        inner: Arc<dyn RSocket>,
        options: ReEnqueueOptions,
        metrics: &Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            inner,
            rate: Arc::new(Mutex::new(SampleEwma::new(RATE_HALF_LIFE_SAMPLES, 0.0))),
            options,
            reenqueues: metrics.counter("reenqueue.count"),
        }
    }

    /// Current reenqueue rate estimate.
    pub fn reenqueue_rate(&self) -> f64 {
        self.rate.lock().expect("lock poisoned").value()
    }
}

/// Reenqueues permitted right now, after the rate cap.
///
/// Integer truncation matters: once the observed rate exceeds the ceiling,
/// the budget collapses to zero rather than lingering at one.
fn effective_max(options: &ReEnqueueOptions, rate: f64) -> u32 {
    if rate <= 0.0 {
        return options.max_reenqueue;
    }
    let by_rate = (options.max_reenqueue_rate / rate) as u32;
    options.max_reenqueue.min(by_rate)
}

impl RSocket for ReEnqueueFilter {
    fn request(&self, request: Payload) -> Response {
        let inner = Arc::clone(&self.inner);
        let rate = Arc::clone(&self.rate);
        let reenqueues = Arc::clone(&self.reenqueues);
        let options = self.options.clone();
        let proxy = CancelHandle::new();
        let proxy_inner = proxy.clone();

        Response::from_future(proxy, async move {
            let mut attempts: u32 = 0;
            loop {
                // Rebind the proxy stream to a fresh inner stream.
                let response = inner.request(request.clone());
                let inner_cancel = response.cancel_handle();

                let outcome = tokio::select! {
                    outcome = response => outcome,
                    _ = proxy_inner.cancelled() => {
                        inner_cancel.cancel();
                        return Err(crate::error::RSocketError::Canceled(
                            "Cancelled by caller".to_string(),
                        ));
                    }
                };

                match outcome {
                    Ok(payload) => {
                        rate.lock().expect("lock poisoned").insert(0.0);
                        return Ok(payload);
                    }
                    Err(err) if err.is_retryable() => {
                        let current = rate.lock().expect("lock poisoned").value();
                        if attempts < effective_max(&options, current) {
                            attempts += 1;
                            rate.lock().expect("lock poisoned").insert(1.0);
                            reenqueues.increment();
                            debug!(attempts, "reenqueueing request: {err}");
                            continue;
                        }
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                }
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RSocketError;
    use crate::metrics::AggregatingRecorder;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fails the first `failures` requests with REJECTED, then succeeds.
    struct RejectingSocket {
        failures: u64,
        seen: AtomicU64,
    }

    impl RejectingSocket {
        fn new(failures: u64) -> Self {
            Self {
                failures,
                seen: AtomicU64::new(0),
            }
        }
    }

    impl RSocket for RejectingSocket {
        fn request(&self, request: Payload) -> Response {
            let attempt = self.seen.fetch_add(1, Ordering::AcqRel);
            let fail = attempt < self.failures;
            Response::from_future(CancelHandle::new(), async move {
                if fail {
                    Err(RSocketError::Rejected("busy".to_string()))
                } else {
                    Ok(request)
                }
            })
        }

        fn availability(&self) -> f64 {
            1.0
        }

        fn close(&self) -> BoxFuture<()> {
            Box::pin(async {})
        }

        fn closed(&self) -> BoxFuture<()> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn test_retries_idempotent_failures() {
        let inner = Arc::new(RejectingSocket::new(2));
        let filter = ReEnqueueFilter::new(inner.clone(), ReEnqueueOptions::default());

        let response = filter.request(Payload::from_str(None, Some("x"))).await;
        assert!(response.is_ok());
        // Two rejections plus the success.
        assert_eq!(inner.seen.load(Ordering::Acquire), 3);
    }

    #[tokio::test]
    async fn test_attempt_cap_is_honored() {
        let inner = Arc::new(RejectingSocket::new(u64::MAX));
        let options = ReEnqueueOptions {
            max_reenqueue: 2,
            max_reenqueue_rate: 1.0,
        };
        let filter = ReEnqueueFilter::new(inner.clone(), options);

        let response = filter.request(Payload::empty()).await;
        assert!(matches!(response, Err(RSocketError::Rejected(_))));
        // Initial attempt plus two reenqueues.
        assert_eq!(inner.seen.load(Ordering::Acquire), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_pass_through() {
        struct AppErrorSocket;
        impl RSocket for AppErrorSocket {
            fn request(&self, _request: Payload) -> Response {
                Response::ready_err(RSocketError::Application("boom".to_string()))
            }
            fn availability(&self) -> f64 {
                1.0
            }
            fn close(&self) -> BoxFuture<()> {
                Box::pin(async {})
            }
            fn closed(&self) -> BoxFuture<()> {
                Box::pin(std::future::pending())
            }
        }

        let filter = ReEnqueueFilter::new(Arc::new(AppErrorSocket), ReEnqueueOptions::default());
        let response = filter.request(Payload::empty()).await;
        assert!(matches!(response, Err(RSocketError::Application(_))));
    }

    #[tokio::test]
    async fn test_rate_cap_suppresses_retry_storm() {
        let recorder = Arc::new(AggregatingRecorder::new());
        let metrics = recorder.clone() as Arc<dyn MetricsRecorder>;
        let inner = Arc::new(RejectingSocket::new(u64::MAX));
        let options = ReEnqueueOptions {
            max_reenqueue: 2,
            max_reenqueue_rate: 0.05,
        };
        let filter = ReEnqueueFilter::with_metrics(inner, options, &metrics);

        for _ in 0..100 {
            let response = filter.request(Payload::empty()).await;
            // Every request terminates, even when the budget is gone.
            assert!(response.is_err());
        }

        // The rate cap chokes retries long before the per-request cap
        // would allow 200 of them.
        let reenqueued = recorder.snapshot().counters["reenqueue.count"];
        assert!(reenqueued < 25, "reenqueued {reenqueued} times");
    }

    #[test]
    fn test_effective_max_truncates() {
        let options = ReEnqueueOptions {
            max_reenqueue: 3,
            max_reenqueue_rate: 0.05,
        };
        assert_eq!(effective_max(&options, 0.0), 3);
        assert_eq!(effective_max(&options, 0.01), 3);
        assert_eq!(effective_max(&options, 0.03), 1);
        // Rate above the ceiling: no budget at all.
        assert_eq!(effective_max(&options, 0.06), 0);
        assert_eq!(effective_max(&options, 0.9), 0);
    }

    #[tokio::test]
    async fn test_successes_decay_the_rate() {
        let inner = Arc::new(RejectingSocket::new(3));
        let filter = ReEnqueueFilter::new(inner, ReEnqueueOptions::default());

        let _ = filter.request(Payload::empty()).await;
        let after_failures = filter.reenqueue_rate();
        assert!(after_failures > 0.0);

        for _ in 0..20 {
            filter.request(Payload::empty()).await.unwrap();
        }
        assert!(filter.reenqueue_rate() < after_failures);
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_inner_attempt() {
        struct StuckSocket;
        impl RSocket for StuckSocket {
            fn request(&self, _request: Payload) -> Response {
                Response::from_future(CancelHandle::new(), async {
                    std::future::pending::<()>().await;
                    unreachable!()
                })
            }
            fn availability(&self) -> f64 {
                1.0
            }
            fn close(&self) -> BoxFuture<()> {
                Box::pin(async {})
            }
            fn closed(&self) -> BoxFuture<()> {
                Box::pin(std::future::pending())
            }
        }

        let filter = ReEnqueueFilter::new(Arc::new(StuckSocket), ReEnqueueOptions::default());
        let response = filter.request(Payload::empty());
        let handle = response.cancel_handle();

        let task = tokio::spawn(response);
        tokio::task::yield_now().await;
        handle.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(RSocketError::Canceled(_))));
    }
}
