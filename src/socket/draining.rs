//! Graceful-drain socket decorator.
//!
//! Once close is requested the socket stops admitting requests
//! (`availability() == 0`) and defers the inner close until every
//! outstanding request terminates or a drain timeout elapses. The inner
//! close runs exactly once.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::error::RSocketError;
use crate::protocol::Payload;
use crate::socket::{BoxFuture, RSocket, Response};

/// Default time to wait for outstanding requests before forcing the close.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

struct DrainState {
    outstanding: AtomicI64,
    pending_close: AtomicBool,
    inner_closed: AtomicBool,
    drained: Notify,
}

/// Decorator deferring close until in-flight requests finish.
pub struct DrainingSocket {
    inner: Arc<dyn RSocket>,
    state: Arc<DrainState>,
    drain_timeout: Duration,
}

impl DrainingSocket {
    pub fn new(inner: Arc<dyn RSocket>) -> Self {
        Self::with_timeout(inner, DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn with_timeout(inner: Arc<dyn RSocket>, drain_timeout: Duration) -> Self {
        Self {
            inner,
            state: Arc::new(DrainState {
                outstanding: AtomicI64::new(0),
                pending_close: AtomicBool::new(false),
                inner_closed: AtomicBool::new(false),
                drained: Notify::new(),
            }),
            drain_timeout,
        }
    }

    /// In-flight request count.
    pub fn outstanding(&self) -> i64 {
        self.state.outstanding.load(Ordering::Acquire)
    }

    /// Whether close has been requested and requests are draining.
    pub fn is_draining(&self) -> bool {
        self.state.pending_close.load(Ordering::Acquire)
    }
}

impl RSocket for DrainingSocket {
    fn request(&self, request: Payload) -> Response {
        if self.state.pending_close.load(Ordering::Acquire) {
            return Response::ready_err(RSocketError::ConnectionClosed);
        }

        self.state.outstanding.fetch_add(1, Ordering::AcqRel);
        let response = self.inner.request(request);
        let cancel = response.cancel_handle();
        // Eager guard: a never-polled response must still drain.
        let guard = OutstandingGuard {
            state: Arc::clone(&self.state),
        };

        Response::from_future(cancel, async move {
            let outcome = response.await;
            drop(guard);
            outcome
        })
    }

    fn availability(&self) -> f64 {
        if self.state.pending_close.load(Ordering::Acquire) {
            0.0
        } else {
            self.inner.availability()
        }
    }

    fn close(&self) -> BoxFuture<()> {
        self.state.pending_close.store(true, Ordering::Release);
        let state = Arc::clone(&self.state);
        let inner = Arc::clone(&self.inner);
        let drain_timeout = self.drain_timeout;

        Box::pin(async move {
            let wait = async {
                loop {
                    let notified = state.drained.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if state.outstanding.load(Ordering::Acquire) == 0 {
                        return;
                    }
                    notified.await;
                }
            };
            if tokio::time::timeout(drain_timeout, wait).await.is_err() {
                debug!("drain timeout elapsed with requests outstanding");
            }

            if !state.inner_closed.swap(true, Ordering::AcqRel) {
                inner.close().await;
            }
        })
    }

    fn closed(&self) -> BoxFuture<()> {
        self.inner.closed()
    }
}

struct OutstandingGuard {
    state: Arc<DrainState>,
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        if self.state.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.drained.notify_waiters();
        }
    }
}
