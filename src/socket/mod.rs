//! Socket contract and decorators.
//!
//! [`RSocket`] is the seam every layer shares: a bare connection, the
//! decorators in this module, and the load balancer itself all expose the
//! same trait, so chains compose as trait objects
//! (`reenqueue -> failure accrual -> weighted -> draining -> connection`).
//!
//! A request is a single terminal poll: [`Response`] resolves to exactly one
//! `Result<Payload, RSocketError>`, and a detached [`CancelHandle`] aborts
//! the exchange from outside the future.

mod draining;
mod failure_accrual;
mod reenqueue;
mod weighted;

pub use draining::{DrainingSocket, DEFAULT_DRAIN_TIMEOUT};
pub use failure_accrual::{FailureAccrualSocket, DEFAULT_FAILURE_WINDOW};
pub use reenqueue::{ReEnqueueFilter, ReEnqueueOptions};
pub use weighted::{WeightedSocket, WeightedSocketOptions};

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Notify;

use crate::error::{RSocketError, Result};
use crate::protocol::Payload;

/// Boxed future alias used across trait objects.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The contract between connections, decorators, and the load balancer.
pub trait RSocket: Send + Sync + 'static {
    /// Issue a request/response exchange.
    fn request(&self, request: Payload) -> Response;

    /// Instantaneous usability in `[0, 1]`.
    fn availability(&self) -> f64;

    /// Close the socket; resolves once the close has taken effect.
    fn close(&self) -> BoxFuture<()>;

    /// Resolves when the socket has fully closed (locally or remotely).
    fn closed(&self) -> BoxFuture<()>;
}

/// Cancellation handle detached from the [`Response`] future.
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    /// Create an un-cancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before the flag check so a concurrent cancel cannot slip
        // between the check and the await.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// The single terminal poll of a request/response exchange.
///
/// Resolves to exactly one `Result<Payload, RSocketError>`; the error kind
/// carries the wire taxonomy (application, rejected, canceled, timeout, ...).
pub struct Response {
    inner: BoxFuture<Result<Payload>>,
    cancel: CancelHandle,
}

impl Response {
    /// Wrap a future with its cancellation handle.
    pub fn new(cancel: CancelHandle, inner: BoxFuture<Result<Payload>>) -> Self {
        Self { inner, cancel }
    }

    /// Wrap a plain future with its cancellation handle.
    pub fn from_future<F>(cancel: CancelHandle, future: F) -> Self
    where
        F: Future<Output = Result<Payload>> + Send + 'static,
    {
        Self::new(cancel, Box::pin(future))
    }

    /// A pre-built failing response with an inert cancel handle.
    pub fn ready_err(err: RSocketError) -> Self {
        Self::from_future(CancelHandle::new(), async move { Err(err) })
    }

    /// Handle that cancels this exchange.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Future for Response {
    type Output = Result<Payload>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}
