//! Lease accounting.
//!
//! A server-granted lease is a request budget valid for a TTL. The state is
//! shared between the connection's dispatch loop (grants) and the request
//! path (spends), so it is tracked with atomics rather than a lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Budget and expiry of the most recent lease.
#[derive(Debug)]
pub struct LeaseState {
    /// Remaining request budget; spent down to 0.
    budget: AtomicU32,
    /// Expiry as microseconds since `base`.
    expiry_micros: AtomicU64,
    /// Whether any lease has been granted yet.
    granted: AtomicBool,
    /// Reference point for expiry arithmetic.
    base: Instant,
}

impl LeaseState {
    /// Create an empty state: no budget until the first grant.
    pub fn new() -> Self {
        Self {
            budget: AtomicU32::new(0),
            expiry_micros: AtomicU64::new(0),
            granted: AtomicBool::new(false),
            base: Instant::now(),
        }
    }

    /// Apply a LEASE frame: replace the budget and push out the expiry.
    pub fn grant(&self, budget: u32, ttl: Duration) {
        let expiry = Instant::now() + ttl;
        let micros = expiry.saturating_duration_since(self.base).as_micros() as u64;
        self.budget.store(budget, Ordering::Release);
        self.expiry_micros.store(micros, Ordering::Release);
        self.granted.store(true, Ordering::Release);
    }

    /// Spend one unit of budget (saturating at 0).
    pub fn use_one(&self) {
        let _ = self
            .budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |budget| {
                Some(budget.saturating_sub(1))
            });
    }

    /// Remaining budget.
    pub fn remaining(&self) -> u32 {
        self.budget.load(Ordering::Acquire)
    }

    /// Whether the lease currently admits requests.
    pub fn is_valid(&self) -> bool {
        if !self.granted.load(Ordering::Acquire) {
            return false;
        }
        if self.remaining() == 0 {
            return false;
        }
        let now_micros = Instant::now().saturating_duration_since(self.base).as_micros() as u64;
        now_micros < self.expiry_micros.load(Ordering::Acquire)
    }
}

impl Default for LeaseState {
    fn default() -> Self {
        Self::new()
    }
}
