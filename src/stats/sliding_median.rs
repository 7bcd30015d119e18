//! Sliding median estimator.
//!
//! A bounded-window order statistic over a fixed array of capacity `2*N`.
//! The logical occupancy `[from, to)` starts centered and holds the samples
//! in sorted order. Insertions binary-search the half indicated by a
//! comparison with the midpoint element and shift that side by one slot;
//! when the window is full, an insertion evicts the element from the
//! opposite side. When a half runs out of slack, a compaction re-centers
//! the occupied region.
//!
//! Complexity: O(log N) search, O(N) worst-case shift.

/// Default window size (number of retained samples).
pub const DEFAULT_WINDOW: usize = 64;

/// Median over a fixed-size window of the most recent samples.
#[derive(Debug, Clone)]
pub struct SlidingMedian {
    /// Backing storage of capacity `2 * window`.
    buffer: Vec<f64>,
    /// Start of the occupied region (inclusive).
    from: usize,
    /// End of the occupied region (exclusive).
    to: usize,
    /// Maximum number of retained samples.
    window: usize,
}

impl SlidingMedian {
    /// Create an estimator with the default window of 64 samples.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Create an estimator retaining up to `window` samples (`window >= 2`).
    pub fn with_window(window: usize) -> Self {
        let window = window.max(2);
        let capacity = window * 2;
        Self {
            buffer: vec![0.0; capacity],
            from: capacity / 2,
            to: capacity / 2,
            window,
        }
    }

    /// Number of samples currently retained.
    pub fn len(&self) -> usize {
        self.to - self.from
    }

    /// Whether no samples have been inserted yet.
    pub fn is_empty(&self) -> bool {
        self.to == self.from
    }

    /// Current median estimate; 0 when empty.
    pub fn estimate(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.buffer[(self.from + self.to) / 2]
        }
    }

    /// Insert a sample, evicting across the midpoint once the window is full.
    pub fn insert(&mut self, x: f64) {
        if self.is_empty() {
            self.buffer[self.from] = x;
            self.to += 1;
            return;
        }

        let full = self.len() == self.window;
        let mid = self.buffer[(self.from + self.to) / 2];

        if x < mid {
            if self.from == 0 {
                self.recenter();
            }
            let pos = self.lower_bound(self.from, (self.from + self.to) / 2, x);
            // Shift the left side one slot left and drop x in the gap.
            for i in self.from..pos {
                self.buffer[i - 1] = self.buffer[i];
            }
            self.from -= 1;
            self.buffer[pos - 1] = x;
            if full {
                self.to -= 1;
            }
        } else {
            if self.to == self.buffer.len() {
                self.recenter();
            }
            let pos = self.lower_bound((self.from + self.to) / 2, self.to, x);
            // Shift the right side one slot right and drop x in the gap.
            for i in (pos..self.to).rev() {
                self.buffer[i + 1] = self.buffer[i];
            }
            self.to += 1;
            self.buffer[pos] = x;
            if full {
                self.from += 1;
            }
        }
    }

    /// First index in `[lo, hi)` whose element is `>= x`.
    fn lower_bound(&self, mut lo: usize, mut hi: usize, x: f64) -> usize {
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.buffer[mid] < x {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Move the occupied region back to the center of the backing array.
    fn recenter(&mut self) {
        let len = self.len();
        let new_from = (self.buffer.len() - len) / 2;
        self.buffer.copy_within(self.from..self.to, new_from);
        self.from = new_from;
        self.to = new_from + len;
    }
}

impl Default for SlidingMedian {
    fn default() -> Self {
        Self::new()
    }
}
