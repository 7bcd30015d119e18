//! Latency and availability estimators.
//!
//! Small, allocation-free building blocks shared by the socket decorators:
//! a fixed-window sliding median and half-life EWMAs.

mod ewma;
mod sliding_median;

pub use ewma::{Ewma, SampleEwma};
pub use sliding_median::{SlidingMedian, DEFAULT_WINDOW};
