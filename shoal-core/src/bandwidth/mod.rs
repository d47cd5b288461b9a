//! Throughput estimation.
//!
//! Two estimators observe the same byte flow. The approximator merges the
//! intervals of recent transfers; the calculators track "loading time" with
//! a nested start/stop counter and answer bandwidth over the last N seconds
//! of actual loading.

mod approximator;
mod calculator;

pub use approximator::{BandwidthApproximator, LoadProgress};
pub use calculator::BandwidthCalculator;

/// Calculators for all sources and for HTTP alone.
#[derive(Debug, Default)]
pub struct BandwidthCalculators {
    pub all: BandwidthCalculator,
    pub http: BandwidthCalculator,
}

impl BandwidthCalculators {
    pub fn new() -> Self {
        Self::default()
    }
}
