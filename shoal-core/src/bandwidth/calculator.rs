//! Bandwidth over the last N seconds of loading time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Data older than this (wall clock) is dropped on every start and sample.
const STALE_THRESHOLD: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy)]
struct LoadingInterval {
    start: Instant,
    end: Option<Instant>,
}

impl LoadingInterval {
    fn end_or(&self, now: Instant) -> Instant {
        self.end.unwrap_or(now)
    }
}

/// Tracks merged loading intervals and the bytes received in them.
///
/// `start_loading` / `stop_loading` nest: an interval opens on the first
/// start and closes when the last concurrent loading stops.
#[derive(Debug)]
pub struct BandwidthCalculator {
    simultaneous_loadings: u32,
    intervals: VecDeque<LoadingInterval>,
    bytes: VecDeque<(Instant, u64)>,
    stale_threshold: Duration,
}

impl Default for BandwidthCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthCalculator {
    pub fn new() -> Self {
        Self {
            simultaneous_loadings: 0,
            intervals: VecDeque::new(),
            bytes: VecDeque::new(),
            stale_threshold: STALE_THRESHOLD,
        }
    }

    pub fn start_loading(&mut self, now: Instant) {
        self.clear_stale(now);
        if self.simultaneous_loadings == 0 {
            self.intervals.push_back(LoadingInterval {
                start: now,
                end: None,
            });
        }
        self.simultaneous_loadings += 1;
    }

    pub fn stop_loading(&mut self, now: Instant) {
        if self.simultaneous_loadings == 0 {
            tracing::debug!("stop_loading without matching start_loading");
            return;
        }
        self.simultaneous_loadings -= 1;
        if self.simultaneous_loadings > 0 {
            return;
        }
        if let Some(interval) = self.intervals.back_mut() {
            interval.end = Some(now);
        }
    }

    pub fn add_bytes(&mut self, bytes: u64, now: Instant) {
        self.clear_stale(now);
        self.bytes.push_back((now, bytes));
    }

    pub fn is_loading(&self) -> bool {
        self.simultaneous_loadings > 0
    }

    /// Bits per second over the last `window` of loading time.
    ///
    /// Walks intervals backwards from `now` until `window` of loading time
    /// is covered, then sums the bytes received inside that span.
    pub fn bandwidth_loading_only(&self, window: Duration, now: Instant) -> f64 {
        let mut covered = Duration::ZERO;
        let mut span_start = None;

        for interval in self.intervals.iter().rev() {
            let end = interval.end_or(now);
            let length = end.saturating_duration_since(interval.start);
            if covered + length >= window {
                let needed = window - covered;
                span_start = Some(end - needed);
                covered = window;
                break;
            }
            covered += length;
            span_start = Some(interval.start);
        }

        let Some(span_start) = span_start else {
            return 0.0;
        };
        if covered.is_zero() {
            return 0.0;
        }

        let bytes: u64 = self
            .bytes
            .iter()
            .rev()
            .take_while(|(at, _)| *at >= span_start)
            .map(|(_, bytes)| bytes)
            .sum();
        (bytes * 8) as f64 / covered.as_secs_f64()
    }

    /// Drops intervals and samples older than the stale threshold and
    /// trims the oldest kept interval to start no earlier than it.
    fn clear_stale(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.stale_threshold) else {
            return;
        };
        while self
            .intervals
            .front()
            .is_some_and(|interval| interval.end.is_some_and(|end| end < cutoff))
        {
            self.intervals.pop_front();
        }
        if let Some(oldest) = self.intervals.front_mut() {
            oldest.start = oldest.start.max(cutoff);
        }
        while self.bytes.front().is_some_and(|(at, _)| *at < cutoff) {
            self.bytes.pop_front();
        }
    }
}
