//! Rolling bandwidth approximation over recent transfer intervals.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples older than this (by last chunk) are discarded.
const SMOOTH_INTERVAL: Duration = Duration::from_secs(15);

/// Byte progress of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    pub started_at: Instant,
    pub last_chunk_at: Instant,
    pub loaded_bytes: u64,
}

impl LoadProgress {
    pub fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            last_chunk_at: started_at,
            loaded_bytes: 0,
        }
    }

    pub fn add_chunk(&mut self, bytes: u64, now: Instant) {
        self.loaded_bytes += bytes;
        self.last_chunk_at = now;
    }
}

/// Aggregate bandwidth of recent attempts with overlapping intervals merged.
///
/// Two simultaneous downloads share wall-clock time, so their bytes are
/// divided by the union of their intervals rather than the sum.
#[derive(Debug)]
pub struct BandwidthApproximator {
    samples: VecDeque<(u64, LoadProgress)>,
    smooth_interval: Duration,
}

impl Default for BandwidthApproximator {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthApproximator {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            smooth_interval: SMOOTH_INTERVAL,
        }
    }

    /// Inserts or replaces the progress of attempt `attempt_id`.
    pub fn record(&mut self, attempt_id: u64, progress: LoadProgress) {
        match self.samples.iter_mut().find(|(id, _)| *id == attempt_id) {
            Some((_, sample)) => *sample = progress,
            None => self.samples.push_back((attempt_id, progress)),
        }
    }

    /// Bits per second over the merged intervals of recent samples.
    pub fn bandwidth(&mut self, now: Instant) -> f64 {
        self.prune(now);

        let mut intervals: Vec<(Instant, Instant, u64)> = self
            .samples
            .iter()
            .map(|(_, p)| (p.started_at, p.last_chunk_at.max(p.started_at), p.loaded_bytes))
            .collect();
        intervals.sort_by_key(|(start, _, _)| *start);

        let total_bytes: u64 = intervals.iter().map(|(_, _, bytes)| bytes).sum();
        let merged = merged_duration(intervals.iter().map(|(start, end, _)| (*start, *end)));

        if merged.is_zero() {
            return 0.0;
        }
        (total_bytes * 8) as f64 / merged.as_secs_f64()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.smooth_interval) else {
            return;
        };
        self.samples
            .retain(|(_, progress)| progress.last_chunk_at >= cutoff);
    }
}

/// Total length of the union of intervals sorted by start.
fn merged_duration(sorted: impl Iterator<Item = (Instant, Instant)>) -> Duration {
    let mut total = Duration::ZERO;
    let mut current: Option<(Instant, Instant)> = None;

    for (start, end) in sorted {
        current = match current {
            Some((cur_start, cur_end)) if start <= cur_end => Some((cur_start, cur_end.max(end))),
            Some((cur_start, cur_end)) => {
                total += cur_end - cur_start;
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((start, end)) = current {
        total += end - start;
    }
    total
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn progress(base: Instant, start_ms: u64, end_ms: u64, bytes: u64) -> LoadProgress {
        LoadProgress {
            started_at: base + Duration::from_millis(start_ms),
            last_chunk_at: base + Duration::from_millis(end_ms),
            loaded_bytes: bytes,
        }
    }

    #[test]
    fn test_overlapping_samples_use_merged_duration() {
        let base = Instant::now();
        let mut approximator = BandwidthApproximator::new();
        approximator.record(1, progress(base, 0, 1000, 1000));
        approximator.record(2, progress(base, 500, 1500, 1000));

        // 2000 bytes over 1.5 merged seconds
        let bps = approximator.bandwidth(base + Duration::from_millis(1500));
        assert!((bps - 2000.0 * 8.0 / 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_record_replaces_existing_attempt() {
        let base = Instant::now();
        let mut approximator = BandwidthApproximator::new();
        approximator.record(7, progress(base, 0, 500, 100));
        approximator.record(7, progress(base, 0, 1000, 1000));

        assert_eq!(approximator.sample_count(), 1);
        let bps = approximator.bandwidth(base + Duration::from_secs(1));
        assert!((bps - 8000.0).abs() < 1e-6);
    }

    #[test]
    fn test_stale_samples_are_discarded() {
        let base = Instant::now();
        let mut approximator = BandwidthApproximator::new();
        approximator.record(1, progress(base, 0, 1000, 1000));

        assert_eq!(approximator.bandwidth(base + Duration::from_secs(30)), 0.0);
        assert_eq!(approximator.sample_count(), 0);
    }

    proptest! {
        #[test]
        fn test_merged_estimate_never_exceeds_naive_sum(
            spans in prop::collection::vec((0u64..5000, 1u64..5000, 1u64..1_000_000), 1..8)
        ) {
            let base = Instant::now();
            let mut approximator = BandwidthApproximator::new();
            let mut naive = 0.0;
            let mut latest = 0;
            for (index, (start, length, bytes)) in spans.iter().enumerate() {
                let end = start + length;
                latest = latest.max(end);
                approximator.record(index as u64, progress(base, *start, end, *bytes));
                naive += (*bytes * 8) as f64 / (*length as f64 / 1000.0);
            }

            let merged = approximator.bandwidth(base + Duration::from_millis(latest));
            prop_assert!(merged > 0.0);
            prop_assert!(merged <= naive * (1.0 + 1e-9));
        }
    }
}
