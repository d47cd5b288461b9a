//! Playback windows.

use crate::config::TimeWindowConfig;
use crate::stream::{Playback, Segment};

/// Demand tiers a segment falls into for the current playback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStatuses {
    pub is_high_demand: bool,
    pub is_http_downloadable: bool,
    pub is_p2p_downloadable: bool,
}

impl PlaybackStatuses {
    /// True when the segment is inside at least one window.
    pub fn is_actual(&self) -> bool {
        self.is_high_demand || self.is_http_downloadable || self.is_p2p_downloadable
    }
}

/// Half-open intersection of `[start, end)` with
/// `[position, position + rate * window)`.
pub fn is_in_time_window(segment: &Segment, playback: &Playback, window: f64) -> bool {
    let window_end = playback.position + playback.rate * window;
    segment.start_time < window_end && segment.end_time > playback.position
}

pub fn segment_playback_statuses(
    segment: &Segment,
    playback: &Playback,
    windows: &TimeWindowConfig,
) -> PlaybackStatuses {
    PlaybackStatuses {
        is_high_demand: is_in_time_window(segment, playback, windows.high_demand),
        is_http_downloadable: is_in_time_window(segment, playback, windows.http_download),
        is_p2p_downloadable: is_in_time_window(segment, playback, windows.p2p_download),
    }
}
