//! Demand classification and queue generation.
//!
//! Pure functions of `(segments, Playback, windows)`: the same inputs always
//! yield the same queue.

mod queue;
mod windows;

pub use queue::{Queue, QueueItem, generate_queue};
pub use windows::{PlaybackStatuses, is_in_time_window, segment_playback_statuses};
