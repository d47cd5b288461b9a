//! Queue generation from the last requested segment forward.

use std::collections::HashSet;
use std::sync::Arc;

use super::windows::{PlaybackStatuses, segment_playback_statuses};
use crate::config::TimeWindowConfig;
use crate::stream::{Playback, Segment, Stream};

/// Segment to fetch and the tiers it belongs to.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub segment: Arc<Segment>,
    pub statuses: PlaybackStatuses,
}

/// Ordered work list of one pass.
#[derive(Debug, Clone, Default)]
pub struct Queue {
    pub items: Vec<QueueItem>,
    /// Local ids of `items`
    pub segment_ids: HashSet<String>,
}

impl Queue {
    pub fn contains(&self, local_id: &str) -> bool {
        self.segment_ids.contains(local_id)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Walks `stream` from `last_requested` forward and classifies segments.
///
/// The walk stops at the first segment outside every window, except when
/// that is the first walked segment and its successor is high-demand: the
/// first segment is then kept and promoted to high-demand. Cached segments
/// advance the walk without being queued.
pub fn generate_queue(
    stream: &Stream,
    last_requested: &str,
    playback: &Playback,
    windows: &TimeWindowConfig,
    is_cached: impl Fn(&Segment) -> bool,
) -> Queue {
    let mut queue = Queue::default();
    let mut walk = stream.segments_from(last_requested).peekable();
    let mut is_first = true;

    while let Some(segment) = walk.next() {
        let mut statuses = segment_playback_statuses(segment, playback, windows);

        if !statuses.is_actual() {
            let next_is_high_demand = walk.peek().is_some_and(|next| {
                segment_playback_statuses(next, playback, windows).is_high_demand
            });
            if !is_first || !next_is_high_demand {
                break;
            }
            statuses.is_high_demand = true;
        }
        is_first = false;

        if is_cached(segment) {
            continue;
        }

        queue.segment_ids.insert(segment.local_id.clone());
        queue.items.push(QueueItem {
            segment: Arc::clone(segment),
            statuses,
        });
    }

    queue
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use url::Url;

    use super::*;
    use crate::stream::StreamId;

    fn stream(count: usize, duration: f64) -> Stream {
        let mut stream = Stream::new(StreamId::main(0));
        stream.append_segments((0..count).map(|index| {
            let url = Url::parse(&format!("https://cdn.example/{index}.ts")).unwrap();
            let start = index as f64 * duration;
            Segment::new(format!("s{index}"), index as i64, url, start, start + duration)
        }));
        stream
    }

    fn windows(high: f64, http: f64, p2p: f64) -> TimeWindowConfig {
        TimeWindowConfig {
            high_demand: high,
            http_download: http,
            p2p_download: p2p,
        }
    }

    fn ids(queue: &Queue) -> Vec<&str> {
        queue
            .items
            .iter()
            .map(|item| item.segment.local_id.as_str())
            .collect()
    }

    #[test]
    fn test_cached_segment_skipped_and_next_high_demand() {
        let stream = stream(10, 5.0);
        let queue = generate_queue(
            &stream,
            "s0",
            &Playback::default(),
            &windows(15.0, 15.0, 15.0),
            |segment| segment.local_id == "s0",
        );

        assert_eq!(ids(&queue), ["s1", "s2"]);
        assert!(queue.items[0].statuses.is_high_demand);
        assert!(!queue.contains("s0"));
    }

    #[test]
    fn test_walk_stops_at_first_segment_outside_windows() {
        let stream = stream(10, 4.0);
        let queue = generate_queue(
            &stream,
            "s1",
            &Playback::default(),
            &windows(4.0, 8.0, 16.0),
            |_| false,
        );

        // Windows reach 16s: s1..s3 are inside, s4 starts at 16
        assert_eq!(ids(&queue), ["s1", "s2", "s3"]);
        assert!(queue.items[0].statuses.is_http_downloadable);
        assert!(!queue.items[0].statuses.is_high_demand);
        assert!(queue.items[2].statuses.is_p2p_downloadable);
        assert!(!queue.items[2].statuses.is_http_downloadable);
    }

    #[test]
    fn test_played_first_segment_promoted_when_next_is_high_demand() {
        let stream = stream(5, 4.0);
        let playback = Playback {
            position: 4.0,
            rate: 1.0,
        };
        let queue = generate_queue(&stream, "s0", &playback, &windows(8.0, 8.0, 8.0), |_| false);

        assert_eq!(ids(&queue), ["s0", "s1", "s2"]);
        assert!(queue.items[0].statuses.is_high_demand);
        assert!(!queue.items[0].statuses.is_http_downloadable);
    }

    #[test]
    fn test_played_first_segment_without_high_demand_successor_ends_queue() {
        let stream = stream(5, 4.0);
        let playback = Playback {
            position: 12.0,
            rate: 1.0,
        };
        let queue = generate_queue(&stream, "s0", &playback, &windows(8.0, 8.0, 8.0), |_| false);

        assert!(queue.is_empty());
    }

    #[test]
    fn test_unknown_last_requested_yields_empty_queue() {
        let stream = stream(5, 4.0);
        let queue = generate_queue(
            &stream,
            "missing",
            &Playback::default(),
            &windows(8.0, 8.0, 8.0),
            |_| false,
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_is_deterministic_for_fixed_inputs() {
        let stream = stream(20, 2.0);
        let playback = Playback {
            position: 3.0,
            rate: 1.5,
        };
        let first = generate_queue(&stream, "s1", &playback, &windows(5.0, 10.0, 20.0), |_| false);
        let second = generate_queue(&stream, "s1", &playback, &windows(5.0, 10.0, 20.0), |_| false);

        assert_eq!(ids(&first), ids(&second));
    }

    proptest! {
        #[test]
        fn test_widening_a_window_never_removes_segments(
            position in 0.0f64..40.0,
            rate in 0.25f64..4.0,
            high in 0.0f64..20.0,
            http in 0.0f64..40.0,
            p2p in 0.0f64..80.0,
            extra in 0.0f64..30.0,
            start in 0usize..20,
        ) {
            let stream = stream(30, 3.0);
            let playback = Playback { position, rate };
            let last = format!("s{start}");
            let narrow = generate_queue(&stream, &last, &playback, &windows(high, http, p2p), |_| false);

            for wide in [
                windows(high + extra, http, p2p),
                windows(high, http + extra, p2p),
                windows(high, http, p2p + extra),
            ] {
                let widened = generate_queue(&stream, &last, &playback, &wide, |_| false);
                for id in &narrow.segment_ids {
                    prop_assert!(widened.contains(id));
                }
            }
        }
    }
}
