//! Map from segment to its request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::{DownloadSource, Request};
use crate::bandwidth::BandwidthCalculators;
use crate::loader::LoaderError;
use crate::stream::{Segment, SegmentKey, StreamId};

/// Receives `(segment, generation)` when a request timer fires.
pub type RequestTimeoutNotifier = Arc<dyn Fn(SegmentKey, u64) + Send + Sync>;

/// Owns every request of a loader; at most one per segment.
pub struct RequestContainer {
    requests: HashMap<SegmentKey, Request>,
    notifier: RequestTimeoutNotifier,
}

impl RequestContainer {
    pub fn new(notifier: RequestTimeoutNotifier) -> Self {
        Self {
            requests: HashMap::new(),
            notifier,
        }
    }

    pub fn get(&self, key: &SegmentKey) -> Option<&Request> {
        self.requests.get(key)
    }

    pub fn get_mut(&mut self, key: &SegmentKey) -> Option<&mut Request> {
        self.requests.get_mut(key)
    }

    /// Returns the request of a segment, creating it on first need.
    pub fn get_or_create(&mut self, segment: &Arc<Segment>) -> &mut Request {
        let key = segment.key();
        let notifier = Arc::clone(&self.notifier);
        self.requests.entry(key.clone()).or_insert_with(|| {
            Request::new(
                Arc::clone(segment),
                Arc::new(move |generation: u64| notifier(key.clone(), generation)),
            )
        })
    }

    pub fn remove(&mut self, key: &SegmentKey) -> Option<Request> {
        self.requests.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SegmentKey, &Request)> {
        self.requests.iter()
    }

    pub fn keys(&self) -> Vec<SegmentKey> {
        self.requests.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn is_loading(&self, key: &SegmentKey) -> bool {
        self.requests.get(key).is_some_and(Request::is_loading)
    }

    pub fn executing_http_count(&self) -> usize {
        self.executing_count(DownloadSource::Http)
    }

    pub fn executing_p2p_count(&self) -> usize {
        self.executing_count(DownloadSource::P2p)
    }

    /// External ids of a stream's segments currently loading over HTTP.
    pub fn http_loading_external_ids(&self, stream: StreamId) -> Vec<i64> {
        self.requests
            .iter()
            .filter(|(key, request)| {
                key.stream == stream
                    && request.is_loading()
                    && request.current_source() == Some(DownloadSource::Http)
            })
            .map(|(_, request)| request.segment().external_id)
            .collect()
    }

    /// Aborts every request and resolves waiting callers with `Shutdown`.
    pub fn destroy(&mut self, bandwidth: &mut BandwidthCalculators, now: Instant) {
        for (_, mut request) in self.requests.drain() {
            if request.is_loading() {
                if let Err(error) = request.abort_from_queue(bandwidth, now) {
                    tracing::debug!(segment = %request.segment().key(), %error, "Request already settled");
                }
            }
            request.resolve_error(LoaderError::Shutdown);
        }
    }

    fn executing_count(&self, source: DownloadSource) -> usize {
        self.requests
            .values()
            .filter(|request| request.is_loading() && request.current_source() == Some(source))
            .count()
    }
}
