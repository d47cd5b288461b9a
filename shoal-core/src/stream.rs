//! Streams, segments and playback state.
//!
//! A `Stream` is one rendition track announced by the manifest adapter. Its
//! segments are immutable values shared as `Arc<Segment>` with requests,
//! the cache and peers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use url::Url;

/// Kind of rendition track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Main,
    Secondary,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Main => write!(f, "main"),
            StreamType::Secondary => write!(f, "secondary"),
        }
    }
}

/// Identity of a stream within a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub stream_type: StreamType,
    pub index: u32,
}

impl StreamId {
    pub fn new(stream_type: StreamType, index: u32) -> Self {
        Self { stream_type, index }
    }

    pub fn main(index: u32) -> Self {
        Self::new(StreamType::Main, index)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.stream_type, self.index)
    }
}

/// Key of a segment across all streams of a loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentKey {
    pub stream: StreamId,
    pub local_id: String,
}

impl SegmentKey {
    pub fn new(stream: StreamId, local_id: impl Into<String>) -> Self {
        Self {
            stream,
            local_id: local_id.into(),
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream, self.local_id)
    }
}

/// Inclusive byte range of a segment inside a larger resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Immutable description of one media segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub stream: StreamId,
    pub local_id: String,
    /// Protocol-visible id, usually the media sequence number
    pub external_id: i64,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    /// Seconds
    pub start_time: f64,
    /// Seconds
    pub end_time: f64,
}

impl Segment {
    pub fn new(
        local_id: impl Into<String>,
        external_id: i64,
        url: Url,
        start_time: f64,
        end_time: f64,
    ) -> Self {
        Self {
            stream: StreamId::main(0),
            local_id: local_id.into(),
            external_id,
            url,
            byte_range: None,
            start_time,
            end_time,
        }
    }

    pub fn with_byte_range(mut self, range: ByteRange) -> Self {
        self.byte_range = Some(range);
        self
    }

    pub fn key(&self) -> SegmentKey {
        SegmentKey::new(self.stream, self.local_id.clone())
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Ordered, insertion-ordered collection of segments of one rendition.
#[derive(Debug, Clone)]
pub struct Stream {
    id: StreamId,
    manifest_url: Option<Url>,
    segments: VecDeque<Arc<Segment>>,
}

impl Stream {
    pub fn new(id: StreamId) -> Self {
        Self {
            id,
            manifest_url: None,
            segments: VecDeque::new(),
        }
    }

    pub fn with_manifest_url(mut self, url: Url) -> Self {
        self.manifest_url = Some(url);
        self
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn manifest_url(&self) -> Option<&Url> {
        self.manifest_url.as_ref()
    }

    /// Appends segments, skipping local ids already present.
    pub fn append_segments(&mut self, segments: impl IntoIterator<Item = Segment>) {
        for mut segment in segments {
            if self.position(&segment.local_id).is_some() {
                continue;
            }
            segment.stream = self.id;
            self.segments.push_back(Arc::new(segment));
        }
    }

    /// Removes segments by local id, returning how many were present.
    pub fn remove_segments(&mut self, local_ids: &[String]) -> usize {
        let before = self.segments.len();
        self.segments
            .retain(|segment| !local_ids.contains(&segment.local_id));
        before - self.segments.len()
    }

    pub fn segment(&self, local_id: &str) -> Option<&Arc<Segment>> {
        self.segments
            .iter()
            .find(|segment| segment.local_id == local_id)
    }

    pub fn segment_by_external_id(&self, external_id: i64) -> Option<&Arc<Segment>> {
        self.segments
            .iter()
            .find(|segment| segment.external_id == external_id)
    }

    pub fn position(&self, local_id: &str) -> Option<usize> {
        self.segments
            .iter()
            .position(|segment| segment.local_id == local_id)
    }

    /// Iterates segments starting at `local_id` (inclusive).
    pub fn segments_from(&self, local_id: &str) -> impl Iterator<Item = &Arc<Segment>> {
        let start = self.position(local_id).unwrap_or(self.segments.len());
        self.segments.iter().skip(start)
    }

    pub fn segments(&self) -> impl Iterator<Item = &Arc<Segment>> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Mean duration of the segments in seconds, 0 for an empty stream.
    pub fn average_segment_duration(&self) -> f64 {
        if self.segments.is_empty() {
            return 0.0;
        }
        let total: f64 = self.segments.iter().map(|segment| segment.duration()).sum();
        total / self.segments.len() as f64
    }
}

/// Player position and speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Playback {
    /// Seconds
    pub position: f64,
    pub rate: f64,
}

impl Default for Playback {
    fn default() -> Self {
        Self {
            position: 0.0,
            rate: 1.0,
        }
    }
}

/// Swarm identity of a stream: `"{base}-{type}-{index}"`.
pub fn swarm_id_for_stream(base: &str, stream: StreamId) -> String {
    format!("{base}-{}-{}", stream.stream_type, stream.index)
}

/// Rendezvous key of a swarm: lowercase hex SHA-1 of its identity.
pub fn swarm_key(swarm_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(swarm_id.as_bytes());
    hex::encode(hasher.finalize())
}
