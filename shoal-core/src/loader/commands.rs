use bytes::Bytes;
use tokio::sync::oneshot;

use super::{LoaderError, LoaderStats, SegmentResponder};
use crate::peer::PeerId;
use crate::request::RequestError;
use crate::stream::{Segment, SegmentKey, Stream, StreamId};
use crate::transport::{ChannelEvent, HttpFailure, RendezvousEvent, ResponseVerdict};

/// Commands that can be sent to the hybrid loader actor.
#[derive(Debug)]
pub(crate) enum LoaderCommand {
    /// Load a segment from cache, HTTP or a peer
    LoadSegment {
        key: SegmentKey,
        responder: SegmentResponder,
    },

    /// Release the waiting caller of a segment
    AbortSegmentLoading {
        key: SegmentKey,
        responder: oneshot::Sender<()>,
    },

    /// Update player position and speed
    UpdatePlayback {
        position: f64,
        rate: f64,
        responder: oneshot::Sender<()>,
    },

    /// Register a stream and join its swarm
    AddStream {
        stream: Stream,
        responder: oneshot::Sender<Result<(), LoaderError>>,
    },

    /// Apply a manifest update to a known stream
    UpdateStream {
        stream: StreamId,
        added: Vec<Segment>,
        removed: Vec<String>,
        responder: oneshot::Sender<Result<(), LoaderError>>,
    },

    /// Get loader statistics
    GetStats {
        responder: oneshot::Sender<LoaderStats>,
    },

    /// Shutdown the loader gracefully
    Shutdown { responder: oneshot::Sender<()> },
}

/// Events produced by transfer tasks, timers and transports.
#[derive(Debug)]
pub(crate) enum LoaderEvent {
    /// No-bytes timer of an HTTP request fired
    RequestTimeout { key: SegmentKey, generation: u64 },

    /// No-bytes timer of a peer download fired
    PeerTimeout {
        stream: StreamId,
        peer: PeerId,
        connection_id: u64,
        generation: u64,
    },

    /// Response headers of an HTTP attempt were checked
    HttpHeaders {
        key: SegmentKey,
        attempt_id: u64,
        verdict: Result<ResponseVerdict, HttpFailure>,
    },

    HttpChunk {
        key: SegmentKey,
        attempt_id: u64,
        data: Bytes,
    },

    HttpFinished { key: SegmentKey, attempt_id: u64 },

    HttpFailed {
        key: SegmentKey,
        attempt_id: u64,
        error: RequestError,
    },

    /// Event of one peer data channel
    Channel {
        stream: StreamId,
        remote: PeerId,
        connection_id: u64,
        event: ChannelEvent,
    },

    /// Event of a swarm membership
    Rendezvous {
        stream: StreamId,
        event: RendezvousEvent,
    },
}
