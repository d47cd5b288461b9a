//! Hybrid loader actor.
//!
//! One task owns every request, the cache, the peers and the bandwidth
//! estimators. Callers talk to it through `LoaderHandle`; transfer tasks,
//! timers and transports report back through an internal event channel,
//! so no state is mutated outside the actor.

mod actor;
mod commands;
mod core;
mod handle;
mod http_attempt;
mod queue_pass;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;

pub use actor::spawn_hybrid_loader;
pub use handle::LoaderHandle;

use crate::request::DownloadSource;
use crate::storage::CacheStats;
use crate::stream::{Segment, SegmentKey, StreamId};
use crate::transport::{HttpTransport, SwarmRendezvous};

/// Data handed to the player for a loaded segment.
#[derive(Debug, Clone)]
pub struct SegmentResponse {
    pub data: Bytes,
    /// Recent download bandwidth estimate in bits per second
    pub bandwidth_bps: f64,
}

/// Player-visible outcome of a segment load.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoaderError {
    #[error("Segment {key} failed: {reason}")]
    Failed { key: SegmentKey, reason: String },

    #[error("Segment loading aborted")]
    Aborted,

    #[error("Unknown stream {stream}")]
    UnknownStream { stream: StreamId },

    #[error("Unknown segment {key}")]
    UnknownSegment { key: SegmentKey },

    #[error("Loader is shut down")]
    Shutdown,
}

/// Responder of a waiting `load_segment` caller.
pub(crate) type SegmentResponder = oneshot::Sender<Result<SegmentResponse, LoaderError>>;

/// Snapshot of loader activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoaderStats {
    pub http_loading: usize,
    pub p2p_loading: usize,
    pub cached_segments: usize,
    pub connected_peers: usize,
    pub http_bytes: u64,
    pub p2p_bytes: u64,
    pub uploaded_bytes: u64,
    pub bandwidth_bps: f64,
    pub cache: CacheStats,
}

/// Caller-supplied check of downloaded segment bytes.
pub trait SegmentValidator: Send + Sync {
    /// Returns false to reject the data; the attempt then fails.
    fn validate(&self, segment: &Segment, data: &Bytes, source: DownloadSource) -> bool;
}

impl<F> SegmentValidator for F
where
    F: Fn(&Segment, &Bytes, DownloadSource) -> bool + Send + Sync,
{
    fn validate(&self, segment: &Segment, data: &Bytes, source: DownloadSource) -> bool {
        self(segment, data, source)
    }
}

/// External services the loader drives.
#[derive(Clone)]
pub struct Collaborators {
    pub http: Arc<dyn HttpTransport>,
    /// Without a rendezvous the loader only uses HTTP
    pub rendezvous: Option<Arc<dyn SwarmRendezvous>>,
    pub validator: Option<Arc<dyn SegmentValidator>>,
}

impl Collaborators {
    pub fn new(http: Arc<dyn HttpTransport>) -> Self {
        Self {
            http,
            rendezvous: None,
            validator: None,
        }
    }

    pub fn with_rendezvous(mut self, rendezvous: Arc<dyn SwarmRendezvous>) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn SegmentValidator>) -> Self {
        self.validator = Some(validator);
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("rendezvous", &self.rendezvous.is_some())
            .field("validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}
