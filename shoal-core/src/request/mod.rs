//! Per-segment request state machine.
//!
//! A `Request` is created lazily the first time a segment is needed and is
//! reused across attempts until it succeeds. Each attempt runs against one
//! source: the HTTP origin or one peer.

mod container;
mod segment_request;
mod timeout;

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

pub use container::{RequestContainer, RequestTimeoutNotifier};
pub use segment_request::{ChunkOutcome, Request};
pub use timeout::{Timeout, TimeoutCallback};

use crate::peer::PeerId;

/// Where an attempt fetches its bytes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadSource {
    Http,
    P2p,
}

impl fmt::Display for DownloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadSource::Http => write!(f, "http"),
            DownloadSource::P2p => write!(f, "p2p"),
        }
    }
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    NotStarted,
    Loading,
    Succeed,
    Failed,
    Aborted,
}

/// Failure taxonomy used for retry budgets and peer distrust.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller or policy initiated; never counted
    Abort,
    /// No bytes within the configured interval
    Timeout,
    /// Status, length, absence or framing failures
    Transport,
}

/// Why one attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Request aborted")]
    Abort,

    #[error("No bytes received within timeout")]
    BytesReceivingTimeout,

    #[error("HTTP request failed with status {status}")]
    HttpError { status: u16 },

    #[error("HTTP transfer failed: {reason}")]
    HttpNetworkFailure { reason: String },

    #[error("HTTP response length does not match the requested range")]
    HttpBytesMismatch,

    #[error("Unexpected HTTP status code {status}")]
    HttpUnexpectedStatusCode { status: u16 },

    #[error("HTTP segment failed validation")]
    HttpSegmentValidationFailed,

    #[error("Peer does not have the segment")]
    PeerSegmentAbsent,

    #[error("Peer connection closed")]
    PeerClosed,

    #[error("Peer sent a different number of bytes than announced")]
    PeerResponseBytesMismatch,

    #[error("Peer violated the protocol")]
    PeerProtocolViolation,

    #[error("P2P segment failed validation")]
    P2pSegmentValidationFailed,

    #[error("Received more bytes than the segment size")]
    BytesMismatch,
}

impl RequestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RequestError::Abort => ErrorClass::Abort,
            RequestError::BytesReceivingTimeout => ErrorClass::Timeout,
            _ => ErrorClass::Transport,
        }
    }
}

/// Illegal state-machine transition, a programming error in the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestStateError {
    #[error("Request cannot start while {status:?}")]
    NotStartable { status: RequestStatus },

    #[error("Request is not loading (status {status:?})")]
    NotLoading { status: RequestStatus },

    #[error("Total bytes already set")]
    TotalBytesAlreadySet,
}

/// One execution of a request against one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAttempt {
    pub id: u64,
    pub source: DownloadSource,
    pub peer: Option<PeerId>,
    pub started_at: Instant,
}

/// A failed attempt and its cause.
#[derive(Debug, Clone)]
pub struct FailedAttempt {
    pub source: DownloadSource,
    pub peer: Option<PeerId>,
    pub error: RequestError,
}

/// Failure history of a request while it is not terminal.
#[derive(Debug, Clone, Default)]
pub struct FailedAttempts {
    attempts: Vec<FailedAttempt>,
}

impl FailedAttempts {
    pub fn add(&mut self, attempt: FailedAttempt) {
        self.attempts.push(attempt);
    }

    pub fn http_count(&self) -> usize {
        self.count_for(DownloadSource::Http)
    }

    pub fn p2p_count(&self) -> usize {
        self.count_for(DownloadSource::P2p)
    }

    pub fn last(&self) -> Option<&FailedAttempt> {
        self.attempts.last()
    }

    pub fn clear(&mut self) {
        self.attempts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    fn count_for(&self, source: DownloadSource) -> usize {
        self.attempts
            .iter()
            .filter(|attempt| attempt.source == source && attempt.error.class() != ErrorClass::Abort)
            .count()
    }
}
