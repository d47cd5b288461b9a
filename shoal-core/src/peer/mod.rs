//! Peer sessions and swarm membership.
//!
//! A `Peer` wraps one data channel: it tracks what the remote announced,
//! drives at most one outgoing download and serves at most one upload. The
//! `Swarm` keeps one peer per remote id for a stream and collapses
//! duplicate connections.

mod session;
mod swarm;

use std::fmt;
use std::time::{Duration, Instant};

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

pub use session::Peer;
pub use swarm::{PeerTimeoutNotifier, Swarm};

use crate::bandwidth::BandwidthCalculators;
use crate::config::{PeerFailurePolicy, ShoalConfig};
use crate::request::{ErrorClass, RequestContainer, RequestError};
use crate::stream::SegmentKey;

const PEER_ID_LENGTH: usize = 20;

/// Textual peer identifier: client prefix plus random alphanumerics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Generates a 20 character id starting with `prefix`.
    pub fn generate<R: Rng>(prefix: &str, rng: &mut R) -> Self {
        let mut id: String = prefix.chars().take(PEER_ID_LENGTH).collect();
        while id.len() < PEER_ID_LENGTH {
            id.push(char::from(rng.sample(Alphanumeric)));
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-peer tunables derived from `ShoalConfig`.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub max_message_size: usize,
    pub not_receiving_bytes_timeout: Duration,
    /// Counted failures that tear the connection down
    pub error_retries: usize,
    pub failure_policy: PeerFailurePolicy,
}

impl PeerSettings {
    pub fn from_config(config: &ShoalConfig) -> Self {
        Self {
            max_message_size: config.p2p.max_message_size,
            not_receiving_bytes_timeout: config.timeouts.p2p_not_receiving_bytes,
            error_retries: config.retries.p2p_error_retries,
            failure_policy: config.retries.peer_failure_policy,
        }
    }

    /// Whether a failure counts towards distrusting the peer.
    pub fn counts_failure(&self, error: &RequestError) -> bool {
        match (self.failure_policy, error.class()) {
            (_, ErrorClass::Abort) => false,
            (_, ErrorClass::Timeout) => true,
            (PeerFailurePolicy::TimeoutsOnly, ErrorClass::Transport) => false,
            (PeerFailurePolicy::AllFailures, ErrorClass::Transport) => true,
        }
    }
}

/// Bytes exchanged with one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerTraffic {
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
}

/// Loader state a peer mutates while handling an event.
pub struct PeerContext<'a> {
    pub requests: &'a mut RequestContainer,
    pub bandwidth: &'a mut BandwidthCalculators,
    pub now: Instant,
}

/// What the loader must do after a peer handled an event.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerReaction {
    /// Remote asked for a segment; answer with data or absence
    SegmentRequested {
        external_id: i64,
        request_id: i64,
        byte_from: Option<i64>,
    },
    /// Remote availability changed
    AnnouncementChanged,
    /// All bytes arrived; validate, then complete the request
    DownloadFinished { key: SegmentKey },
    /// Download attempt failed and the request was aborted
    DownloadFailed {
        key: SegmentKey,
        error: RequestError,
    },
    ChunkDownloaded { bytes: u64 },
    ChunkUploaded { bytes: u64 },
    /// Undecodable command; the connection stays up
    ProtocolViolation { reason: String },
    /// Peer is unreliable; tear the connection down
    Destroy,
}
