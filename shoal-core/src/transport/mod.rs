//! Collaborator seams: HTTP fetching, peer data channels and rendezvous.
//!
//! The loader owns scheduling, framing and flow control; everything below
//! those (sockets, ICE, trackers) lives behind these traits so production
//! and in-memory implementations drive the same core.

pub mod http;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use url::Url;

pub use http::{
    HttpAttemptPlan, HttpFailure, ReqwestHttpTransport, ResponseVerdict, parse_content_range,
    validate_response,
};

use crate::peer::PeerId;

/// Collaborator failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP transport failed: {reason}")]
    Http { reason: String },

    #[error("Channel closed")]
    Closed,

    #[error("Send failed: {reason}")]
    Send { reason: String },

    #[error("Rendezvous failed: {reason}")]
    Rendezvous { reason: String },
}

/// One HTTP GET, optionally ranged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: Url,
    /// Inclusive `(from, to)`; `to = None` reads to the end
    pub range: Option<(u64, Option<u64>)>,
}

impl HttpRequest {
    /// Value of the `Range` header, if any.
    pub fn range_header(&self) -> Option<String> {
        self.range.map(|(from, to)| match to {
            Some(to) => format!("bytes={from}-{to}"),
            None => format!("bytes={from}-"),
        })
    }
}

/// Streaming HTTP response; dropping the body cancels the transfer.
pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// Executes HTTP requests for segment bytes.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends the request and returns once response headers are known.
    ///
    /// # Errors
    /// - `TransportError::Http` - Connection or protocol failure
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Ordered, reliable, message-size-bounded channel to one peer.
pub trait DataChannel: Send + Sync {
    /// Queues one message.
    ///
    /// # Errors
    /// - `TransportError::Closed` - Channel no longer open
    /// - `TransportError::Send` - Transport rejected the message
    fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Bytes queued but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    /// `ChannelEvent::BufferedAmountLow` fires when the buffered amount
    /// drops to this value.
    fn buffered_amount_low_threshold(&self) -> usize;

    fn close(&self);
}

/// Events of one data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Data(Bytes),
    BufferedAmountLow,
    Closed,
    Error(String),
}

/// A connection offered by the rendezvous for one remote peer.
pub struct PeerCandidate {
    pub remote_id: PeerId,
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl fmt::Debug for PeerCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerCandidate")
            .field("remote_id", &self.remote_id)
            .finish_non_exhaustive()
    }
}

/// Events of one swarm membership.
#[derive(Debug)]
pub enum RendezvousEvent {
    Candidate(PeerCandidate),
    Warning(String),
    Error(String),
}

/// Discovers peers of a swarm.
#[async_trait]
pub trait SwarmRendezvous: Send + Sync {
    /// Joins a swarm and returns the stream of candidates.
    ///
    /// # Errors
    /// - `TransportError::Rendezvous` - Swarm could not be joined
    async fn join(
        &self,
        swarm_key: &str,
        local_id: &PeerId,
    ) -> Result<mpsc::UnboundedReceiver<RendezvousEvent>, TransportError>;

    /// Leaves a swarm; unknown swarms are ignored.
    async fn leave(&self, swarm_key: &str, local_id: &PeerId);
}
