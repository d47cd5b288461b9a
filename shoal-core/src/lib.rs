//! Shoal Core - hybrid HTTP and peer-to-peer media segment loading
//!
//! This crate fetches the segments of an adaptive media stream from an HTTP
//! origin and, opportunistically, from other viewers of the same stream over
//! peer data channels. A single loader actor decides which segments to fetch,
//! from which source, and when to preempt less urgent transfers.

pub mod bandwidth;
pub mod config;
pub mod events;
pub mod loader;
pub mod peer;
pub mod protocol;
pub mod request;
pub mod scheduler;
pub mod storage;
pub mod stream;
pub mod tracing_setup;
pub mod transport;

// Re-export main types for convenient access
pub use config::ShoalConfig;
pub use events::{CoreEvent, EventKind, SubscriptionId};
pub use loader::{
    Collaborators, LoaderError, LoaderHandle, LoaderStats, SegmentResponse, SegmentValidator,
    spawn_hybrid_loader,
};
pub use peer::PeerId;
pub use protocol::ProtocolError;
pub use request::{RequestError, RequestStateError};
pub use stream::{ByteRange, Playback, Segment, SegmentKey, Stream, StreamId, StreamType};
pub use transport::TransportError;

/// Core errors that can bubble up from any Shoal subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Request state error: {0}")]
    RequestState(#[from] RequestStateError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl ShoalError {
    /// Checks if this error is due to caller-supplied configuration.
    pub fn is_user_error(&self) -> bool {
        matches!(self, ShoalError::Configuration { .. })
    }
}

pub type Result<T> = std::result::Result<T, ShoalError>;
