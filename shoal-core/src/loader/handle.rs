use tokio::sync::{mpsc, oneshot};

use super::commands::LoaderCommand;
use super::{LoaderError, LoaderStats, SegmentResponse};
use crate::events::{CoreEvent, EventBus, EventKind, SubscriptionId};
use crate::stream::{Segment, SegmentKey, Stream, StreamId};

/// Handle for communicating with the hybrid loader actor.
#[derive(Clone)]
pub struct LoaderHandle {
    sender: mpsc::Sender<LoaderCommand>,
    events: EventBus,
}

impl LoaderHandle {
    pub(crate) fn new(sender: mpsc::Sender<LoaderCommand>, events: EventBus) -> Self {
        Self { sender, events }
    }

    /// Loads a segment, waiting until it is available.
    ///
    /// Resolves from cache immediately when possible. A second call for the
    /// same segment replaces the first caller, which gets `Aborted`.
    ///
    /// # Errors
    ///
    /// - `LoaderError::UnknownStream` / `UnknownSegment` - Key not registered
    /// - `LoaderError::Failed` - Every source exhausted its retries
    /// - `LoaderError::Aborted` - Caller was released or replaced
    /// - `LoaderError::Shutdown` - Loader stopped
    pub async fn load_segment(&self, key: SegmentKey) -> Result<SegmentResponse, LoaderError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(LoaderCommand::LoadSegment { key, responder })
            .await
            .map_err(|_| LoaderError::Shutdown)?;
        rx.await.map_err(|_| LoaderError::Shutdown)?
    }

    /// Releases the caller waiting on a segment with `Aborted`.
    ///
    /// The transfer itself keeps running while the segment stays queued.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Shutdown` - Loader stopped
    pub async fn abort_segment_loading(&self, key: SegmentKey) -> Result<(), LoaderError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(LoaderCommand::AbortSegmentLoading { key, responder })
            .await
            .map_err(|_| LoaderError::Shutdown)?;
        rx.await.map_err(|_| LoaderError::Shutdown)
    }

    /// Reports the player position in seconds and playback rate.
    ///
    /// A rate of 0 (paused) keeps the last non-zero rate for window scaling.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Shutdown` - Loader stopped
    pub async fn update_playback(&self, position: f64, rate: f64) -> Result<(), LoaderError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(LoaderCommand::UpdatePlayback {
                position,
                rate,
                responder,
            })
            .await
            .map_err(|_| LoaderError::Shutdown)?;
        rx.await.map_err(|_| LoaderError::Shutdown)
    }

    /// Registers a stream; re-adding a known stream merges its segments.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Shutdown` - Loader stopped
    pub async fn add_stream(&self, stream: Stream) -> Result<(), LoaderError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(LoaderCommand::AddStream { stream, responder })
            .await
            .map_err(|_| LoaderError::Shutdown)?;
        rx.await.map_err(|_| LoaderError::Shutdown)?
    }

    /// Appends and removes segments of a live stream.
    ///
    /// # Errors
    ///
    /// - `LoaderError::UnknownStream` - Stream was never added
    /// - `LoaderError::Shutdown` - Loader stopped
    pub async fn update_stream(
        &self,
        stream: StreamId,
        added: Vec<Segment>,
        removed: Vec<String>,
    ) -> Result<(), LoaderError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(LoaderCommand::UpdateStream {
                stream,
                added,
                removed,
                responder,
            })
            .await
            .map_err(|_| LoaderError::Shutdown)?;
        rx.await.map_err(|_| LoaderError::Shutdown)?
    }

    /// Subscribes to one kind of loader event.
    ///
    /// Subscribers run synchronously on the loader task.
    pub fn subscribe<F>(&self, kind: EventKind, subscriber: F) -> SubscriptionId
    where
        F: Fn(&CoreEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// # Errors
    ///
    /// - `LoaderError::Shutdown` - Loader stopped
    pub async fn stats(&self) -> Result<LoaderStats, LoaderError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(LoaderCommand::GetStats { responder })
            .await
            .map_err(|_| LoaderError::Shutdown)?;
        rx.await.map_err(|_| LoaderError::Shutdown)
    }

    /// Stops the loader; waiting callers get `Shutdown`.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Shutdown` - Loader already stopped
    pub async fn shutdown(&self) -> Result<(), LoaderError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(LoaderCommand::Shutdown { responder })
            .await
            .map_err(|_| LoaderError::Shutdown)?;
        rx.await.map_err(|_| LoaderError::Shutdown)
    }

    /// Checks if the loader task is still running.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
