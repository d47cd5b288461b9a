//! State machine of one segment request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use super::{
    DownloadSource, FailedAttempt, FailedAttempts, RequestAttempt, RequestError, RequestStateError,
    RequestStatus, Timeout, TimeoutCallback,
};
use crate::bandwidth::{BandwidthCalculators, LoadProgress};
use crate::loader::{LoaderError, SegmentResponder, SegmentResponse};
use crate::peer::PeerId;
use crate::stream::Segment;

static NEXT_ATTEMPT_ID: AtomicU64 = AtomicU64::new(1);

/// Result of feeding a chunk to a loading request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Accepted,
    /// Chunk exceeded the known total; the attempt failed with `BytesMismatch`
    Overflow,
}

/// Per-segment request.
///
/// Lifecycle: `NotStarted -> Loading -> {Succeed | Failed | Aborted}`.
/// `Failed` and `Aborted` restart with a new attempt; `Succeed` is terminal.
#[derive(Debug)]
pub struct Request {
    segment: Arc<Segment>,
    status: RequestStatus,
    current_attempt: Option<RequestAttempt>,
    failed_attempts: FailedAttempts,
    chunks: Vec<Bytes>,
    loaded_bytes: u64,
    total_bytes: Option<u64>,
    total_from_range: bool,
    progress: Option<LoadProgress>,
    timeout: Timeout,
    caller: Option<SegmentResponder>,
}

impl Request {
    /// Creates a request; `on_timeout` receives the generation of a fire.
    pub fn new(segment: Arc<Segment>, on_timeout: TimeoutCallback) -> Self {
        let total_bytes = segment.byte_range.map(|range| range.len());
        Self {
            segment,
            status: RequestStatus::NotStarted,
            current_attempt: None,
            failed_attempts: FailedAttempts::default(),
            chunks: Vec::new(),
            loaded_bytes: 0,
            total_from_range: total_bytes.is_some(),
            total_bytes,
            progress: None,
            timeout: Timeout::new(on_timeout),
            caller: None,
        }
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn is_loading(&self) -> bool {
        self.status == RequestStatus::Loading
    }

    pub fn current_attempt(&self) -> Option<&RequestAttempt> {
        self.current_attempt.as_ref()
    }

    pub fn current_source(&self) -> Option<DownloadSource> {
        self.current_attempt.as_ref().map(|attempt| attempt.source)
    }

    pub fn current_peer(&self) -> Option<&PeerId> {
        self.current_attempt
            .as_ref()
            .and_then(|attempt| attempt.peer.as_ref())
    }

    pub fn attempt_id(&self) -> Option<u64> {
        self.current_attempt.as_ref().map(|attempt| attempt.id)
    }

    pub fn failed_attempts(&self) -> &FailedAttempts {
        &self.failed_attempts
    }

    pub fn failed_attempts_mut(&mut self) -> &mut FailedAttempts {
        &mut self.failed_attempts
    }

    pub fn loaded_bytes(&self) -> u64 {
        self.loaded_bytes
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn progress(&self) -> Option<LoadProgress> {
        self.progress
    }

    /// Percentage of the known total already received.
    pub fn loaded_percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) | None => None,
            Some(total) => Some(self.loaded_bytes as f64 / total as f64 * 100.0),
        }
    }

    /// Starts a new attempt, returning its id.
    ///
    /// `timeout` arms the no-bytes timer; P2P attempts pass `None` since the
    /// peer owns that timer.
    ///
    /// # Errors
    ///
    /// - `RequestStateError::NotStartable` - Request is loading or succeeded
    pub fn start(
        &mut self,
        source: DownloadSource,
        peer: Option<PeerId>,
        timeout: Option<Duration>,
        bandwidth: &mut BandwidthCalculators,
        now: Instant,
    ) -> Result<u64, RequestStateError> {
        if !matches!(
            self.status,
            RequestStatus::NotStarted | RequestStatus::Failed | RequestStatus::Aborted
        ) {
            return Err(RequestStateError::NotStartable {
                status: self.status,
            });
        }

        let id = NEXT_ATTEMPT_ID.fetch_add(1, Ordering::Relaxed);
        self.status = RequestStatus::Loading;
        self.current_attempt = Some(RequestAttempt {
            id,
            source,
            peer,
            started_at: now,
        });
        self.progress = Some(LoadProgress::new(now));

        bandwidth.all.start_loading(now);
        if source == DownloadSource::Http {
            bandwidth.http.start_loading(now);
        }
        if let Some(duration) = timeout {
            self.timeout.start(duration);
        }

        tracing::debug!(
            segment = %self.segment.key(),
            %source,
            attempt = id,
            resume_from = self.loaded_bytes,
            "Request started"
        );
        Ok(id)
    }

    /// Restarts the no-bytes timer, e.g. on response headers.
    pub fn first_bytes_received(&mut self) {
        self.timeout.restart();
    }

    /// Appends a chunk of the current attempt.
    ///
    /// # Errors
    ///
    /// - `RequestStateError::NotLoading` - No attempt is running
    pub fn add_loaded_chunk(
        &mut self,
        chunk: Bytes,
        bandwidth: &mut BandwidthCalculators,
        now: Instant,
    ) -> Result<ChunkOutcome, RequestStateError> {
        self.ensure_loading()?;

        let length = chunk.len() as u64;
        if matches!(self.total_bytes, Some(total) if self.loaded_bytes + length > total) {
            tracing::warn!(
                segment = %self.segment.key(),
                loaded = self.loaded_bytes,
                chunk = length,
                total = ?self.total_bytes,
                "Chunk overflows segment size"
            );
            self.clear_loaded_bytes();
            self.fail(RequestError::BytesMismatch, bandwidth, now);
            return Ok(ChunkOutcome::Overflow);
        }

        self.timeout.restart();
        self.loaded_bytes += length;
        self.chunks.push(chunk);
        if let Some(progress) = self.progress.as_mut() {
            progress.add_chunk(length, now);
        }
        bandwidth.all.add_bytes(length, now);
        if self.current_source() == Some(DownloadSource::Http) {
            bandwidth.http.add_bytes(length, now);
        }
        Ok(ChunkOutcome::Accepted)
    }

    /// Concatenates received chunks without changing state.
    pub fn assembled_data(&mut self) -> Bytes {
        if self.chunks.len() > 1 {
            let mut buffer = BytesMut::with_capacity(self.loaded_bytes as usize);
            for chunk in &self.chunks {
                buffer.extend_from_slice(chunk);
            }
            self.chunks = vec![buffer.freeze()];
        }
        self.chunks.first().cloned().unwrap_or_default()
    }

    /// Freezes the buffer and marks the request succeeded.
    ///
    /// # Errors
    ///
    /// - `RequestStateError::NotLoading` - No attempt is running
    pub fn complete_on_success(
        &mut self,
        bandwidth: &mut BandwidthCalculators,
        now: Instant,
    ) -> Result<Bytes, RequestStateError> {
        self.ensure_loading()?;

        let data = self.assembled_data();
        self.total_bytes = Some(self.loaded_bytes);
        self.status = RequestStatus::Succeed;
        self.stop_attempt(bandwidth, now);

        tracing::debug!(
            segment = %self.segment.key(),
            bytes = data.len(),
            "Request succeeded"
        );
        Ok(data)
    }

    /// Fails the current attempt and records it in the failure history.
    ///
    /// # Errors
    ///
    /// - `RequestStateError::NotLoading` - No attempt is running
    pub fn abort_on_error(
        &mut self,
        error: RequestError,
        bandwidth: &mut BandwidthCalculators,
        now: Instant,
    ) -> Result<(), RequestStateError> {
        self.ensure_loading()?;
        self.fail(error, bandwidth, now);
        Ok(())
    }

    /// Handles a timer fire; returns false for stale generations.
    pub fn abort_on_timeout(
        &mut self,
        generation: u64,
        bandwidth: &mut BandwidthCalculators,
        now: Instant,
    ) -> bool {
        if !self.is_loading() || !self.timeout.is_current(generation) {
            return false;
        }
        self.fail(RequestError::BytesReceivingTimeout, bandwidth, now);
        true
    }

    /// Aborts the current attempt on scheduler decision; not recorded.
    ///
    /// # Errors
    ///
    /// - `RequestStateError::NotLoading` - No attempt is running
    pub fn abort_from_queue(
        &mut self,
        bandwidth: &mut BandwidthCalculators,
        now: Instant,
    ) -> Result<(), RequestStateError> {
        self.ensure_loading()?;
        self.status = RequestStatus::Aborted;
        self.stop_attempt(bandwidth, now);
        tracing::debug!(segment = %self.segment.key(), "Request aborted from queue");
        Ok(())
    }

    /// Sets the size learned from the transport.
    ///
    /// # Errors
    ///
    /// - `RequestStateError::TotalBytesAlreadySet` - Size is immutable once known
    pub fn set_total_bytes(&mut self, total: u64) -> Result<(), RequestStateError> {
        if self.total_bytes.is_some() {
            return Err(RequestStateError::TotalBytesAlreadySet);
        }
        self.total_bytes = Some(total);
        Ok(())
    }

    /// Drops received bytes; a learned size is forgotten too.
    pub fn clear_loaded_bytes(&mut self) {
        self.chunks.clear();
        self.loaded_bytes = 0;
        if !self.total_from_range {
            self.total_bytes = None;
        }
    }

    pub fn has_caller(&self) -> bool {
        self.caller.is_some()
    }

    /// Binds a waiting caller, returning the one it replaces.
    pub fn replace_caller(&mut self, caller: SegmentResponder) -> Option<SegmentResponder> {
        self.caller.replace(caller)
    }

    /// Resolves the waiting caller with data, if any.
    pub fn resolve_success(&mut self, response: SegmentResponse) {
        if let Some(caller) = self.caller.take() {
            let _ = caller.send(Ok(response));
        }
    }

    /// Resolves the waiting caller with an error, if any.
    pub fn resolve_error(&mut self, error: LoaderError) {
        if let Some(caller) = self.caller.take() {
            let _ = caller.send(Err(error));
        }
    }

    fn ensure_loading(&self) -> Result<(), RequestStateError> {
        if self.is_loading() {
            Ok(())
        } else {
            Err(RequestStateError::NotLoading {
                status: self.status,
            })
        }
    }

    fn fail(&mut self, error: RequestError, bandwidth: &mut BandwidthCalculators, now: Instant) {
        tracing::debug!(segment = %self.segment.key(), %error, "Request attempt failed");
        self.status = RequestStatus::Failed;
        if let Some(attempt) = self.current_attempt.as_ref() {
            self.failed_attempts.add(FailedAttempt {
                source: attempt.source,
                peer: attempt.peer.clone(),
                error,
            });
        }
        self.stop_attempt(bandwidth, now);
    }

    fn stop_attempt(&mut self, bandwidth: &mut BandwidthCalculators, now: Instant) {
        self.timeout.clear();
        bandwidth.all.stop_loading(now);
        if self.current_source() == Some(DownloadSource::Http) {
            bandwidth.http.stop_loading(now);
        }
    }
}
