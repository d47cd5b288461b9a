//! HTTP attempts: the transfer task and the loader side of its events.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::commands::LoaderEvent;
use super::core::{HttpTask, HybridLoader};
use crate::events::CoreEvent;
use crate::request::{ChunkOutcome, DownloadSource, RequestError};
use crate::stream::{Segment, SegmentKey};
use crate::transport::{HttpAttemptPlan, HttpFailure, HttpTransport, ResponseVerdict, validate_response};

impl HybridLoader {
    /// Starts an HTTP attempt for a segment, resuming after kept bytes.
    pub(super) fn start_http(&mut self, segment: &Arc<Segment>) -> bool {
        let key = segment.key();
        let timeout = self.config.timeouts.http_not_receiving_bytes;
        let request = self.requests.get_or_create(segment);
        let plan = HttpAttemptPlan {
            url: segment.url.clone(),
            segment_range: segment.byte_range,
            loaded_bytes: request.loaded_bytes(),
            total_bytes: request.total_bytes(),
        };
        let attempt_id = match request.start(
            DownloadSource::Http,
            None,
            Some(timeout),
            &mut self.bandwidth,
            Instant::now(),
        ) {
            Ok(attempt_id) => attempt_id,
            Err(error) => {
                tracing::warn!(segment = %key, %error, "Could not start HTTP download");
                return false;
            }
        };

        let handle = tokio::spawn(run_http_attempt(
            Arc::clone(&self.http),
            plan,
            key.clone(),
            attempt_id,
            self.event_sender.clone(),
        ));
        if let Some(previous) = self
            .http_tasks
            .insert(key.clone(), HttpTask { attempt_id, handle })
        {
            previous.handle.abort();
        }

        self.dirty_announcements.insert(segment.stream);
        self.events.emit(CoreEvent::SegmentStart {
            key,
            source: DownloadSource::Http,
            peer: None,
        });
        true
    }

    /// Whether an event belongs to the running attempt of a request.
    pub(super) fn is_current_http(&self, key: &SegmentKey, attempt_id: u64) -> bool {
        self.http_tasks
            .get(key)
            .is_some_and(|task| task.attempt_id == attempt_id)
            && self
                .requests
                .get(key)
                .is_some_and(|request| request.is_loading() && request.attempt_id() == Some(attempt_id))
    }

    pub(super) fn on_http_headers(
        &mut self,
        key: &SegmentKey,
        attempt_id: u64,
        verdict: Result<ResponseVerdict, HttpFailure>,
    ) {
        if !self.is_current_http(key, attempt_id) {
            return;
        }
        let Some(request) = self.requests.get_mut(key) else {
            return;
        };

        match verdict {
            Ok(verdict) => {
                request.first_bytes_received();
                if verdict.restart {
                    tracing::debug!(segment = %key, "Server ignored range, restarting from zero");
                    request.clear_loaded_bytes();
                }
                if let Some(total) = verdict.learned_total.filter(|_| request.total_bytes().is_none()) {
                    if let Err(error) = request.set_total_bytes(total) {
                        tracing::debug!(segment = %key, %error, "Kept earlier total size");
                    }
                }
            }
            Err(failure) => {
                if failure.clear_loaded_bytes {
                    request.clear_loaded_bytes();
                }
                self.fail_http(key, failure.error);
            }
        }
    }

    pub(super) fn on_http_chunk(&mut self, key: &SegmentKey, attempt_id: u64, data: Bytes) {
        if !self.is_current_http(key, attempt_id) {
            return;
        }
        let Some(request) = self.requests.get_mut(key) else {
            return;
        };

        let length = data.len() as u64;
        match request.add_loaded_chunk(data, &mut self.bandwidth, Instant::now()) {
            Ok(ChunkOutcome::Accepted) => {
                if let Some(progress) = request.progress() {
                    self.approximator.record(attempt_id, progress);
                }
                self.traffic.http_bytes += length;
                self.events.emit(CoreEvent::ChunkDownloaded {
                    bytes: length,
                    source: DownloadSource::Http,
                    peer: None,
                });
            }
            Ok(ChunkOutcome::Overflow) => {
                if let Some(task) = self.http_tasks.remove(key) {
                    task.handle.abort();
                }
                self.dirty_announcements.insert(key.stream);
                self.events.emit(CoreEvent::SegmentError {
                    key: key.clone(),
                    error: RequestError::BytesMismatch,
                    source: DownloadSource::Http,
                    peer: None,
                });
                self.schedule_pass(false);
            }
            Err(error) => {
                tracing::warn!(segment = %key, %error, "Dropped HTTP chunk");
            }
        }
    }

    pub(super) fn on_http_finished(&mut self, key: &SegmentKey, attempt_id: u64) {
        if !self.is_current_http(key, attempt_id) {
            return;
        }
        let Some(request) = self.requests.get_mut(key) else {
            return;
        };

        let complete = request
            .total_bytes()
            .is_none_or(|total| total == request.loaded_bytes());
        if !complete {
            tracing::warn!(
                segment = %key,
                loaded = request.loaded_bytes(),
                total = ?request.total_bytes(),
                "HTTP body ended early"
            );
            request.clear_loaded_bytes();
            self.fail_http(key, RequestError::HttpBytesMismatch);
            return;
        }
        self.finish_download(key, DownloadSource::Http);
    }

    /// Fails the running HTTP attempt and stops its task.
    pub(super) fn fail_http(&mut self, key: &SegmentKey, error: RequestError) {
        if let Some(task) = self.http_tasks.remove(key) {
            task.handle.abort();
        }
        let Some(request) = self.requests.get_mut(key) else {
            return;
        };
        if request
            .abort_on_error(error.clone(), &mut self.bandwidth, Instant::now())
            .is_err()
        {
            return;
        }
        tracing::warn!(segment = %key, %error, "HTTP attempt failed");

        self.dirty_announcements.insert(key.stream);
        self.events.emit(CoreEvent::SegmentError {
            key: key.clone(),
            error,
            source: DownloadSource::Http,
            peer: None,
        });
        self.schedule_pass(false);
    }
}

/// Fetches one attempt and reports headers, chunks and the outcome.
///
/// Dropping the task drops the body, which cancels the transfer.
async fn run_http_attempt(
    http: Arc<dyn HttpTransport>,
    plan: HttpAttemptPlan,
    key: SegmentKey,
    attempt_id: u64,
    events: mpsc::UnboundedSender<LoaderEvent>,
) {
    let response = match http.fetch(plan.to_request()).await {
        Ok(response) => response,
        Err(error) => {
            let _ = events.send(LoaderEvent::HttpFailed {
                key,
                attempt_id,
                error: RequestError::HttpNetworkFailure {
                    reason: error.to_string(),
                },
            });
            return;
        }
    };

    let verdict = validate_response(
        &plan,
        response.status,
        response.content_length,
        response.content_range.as_deref(),
    );
    let accepted = verdict.is_ok();
    let sent = events.send(LoaderEvent::HttpHeaders {
        key: key.clone(),
        attempt_id,
        verdict,
    });
    if sent.is_err() || !accepted {
        return;
    }

    let mut body = response.body;
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(data) if data.is_empty() => {}
            Ok(data) => {
                let sent = events.send(LoaderEvent::HttpChunk {
                    key: key.clone(),
                    attempt_id,
                    data,
                });
                if sent.is_err() {
                    return;
                }
            }
            Err(error) => {
                let _ = events.send(LoaderEvent::HttpFailed {
                    key,
                    attempt_id,
                    error: RequestError::HttpNetworkFailure {
                        reason: error.to_string(),
                    },
                });
                return;
            }
        }
    }

    let _ = events.send(LoaderEvent::HttpFinished { key, attempt_id });
}
