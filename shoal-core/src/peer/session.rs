//! One peer connection.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;

use super::{PeerContext, PeerId, PeerReaction, PeerSettings, PeerTraffic};
use crate::ShoalError;
use crate::protocol::{IncomingMessage, PeerCommand, PeerWire, UploadProgress};
use crate::request::{DownloadSource, RequestError, Timeout, TimeoutCallback};
use crate::stream::{Segment, SegmentKey, StreamId};
use crate::transport::{DataChannel, TransportError};

#[derive(Debug, Clone)]
struct DownloadingContext {
    key: SegmentKey,
    external_id: i64,
    request_id: i64,
    data_command_received: bool,
}

/// Session with one remote peer.
///
/// Downloads mirror the request state machine: the peer starts the P2P
/// attempt, feeds chunks into the request and fails it on absence,
/// mismatch or timeout. The no-bytes timer is owned by the peer, not the
/// request.
pub struct Peer {
    id: PeerId,
    stream: StreamId,
    connection_id: u64,
    wire: PeerWire,
    remote_loaded: HashSet<i64>,
    remote_http_loading: HashSet<i64>,
    downloading: Option<DownloadingContext>,
    download_errors: usize,
    timeout: Timeout,
    settings: PeerSettings,
    traffic: PeerTraffic,
}

impl Peer {
    pub fn new(
        id: PeerId,
        stream: StreamId,
        connection_id: u64,
        channel: Arc<dyn DataChannel>,
        settings: PeerSettings,
        on_timeout: TimeoutCallback,
    ) -> Self {
        Self {
            id,
            stream,
            connection_id,
            wire: PeerWire::new(channel, settings.max_message_size),
            remote_loaded: HashSet::new(),
            remote_http_loading: HashSet::new(),
            downloading: None,
            download_errors: 0,
            timeout: Timeout::new(on_timeout),
            settings,
            traffic: PeerTraffic::default(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn traffic(&self) -> PeerTraffic {
        self.traffic
    }

    pub fn download_errors(&self) -> usize {
        self.download_errors
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.is_some()
    }

    pub fn downloading_key(&self) -> Option<&SegmentKey> {
        self.downloading.as_ref().map(|downloading| &downloading.key)
    }

    pub fn is_uploading(&self) -> bool {
        self.wire.upload().is_some()
    }

    /// Remote announced the segment as loaded.
    pub fn has_segment(&self, external_id: i64) -> bool {
        self.remote_loaded.contains(&external_id)
    }

    pub fn is_loading_or_loaded(&self, external_id: i64) -> bool {
        self.remote_loaded.contains(&external_id) || self.remote_http_loading.contains(&external_id)
    }

    /// Starts a P2P attempt for `segment` and sends the request.
    ///
    /// The attempt resumes after bytes kept from earlier attempts.
    ///
    /// # Errors
    ///
    /// - `ShoalError::Transport` - Peer is busy or the channel rejected the request
    /// - `ShoalError::RequestState` - Request cannot start
    pub fn download_segment<R: Rng>(
        &mut self,
        segment: &Arc<Segment>,
        ctx: &mut PeerContext<'_>,
        rng: &mut R,
    ) -> Result<u64, ShoalError> {
        if self.downloading.is_some() {
            return Err(TransportError::Send {
                reason: format!("peer {} is already downloading", self.id),
            }
            .into());
        }

        let request = ctx.requests.get_or_create(segment);
        let attempt_id = request.start(
            DownloadSource::P2p,
            Some(self.id.clone()),
            None,
            ctx.bandwidth,
            ctx.now,
        )?;

        let loaded = request.loaded_bytes();
        let request_id = rng.random_range(0..i64::from(i32::MAX));
        let command = PeerCommand::SegmentRequest {
            segment_id: segment.external_id,
            request_id,
            byte_from: (loaded > 0).then_some(loaded as i64),
        };
        if let Err(error) = self.wire.send_command(&command) {
            if let Err(state) = request.abort_on_error(RequestError::PeerClosed, ctx.bandwidth, ctx.now) {
                tracing::debug!(peer = %self.id, error = %state, "Request already settled");
            }
            return Err(error);
        }

        self.downloading = Some(DownloadingContext {
            key: segment.key(),
            external_id: segment.external_id,
            request_id,
            data_command_received: false,
        });
        self.timeout.start(self.settings.not_receiving_bytes_timeout);
        tracing::debug!(
            peer = %self.id,
            segment = %segment.key(),
            request_id,
            resume_from = loaded,
            "Requested segment from peer"
        );
        Ok(attempt_id)
    }

    /// Stops the running download after the loader aborted its request.
    pub fn abort_download(&mut self) -> Option<SegmentKey> {
        let downloading = self.downloading.take()?;
        self.timeout.clear();
        let _ = self.wire.send_command(&PeerCommand::CancelSegmentRequest {
            segment_id: downloading.external_id,
            request_id: downloading.request_id,
        });
        Some(downloading.key)
    }

    pub fn handle_data(&mut self, data: Bytes, ctx: &mut PeerContext<'_>) -> Vec<PeerReaction> {
        match self.wire.receive(data) {
            IncomingMessage::Command(command) => self.handle_command(command, ctx),
            IncomingMessage::SegmentChunk(chunk) => self.handle_segment_chunk(chunk, ctx),
            IncomingMessage::Pending => Vec::new(),
            IncomingMessage::Malformed(error) => {
                tracing::warn!(peer = %self.id, %error, "Dropped malformed command");
                vec![PeerReaction::ProtocolViolation {
                    reason: error.to_string(),
                }]
            }
        }
    }

    /// Handles a fire of the no-bytes timer.
    pub fn handle_timeout(&mut self, generation: u64, ctx: &mut PeerContext<'_>) -> Vec<PeerReaction> {
        if !self.timeout.is_current(generation) {
            return Vec::new();
        }
        self.fail_download(RequestError::BytesReceivingTimeout, ctx)
    }

    /// Continues a paused upload once the channel drained.
    ///
    /// # Errors
    ///
    /// - `ShoalError::Transport` - Channel rejected a chunk
    pub fn handle_buffered_amount_low(&mut self) -> Result<Vec<PeerReaction>, ShoalError> {
        let Some((segment_id, request_id)) = self
            .wire
            .upload()
            .map(|upload| (upload.segment_id(), upload.request_id()))
        else {
            return Ok(Vec::new());
        };
        match self.wire.resume_upload()? {
            Some(progress) => self.after_upload_progress(progress, segment_id, request_id),
            None => Ok(Vec::new()),
        }
    }

    /// Serves a segment request from cached data.
    ///
    /// # Errors
    ///
    /// - `ShoalError::Transport` - Channel rejected a message
    /// - `ShoalError::Protocol` - Header could not be encoded
    pub fn upload_segment(
        &mut self,
        external_id: i64,
        request_id: i64,
        data: Bytes,
        byte_from: Option<i64>,
    ) -> Result<Vec<PeerReaction>, ShoalError> {
        let total_bytes = data.len();
        self.wire.send_command(&PeerCommand::SegmentData {
            segment_id: external_id,
            request_id,
            total_bytes: total_bytes as i64,
        })?;

        let offset = byte_from.map_or(0, |from| from.clamp(0, total_bytes as i64) as usize);
        let progress = self
            .wire
            .start_upload(external_id, request_id, data.slice(offset..))?;
        tracing::debug!(peer = %self.id, segment = external_id, offset, "Uploading segment");
        self.after_upload_progress(progress, external_id, request_id)
    }

    /// # Errors
    ///
    /// - `ShoalError::Transport` - Channel rejected the message
    pub fn send_segment_absent(&self, external_id: i64, request_id: i64) -> Result<(), ShoalError> {
        self.wire.send_command(&PeerCommand::SegmentAbsent {
            segment_id: external_id,
            request_id,
        })
    }

    /// # Errors
    ///
    /// - `ShoalError::Protocol` - Ids span too many groups
    /// - `ShoalError::Transport` - Channel rejected the message
    pub fn send_announcement(&self, loaded: Vec<i64>, http_loading: Vec<i64>) -> Result<(), ShoalError> {
        self.wire.send_command(&PeerCommand::SegmentsAnnouncement {
            loaded,
            http_loading,
        })
    }

    /// Fails the running download, stops the upload and closes the channel.
    pub fn destroy(&mut self, ctx: &mut PeerContext<'_>) -> Vec<PeerReaction> {
        let mut reactions = self.fail_download(RequestError::PeerClosed, ctx);
        reactions.retain(|reaction| *reaction != PeerReaction::Destroy);
        self.timeout.clear();
        self.wire.close();
        tracing::info!(peer = %self.id, stream = %self.stream, "Peer connection closed");
        reactions
    }

    fn handle_command(&mut self, command: PeerCommand, ctx: &mut PeerContext<'_>) -> Vec<PeerReaction> {
        match command {
            PeerCommand::SegmentsAnnouncement {
                loaded,
                http_loading,
            } => {
                self.remote_loaded = loaded.into_iter().collect();
                self.remote_http_loading = http_loading.into_iter().collect();
                vec![PeerReaction::AnnouncementChanged]
            }
            PeerCommand::SegmentRequest {
                segment_id,
                request_id,
                byte_from,
            } => vec![PeerReaction::SegmentRequested {
                external_id: segment_id,
                request_id,
                byte_from,
            }],
            PeerCommand::SegmentData {
                segment_id,
                request_id,
                total_bytes,
            } => {
                if !self.is_current_download(segment_id, request_id) {
                    return Vec::new();
                }
                self.handle_segment_header(total_bytes, ctx)
            }
            PeerCommand::SegmentDataSendingCompleted {
                segment_id,
                request_id,
            } => {
                if !self.is_current_download(segment_id, request_id) {
                    return Vec::new();
                }
                self.handle_sending_completed(ctx)
            }
            PeerCommand::SegmentAbsent {
                segment_id,
                request_id,
            } => {
                if !self.is_current_download(segment_id, request_id) {
                    return Vec::new();
                }
                self.remote_loaded.remove(&segment_id);
                self.fail_download(RequestError::PeerSegmentAbsent, ctx)
            }
            PeerCommand::CancelSegmentRequest {
                segment_id,
                request_id,
            } => {
                let matches_upload = self.wire.upload().is_some_and(|upload| {
                    upload.segment_id() == segment_id && upload.request_id() == request_id
                });
                if matches_upload {
                    self.wire.stop_upload();
                    tracing::debug!(peer = %self.id, segment = segment_id, "Upload cancelled by peer");
                }
                Vec::new()
            }
        }
    }

    fn handle_segment_header(&mut self, total_bytes: i64, ctx: &mut PeerContext<'_>) -> Vec<PeerReaction> {
        let Some(key) = self.downloading_key().cloned() else {
            return Vec::new();
        };
        let Ok(total_bytes) = u64::try_from(total_bytes) else {
            return self.fail_download(RequestError::PeerProtocolViolation, ctx);
        };
        let Some(request) = ctx.requests.get_mut(&key) else {
            return self.fail_download(RequestError::PeerClosed, ctx);
        };

        match request.total_bytes() {
            Some(known) if known != total_bytes => {
                return self.fail_download(RequestError::PeerResponseBytesMismatch, ctx);
            }
            Some(_) => {}
            None => {
                if let Err(error) = request.set_total_bytes(total_bytes) {
                    tracing::debug!(segment = %key, %error, "Kept earlier total size");
                }
            }
        }

        if let Some(downloading) = self.downloading.as_mut() {
            downloading.data_command_received = true;
        }
        self.timeout.restart();
        Vec::new()
    }

    fn handle_sending_completed(&mut self, ctx: &mut PeerContext<'_>) -> Vec<PeerReaction> {
        let Some(downloading) = self.downloading.clone() else {
            return Vec::new();
        };
        let complete = ctx.requests.get(&downloading.key).is_some_and(|request| {
            request.is_loading() && request.total_bytes() == Some(request.loaded_bytes())
        });
        if !downloading.data_command_received || !complete {
            return self.fail_download(RequestError::PeerResponseBytesMismatch, ctx);
        }

        self.downloading = None;
        self.timeout.clear();
        self.download_errors = 0;
        vec![PeerReaction::DownloadFinished {
            key: downloading.key,
        }]
    }

    fn handle_segment_chunk(&mut self, chunk: Bytes, ctx: &mut PeerContext<'_>) -> Vec<PeerReaction> {
        let Some(downloading) = self.downloading.as_ref() else {
            // Late bytes of a cancelled request
            return Vec::new();
        };
        if !downloading.data_command_received {
            return self.fail_download(RequestError::PeerProtocolViolation, ctx);
        }
        let key = downloading.key.clone();
        let Some(request) = ctx.requests.get_mut(&key) else {
            return self.fail_download(RequestError::PeerClosed, ctx);
        };

        let length = chunk.len() as u64;
        if matches!(request.total_bytes(), Some(total) if request.loaded_bytes() + length > total) {
            return self.fail_download(RequestError::PeerResponseBytesMismatch, ctx);
        }
        if request.add_loaded_chunk(chunk, ctx.bandwidth, ctx.now).is_err() {
            return self.fail_download(RequestError::PeerProtocolViolation, ctx);
        }

        self.timeout.restart();
        self.traffic.downloaded_bytes += length;
        vec![PeerReaction::ChunkDownloaded { bytes: length }]
    }

    fn fail_download(&mut self, error: RequestError, ctx: &mut PeerContext<'_>) -> Vec<PeerReaction> {
        let Some(downloading) = self.downloading.take() else {
            return Vec::new();
        };
        self.timeout.clear();

        if let Some(request) = ctx.requests.get_mut(&downloading.key) {
            if matches!(
                error,
                RequestError::PeerResponseBytesMismatch | RequestError::PeerProtocolViolation
            ) {
                request.clear_loaded_bytes();
            }
            if request.is_loading() && request.current_peer() == Some(&self.id) {
                if let Err(state) = request.abort_on_error(error.clone(), ctx.bandwidth, ctx.now) {
                    tracing::debug!(peer = %self.id, error = %state, "Request already settled");
                }
            }
        }

        if error == RequestError::BytesReceivingTimeout {
            let _ = self.wire.send_command(&PeerCommand::CancelSegmentRequest {
                segment_id: downloading.external_id,
                request_id: downloading.request_id,
            });
        }

        tracing::warn!(
            peer = %self.id,
            segment = %downloading.key,
            %error,
            "Peer download failed"
        );

        let counted = self.settings.counts_failure(&error);
        let mut reactions = vec![PeerReaction::DownloadFailed {
            key: downloading.key,
            error,
        }];
        if counted {
            self.download_errors += 1;
            if self.download_errors >= self.settings.error_retries {
                tracing::warn!(
                    peer = %self.id,
                    failures = self.download_errors,
                    "Peer exceeded failure budget"
                );
                reactions.push(PeerReaction::Destroy);
            }
        }
        reactions
    }

    fn after_upload_progress(
        &mut self,
        progress: UploadProgress,
        segment_id: i64,
        request_id: i64,
    ) -> Result<Vec<PeerReaction>, ShoalError> {
        let sent_bytes = match progress {
            UploadProgress::Paused { sent_bytes } => sent_bytes,
            UploadProgress::Finished { sent_bytes } => {
                self.wire
                    .send_command(&PeerCommand::SegmentDataSendingCompleted {
                        segment_id,
                        request_id,
                    })?;
                sent_bytes
            }
        };
        self.traffic.uploaded_bytes += sent_bytes as u64;

        let mut reactions = Vec::new();
        if sent_bytes > 0 {
            reactions.push(PeerReaction::ChunkUploaded {
                bytes: sent_bytes as u64,
            });
        }
        Ok(reactions)
    }

    fn is_current_download(&self, segment_id: i64, request_id: i64) -> bool {
        self.downloading.as_ref().is_some_and(|downloading| {
            downloading.external_id == segment_id && downloading.request_id == request_id
        })
    }
}
