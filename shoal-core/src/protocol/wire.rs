//! Framing, command codec and upload state of one peer connection.

use std::sync::Arc;

use bytes::Bytes;

use super::{
    ChunkedUpload, CommandChunkJoiner, PeerCommand, ProtocolError, UploadProgress, frame_command,
    is_command_chunk,
};
use crate::ShoalError;
use crate::transport::{DataChannel, TransportError};

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Command(PeerCommand),
    /// Raw bytes of the segment being downloaded
    SegmentChunk(Bytes),
    /// Part of a chunked command; more chunks expected
    Pending,
    /// Undecodable command; the partial buffer was dropped
    Malformed(ProtocolError),
}

/// Wire endpoint over a data channel.
///
/// Holds at most one upload. The upload only advances on `start_upload`
/// and on `resume_upload` (channel drained), so stopping it leaves nothing
/// behind.
pub struct PeerWire {
    channel: Arc<dyn DataChannel>,
    joiner: CommandChunkJoiner,
    upload: Option<ChunkedUpload>,
    max_message_size: usize,
}

impl PeerWire {
    pub fn new(channel: Arc<dyn DataChannel>, max_message_size: usize) -> Self {
        Self {
            channel,
            joiner: CommandChunkJoiner::new(),
            upload: None,
            max_message_size,
        }
    }

    pub fn channel(&self) -> &Arc<dyn DataChannel> {
        &self.channel
    }

    pub fn receive(&mut self, data: Bytes) -> IncomingMessage {
        if !is_command_chunk(&data) {
            return IncomingMessage::SegmentChunk(data);
        }

        match self.joiner.add_chunk(&data) {
            Ok(None) => IncomingMessage::Pending,
            Ok(Some(mut payload)) => match PeerCommand::decode(&mut payload) {
                Ok(command) => IncomingMessage::Command(command),
                Err(error) => IncomingMessage::Malformed(error),
            },
            Err(error) => IncomingMessage::Malformed(error.into()),
        }
    }

    /// Encodes, frames and sends a command.
    ///
    /// # Errors
    ///
    /// - `ShoalError::Protocol` - Command cannot be encoded or framed
    /// - `ShoalError::Transport` - Channel rejected a chunk
    pub fn send_command(&self, command: &PeerCommand) -> Result<(), ShoalError> {
        let encoded = command.encode()?;
        for chunk in frame_command(&encoded, self.max_message_size)? {
            self.channel.send(chunk)?;
        }
        Ok(())
    }

    /// Replaces any running upload and starts feeding the new one.
    ///
    /// # Errors
    ///
    /// - `TransportError` - Channel rejected a chunk; the upload is dropped
    pub fn start_upload(
        &mut self,
        segment_id: i64,
        request_id: i64,
        data: Bytes,
    ) -> Result<UploadProgress, TransportError> {
        self.upload = Some(ChunkedUpload::new(
            segment_id,
            request_id,
            data,
            self.max_message_size,
        ));
        self.resume_upload().map(|progress| {
            progress.unwrap_or(UploadProgress::Finished { sent_bytes: 0 })
        })
    }

    /// Feeds the running upload after the channel drained.
    ///
    /// # Errors
    ///
    /// - `TransportError` - Channel rejected a chunk; the upload is dropped
    pub fn resume_upload(&mut self) -> Result<Option<UploadProgress>, TransportError> {
        let Some(upload) = self.upload.as_mut() else {
            return Ok(None);
        };
        match upload.feed(self.channel.as_ref()) {
            Ok(progress) => {
                if matches!(progress, UploadProgress::Finished { .. }) {
                    self.upload = None;
                }
                Ok(Some(progress))
            }
            Err(error) => {
                self.upload = None;
                Err(error)
            }
        }
    }

    pub fn stop_upload(&mut self) -> Option<ChunkedUpload> {
        self.upload.take()
    }

    pub fn upload(&self) -> Option<&ChunkedUpload> {
        self.upload.as_ref()
    }

    pub fn close(&mut self) {
        self.upload = None;
        self.joiner.reset();
        self.channel.close();
    }
}
