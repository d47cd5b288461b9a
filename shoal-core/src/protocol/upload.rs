//! Flow-controlled upload of raw segment bytes.

use bytes::Bytes;

use crate::transport::{DataChannel, TransportError};

/// State of an upload after feeding the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadProgress {
    /// Channel buffer is above its low-water mark; resume on drain
    Paused { sent_bytes: usize },
    Finished { sent_bytes: usize },
}

/// Cursor over the bytes of one segment, yielding raw chunks.
///
/// Chunks are zero-copy slices of the segment buffer.
#[derive(Debug, Clone)]
pub struct ChunkedUpload {
    data: Bytes,
    cursor: usize,
    chunk_size: usize,
    segment_id: i64,
    request_id: i64,
}

impl ChunkedUpload {
    pub fn new(segment_id: i64, request_id: i64, data: Bytes, chunk_size: usize) -> Self {
        Self {
            data,
            cursor: 0,
            chunk_size: chunk_size.max(1),
            segment_id,
            request_id,
        }
    }

    pub fn segment_id(&self) -> i64 {
        self.segment_id
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    pub fn total_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn sent_bytes(&self) -> usize {
        self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.data.len()
    }

    /// Sends chunks until done or until the channel buffer is full.
    ///
    /// # Errors
    ///
    /// - `TransportError::Closed` - Channel closed mid-upload
    /// - `TransportError::Send` - Channel rejected a chunk
    pub fn feed(&mut self, channel: &dyn DataChannel) -> Result<UploadProgress, TransportError> {
        let mut sent_bytes = 0;
        loop {
            if self.is_finished() {
                return Ok(UploadProgress::Finished { sent_bytes });
            }
            if channel.buffered_amount() > channel.buffered_amount_low_threshold() {
                return Ok(UploadProgress::Paused { sent_bytes });
            }
            if let Some(chunk) = self.next() {
                sent_bytes += chunk.len();
                channel.send(chunk)?;
            }
        }
    }
}

impl Iterator for ChunkedUpload {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.is_finished() {
            return None;
        }
        let end = (self.cursor + self.chunk_size).min(self.data.len());
        let chunk = self.data.slice(self.cursor..end);
        self.cursor = end;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelEvent;
    use crate::transport::memory::MemoryChannel;

    #[test]
    fn test_chunks_cover_data_without_copy() {
        let data = Bytes::from(vec![3u8; 10]);
        let chunks: Vec<Bytes> = ChunkedUpload::new(1, 2, data, 4).collect();

        assert_eq!(
            chunks.iter().map(Bytes::len).collect::<Vec<_>>(),
            [4, 4, 2]
        );
    }

    #[test]
    fn test_empty_upload_finishes_immediately() {
        let ((channel, _rx), _) = MemoryChannel::pair(0);
        let mut upload = ChunkedUpload::new(1, 2, Bytes::new(), 4);
        assert_eq!(
            upload.feed(channel.as_ref()).unwrap(),
            UploadProgress::Finished { sent_bytes: 0 }
        );
    }

    #[tokio::test]
    async fn test_feed_pauses_above_low_water_mark_and_resumes() {
        let ((sender, _sender_rx), (_receiver, mut receiver_rx)) = MemoryChannel::pair(5);
        let _ = receiver_rx.recv().await;
        sender.set_holding(true);

        let mut upload = ChunkedUpload::new(1, 2, Bytes::from(vec![1u8; 20]), 4);

        // 4 and 8 buffered bytes: the second chunk crosses the mark
        assert_eq!(
            upload.feed(sender.as_ref()).unwrap(),
            UploadProgress::Paused { sent_bytes: 8 }
        );
        assert_eq!(upload.sent_bytes(), 8);

        sender.flush();
        assert_eq!(
            upload.feed(sender.as_ref()).unwrap(),
            UploadProgress::Paused { sent_bytes: 8 }
        );
        sender.flush();
        assert_eq!(
            upload.feed(sender.as_ref()).unwrap(),
            UploadProgress::Finished { sent_bytes: 4 }
        );

        let mut received = 0;
        while let Ok(event) = receiver_rx.try_recv() {
            if let ChannelEvent::Data(chunk) = event {
                received += chunk.len();
            }
        }
        assert_eq!(received, 16);
    }

    #[test]
    fn test_feed_on_closed_channel_fails() {
        let ((channel, _rx), _) = MemoryChannel::pair(0);
        channel.close();
        let mut upload = ChunkedUpload::new(1, 2, Bytes::from_static(b"data"), 4);
        assert_eq!(upload.feed(channel.as_ref()), Err(TransportError::Closed));
    }
}
