//! Command framing and reassembly.
//!
//! A whole command travels as `cstr <payload> cend`. A command too large
//! for one message is split into near-equal parts: the first framed as
//! `cstr .. dend`, middle ones as `dstr .. dend`, the last as
//! `dstr .. cend`. A buffer is a command chunk iff it starts with a start
//! marker and ends with an end marker; anything else is segment data.

use bytes::{Bytes, BytesMut};

use super::{JoiningError, ProtocolError};

const MARKER_LEN: usize = 4;
const COMMAND_START: &[u8; MARKER_LEN] = b"cstr";
const COMMAND_END: &[u8; MARKER_LEN] = b"cend";
const DIVIDED_START: &[u8; MARKER_LEN] = b"dstr";
const DIVIDED_END: &[u8; MARKER_LEN] = b"dend";

/// Bytes added to every framed chunk.
pub const FRAMING_OVERHEAD: usize = 2 * MARKER_LEN;

/// Frames a serialized command into chunks of at most `max_message_size`.
///
/// # Errors
///
/// - `ProtocolError::MessageSizeTooSmall` - No payload fits next to the markers
pub fn frame_command(command: &[u8], max_message_size: usize) -> Result<Vec<Bytes>, ProtocolError> {
    if max_message_size <= FRAMING_OVERHEAD {
        return Err(ProtocolError::MessageSizeTooSmall { max_message_size });
    }

    if command.len() + FRAMING_OVERHEAD <= max_message_size {
        return Ok(vec![frame(COMMAND_START, command, COMMAND_END)]);
    }

    let mut chunk_count = command.len().div_ceil(max_message_size);
    while command.len().div_ceil(chunk_count) + FRAMING_OVERHEAD > max_message_size {
        chunk_count += 1;
    }

    let parts = split_equally(command, chunk_count);
    let last = parts.len() - 1;
    Ok(parts
        .into_iter()
        .enumerate()
        .map(|(index, part)| {
            let start = if index == 0 { COMMAND_START } else { DIVIDED_START };
            let end = if index == last { COMMAND_END } else { DIVIDED_END };
            frame(start, part, end)
        })
        .collect())
}

/// Whether a received buffer carries (part of) a command.
pub fn is_command_chunk(buffer: &[u8]) -> bool {
    if buffer.len() < FRAMING_OVERHEAD {
        return false;
    }
    let (start, rest) = buffer.split_at(MARKER_LEN);
    let end = &rest[rest.len() - MARKER_LEN..];
    (start == COMMAND_START || start == DIVIDED_START) && (end == COMMAND_END || end == DIVIDED_END)
}

/// Reassembles framed chunks into serialized commands.
#[derive(Debug, Default)]
pub struct CommandChunkJoiner {
    buffer: BytesMut,
    joining: bool,
}

impl CommandChunkJoiner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_joining(&self) -> bool {
        self.joining
    }

    /// Feeds one command chunk; returns the payload once complete.
    ///
    /// On error the partial command is discarded and the joiner waits for
    /// a fresh first chunk.
    ///
    /// # Errors
    ///
    /// - `JoiningError::NoFirstChunk` - Continuation without a first chunk
    /// - `JoiningError::IncompleteJoining` - First chunk while a command is pending
    pub fn add_chunk(&mut self, chunk: &[u8]) -> Result<Option<Bytes>, JoiningError> {
        let (start, rest) = chunk.split_at(MARKER_LEN.min(chunk.len()));
        let payload_end = rest.len().saturating_sub(MARKER_LEN);
        let (payload, end) = rest.split_at(payload_end);
        let is_first = start == COMMAND_START;
        let is_last = end == COMMAND_END;

        match (self.joining, is_first) {
            (false, false) => {
                self.reset();
                return Err(JoiningError::NoFirstChunk);
            }
            (true, true) => {
                self.reset();
                return Err(JoiningError::IncompleteJoining);
            }
            _ => {}
        }

        if is_first && is_last {
            return Ok(Some(Bytes::copy_from_slice(payload)));
        }

        self.joining = true;
        self.buffer.extend_from_slice(payload);
        if is_last {
            self.joining = false;
            return Ok(Some(self.buffer.split().freeze()));
        }
        Ok(None)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.joining = false;
    }
}

fn frame(start: &[u8], payload: &[u8], end: &[u8]) -> Bytes {
    let mut buffer = BytesMut::with_capacity(payload.len() + FRAMING_OVERHEAD);
    buffer.extend_from_slice(start);
    buffer.extend_from_slice(payload);
    buffer.extend_from_slice(end);
    buffer.freeze()
}

/// Splits into `count` parts whose lengths differ by at most one.
fn split_equally(buffer: &[u8], count: usize) -> Vec<&[u8]> {
    let base = buffer.len() / count;
    let remainder = buffer.len() % count;
    let mut parts = Vec::with_capacity(count);
    let mut offset = 0;
    for index in 0..count {
        let length = base + usize::from(index < remainder);
        parts.push(&buffer[offset..offset + length]);
        offset += length;
    }
    parts
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn join_all(joiner: &mut CommandChunkJoiner, chunks: &[Bytes]) -> Option<Bytes> {
        let mut result = None;
        for chunk in chunks {
            assert!(is_command_chunk(chunk));
            result = joiner.add_chunk(chunk).unwrap();
        }
        result
    }

    #[test]
    fn test_small_command_framed_whole() {
        let chunks = frame_command(b"abc", 64).unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"cstrabccend")]);

        let mut joiner = CommandChunkJoiner::new();
        assert_eq!(joiner.add_chunk(&chunks[0]).unwrap().unwrap(), &b"abc"[..]);
    }

    #[test]
    fn test_large_command_split_under_limit() {
        let command: Vec<u8> = (0..1000u32).map(|index| index as u8).collect();
        let chunks = frame_command(&command, 100).unwrap();

        assert!(chunks.len() > 10);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 100));
        assert!(chunks[0].starts_with(COMMAND_START));
        assert!(chunks[0].ends_with(DIVIDED_END));
        assert!(chunks[1].starts_with(DIVIDED_START));
        assert!(chunks.last().unwrap().ends_with(COMMAND_END));

        let mut joiner = CommandChunkJoiner::new();
        assert_eq!(join_all(&mut joiner, &chunks).unwrap(), command);
        assert!(!joiner.is_joining());
    }

    #[test]
    fn test_continuation_without_first_chunk_rejected() {
        let command = vec![7u8; 300];
        let chunks = frame_command(&command, 100).unwrap();
        let mut joiner = CommandChunkJoiner::new();

        assert_eq!(joiner.add_chunk(&chunks[1]), Err(JoiningError::NoFirstChunk));

        // Joiner recovers for the next complete command
        assert_eq!(join_all(&mut joiner, &chunks).unwrap(), command);
    }

    #[test]
    fn test_truncated_command_rejected_then_recovers() {
        let command = vec![1u8; 300];
        let chunks = frame_command(&command, 100).unwrap();
        let mut joiner = CommandChunkJoiner::new();

        assert!(joiner.add_chunk(&chunks[0]).unwrap().is_none());
        // Rest of the first command lost, a new command starts
        assert_eq!(
            joiner.add_chunk(&chunks[0]),
            Err(JoiningError::IncompleteJoining)
        );
        assert!(!joiner.is_joining());

        assert_eq!(join_all(&mut joiner, &chunks).unwrap(), command);
    }

    #[test]
    fn test_segment_data_is_not_a_command_chunk() {
        assert!(!is_command_chunk(b"raw media bytes"));
        assert!(!is_command_chunk(b"cstr"));
        assert!(!is_command_chunk(b"cstrpayload"));
        assert!(is_command_chunk(b"dstrpayloaddend"));
    }

    #[test]
    fn test_tiny_message_size_rejected() {
        assert_eq!(
            frame_command(b"abc", FRAMING_OVERHEAD),
            Err(ProtocolError::MessageSizeTooSmall {
                max_message_size: FRAMING_OVERHEAD
            })
        );
    }

    proptest! {
        #[test]
        fn test_reassembly_at_any_chunk_size(
            command in prop::collection::vec(any::<u8>(), 1..2000),
            max_message_size in (FRAMING_OVERHEAD + 1)..300,
        ) {
            let chunks = frame_command(&command, max_message_size).unwrap();
            prop_assert!(chunks.iter().all(|chunk| chunk.len() <= max_message_size));

            let mut joiner = CommandChunkJoiner::new();
            let mut joined = None;
            for chunk in &chunks {
                prop_assert!(is_command_chunk(chunk));
                joined = joiner.add_chunk(chunk).unwrap();
            }
            prop_assert_eq!(joined.unwrap().to_vec(), command);
        }
    }
}
