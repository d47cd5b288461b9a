//! Peer wire protocol.
//!
//! Commands are compact binary buffers: a command-type byte followed by
//! named items (signed ints and similar-int arrays). Commands larger than
//! the channel's maximum message size are split into framed chunks and
//! joined on receipt. Segment bytes travel as raw, unframed chunks.

mod command;
mod framing;
mod serialization;
mod upload;
mod wire;

pub use command::{PeerCommand, PeerCommandType};
pub use framing::{CommandChunkJoiner, FRAMING_OVERHEAD, frame_command, is_command_chunk};
pub use serialization::{
    decode_int, decode_similar_int_array, encode_int, encode_similar_int_array,
};
pub use upload::{ChunkedUpload, UploadProgress};
pub use wire::{IncomingMessage, PeerWire};

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unexpected end of buffer, {needed} more bytes needed")]
    UnexpectedEnd { needed: usize },

    #[error("Empty command buffer")]
    EmptyCommand,

    #[error("Unknown command type {kind}")]
    UnknownCommand { kind: u8 },

    #[error("Unknown item type {kind} in field '{name}'")]
    UnknownFieldType { name: char, kind: u8 },

    #[error("Missing field '{name}'")]
    MissingField { name: char },

    #[error("Invalid item: {reason}")]
    InvalidItem { reason: String },

    #[error("Similar int array needs {groups} groups, at most 255 fit")]
    TooManyGroups { groups: usize },

    #[error("Max message size {max_message_size} leaves no room for framing")]
    MessageSizeTooSmall { max_message_size: usize },

    #[error("Chunk joining failed: {0}")]
    Joining(#[from] JoiningError),
}

/// Reassembly failures of chunked commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoiningError {
    #[error("Continuation chunk received without a first chunk")]
    NoFirstChunk,

    #[error("First chunk received before the previous command completed")]
    IncompleteJoining,
}
