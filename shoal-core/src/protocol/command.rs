//! Peer commands.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ProtocolError;
use super::serialization::{
    INT_KIND, SIMILAR_INT_ARRAY_KIND, decode_int, decode_similar_int_array, encode_int,
    encode_similar_int_array, peek_item_kind, read_u8,
};

const FIELD_SEGMENT_ID: u8 = b'i';
const FIELD_REQUEST_ID: u8 = b'r';
const FIELD_BYTE_FROM: u8 = b'b';
const FIELD_SIZE: u8 = b's';
const FIELD_LOADED: u8 = b'l';
const FIELD_HTTP_LOADING: u8 = b'p';

/// Command type discriminant, first byte of every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PeerCommandType {
    SegmentsAnnouncement = 0,
    SegmentRequest = 1,
    SegmentData = 2,
    SegmentDataSendingCompleted = 3,
    SegmentAbsent = 4,
    CancelSegmentRequest = 5,
}

impl TryFrom<u8> for PeerCommandType {
    type Error = ProtocolError;

    fn try_from(kind: u8) -> Result<Self, Self::Error> {
        Ok(match kind {
            0 => Self::SegmentsAnnouncement,
            1 => Self::SegmentRequest,
            2 => Self::SegmentData,
            3 => Self::SegmentDataSendingCompleted,
            4 => Self::SegmentAbsent,
            5 => Self::CancelSegmentRequest,
            _ => return Err(ProtocolError::UnknownCommand { kind }),
        })
    }
}

/// Command exchanged between peers.
///
/// Segment ids are external ids. `request_id` pairs responses with the
/// request that caused them so data of a cancelled request is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    SegmentsAnnouncement {
        loaded: Vec<i64>,
        http_loading: Vec<i64>,
    },
    SegmentRequest {
        segment_id: i64,
        request_id: i64,
        /// Resume offset into the segment
        byte_from: Option<i64>,
    },
    /// Precedes the raw bytes of a segment
    SegmentData {
        segment_id: i64,
        request_id: i64,
        total_bytes: i64,
    },
    SegmentDataSendingCompleted {
        segment_id: i64,
        request_id: i64,
    },
    SegmentAbsent {
        segment_id: i64,
        request_id: i64,
    },
    CancelSegmentRequest {
        segment_id: i64,
        request_id: i64,
    },
}

impl PeerCommand {
    pub fn command_type(&self) -> PeerCommandType {
        match self {
            PeerCommand::SegmentsAnnouncement { .. } => PeerCommandType::SegmentsAnnouncement,
            PeerCommand::SegmentRequest { .. } => PeerCommandType::SegmentRequest,
            PeerCommand::SegmentData { .. } => PeerCommandType::SegmentData,
            PeerCommand::SegmentDataSendingCompleted { .. } => {
                PeerCommandType::SegmentDataSendingCompleted
            }
            PeerCommand::SegmentAbsent { .. } => PeerCommandType::SegmentAbsent,
            PeerCommand::CancelSegmentRequest { .. } => PeerCommandType::CancelSegmentRequest,
        }
    }

    /// Serializes the command without framing.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::TooManyGroups` - An announcement list cannot be grouped
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut w = BytesMut::new();
        w.put_u8(self.command_type() as u8);

        match self {
            PeerCommand::SegmentsAnnouncement {
                loaded,
                http_loading,
            } => {
                if !loaded.is_empty() {
                    w.put_u8(FIELD_LOADED);
                    encode_similar_int_array(loaded, &mut w)?;
                }
                if !http_loading.is_empty() {
                    w.put_u8(FIELD_HTTP_LOADING);
                    encode_similar_int_array(http_loading, &mut w)?;
                }
            }
            PeerCommand::SegmentRequest {
                segment_id,
                request_id,
                byte_from,
            } => {
                put_int_field(&mut w, FIELD_SEGMENT_ID, *segment_id);
                put_int_field(&mut w, FIELD_REQUEST_ID, *request_id);
                if let Some(byte_from) = byte_from {
                    put_int_field(&mut w, FIELD_BYTE_FROM, *byte_from);
                }
            }
            PeerCommand::SegmentData {
                segment_id,
                request_id,
                total_bytes,
            } => {
                put_int_field(&mut w, FIELD_SEGMENT_ID, *segment_id);
                put_int_field(&mut w, FIELD_REQUEST_ID, *request_id);
                put_int_field(&mut w, FIELD_SIZE, *total_bytes);
            }
            PeerCommand::SegmentDataSendingCompleted {
                segment_id,
                request_id,
            }
            | PeerCommand::SegmentAbsent {
                segment_id,
                request_id,
            }
            | PeerCommand::CancelSegmentRequest {
                segment_id,
                request_id,
            } => {
                put_int_field(&mut w, FIELD_SEGMENT_ID, *segment_id);
                put_int_field(&mut w, FIELD_REQUEST_ID, *request_id);
            }
        }

        Ok(w.freeze())
    }

    /// Parses an unframed command.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::EmptyCommand` - Buffer is empty
    /// - `ProtocolError::UnknownCommand` - Unknown command-type byte
    /// - `ProtocolError::UnknownFieldType` - Item of unknown kind
    /// - `ProtocolError::MissingField` - Required field absent
    pub fn decode<R: Buf>(r: &mut R) -> Result<Self, ProtocolError> {
        if !r.has_remaining() {
            return Err(ProtocolError::EmptyCommand);
        }
        let command_type = PeerCommandType::try_from(r.get_u8())?;
        let fields = Fields::decode(r)?;

        Ok(match command_type {
            PeerCommandType::SegmentsAnnouncement => PeerCommand::SegmentsAnnouncement {
                loaded: fields.array(FIELD_LOADED),
                http_loading: fields.array(FIELD_HTTP_LOADING),
            },
            PeerCommandType::SegmentRequest => PeerCommand::SegmentRequest {
                segment_id: fields.int(FIELD_SEGMENT_ID)?,
                request_id: fields.int(FIELD_REQUEST_ID)?,
                byte_from: fields.ints.get(&FIELD_BYTE_FROM).copied(),
            },
            PeerCommandType::SegmentData => PeerCommand::SegmentData {
                segment_id: fields.int(FIELD_SEGMENT_ID)?,
                request_id: fields.int(FIELD_REQUEST_ID)?,
                total_bytes: fields.int(FIELD_SIZE)?,
            },
            PeerCommandType::SegmentDataSendingCompleted => {
                PeerCommand::SegmentDataSendingCompleted {
                    segment_id: fields.int(FIELD_SEGMENT_ID)?,
                    request_id: fields.int(FIELD_REQUEST_ID)?,
                }
            }
            PeerCommandType::SegmentAbsent => PeerCommand::SegmentAbsent {
                segment_id: fields.int(FIELD_SEGMENT_ID)?,
                request_id: fields.int(FIELD_REQUEST_ID)?,
            },
            PeerCommandType::CancelSegmentRequest => PeerCommand::CancelSegmentRequest {
                segment_id: fields.int(FIELD_SEGMENT_ID)?,
                request_id: fields.int(FIELD_REQUEST_ID)?,
            },
        })
    }
}

fn put_int_field(w: &mut BytesMut, name: u8, value: i64) {
    w.put_u8(name);
    encode_int(value, w);
}

#[derive(Default)]
struct Fields {
    ints: HashMap<u8, i64>,
    arrays: HashMap<u8, Vec<i64>>,
}

impl Fields {
    fn decode<R: Buf>(r: &mut R) -> Result<Self, ProtocolError> {
        let mut fields = Fields::default();
        while r.has_remaining() {
            let name = read_u8(r)?;
            match peek_item_kind(r)? {
                INT_KIND => {
                    fields.ints.insert(name, decode_int(r)?);
                }
                SIMILAR_INT_ARRAY_KIND => {
                    fields.arrays.insert(name, decode_similar_int_array(r)?);
                }
                kind => {
                    return Err(ProtocolError::UnknownFieldType {
                        name: char::from(name),
                        kind,
                    });
                }
            }
        }
        Ok(fields)
    }

    fn int(&self, name: u8) -> Result<i64, ProtocolError> {
        self.ints
            .get(&name)
            .copied()
            .ok_or(ProtocolError::MissingField {
                name: char::from(name),
            })
    }

    fn array(&self, name: u8) -> Vec<i64> {
        self.arrays.get(&name).cloned().unwrap_or_default()
    }
}
