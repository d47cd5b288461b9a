//! Item encoding: signed ints and similar-int arrays.
//!
//! Item header byte is `(kind << 4) | payload_len`.
//!
//! Int payload: big-endian magnitude in the minimal number of bytes that
//! leaves the top bit free; that bit carries the sign.
//!
//! Similar-int array: `[1 << 4][group_count]`, then per group an int item
//! holding `common | count` (common = value with the low byte cleared)
//! followed by `count` low bytes.

use bytes::{Buf, BufMut};

use super::ProtocolError;

pub(crate) const INT_KIND: u8 = 0;
pub(crate) const SIMILAR_INT_ARRAY_KIND: u8 = 1;

const MAX_INT_BYTES: usize = 9;
const MAX_GROUP_ENTRIES: usize = 0xff;
const MAX_GROUPS: usize = 0xff;

pub fn encode_int<W: BufMut>(value: i64, w: &mut W) {
    let magnitude = value.unsigned_abs();
    let bits = 64 - magnitude.leading_zeros() as usize;
    let length = (bits + 8) / 8;

    w.put_u8((INT_KIND << 4) | length as u8);
    for index in (0..length).rev() {
        let shift = index * 8;
        let mut byte = if shift < 64 {
            (magnitude >> shift) as u8
        } else {
            0
        };
        if index == length - 1 && value < 0 {
            byte |= 0x80;
        }
        w.put_u8(byte);
    }
}

pub fn decode_int<R: Buf>(r: &mut R) -> Result<i64, ProtocolError> {
    let header = read_u8(r)?;
    let kind = header >> 4;
    if kind != INT_KIND {
        return Err(ProtocolError::InvalidItem {
            reason: format!("expected int item, found kind {kind}"),
        });
    }

    let length = (header & 0x0f) as usize;
    if length == 0 || length > MAX_INT_BYTES {
        return Err(ProtocolError::InvalidItem {
            reason: format!("int length {length} out of range"),
        });
    }
    ensure_remaining(r, length)?;

    let first = r.get_u8();
    let negative = first & 0x80 != 0;
    let mut magnitude = u128::from(first & 0x7f);
    for _ in 1..length {
        magnitude = (magnitude << 8) | u128::from(r.get_u8());
    }

    let value = if negative {
        -(magnitude as i128)
    } else {
        magnitude as i128
    };
    i64::try_from(value).map_err(|_| ProtocolError::InvalidItem {
        reason: "int does not fit in 64 bits".to_string(),
    })
}

/// Encodes values grouped by shared high-order bits, in first-seen order.
///
/// # Errors
///
/// - `ProtocolError::TooManyGroups` - Values span more than 255 groups
pub fn encode_similar_int_array<W: BufMut>(values: &[i64], w: &mut W) -> Result<(), ProtocolError> {
    let mut groups: Vec<(i64, Vec<u8>)> = Vec::new();

    for value in values {
        let common = value & !0xff;
        let low = (value & 0xff) as u8;
        // Only the newest group of a prefix can still have room
        match groups
            .iter_mut()
            .rev()
            .find(|(prefix, entries)| *prefix == common && entries.len() < MAX_GROUP_ENTRIES)
        {
            Some((_, entries)) => entries.push(low),
            None => groups.push((common, vec![low])),
        }
    }

    if groups.len() > MAX_GROUPS {
        return Err(ProtocolError::TooManyGroups {
            groups: groups.len(),
        });
    }

    w.put_u8(SIMILAR_INT_ARRAY_KIND << 4);
    w.put_u8(groups.len() as u8);
    for (common, entries) in &groups {
        encode_int(common | entries.len() as i64, w);
        w.put_slice(entries);
    }
    Ok(())
}

pub fn decode_similar_int_array<R: Buf>(r: &mut R) -> Result<Vec<i64>, ProtocolError> {
    let header = read_u8(r)?;
    let kind = header >> 4;
    if kind != SIMILAR_INT_ARRAY_KIND {
        return Err(ProtocolError::InvalidItem {
            reason: format!("expected similar int array, found kind {kind}"),
        });
    }

    let group_count = read_u8(r)?;
    let mut values = Vec::new();
    for _ in 0..group_count {
        let common_and_count = decode_int(r)?;
        let count = (common_and_count & 0xff) as usize;
        let common = common_and_count & !0xff;
        ensure_remaining(r, count)?;
        values.extend((0..count).map(|_| common | i64::from(r.get_u8())));
    }
    Ok(values)
}

/// Kind nibble of the next item without consuming it.
pub(crate) fn peek_item_kind<R: Buf>(r: &R) -> Result<u8, ProtocolError> {
    r.chunk()
        .first()
        .map(|header| header >> 4)
        .ok_or(ProtocolError::UnexpectedEnd { needed: 1 })
}

pub(crate) fn read_u8<R: Buf>(r: &mut R) -> Result<u8, ProtocolError> {
    ensure_remaining(r, 1)?;
    Ok(r.get_u8())
}

fn ensure_remaining<R: Buf>(r: &R, required: usize) -> Result<(), ProtocolError> {
    let needed = required.saturating_sub(r.remaining());
    if needed > 0 {
        Err(ProtocolError::UnexpectedEnd { needed })
    } else {
        Ok(())
    }
}
