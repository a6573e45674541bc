//! # Variable-Length Integers
//!
//! LEB128 encoding and decoding for 32- and 64-bit integers, as used by the
//! `Variable` length-prefix framing kind. Values are emitted seven bits per
//! octet, least significant group first, with the high bit of each octet
//! flagging continuation.
//!
//! Signed values travel as the two's-complement bit pattern of the
//! same-width unsigned type; `-1i32` encodes as `ff ff ff ff 0f`.

use crate::buffer::ByteBuffer;
use crate::endpoint::{IoError, IoResult, Source};

/// Maximum octet count of an encoded 32-bit value.
pub const MAX_OCTETS_32BIT: usize = 5;
/// Maximum octet count of an encoded 64-bit value.
pub const MAX_OCTETS_64BIT: usize = 10;

const CONTINUATION: u8 = 0x80;

/// Append a 64-bit unsigned value to a buffer in LEB128 encoding.
pub fn encode_u64(value: u64, buffer: &mut ByteBuffer) -> IoResult<()> {
    let mut rest = value;
    loop {
        let mut octet = (rest & 0x7f) as u8;
        rest >>= 7;
        if rest != 0 {
            octet |= CONTINUATION;
        }
        buffer.add(&[octet])?;
        if rest == 0 {
            return Ok(());
        }
    }
}

/// Append a 32-bit unsigned value to a buffer in LEB128 encoding.
pub fn encode_u32(value: u32, buffer: &mut ByteBuffer) -> IoResult<()> {
    encode_u64(u64::from(value), buffer)
}

/// Append a 64-bit signed value to a buffer in LEB128 encoding.
pub fn encode_s64(value: i64, buffer: &mut ByteBuffer) -> IoResult<()> {
    encode_u64(value as u64, buffer)
}

/// Append a 32-bit signed value to a buffer in LEB128 encoding.
pub fn encode_s32(value: i32, buffer: &mut ByteBuffer) -> IoResult<()> {
    encode_u32(value as u32, buffer)
}

fn decode(buffer: &mut ByteBuffer, max_octets: usize) -> IoResult<u64> {
    let mut value = 0u64;
    for i in 0..max_octets {
        let mut octet = [0u8; 1];
        buffer.consume(&mut octet)?;
        value |= u64::from(octet[0] & 0x7f) << (i * 7);
        if octet[0] & CONTINUATION == 0 {
            return Ok(value);
        }
    }
    // Continuation past the maximum width is not a valid encoding.
    Err(IoError::BadMessage)
}

/// Decode a 64-bit unsigned value from a buffer, advancing its read mark.
pub fn decode_u64(buffer: &mut ByteBuffer) -> IoResult<u64> {
    decode(buffer, MAX_OCTETS_64BIT)
}

/// Decode a 32-bit unsigned value from a buffer, advancing its read mark.
pub fn decode_u32(buffer: &mut ByteBuffer) -> IoResult<u32> {
    decode(buffer, MAX_OCTETS_32BIT).map(|v| v as u32)
}

/// Decode a 64-bit signed value from a buffer, advancing its read mark.
pub fn decode_s64(buffer: &mut ByteBuffer) -> IoResult<i64> {
    decode_u64(buffer).map(|v| v as i64)
}

/// Decode a 32-bit signed value from a buffer, advancing its read mark.
pub fn decode_s32(buffer: &mut ByteBuffer) -> IoResult<i32> {
    decode_u32(buffer).map(|v| v as i32)
}

fn from_source(source: &mut Source<'_>, max_octets: usize) -> IoResult<u64> {
    let mut value = 0u64;
    for i in 0..max_octets {
        let octet = source.get_octet()?;
        value |= u64::from(octet & 0x7f) << (i * 7);
        if octet & CONTINUATION == 0 {
            return Ok(value);
        }
    }
    Err(IoError::BadMessage)
}

/// Read a 64-bit unsigned value octet by octet from a source.
pub fn u64_from_source(source: &mut Source<'_>) -> IoResult<u64> {
    from_source(source, MAX_OCTETS_64BIT)
}

/// Read a 32-bit unsigned value octet by octet from a source.
pub fn u32_from_source(source: &mut Source<'_>) -> IoResult<u32> {
    from_source(source, MAX_OCTETS_32BIT).map(|v| v as u32)
}

/// Read a 64-bit signed value octet by octet from a source.
pub fn s64_from_source(source: &mut Source<'_>) -> IoResult<i64> {
    u64_from_source(source).map(|v| v as i64)
}

/// Read a 32-bit signed value octet by octet from a source.
pub fn s32_from_source(source: &mut Source<'_>) -> IoResult<i32> {
    u32_from_source(source).map(|v| v as i32)
}
