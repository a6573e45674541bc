//! # Length-Prefix Framing
//!
//! Frames for reliable byte streams: a length prefix announces the payload
//! size, followed by exactly that many payload bytes. The prefix is either
//! a fixed-width integer in one of four layouts, a single octet, or an
//! LEB128 variable-length integer for frames of unbounded size.

use crate::binfmt;
use crate::buffer::ByteBuffer;
use crate::endpoint::{sts_n, IoError, IoResult, Sink, Source};
use crate::varint;

/// The shape of the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixKind {
    /// LEB128 variable-length integer, up to ten octets.
    Variable,
    /// A single octet; payloads up to 255 bytes.
    Octet,
    /// 16-bit little-endian.
    Le16,
    /// 32-bit little-endian.
    Le32,
    /// 16-bit big-endian.
    Be16,
    /// 32-bit big-endian.
    Be32,
}

impl PrefixKind {
    /// The largest payload size this prefix can announce.
    #[must_use]
    pub const fn max_payload(self) -> u64 {
        match self {
            Self::Variable => u64::MAX,
            Self::Octet => u8::MAX as u64,
            Self::Le16 | Self::Be16 => u16::MAX as u64,
            Self::Le32 | Self::Be32 => u32::MAX as u64,
        }
    }

    /// Encoded prefix size in octets; `None` for the variable kind.
    #[must_use]
    pub const fn size(self) -> Option<usize> {
        match self {
            Self::Variable => None,
            Self::Octet => Some(1),
            Self::Le16 | Self::Be16 => Some(2),
            Self::Le32 | Self::Be32 => Some(4),
        }
    }
}

/// Encode a length prefix into `buf`, returning the number of octets
/// written. Sizes the prefix cannot represent are rejected with
/// [`IoError::InvalidInput`].
fn encode_prefix(kind: PrefixKind, buf: &mut [u8], n: usize) -> IoResult<usize> {
    let n64 = n as u64;
    if n64 > kind.max_payload() {
        return Err(IoError::InvalidInput);
    }
    match kind {
        PrefixKind::Variable => {
            let mut b = ByteBuffer::with_capacity(varint::MAX_OCTETS_64BIT);
            varint::encode_u64(n64, &mut b)?;
            let used = b.used();
            buf[..used].copy_from_slice(b.filled());
            Ok(used)
        }
        PrefixKind::Octet => {
            buf[0] = n as u8;
            Ok(1)
        }
        PrefixKind::Le16 => {
            binfmt::put_u16_le(buf, n as u16);
            Ok(2)
        }
        PrefixKind::Be16 => {
            binfmt::put_u16_be(buf, n as u16);
            Ok(2)
        }
        PrefixKind::Le32 => {
            binfmt::put_u32_le(buf, n as u32);
            Ok(4)
        }
        PrefixKind::Be32 => {
            binfmt::put_u32_be(buf, n as u32);
            Ok(4)
        }
    }
}

/// Write one frame: prefix, then the payload. Returns the total number of
/// bytes put into the sink.
pub fn encode_to_sink(kind: PrefixKind, sink: &mut Sink<'_>, payload: &[u8]) -> IoResult<usize> {
    encode_chunks_to_sink(kind, sink, &[payload])
}

/// Write one frame whose payload is scattered over several slices. The
/// prefix announces the combined size; the chunks follow back to back.
pub fn encode_chunks_to_sink(
    kind: PrefixKind,
    sink: &mut Sink<'_>,
    chunks: &[&[u8]],
) -> IoResult<usize> {
    let total: usize = chunks.iter().map(|c| c.len()).sum();

    let mut prefix = [0u8; varint::MAX_OCTETS_64BIT];
    let prefix_len = encode_prefix(kind, &mut prefix, total)?;

    sink.put_chunk(&prefix[..prefix_len])?;
    for chunk in chunks {
        if !chunk.is_empty() {
            sink.put_chunk(chunk)?;
        }
    }

    Ok(prefix_len + total)
}

/// Read and decode a length prefix from a source.
pub fn decode_prefix(kind: PrefixKind, source: &mut Source<'_>) -> IoResult<u64> {
    match kind.size() {
        None => varint::u64_from_source(source),
        Some(size) => {
            let mut buf = [0u8; 4];
            source.get_chunk(&mut buf[..size])?;
            Ok(match kind {
                PrefixKind::Octet => u64::from(buf[0]),
                PrefixKind::Le16 => u64::from(binfmt::get_u16_le(&buf)),
                PrefixKind::Be16 => u64::from(binfmt::get_u16_be(&buf)),
                PrefixKind::Le32 => u64::from(binfmt::get_u32_le(&buf)),
                PrefixKind::Be32 => u64::from(binfmt::get_u32_be(&buf)),
                PrefixKind::Variable => unreachable!("handled above"),
            })
        }
    }
}

/// Read one frame from `source`, moving exactly the announced number of
/// payload bytes into `sink`. Returns the payload size. A sink that cannot
/// take the announced size fails the transfer with [`IoError::NoMem`].
pub fn decode_to_sink(
    kind: PrefixKind,
    source: &mut Source<'_>,
    sink: &mut Sink<'_>,
) -> IoResult<usize> {
    let len = decode_prefix(kind, source)?;
    let len = usize::try_from(len).map_err(|_| IoError::NoMem)?;
    if len == 0 {
        return Ok(0);
    }
    sts_n(source, sink, len)
}

/// Read one frame's payload into a byte buffer. Fails with
/// [`IoError::NoMem`], without consuming payload bytes, when the buffer's
/// free space cannot hold the announced size.
pub fn decode_to_buffer(
    kind: PrefixKind,
    source: &mut Source<'_>,
    buffer: &mut ByteBuffer,
) -> IoResult<usize> {
    let len = decode_prefix(kind, source)?;
    if len > buffer.avail() as u64 {
        return Err(IoError::NoMem);
    }
    let len = len as usize;
    let got = source.get_chunk(&mut buffer.writable()[..len])?;
    buffer.commit(got)?;
    Ok(got)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::instrumented::InstrumentedBuffer;
    use proptest::prelude::*;

    const ALL_KINDS: [PrefixKind; 6] = [
        PrefixKind::Variable,
        PrefixKind::Octet,
        PrefixKind::Le16,
        PrefixKind::Le32,
        PrefixKind::Be16,
        PrefixKind::Be32,
    ];

    fn encode(kind: PrefixKind, payload: &[u8]) -> IoResult<Vec<u8>> {
        let mut wire = InstrumentedBuffer::with_capacity(payload.len() + 16);
        {
            let mut sink = Sink::chunk(&mut wire);
            encode_to_sink(kind, &mut sink, payload)?;
        }
        Ok(wire.buffer.filled().to_vec())
    }

    #[test]
    fn prefix_layouts_are_as_advertised() {
        assert_eq!(encode(PrefixKind::Octet, b"ab").unwrap(), b"\x02ab");
        assert_eq!(encode(PrefixKind::Le16, b"ab").unwrap(), b"\x02\x00ab");
        assert_eq!(encode(PrefixKind::Be16, b"ab").unwrap(), b"\x00\x02ab");
        assert_eq!(
            encode(PrefixKind::Le32, b"ab").unwrap(),
            b"\x02\x00\x00\x00ab"
        );
        assert_eq!(
            encode(PrefixKind::Be32, b"ab").unwrap(),
            b"\x00\x00\x00\x02ab"
        );
        assert_eq!(encode(PrefixKind::Variable, b"ab").unwrap(), b"\x02ab");
    }

    #[test]
    fn variable_prefixes_grow_with_the_payload() {
        let payload = vec![0u8; 300];
        let wire = encode(PrefixKind::Variable, &payload).unwrap();
        assert_eq!(wire[..2], [0xac, 0x02]);
        assert_eq!(wire.len(), 302);
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let payload = vec![0u8; 256];
        assert_eq!(
            encode(PrefixKind::Octet, &payload),
            Err(IoError::InvalidInput)
        );

        let payload = vec![0u8; 65536];
        assert_eq!(
            encode(PrefixKind::Le16, &payload),
            Err(IoError::InvalidInput)
        );
        assert_eq!(encode(PrefixKind::Variable, &payload).map(|w| w.len()), Ok(65539));
    }

    #[test]
    fn scattered_chunks_form_one_frame() {
        let mut wire = InstrumentedBuffer::with_capacity(32);
        {
            let mut sink = Sink::chunk(&mut wire);
            let chunks: [&[u8]; 3] = [b"he", b"ll", b"o"];
            assert_eq!(
                encode_chunks_to_sink(PrefixKind::Octet, &mut sink, &chunks),
                Ok(6)
            );
        }
        assert_eq!(wire.buffer.filled(), b"\x05hello");
    }

    #[test]
    fn decode_transfers_exactly_the_announced_size() {
        let mut wire = InstrumentedBuffer::around(ByteBuffer::from_data(b"\x03abcdef".to_vec()));
        let mut out = InstrumentedBuffer::with_capacity(16);
        {
            let mut source = Source::chunk(&mut wire);
            let mut sink = Sink::chunk(&mut out);
            assert_eq!(decode_to_sink(PrefixKind::Octet, &mut source, &mut sink), Ok(3));
        }
        assert_eq!(out.buffer.filled(), b"abc");
        // The remaining bytes are still in the source.
        assert_eq!(wire.buffer.rest(), 3);
    }

    #[test]
    fn decode_to_buffer_rejects_oversized_frames() {
        let mut wire = InstrumentedBuffer::around(ByteBuffer::from_data(b"\x09waytoobig".to_vec()));
        let mut out = ByteBuffer::with_capacity(4);
        let mut source = Source::chunk(&mut wire);
        assert_eq!(
            decode_to_buffer(PrefixKind::Octet, &mut source, &mut out),
            Err(IoError::NoMem)
        );
    }

    #[test]
    fn overlong_variable_prefixes_are_rejected() {
        let mut wire =
            InstrumentedBuffer::around(ByteBuffer::from_data(vec![0x80; 16]));
        let mut out = InstrumentedBuffer::with_capacity(16);
        let mut source = Source::chunk(&mut wire);
        let mut sink = Sink::chunk(&mut out);
        assert_eq!(
            decode_to_sink(PrefixKind::Variable, &mut source, &mut sink),
            Err(IoError::BadMessage)
        );
    }

    proptest! {
        #[test]
        fn roundtrips_for_every_kind(
            payload in proptest::collection::vec(any::<u8>(), 0..200),
        ) {
            for kind in ALL_KINDS {
                let wire = encode(kind, &payload).unwrap();
                let mut wire = InstrumentedBuffer::around(ByteBuffer::from_data(wire));
                let mut out = InstrumentedBuffer::with_capacity(256);
                {
                    let mut source = Source::chunk(&mut wire);
                    let mut sink = Sink::chunk(&mut out);
                    prop_assert_eq!(
                        decode_to_sink(kind, &mut source, &mut sink),
                        Ok(payload.len())
                    );
                }
                prop_assert_eq!(out.buffer.filled(), &payload[..]);
            }
        }
    }
}
