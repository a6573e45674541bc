//! # SLIP Framing
//!
//! Byte-stuffed framing in the style of RFC 1055. A frame is terminated by
//! the `END` octet; occurrences of `END` and `ESC` inside the frame body
//! are replaced by two-octet escape sequences. Optionally a second `END` is
//! sent up front as a start-of-frame delimiter, which lets a receiver skip
//! line noise between frames.

use crate::endpoint::{IoError, IoResult, Sink, Source};

/// Frame delimiter octet.
pub const END: u8 = 0xc0;
/// Escape introducer octet.
pub const ESC: u8 = 0xdb;
/// Escaped form of `END`.
pub const ESC_END: u8 = 0xdc;
/// Escaped form of `ESC`.
pub const ESC_ESC: u8 = 0xdd;

/// Encoder/decoder configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slip {
    with_sof: bool,
}

impl Slip {
    /// Classic SLIP: frames are terminated by `END` only.
    #[must_use]
    pub const fn new() -> Self {
        Self { with_sof: false }
    }

    /// SLIP with a start-of-frame delimiter: frames are wrapped in `END`
    /// octets, and the decoder discards anything before the first `END`.
    #[must_use]
    pub const fn with_sof() -> Self {
        Self { with_sof: true }
    }

    /// Read one frame's worth of bytes from `source` and write its encoded
    /// form, including delimiters, to `sink`.
    ///
    /// Encoding itself cannot fail; SLIP can carry arbitrary byte
    /// sequences. Errors from either endpoint propagate verbatim.
    pub fn encode(&self, source: &mut Source<'_>, sink: &mut Sink<'_>) -> IoResult<()> {
        if self.with_sof {
            sink.put_octet(END)?;
        }

        loop {
            let octet = match source.get_octet() {
                Ok(octet) => octet,
                Err(IoError::NoData) => break,
                Err(e) => return Err(e),
            };
            match octet {
                END => sink.put_chunk(&[ESC, ESC_END]).map(|_| ())?,
                ESC => sink.put_chunk(&[ESC, ESC_ESC]).map(|_| ())?,
                _ => sink.put_octet(octet)?,
            }
        }

        sink.put_octet(END)
    }

    /// Read encoded bytes from `source` until one complete frame has been
    /// decoded into `sink`.
    ///
    /// An `ESC` octet followed by anything other than `ESC_END` or
    /// `ESC_ESC` fails with [`IoError::BadMessage`]. The offending octet is
    /// consumed: if a channel drops the octet following an `ESC`, the
    /// decoder must not resume mid-frame and swallow the next frame
    /// delimiter. Callers restart decoding to resynchronise.
    pub fn decode(&self, source: &mut Source<'_>, sink: &mut Sink<'_>) -> IoResult<()> {
        if self.with_sof {
            // Hunt for the start-of-frame delimiter, discarding noise.
            loop {
                if source.get_octet()? == END {
                    break;
                }
            }
        }

        let mut received = 0usize;
        loop {
            let octet = source.get_octet()?;
            let decoded = match octet {
                END if received > 0 => return Ok(()),
                // An empty frame; keep treating END as start-of-frame.
                END => continue,
                ESC => match source.get_octet()? {
                    ESC_END => END,
                    ESC_ESC => ESC,
                    _ => return Err(IoError::BadMessage),
                },
                _ => octet,
            };
            sink.put_octet(decoded)?;
            received += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteBuffer;
    use crate::endpoint::instrumented::InstrumentedBuffer;
    use proptest::prelude::*;

    /// All special octets appear in here, hitting most encoder paths.
    const PAYLOAD: [u8; 24] = [
        END, b'a', b'b', b'c', END, b'd', b'e', b'f', ESC, b'g', b'h', b'i', ESC_ESC, b'j', b'k',
        b'l', ESC_END, b'm', b'n', b'o', ESC_END, b'e', b'n', b'd',
    ];

    /// Expected encoding of `PAYLOAD` with a start-of-frame delimiter; the
    /// classic encoding is the same without the first octet.
    const EXPECT_WITH_SOF: [u8; 29] = [
        END, ESC, ESC_END, b'a', b'b', b'c', ESC, ESC_END, b'd', b'e', b'f', ESC, ESC_ESC, b'g',
        b'h', b'i', ESC_ESC, b'j', b'k', b'l', ESC_END, b'm', b'n', b'o', ESC_END, b'e', b'n',
        b'd', END,
    ];

    fn run_encode(slip: Slip, input: &[u8], capacity: usize) -> IoResult<Vec<u8>> {
        let mut src = InstrumentedBuffer::around(ByteBuffer::from_data(input.to_vec()));
        let mut dst = InstrumentedBuffer::with_capacity(capacity);
        {
            let mut source = Source::octet(&mut src);
            let mut sink = Sink::octet(&mut dst);
            slip.encode(&mut source, &mut sink)?;
        }
        Ok(dst.buffer.filled().to_vec())
    }

    fn run_decode(slip: Slip, input: &mut InstrumentedBuffer, capacity: usize) -> IoResult<Vec<u8>> {
        let mut dst = InstrumentedBuffer::with_capacity(capacity);
        {
            let mut source = Source::octet(input);
            let mut sink = Sink::octet(&mut dst);
            slip.decode(&mut source, &mut sink)?;
        }
        Ok(dst.buffer.filled().to_vec())
    }

    #[test]
    fn classic_encoding_stuffs_special_octets() {
        let wire = run_encode(Slip::new(), &PAYLOAD, 64).unwrap();
        assert_eq!(wire, EXPECT_WITH_SOF[1..]);
    }

    #[test]
    fn sof_encoding_prepends_a_delimiter() {
        let wire = run_encode(Slip::with_sof(), &PAYLOAD, 64).unwrap();
        assert_eq!(wire, EXPECT_WITH_SOF);
    }

    #[test]
    fn classic_decoding_inverts_the_encoding() {
        let mut wire =
            InstrumentedBuffer::around(ByteBuffer::from_data(EXPECT_WITH_SOF[1..].to_vec()));
        let plain = run_decode(Slip::new(), &mut wire, 64).unwrap();
        assert_eq!(plain, PAYLOAD);
    }

    #[test]
    fn sof_decoding_inverts_the_encoding() {
        let mut wire = InstrumentedBuffer::around(ByteBuffer::from_data(EXPECT_WITH_SOF.to_vec()));
        let plain = run_decode(Slip::with_sof(), &mut wire, 64).unwrap();
        assert_eq!(plain, PAYLOAD);
    }

    #[test]
    fn encoder_propagates_sink_errors() {
        let mut src = InstrumentedBuffer::around(ByteBuffer::from_data(PAYLOAD.to_vec()));
        let mut dst = InstrumentedBuffer::with_capacity(64);
        dst.write_error_at(10, IoError::Io);

        let mut source = Source::octet(&mut src);
        let mut sink = Sink::octet(&mut dst);
        assert_eq!(Slip::with_sof().encode(&mut source, &mut sink), Err(IoError::Io));
    }

    #[test]
    fn decoder_resynchronises_after_a_broken_escape() {
        // A channel that dropped the octet after an ESC must surface an
        // error instead of silently eating the next delimiter; restarting
        // the decoder then finds the intact frame.
        let wire_bytes = [
            b'i', b'g', b'n', b'o', b'r', b'e', // noise before SOF
            END, b'f', ESC, b'o', b'o', END, // broken escape sequence
            END, b'f', ESC, END, // escape octet got dropped in transit
            END, b'f', b'o', b'o', END, // intact frame
        ];
        let slip = Slip::with_sof();
        let mut wire = InstrumentedBuffer::around(ByteBuffer::from_data(wire_bytes.to_vec()));

        assert_eq!(
            run_decode(slip, &mut wire, 64),
            Err(IoError::BadMessage)
        );
        assert_eq!(
            run_decode(slip, &mut wire, 64),
            Err(IoError::BadMessage)
        );
        assert_eq!(run_decode(slip, &mut wire, 64).as_deref(), Ok(&b"foo"[..]));
    }

    #[test]
    fn decoder_propagates_sink_errors() {
        let mut wire = InstrumentedBuffer::around(ByteBuffer::from_data(EXPECT_WITH_SOF.to_vec()));
        let mut dst = InstrumentedBuffer::with_capacity(64);
        dst.write_error_at(10, IoError::Io);

        let mut source = Source::octet(&mut wire);
        let mut sink = Sink::octet(&mut dst);
        assert_eq!(Slip::with_sof().decode(&mut source, &mut sink), Err(IoError::Io));
    }

    proptest! {
        #[test]
        fn roundtrips_arbitrary_payloads(
            payload in proptest::collection::vec(any::<u8>(), 1..256),
        ) {
            for slip in [Slip::new(), Slip::with_sof()] {
                let wire = run_encode(slip, &payload, 1024).unwrap();
                let mut wire =
                    InstrumentedBuffer::around(ByteBuffer::from_data(wire));
                let plain = run_decode(slip, &mut wire, 1024).unwrap();
                prop_assert_eq!(&plain, &payload);
            }
        }
    }
}
