//! # Instrumented Endpoints
//!
//! A buffer-backed endpoint whose error behaviour can be scripted: at which
//! buffer position a given error should start occurring, or for how many
//! accesses it should persist before the endpoint starts working. The
//! engine's error paths are only reachable through endpoints like this, so
//! the type is part of the crate proper, not of its test code.
//!
//! One [`InstrumentedBuffer`] serves one direction of a channel; wrap it as
//! a [`Source`](crate::endpoint::Source) or a
//! [`Sink`](crate::endpoint::Sink) in either octet or chunk granularity.

use crate::buffer::ByteBuffer;
use crate::endpoint::{ChunkSink, ChunkSource, IoError, IoResult, OctetSink, OctetSource};

/// Scripted error behaviour of one transfer direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorScript {
    /// Never inject an error.
    #[default]
    None,
    /// Work normally until the buffer position reaches `at`, then keep
    /// returning `error`.
    UntilErrorAt {
        /// Buffer position from which on the error occurs.
        at: usize,
        /// The injected error.
        error: IoError,
    },
    /// Return `error` for the first `accesses` driver calls, then work
    /// normally.
    UntilSuccessAt {
        /// Number of failing accesses.
        accesses: usize,
        /// The injected error.
        error: IoError,
    },
}

/// Transfer counters of one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessStats {
    /// Bytes actually transferred.
    pub bytes: usize,
    /// Driver invocations, including failing ones.
    pub accesses: usize,
}

#[derive(Debug, Default)]
struct Direction {
    script: ErrorScript,
    stats: AccessStats,
}

impl Direction {
    /// Consult the error script; `position` is the buffer cursor relevant
    /// for this direction. Counts the access either way.
    fn check(&mut self, position: usize) -> IoResult<()> {
        self.stats.accesses += 1;
        match self.script {
            ErrorScript::None => Ok(()),
            ErrorScript::UntilErrorAt { at, error } if position >= at => Err(error),
            ErrorScript::UntilSuccessAt { accesses, error } if self.stats.accesses <= accesses => {
                Err(error)
            }
            _ => Ok(()),
        }
    }
}

/// A byte buffer with scripted per-direction failures and access counters.
#[derive(Debug)]
pub struct InstrumentedBuffer {
    /// The buffer this endpoint reads from and writes to.
    pub buffer: ByteBuffer,
    read: Direction,
    write: Direction,
    /// Largest transfer unit of the chunk-granular driver; zero means
    /// unlimited. Useful for exercising repetition logic.
    chunksize: usize,
}

impl InstrumentedBuffer {
    /// Instrument `size` bytes of empty space.
    #[must_use]
    pub fn with_capacity(size: usize) -> Self {
        Self::around(ByteBuffer::with_capacity(size))
    }

    /// Instrument an existing buffer.
    #[must_use]
    pub fn around(buffer: ByteBuffer) -> Self {
        Self {
            buffer,
            read: Direction::default(),
            write: Direction::default(),
            chunksize: 0,
        }
    }

    /// Limit chunk transfers to `n` bytes per driver call.
    pub fn set_chunksize(&mut self, n: usize) {
        self.chunksize = n;
    }

    /// Fail reads with `error` once the read mark reaches `at`.
    pub fn read_error_at(&mut self, at: usize, error: IoError) {
        self.read.script = ErrorScript::UntilErrorAt { at, error };
    }

    /// Fail the first `accesses` reads with `error`.
    pub fn read_error_until(&mut self, accesses: usize, error: IoError) {
        self.read.script = ErrorScript::UntilSuccessAt { accesses, error };
    }

    /// Fail writes with `error` once the write mark reaches `at`.
    pub fn write_error_at(&mut self, at: usize, error: IoError) {
        self.write.script = ErrorScript::UntilErrorAt { at, error };
    }

    /// Fail the first `accesses` writes with `error`.
    pub fn write_error_until(&mut self, accesses: usize, error: IoError) {
        self.write.script = ErrorScript::UntilSuccessAt { accesses, error };
    }

    /// Stop injecting read errors.
    pub fn clear_read_error(&mut self) {
        self.read.script = ErrorScript::None;
    }

    /// Stop injecting write errors.
    pub fn clear_write_error(&mut self) {
        self.write.script = ErrorScript::None;
    }

    /// Reset both directions' counters.
    pub fn reset_stats(&mut self) {
        self.read.stats = AccessStats::default();
        self.write.stats = AccessStats::default();
    }

    /// Transfer counters of the read direction.
    #[must_use]
    pub const fn read_stats(&self) -> AccessStats {
        self.read.stats
    }

    /// Transfer counters of the write direction.
    #[must_use]
    pub const fn write_stats(&self) -> AccessStats {
        self.write.stats
    }

    fn clamp(&self, n: usize) -> usize {
        if self.chunksize == 0 {
            n
        } else {
            n.min(self.chunksize)
        }
    }
}

impl OctetSource for InstrumentedBuffer {
    fn get(&mut self) -> IoResult<u8> {
        self.read.check(self.buffer.offset())?;
        let mut octet = [0u8; 1];
        self.buffer
            .consume(&mut octet)
            .map_err(|_| IoError::NoData)?;
        self.read.stats.bytes += 1;
        Ok(octet[0])
    }

    fn exposed_buffer(&mut self) -> Option<&mut ByteBuffer> {
        Some(&mut self.buffer)
    }
}

impl OctetSink for InstrumentedBuffer {
    fn put(&mut self, octet: u8) -> IoResult<()> {
        self.write.check(self.buffer.used())?;
        self.buffer.add(&[octet]).map_err(|_| IoError::NoMem)?;
        self.write.stats.bytes += 1;
        Ok(())
    }

    fn exposed_buffer(&mut self) -> Option<&mut ByteBuffer> {
        Some(&mut self.buffer)
    }
}

impl ChunkSource for InstrumentedBuffer {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        self.read.check(self.buffer.offset())?;
        let n = self.clamp(buf.len());
        let got = self.buffer.consume_at_most(&mut buf[..n])?;
        self.read.stats.bytes += got;
        Ok(got)
    }

    fn exposed_buffer(&mut self) -> Option<&mut ByteBuffer> {
        Some(&mut self.buffer)
    }
}

impl ChunkSink for InstrumentedBuffer {
    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        self.write.check(self.buffer.used())?;
        let n = self.clamp(data.len()).min(self.buffer.avail());
        if n == 0 {
            return Err(IoError::NoMem);
        }
        self.buffer.add(&data[..n])?;
        self.write.stats.bytes += n;
        Ok(n)
    }

    fn exposed_buffer(&mut self) -> Option<&mut ByteBuffer> {
        Some(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Sink, Source};

    #[test]
    fn behaves_like_a_plain_buffer_without_a_script() {
        let mut wire = InstrumentedBuffer::with_capacity(16);

        {
            let mut sink = Sink::octet(&mut wire);
            sink.put_chunk(&[1, 2, 3]).unwrap();
        }
        {
            let mut source = Source::octet(&mut wire);
            let mut out = [0u8; 3];
            source.get_chunk(&mut out).unwrap();
            assert_eq!(out, [1, 2, 3]);
        }

        assert_eq!(wire.read_stats().bytes, 3);
        assert_eq!(wire.write_stats().bytes, 3);
    }

    #[test]
    fn read_errors_start_at_the_scripted_offset() {
        let mut wire = InstrumentedBuffer::around(ByteBuffer::from_data(vec![0; 8]));
        wire.read_error_at(4, IoError::Io);

        let mut source = Source::octet(&mut wire);
        let mut out = [0u8; 4];
        assert_eq!(source.get_chunk(&mut out), Ok(4));
        assert_eq!(source.get_octet(), Err(IoError::Io));
    }

    #[test]
    fn write_errors_clear_after_the_scripted_accesses() {
        let mut wire = InstrumentedBuffer::with_capacity(8);
        wire.write_error_until(2, IoError::Io);

        {
            let mut sink = Sink::octet(&mut wire);
            assert_eq!(sink.put_octet(9), Err(IoError::Io));
            assert_eq!(sink.put_octet(9), Err(IoError::Io));
            assert_eq!(sink.put_octet(9), Ok(()));
        }
        assert_eq!(wire.write_stats().accesses, 3);
        assert_eq!(wire.write_stats().bytes, 1);
    }

    #[test]
    fn transient_errors_are_absorbed_by_the_retry_machinery() {
        let mut wire = InstrumentedBuffer::around(ByteBuffer::from_data(vec![7, 8]));
        wire.read_error_until(3, IoError::Again);

        let mut source = Source::octet(&mut wire);
        let mut out = [0u8; 2];
        assert_eq!(source.get_chunk(&mut out), Ok(2));
        assert_eq!(out, [7, 8]);
    }

    #[test]
    fn chunksize_limits_single_transfers() {
        let mut wire = InstrumentedBuffer::around(ByteBuffer::from_data(vec![1, 2, 3, 4, 5]));
        wire.set_chunksize(2);

        let mut chunk = [0u8; 5];
        assert_eq!(ChunkSource::read(&mut wire, &mut chunk), Ok(2));
        assert_eq!(ChunkSource::read(&mut wire, &mut chunk), Ok(2));
        assert_eq!(ChunkSource::read(&mut wire, &mut chunk), Ok(1));
    }

    #[test]
    fn full_sink_reports_no_memory() {
        let mut wire = InstrumentedBuffer::with_capacity(2);
        let mut sink = Sink::chunk(&mut wire);
        assert_eq!(sink.put_chunk_atmost(&[1, 2, 3]), Ok(2));
        assert_eq!(sink.put_chunk_atmost(&[3]), Err(IoError::NoMem));
    }
}
