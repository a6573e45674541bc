//! # Source and Sink Endpoints
//!
//! This module implements a generic source and sink abstraction. The main
//! idea is to be able to reuse implementations of protocols like SLIP for a
//! wide array of applications: the framing and wire-protocol layers only
//! ever talk to a [`Source`] and a [`Sink`], never to a concrete transport.
//!
//! A driver is either octet-granular ([`OctetSource`]/[`OctetSink`]) or
//! chunk-granular ([`ChunkSource`]/[`ChunkSink`]); the wrapper synthesises
//! the missing granularity by looping. Drivers signal a permanent end of
//! data with [`IoError::NoData`], a full sink with [`IoError::NoMem`], and
//! temporary conditions with [`IoError::Again`] or [`IoError::Interrupted`].
//! Returning `Ok(0)` from a chunk driver means no progress was made; the
//! system will retry.
//!
//! The retry logic for conditions like `Again` and `Interrupted` can be
//! customised per endpoint through [`RetryPolicy`], a plain struct of
//! function pointers and flags, so the receive path stays allocation-free.
//!
//! Naming conventions borrowed from the C lineage of this design:
//!
//! - `sts_*`: source-to-sink plumbing
//! - `*_atmost`: transfer some positive amount, bounded by the caller
//! - `*_n`: transfer an exact amount
//! - `*_drain`: transfer until the source runs out

pub mod instrumented;

use std::fmt;

use crate::buffer::{BufferError, ByteBuffer};

/// Result type of all endpoint operations.
pub type IoResult<T> = Result<T, IoError>;

/// The error taxonomy of the generic I/O paths.
///
/// These mirror the POSIX errno values the on-wire machinery distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    /// The operation would block; retrying later may succeed (EAGAIN).
    #[error("operation would block")]
    Again,
    /// The operation was interrupted; retry (EINTR).
    #[error("operation was interrupted")]
    Interrupted,
    /// The source has permanently run out of data (ENODATA).
    #[error("source ran out of data")]
    NoData,
    /// The sink has no room left to store data (ENOMEM).
    #[error("sink ran out of space")]
    NoMem,
    /// A message failed structural parsing (EBADMSG).
    #[error("malformed message")]
    BadMessage,
    /// A checksum over header data did not match (EILSEQ).
    #[error("illegal byte sequence")]
    IllegalSequence,
    /// A checksum over payload data did not match (EPROTO).
    #[error("protocol error")]
    Protocol,
    /// Payload data is implausible for its declared shape (EFAULT).
    #[error("implausible payload")]
    Fault,
    /// A required resource is temporarily unavailable (EBUSY).
    #[error("resource busy")]
    Busy,
    /// A parameter made no sense; reserved for programmer errors and never
    /// sent on the wire (EINVAL).
    #[error("invalid parameter")]
    InvalidInput,
    /// The endpoint does not implement the requested extension (ENOTSUP).
    #[error("operation not supported")]
    NotSupported,
    /// No buffer space available (ENOBUFS).
    #[error("no buffer space available")]
    NoBufs,
    /// A generic input/output error (EIO).
    #[error("input/output error")]
    Io,
}

impl From<BufferError> for IoError {
    fn from(e: BufferError) -> Self {
        match e {
            BufferError::NoMem => Self::NoMem,
            BufferError::NoData => Self::NoData,
            BufferError::InvalidInput => Self::InvalidInput,
        }
    }
}

/// Invoke the retry runner for other (non-retryable by default) errors.
pub const RETRY_ON_OTHER: u32 = 1 << 0;
/// Invoke the retry runner when a driver makes zero progress.
pub const RETRY_ON_ZERO_PROGRESS: u32 = 1 << 1;
/// Invoke the retry runner on [`IoError::Again`].
pub const RETRY_ON_AGAIN: u32 = 1 << 2;
/// Invoke the retry runner on [`IoError::Interrupted`].
pub const RETRY_ON_INTERRUPTED: u32 = 1 << 3;

/// The condition that caused the retry runner to be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTrigger {
    /// The driver returned [`IoError::Again`].
    Again,
    /// The driver returned [`IoError::Interrupted`].
    Interrupted,
    /// The driver transferred zero bytes without an error.
    ZeroProgress,
    /// The driver returned some other error.
    Other(IoError),
}

/// What the retry runner wants the endpoint to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Repeat the I/O operation that triggered the runner.
    Retry,
    /// Cancel the transaction; surfaces as [`IoError::NoData`].
    GiveUp,
    /// Abort the transaction with this error.
    Fail(IoError),
}

/// Customisable retry behaviour of an endpoint.
///
/// This is deliberately a struct of plain function pointers plus a scratch
/// word, not a closure, to keep endpoints `Copy`-able and the receive path
/// free of allocation. `init` runs once at the start of every chunk
/// transaction; `run` is consulted for each condition selected in
/// `control`. Conditions not selected keep their default behaviour:
/// `Again`, `Interrupted` and zero progress retry unconditionally, other
/// errors propagate.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Transaction setup hook.
    pub init: Option<fn(&mut RetryPolicy)>,
    /// Per-condition decision hook.
    pub run: Option<fn(&mut RetryPolicy, RetryTrigger) -> RetryVerdict>,
    /// Bit set of `RETRY_ON_*` values selecting which conditions consult
    /// `run`.
    pub control: u32,
    /// Scratch state owned by the runner, e.g. an attempt counter.
    pub scratch: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            init: None,
            run: None,
            control: 0,
            scratch: 0,
        }
    }
}

impl RetryPolicy {
    fn begin(&mut self) {
        if let Some(init) = self.init {
            init(self);
        }
    }

    /// Decide how to react to a failed driver call.
    fn decide(&mut self, trigger: RetryTrigger) -> RetryVerdict {
        let (bit, default) = match trigger {
            RetryTrigger::Again => (RETRY_ON_AGAIN, RetryVerdict::Retry),
            RetryTrigger::Interrupted => (RETRY_ON_INTERRUPTED, RetryVerdict::Retry),
            RetryTrigger::ZeroProgress => (RETRY_ON_ZERO_PROGRESS, RetryVerdict::Retry),
            RetryTrigger::Other(e) => (RETRY_ON_OTHER, RetryVerdict::Fail(e)),
        };

        match self.run {
            Some(run) if self.control & bit != 0 => run(self, trigger),
            _ => default,
        }
    }
}

/// An octet-granular byte producer.
pub trait OctetSource {
    /// Produce the next octet.
    fn get(&mut self) -> IoResult<u8>;

    /// Buffer-exposing extension; endpoints backed by an internal
    /// [`ByteBuffer`] can hand it out for single-copy plumbing.
    fn exposed_buffer(&mut self) -> Option<&mut ByteBuffer> {
        None
    }

    /// Seek extension for storage-backed endpoints.
    fn seek(&mut self, _offset: usize) -> IoResult<()> {
        Err(IoError::NotSupported)
    }
}

/// An octet-granular byte consumer.
pub trait OctetSink {
    /// Consume one octet.
    fn put(&mut self, octet: u8) -> IoResult<()>;

    /// Buffer-exposing extension, see [`OctetSource::exposed_buffer`].
    fn exposed_buffer(&mut self) -> Option<&mut ByteBuffer> {
        None
    }

    /// Seek extension for storage-backed endpoints.
    fn seek(&mut self, _offset: usize) -> IoResult<()> {
        Err(IoError::NotSupported)
    }
}

/// A chunk-granular byte producer.
pub trait ChunkSource {
    /// Read up to `buf.len()` bytes, returning the number of bytes
    /// produced. `Ok(0)` counts as zero progress and is retried.
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize>;

    /// Buffer-exposing extension, see [`OctetSource::exposed_buffer`].
    fn exposed_buffer(&mut self) -> Option<&mut ByteBuffer> {
        None
    }

    /// Seek extension for storage-backed endpoints.
    fn seek(&mut self, _offset: usize) -> IoResult<()> {
        Err(IoError::NotSupported)
    }
}

/// A chunk-granular byte consumer.
pub trait ChunkSink {
    /// Write up to `data.len()` bytes, returning the number of bytes
    /// consumed. `Ok(0)` counts as zero progress and is retried.
    fn write(&mut self, data: &[u8]) -> IoResult<usize>;

    /// Buffer-exposing extension, see [`OctetSource::exposed_buffer`].
    fn exposed_buffer(&mut self) -> Option<&mut ByteBuffer> {
        None
    }

    /// Seek extension for storage-backed endpoints.
    fn seek(&mut self, _offset: usize) -> IoResult<()> {
        Err(IoError::NotSupported)
    }
}

enum SourceDriver<'a> {
    Octet(&'a mut dyn OctetSource),
    Chunk(&'a mut dyn ChunkSource),
}

impl fmt::Debug for SourceDriver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Octet(_) => write!(f, "SourceDriver::Octet"),
            Self::Chunk(_) => write!(f, "SourceDriver::Chunk"),
        }
    }
}

/// A byte producer endpoint: a driver plus a retry policy.
#[derive(Debug)]
pub struct Source<'a> {
    driver: SourceDriver<'a>,
    /// Retry behaviour of this endpoint.
    pub retry: RetryPolicy,
}

impl<'a> Source<'a> {
    /// Wrap an octet-granular driver.
    pub fn octet(driver: &'a mut dyn OctetSource) -> Self {
        Self {
            driver: SourceDriver::Octet(driver),
            retry: RetryPolicy::default(),
        }
    }

    /// Wrap a chunk-granular driver.
    pub fn chunk(driver: &'a mut dyn ChunkSource) -> Self {
        Self {
            driver: SourceDriver::Chunk(driver),
            retry: RetryPolicy::default(),
        }
    }

    /// Access the driver's exposed buffer, if it has one.
    pub fn exposed_buffer(&mut self) -> Option<&mut ByteBuffer> {
        match &mut self.driver {
            SourceDriver::Octet(d) => d.exposed_buffer(),
            SourceDriver::Chunk(d) => d.exposed_buffer(),
        }
    }

    /// Reposition a storage-backed source.
    pub fn seek(&mut self, offset: usize) -> IoResult<()> {
        match &mut self.driver {
            SourceDriver::Octet(d) => d.seek(offset),
            SourceDriver::Chunk(d) => d.seek(offset),
        }
    }

    /// One driver-level read without retry logic. Octet drivers are
    /// adapted by looping; a partial transfer is reported as its count.
    fn read_raw(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        match &mut self.driver {
            SourceDriver::Chunk(d) => d.read(buf),
            SourceDriver::Octet(d) => {
                let mut done = 0;
                while done < buf.len() {
                    match d.get() {
                        Ok(octet) => {
                            buf[done] = octet;
                            done += 1;
                        }
                        Err(e) if done == 0 => return Err(e),
                        Err(_) => break,
                    }
                }
                Ok(done)
            }
        }
    }

    /// Worker shared by [`Self::get_chunk`] and
    /// [`Self::get_chunk_atmost`]: transfers as much as it can, reporting
    /// both the byte count and the error that stopped it.
    fn read_multi(&mut self, buf: &mut [u8]) -> (usize, Option<IoError>) {
        if buf.is_empty() {
            return (0, Some(IoError::InvalidInput));
        }

        self.retry.begin();

        let mut done = 0;
        while done < buf.len() {
            let trigger = match self.read_raw(&mut buf[done..]) {
                Ok(0) => RetryTrigger::ZeroProgress,
                Ok(n) => {
                    done += n;
                    continue;
                }
                Err(IoError::Again) => RetryTrigger::Again,
                Err(IoError::Interrupted) => RetryTrigger::Interrupted,
                Err(e) => RetryTrigger::Other(e),
            };
            match self.retry.decide(trigger) {
                RetryVerdict::Retry => continue,
                RetryVerdict::GiveUp => return (done, Some(IoError::NoData)),
                RetryVerdict::Fail(e) => return (done, Some(e)),
            }
        }

        (done, None)
    }

    /// Produce a single octet, with full retry handling.
    pub fn get_octet(&mut self) -> IoResult<u8> {
        let mut buf = [0u8; 1];
        self.get_chunk(&mut buf)?;
        Ok(buf[0])
    }

    /// Read exactly `buf.len()` bytes, or fail. Zero-sized requests fail
    /// with [`IoError::InvalidInput`].
    pub fn get_chunk(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        match self.read_multi(buf) {
            (_, Some(e)) => Err(e),
            (n, None) => Ok(n),
        }
    }

    /// Read up to `buf.len()` bytes; errors surface only when nothing at
    /// all could be read.
    pub fn get_chunk_atmost(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        match self.read_multi(buf) {
            (0, Some(e)) => Err(e),
            (n, _) => Ok(n),
        }
    }
}

enum SinkDriver<'a> {
    Octet(&'a mut dyn OctetSink),
    Chunk(&'a mut dyn ChunkSink),
}

impl fmt::Debug for SinkDriver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Octet(_) => write!(f, "SinkDriver::Octet"),
            Self::Chunk(_) => write!(f, "SinkDriver::Chunk"),
        }
    }
}

/// A byte consumer endpoint: a driver plus a retry policy.
#[derive(Debug)]
pub struct Sink<'a> {
    driver: SinkDriver<'a>,
    /// Retry behaviour of this endpoint.
    pub retry: RetryPolicy,
}

impl<'a> Sink<'a> {
    /// Wrap an octet-granular driver.
    pub fn octet(driver: &'a mut dyn OctetSink) -> Self {
        Self {
            driver: SinkDriver::Octet(driver),
            retry: RetryPolicy::default(),
        }
    }

    /// Wrap a chunk-granular driver.
    pub fn chunk(driver: &'a mut dyn ChunkSink) -> Self {
        Self {
            driver: SinkDriver::Chunk(driver),
            retry: RetryPolicy::default(),
        }
    }

    /// Access the driver's exposed buffer, if it has one.
    pub fn exposed_buffer(&mut self) -> Option<&mut ByteBuffer> {
        match &mut self.driver {
            SinkDriver::Octet(d) => d.exposed_buffer(),
            SinkDriver::Chunk(d) => d.exposed_buffer(),
        }
    }

    /// Reposition a storage-backed sink.
    pub fn seek(&mut self, offset: usize) -> IoResult<()> {
        match &mut self.driver {
            SinkDriver::Octet(d) => d.seek(offset),
            SinkDriver::Chunk(d) => d.seek(offset),
        }
    }

    /// One driver-level write without retry logic.
    fn write_raw(&mut self, data: &[u8]) -> IoResult<usize> {
        match &mut self.driver {
            SinkDriver::Chunk(d) => d.write(data),
            SinkDriver::Octet(d) => {
                let mut done = 0;
                for &octet in data {
                    match d.put(octet) {
                        Ok(()) => done += 1,
                        Err(e) if done == 0 => return Err(e),
                        Err(_) => break,
                    }
                }
                Ok(done)
            }
        }
    }

    fn write_multi(&mut self, data: &[u8]) -> (usize, Option<IoError>) {
        if data.is_empty() {
            // A zero sized write is complete before it starts.
            return (0, None);
        }

        self.retry.begin();

        let mut done = 0;
        while done < data.len() {
            let trigger = match self.write_raw(&data[done..]) {
                Ok(0) => RetryTrigger::ZeroProgress,
                Ok(n) => {
                    done += n;
                    continue;
                }
                Err(IoError::Again) => RetryTrigger::Again,
                Err(IoError::Interrupted) => RetryTrigger::Interrupted,
                Err(e) => RetryTrigger::Other(e),
            };
            match self.retry.decide(trigger) {
                RetryVerdict::Retry => continue,
                RetryVerdict::GiveUp => return (done, Some(IoError::NoData)),
                RetryVerdict::Fail(e) => return (done, Some(e)),
            }
        }

        (done, None)
    }

    /// Consume a single octet, with full retry handling.
    pub fn put_octet(&mut self, octet: u8) -> IoResult<()> {
        self.put_chunk(&[octet]).map(|_| ())
    }

    /// Write all of `data`, or fail. A zero-sized write succeeds
    /// trivially.
    pub fn put_chunk(&mut self, data: &[u8]) -> IoResult<usize> {
        match self.write_multi(data) {
            (_, Some(e)) => Err(e),
            (n, None) => Ok(n),
        }
    }

    /// Write as much of `data` as possible; errors surface only when
    /// nothing at all could be written.
    pub fn put_chunk_atmost(&mut self, data: &[u8]) -> IoResult<usize> {
        match self.write_multi(data) {
            (0, Some(e)) => Err(e),
            (n, _) => Ok(n),
        }
    }
}

/*
 * Source to Sink Plumbing
 */

/// One plumbing stage: move up to `n` bytes. Uses the exposed buffer of
/// either endpoint when available (single copy); falls back to octet-wise
/// transfer otherwise.
pub fn sts_atmost(source: &mut Source<'_>, sink: &mut Sink<'_>, n: usize) -> IoResult<usize> {
    if n == 0 {
        return Err(IoError::InvalidInput);
    }

    if let Some(buffer) = sink.exposed_buffer() {
        let window = buffer.writable();
        if !window.is_empty() {
            let limit = n.min(window.len());
            let got = source.get_chunk_atmost(&mut window[..limit])?;
            sink.exposed_buffer()
                .expect("sink lost its buffer mid-transfer")
                .commit(got)?;
            return Ok(got);
        }
        return Err(IoError::NoMem);
    }

    if source.exposed_buffer().is_some() {
        let put = {
            let buffer = source
                .exposed_buffer()
                .expect("source lost its buffer mid-transfer");
            let window = buffer.readable();
            if window.is_empty() {
                return Err(IoError::NoData);
            }
            let limit = n.min(window.len());
            sink.put_chunk_atmost(&window[..limit])?
        };
        source
            .exposed_buffer()
            .expect("source lost its buffer mid-transfer")
            .skip(put)?;
        return Ok(put);
    }

    // Neither side exposes memory; go octet by octet.
    let mut done = 0;
    while done < n {
        let octet = match source.get_octet() {
            Ok(octet) => octet,
            Err(IoError::NoData) if done > 0 => break,
            Err(e) => return Err(e),
        };
        sink.put_octet(octet)?;
        done += 1;
    }
    Ok(done)
}

/// Move exactly `n` bytes from `source` to `sink`.
///
/// A stage failing with [`IoError::NoMem`] is retried only while the sink
/// still exposes a buffer with room in it; anything else propagates.
pub fn sts_n(source: &mut Source<'_>, sink: &mut Sink<'_>, n: usize) -> IoResult<usize> {
    let mut rest = n;
    while rest > 0 {
        match sts_atmost(source, sink, rest) {
            Ok(moved) => rest -= moved,
            Err(IoError::NoMem) => {
                let retryable = sink
                    .exposed_buffer()
                    .map(|b| b.avail() > 0)
                    .unwrap_or(false);
                if !retryable {
                    return Err(IoError::NoMem);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

/// Move some system-determined, positive amount of bytes.
pub fn sts_some(source: &mut Source<'_>, sink: &mut Sink<'_>) -> IoResult<usize> {
    let hint = source
        .exposed_buffer()
        .map(|b| b.rest())
        .filter(|&n| n > 0)
        .or_else(|| sink.exposed_buffer().map(|b| b.avail()).filter(|&n| n > 0))
        .unwrap_or(1);
    sts_atmost(source, sink, hint)
}

/// Move bytes until the source permanently runs out of data. Returns the
/// total number of bytes moved.
pub fn sts_drain(source: &mut Source<'_>, sink: &mut Sink<'_>) -> IoResult<usize> {
    let mut total = 0;
    loop {
        match sts_some(source, sink) {
            Ok(moved) => total += moved,
            Err(IoError::NoData) => return Ok(total),
            Err(e) => return Err(e),
        }
    }
}

/*
 * Generic Sources and Sinks
 */

/// A source that is permanently out of data.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySource;

impl ChunkSource for EmptySource {
    fn read(&mut self, _buf: &mut [u8]) -> IoResult<usize> {
        Err(IoError::NoData)
    }
}

/// A source producing an endless stream of zero octets.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroSource;

impl ChunkSource for ZeroSource {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        buf.fill(0);
        Ok(buf.len())
    }
}

/// A sink that discards everything put into it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ChunkSink for NullSink {
    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        Ok(data.len())
    }
}

/// A source draining a [`ByteBuffer`], exposing it for single-copy
/// plumbing.
#[derive(Debug)]
pub struct BufferSource<'b> {
    buffer: &'b mut ByteBuffer,
}

impl<'b> BufferSource<'b> {
    /// Read from the unread part of `buffer`.
    pub fn new(buffer: &'b mut ByteBuffer) -> Self {
        Self { buffer }
    }
}

impl ChunkSource for BufferSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        Ok(self.buffer.consume_at_most(buf)?)
    }

    fn exposed_buffer(&mut self) -> Option<&mut ByteBuffer> {
        Some(self.buffer)
    }
}

/// A sink appending to a [`ByteBuffer`], exposing it for single-copy
/// plumbing.
#[derive(Debug)]
pub struct BufferSink<'b> {
    buffer: &'b mut ByteBuffer,
}

impl<'b> BufferSink<'b> {
    /// Append to the free space of `buffer`.
    pub fn new(buffer: &'b mut ByteBuffer) -> Self {
        Self { buffer }
    }
}

impl ChunkSink for BufferSink<'_> {
    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        let n = data.len().min(self.buffer.avail());
        if n == 0 {
            return Err(IoError::NoMem);
        }
        self.buffer.add(&data[..n])?;
        Ok(n)
    }

    fn exposed_buffer(&mut self) -> Option<&mut ByteBuffer> {
        Some(self.buffer)
    }
}

/// A source reading a list of byte slices back to back.
///
/// The wire protocol uses this to emit a header and its payload as one
/// frame without assembling them in contiguous memory first.
#[derive(Debug)]
pub struct ScatterSource<'b> {
    chunks: &'b [&'b [u8]],
    active: usize,
    position: usize,
}

impl<'b> ScatterSource<'b> {
    /// Read the given slices in order.
    #[must_use]
    pub fn new(chunks: &'b [&'b [u8]]) -> Self {
        Self {
            chunks,
            active: 0,
            position: 0,
        }
    }

    /// Number of bytes left to produce.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let mut total = 0;
        for (i, chunk) in self.chunks.iter().enumerate().skip(self.active) {
            total += chunk.len();
            if i == self.active {
                total -= self.position;
            }
        }
        total
    }
}

impl ChunkSource for ScatterSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        while self.active < self.chunks.len() {
            let chunk = self.chunks[self.active];
            if self.position < chunk.len() {
                let n = buf.len().min(chunk.len() - self.position);
                buf[..n].copy_from_slice(&chunk[self.position..self.position + n]);
                self.position += n;
                return Ok(n);
            }
            self.active += 1;
            self.position = 0;
        }
        Err(IoError::NoData)
    }
}
