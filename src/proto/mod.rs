//! # Register Protocol
//!
//! The wire protocol of the register stack: a binary request/response
//! scheme that lets a remote peer read and write ranges of a device's
//! logical memory. Frames carry a twelve byte header (plus optional header
//! and payload checksums) and travel either SLIP-framed over serial links
//! or length-prefixed over reliable streams.
//!
//! A [`Protocol`] instance ties together a memory backend, a channel (one
//! source, one sink, and the framing the channel kind implies), a block
//! allocator for receive buffers and a session counter. Servers loop over
//! [`Protocol::recv`] and [`Protocol::process`]; clients use the `req_*`
//! family and match on the frames they get back.

pub mod alloc;

use std::ops::Range;

use tracing::debug;

use crate::binfmt;
use crate::crc16::crc16_arc;
use crate::endpoint::{IoError, IoResult, Sink, Source};
use crate::framing::lenprefix::{self, PrefixKind};
use crate::framing::slip::Slip;
use crate::regtable::{AccessError, RegisterTable};

pub use self::alloc::{BlockAllocator, HeapAllocator};

/// The protocol version this implementation speaks.
pub const IMPLEMENTATION_VERSION: u8 = 0;

/// Default receive buffer size of the default allocator, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 128;

/// Option bit: block sizes and payloads count 16-bit words, not bytes.
pub const OPT_WORD_SIZE_16: u8 = 1 << 0;
/// Option bit: the header carries a CRC over itself.
pub const OPT_WITH_HEADER_CRC: u8 = 1 << 1;
/// Option bit: the header carries a CRC over the payload.
pub const OPT_WITH_PAYLOAD_CRC: u8 = 1 << 2;

/// Header size without any checksums, in bytes.
pub const HEADER_SIZE_BARE: usize = 12;
/// Header size with both checksums, in bytes.
pub const HEADER_SIZE_MAX: usize = 16;

/// The kind of a frame, encoded in the type nibble of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Request to read a block of memory.
    ReadRequest = 0,
    /// Response to a read request.
    ReadResponse = 1,
    /// Request to write a block of memory.
    WriteRequest = 2,
    /// Response to a write request.
    WriteResponse = 3,
    /// Protocol-level notification outside request/response pairing.
    Meta = 15,
}

impl FrameType {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Self::ReadRequest),
            1 => Some(Self::ReadResponse),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::WriteResponse),
            15 => Some(Self::Meta),
            _ => None,
        }
    }

    /// The response type answering a request of this type.
    #[must_use]
    pub const fn response(self) -> Self {
        match self {
            Self::ReadRequest => Self::ReadResponse,
            Self::WriteRequest => Self::WriteResponse,
            _ => Self::Meta,
        }
    }
}

/// Response codes, carried in the meta nibble of response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// The request was served.
    Ack = 0,
    /// The request's word size does not match the memory backend.
    EWordSize = 1,
    /// The payload checksum did not match.
    EPayloadCrc = 2,
    /// The payload size does not fit the frame type.
    EPayloadSize = 3,
    /// The frame did not fit the receiver's buffer.
    ERxOverflow = 4,
    /// The response would not fit the sender's buffer.
    ETxOverflow = 5,
    /// No receive buffer could be allocated.
    EBusy = 6,
    /// The address range touches unmapped memory.
    EUnmapped = 7,
    /// The address range is not accessible this way.
    EAccess = 8,
    /// A value was rejected by a register's validator.
    ERange = 9,
    /// A value could not be serialised or deserialised.
    EInvalid = 10,
    /// The memory backend failed internally.
    EIo = 11,
}

impl Response {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Self::Ack),
            1 => Some(Self::EWordSize),
            2 => Some(Self::EPayloadCrc),
            3 => Some(Self::EPayloadSize),
            4 => Some(Self::ERxOverflow),
            5 => Some(Self::ETxOverflow),
            6 => Some(Self::EBusy),
            7 => Some(Self::EUnmapped),
            8 => Some(Self::EAccess),
            9 => Some(Self::ERange),
            10 => Some(Self::EInvalid),
            11 => Some(Self::EIo),
            _ => None,
        }
    }
}

/// Message codes of meta frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaCode {
    /// A header failed structural parsing at the peer.
    HeaderEncoding = 1,
    /// A header checksum did not match at the peer.
    HeaderCrc = 2,
}

/// Result of one memory backend block access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAccess {
    /// Outcome of the access.
    pub status: Response,
    /// On errors, the address the access failed at.
    pub address: u32,
}

impl BlockAccess {
    /// A successful access.
    #[must_use]
    pub const fn ack() -> Self {
        Self {
            status: Response::Ack,
            address: 0,
        }
    }

    /// A failed access.
    #[must_use]
    pub const fn error(status: Response, address: u32) -> Self {
        Self { status, address }
    }
}

/// A memory backend with 16-bit word granularity.
pub trait WordMemory {
    /// Fill `dst` from memory starting at `address` (in words).
    fn read_block(&mut self, address: u32, dst: &mut [u16]) -> BlockAccess;
    /// Store `src` into memory starting at `address` (in words).
    fn write_block(&mut self, address: u32, src: &[u16]) -> BlockAccess;
}

/// A memory backend with byte granularity.
pub trait ByteMemory {
    /// Fill `dst` from memory starting at `address` (in bytes).
    fn read_block(&mut self, address: u32, dst: &mut [u8]) -> BlockAccess;
    /// Store `src` into memory starting at `address` (in bytes).
    fn write_block(&mut self, address: u32, src: &[u8]) -> BlockAccess;
}

/// The memory a protocol instance serves, with its word size fixed at run
/// time.
pub enum MemoryBackend<'a> {
    /// 16-bit word semantics.
    Words(&'a mut dyn WordMemory),
    /// 8-bit byte semantics.
    Bytes(&'a mut dyn ByteMemory),
}

impl MemoryBackend<'_> {
    const fn is_word_sized(&self) -> bool {
        matches!(self, Self::Words(_))
    }

    /// Bytes per addressable unit of this backend.
    const fn unit_size(&self) -> usize {
        match self {
            Self::Words(_) => 2,
            Self::Bytes(_) => 1,
        }
    }
}

impl std::fmt::Debug for MemoryBackend<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Words(_) => write!(f, "MemoryBackend::Words"),
            Self::Bytes(_) => write!(f, "MemoryBackend::Bytes"),
        }
    }
}

/// A memory backend that answers every access with [`Response::EUnmapped`].
#[derive(Debug, Default, Clone, Copy)]
pub struct VoidMemory;

impl WordMemory for VoidMemory {
    fn read_block(&mut self, address: u32, _dst: &mut [u16]) -> BlockAccess {
        BlockAccess::error(Response::EUnmapped, address)
    }

    fn write_block(&mut self, address: u32, _src: &[u16]) -> BlockAccess {
        BlockAccess::error(Response::EUnmapped, address)
    }
}

impl ByteMemory for VoidMemory {
    fn read_block(&mut self, address: u32, _dst: &mut [u8]) -> BlockAccess {
        BlockAccess::error(Response::EUnmapped, address)
    }

    fn write_block(&mut self, address: u32, _src: &[u8]) -> BlockAccess {
        BlockAccess::error(Response::EUnmapped, address)
    }
}

/// Map register table errors onto wire response codes.
const fn access_to_block(e: AccessError) -> BlockAccess {
    match e {
        AccessError::Uninitialised { address } | AccessError::NoEntry { address } => {
            BlockAccess::error(Response::EUnmapped, address)
        }
        AccessError::Range { address } => BlockAccess::error(Response::ERange, address),
        AccessError::Invalid { address } => BlockAccess::error(Response::EInvalid, address),
        AccessError::ReadOnly { address } => BlockAccess::error(Response::EAccess, address),
        AccessError::Failure { address } | AccessError::Io { address } => {
            BlockAccess::error(Response::EIo, address)
        }
    }
}

/// The register table is the canonical word-sized memory backend.
impl WordMemory for RegisterTable {
    fn read_block(&mut self, address: u32, dst: &mut [u16]) -> BlockAccess {
        match self.block_read(address, dst.len() as u32, dst) {
            Ok(()) => BlockAccess::ack(),
            Err(e) => access_to_block(e),
        }
    }

    fn write_block(&mut self, address: u32, src: &[u16]) -> BlockAccess {
        match self.block_write(address, src.len() as u32, src) {
            Ok(()) => BlockAccess::ack(),
            Err(e) => access_to_block(e),
        }
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version of the frame.
    pub version: u8,
    /// Frame type.
    pub ftype: FrameType,
    /// Option bits, `OPT_*`.
    pub options: u8,
    /// Raw meta nibble; response code or meta-message code.
    pub meta: u8,
    /// Session sequence number.
    pub sequence: u16,
    /// Start address of the access.
    pub address: u32,
    /// Number of atoms or bytes, depending on the word-size option.
    pub blocksize: u32,
    /// Header checksum, zero when absent.
    pub hdcrc: u16,
    /// Payload checksum, zero when absent.
    pub plcrc: u16,
}

impl Header {
    /// The frame counts 16-bit words, not bytes.
    #[must_use]
    pub const fn is_16bit_semantics(&self) -> bool {
        self.options & OPT_WORD_SIZE_16 != 0
    }

    /// The header carries a checksum over itself.
    #[must_use]
    pub const fn has_hdcrc(&self) -> bool {
        self.options & OPT_WITH_HEADER_CRC != 0
    }

    /// The header carries a checksum over the payload.
    #[must_use]
    pub const fn has_plcrc(&self) -> bool {
        self.options & OPT_WITH_PAYLOAD_CRC != 0
    }

    /// The response code of a response frame.
    #[must_use]
    pub fn response(&self) -> Option<Response> {
        match self.ftype {
            FrameType::ReadResponse | FrameType::WriteResponse => Response::from_nibble(self.meta),
            _ => None,
        }
    }

    /// The message code of a meta frame.
    #[must_use]
    pub const fn meta_code(&self) -> Option<MetaCode> {
        match (self.ftype, self.meta) {
            (FrameType::Meta, 1) => Some(MetaCode::HeaderEncoding),
            (FrameType::Meta, 2) => Some(MetaCode::HeaderCrc),
            _ => None,
        }
    }
}

/// One received frame: its parsed header plus the raw frame bytes in the
/// allocator-provided block.
#[derive(Debug)]
pub struct Frame {
    /// The parsed header.
    pub header: Header,
    block: Vec<u8>,
    payload: Range<usize>,
}

impl Frame {
    /// The frame's payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.block[self.payload.clone()]
    }

    /// The frame's payload decoded as 16-bit little-endian words.
    #[must_use]
    pub fn payload_words(&self) -> Vec<u16> {
        self.payload()
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// The whole raw frame, header included.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.block
    }

    /// The frame is a read or write request.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        matches!(
            self.header.ftype,
            FrameType::ReadRequest | FrameType::WriteRequest
        )
    }

    /// The frame is a read or write response.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        matches!(
            self.header.ftype,
            FrameType::ReadResponse | FrameType::WriteResponse
        )
    }

    /// The frame is a read request.
    #[must_use]
    pub const fn is_read_request(&self) -> bool {
        matches!(self.header.ftype, FrameType::ReadRequest)
    }

    /// The frame is a write request.
    #[must_use]
    pub const fn is_write_request(&self) -> bool {
        matches!(self.header.ftype, FrameType::WriteRequest)
    }

    /// The frame is a read response.
    #[must_use]
    pub const fn is_read_response(&self) -> bool {
        matches!(self.header.ftype, FrameType::ReadResponse)
    }

    /// The frame is a write response.
    #[must_use]
    pub const fn is_write_response(&self) -> bool {
        matches!(self.header.ftype, FrameType::WriteResponse)
    }

    /// The frame is a meta message.
    #[must_use]
    pub const fn is_meta_message(&self) -> bool {
        matches!(self.header.ftype, FrameType::Meta)
    }

    /// The address window the frame talks about.
    #[must_use]
    pub const fn range(&self) -> AddressRange {
        AddressRange::new(self.header.address, self.header.blocksize)
    }

    /// The overlap between this frame's address window and a register
    /// region.
    #[must_use]
    pub fn intersection(&self, region: &AddressRange) -> AddressRange {
        self.range().intersection(region)
    }
}

/// A window of the register address space: a start address plus a size,
/// counted in the same units as a frame's block size.
///
/// Higher layers use this to decide whether a request touches a specific
/// register region, e.g. to hook custom behaviour into an address range
/// before handing the rest of a frame to [`Protocol::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressRange {
    /// First address of the window.
    pub address: u32,
    /// Number of addressable units in the window.
    pub size: u32,
}

impl AddressRange {
    /// A window of `size` units starting at `address`.
    #[must_use]
    pub const fn new(address: u32, size: u32) -> Self {
        Self { address, size }
    }

    /// A window covering no addresses.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            address: 0,
            size: 0,
        }
    }

    /// Whether the window covers no addresses at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether `address` lies inside the window.
    #[must_use]
    pub fn contains(&self, address: u32) -> bool {
        !self.is_empty()
            && address >= self.address
            && u64::from(address) <= self.last()
    }

    /// The window's final address, widened so windows reaching the top of
    /// the address space do not wrap.
    fn last(&self) -> u64 {
        u64::from(self.address) + u64::from(self.size) - 1
    }

    /// The overlap of two windows; empty when they do not meet.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        if self.is_empty() || other.is_empty() {
            return Self::empty();
        }

        let start = self.address.max(other.address);
        let end = self.last().min(other.last());

        if u64::from(start) <= end {
            Self::new(start, (end - u64::from(start) + 1) as u32)
        } else {
            Self::empty()
        }
    }

    /// Whether the two windows share at least one address.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Whether `other` lies entirely inside this window.
    #[must_use]
    pub fn contains_range(&self, other: &Self) -> bool {
        self.intersection(other) == *other
    }
}

/// What went wrong while receiving a frame; see [`Protocol::recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvIssue {
    /// The allocator had no buffer; an `EBusy` response went out.
    Busy,
    /// The frame did not fit the allocated buffer; an `ERxOverflow`
    /// response went out. Carries the observed frame size.
    Overflow {
        /// The full size of the oversized frame.
        framesize: usize,
    },
    /// The header failed structural parsing; a meta frame went out.
    HeaderEncoding,
    /// The header checksum did not match; a meta frame went out.
    HeaderCrc,
    /// The payload size is implausible for the frame type.
    PayloadSize,
    /// The payload checksum did not match.
    PayloadCrc,
}

/// The outcome of one receive operation.
///
/// A fully valid frame has `issue == None`. Payload-level issues still
/// carry the frame for inspection; everything earlier does not.
#[derive(Debug, Default)]
pub struct Received {
    /// The received frame, when one could be assembled.
    pub frame: Option<Frame>,
    /// The failure class, when reception was not clean.
    pub issue: Option<RecvIssue>,
}

impl Received {
    /// The reception produced a fully valid frame.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.frame.is_some() && self.issue.is_none()
    }
}

/// The session state of a protocol instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct Session {
    sequence: u16,
}

impl Session {
    /// The sequence number the next originated request will carry.
    #[must_use]
    pub const fn sequence(&self) -> u16 {
        self.sequence
    }

    fn next(&mut self) -> u16 {
        let current = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        current
    }
}

/// The channel kind, which selects the framing in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// SLIP framed with mandatory header checksums; for lossy serial
    /// links.
    Serial,
    /// Length prefixed by a single octet; for reliable streams.
    Tcp,
}

/// Word-size selector for header encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Units {
    /// Follow the memory backend's word size.
    Auto,
    /// Byte semantics, regardless of the backend.
    Bytes,
    /// 16-bit word semantics.
    Words,
}

/// A register protocol instance.
#[derive(Debug)]
pub struct Protocol<'a> {
    memory: MemoryBackend<'a>,
    session: Session,
    kind: ChannelKind,
    source: Source<'a>,
    sink: Sink<'a>,
    alloc: &'a dyn BlockAllocator,
}

impl<'a> Protocol<'a> {
    /// Tie a memory backend, a channel and an allocator into a protocol
    /// instance.
    pub fn new(
        kind: ChannelKind,
        source: Source<'a>,
        sink: Sink<'a>,
        memory: MemoryBackend<'a>,
        alloc: &'a dyn BlockAllocator,
    ) -> Self {
        Self {
            memory,
            session: Session::default(),
            kind,
            source,
            sink,
            alloc,
        }
    }

    /// Replace the memory backend.
    pub fn use_memory(&mut self, memory: MemoryBackend<'a>) {
        self.memory = memory;
    }

    /// Replace the channel.
    pub fn use_channel(&mut self, kind: ChannelKind, source: Source<'a>, sink: Sink<'a>) {
        self.kind = kind;
        self.source = source;
        self.sink = sink;
    }

    /// Replace the block allocator.
    pub fn use_allocator(&mut self, alloc: &'a dyn BlockAllocator) {
        self.alloc = alloc;
    }

    /// The current session state.
    #[must_use]
    pub const fn session(&self) -> Session {
        self.session
    }

    /// Reset the session's sequence counter to zero.
    pub fn reset_session(&mut self) {
        self.session = Session::default();
    }

    /// Hand a frame's buffer back to the allocator.
    pub fn free(&mut self, frame: Frame) {
        self.alloc.free(frame.block);
    }

    /*
     * Header encoding
     */

    fn make_motv(&self, units: Units, meta: u8, ftype: FrameType, n: usize) -> u16 {
        let word16 = match units {
            Units::Words => true,
            Units::Bytes => false,
            Units::Auto => self.memory.is_word_sized(),
        };
        let serial = self.kind == ChannelKind::Serial;
        let with_plcrc = serial && n > 0 && ftype != FrameType::ReadRequest;

        let mut options = 0u8;
        if word16 {
            options |= OPT_WORD_SIZE_16;
        }
        if serial {
            options |= OPT_WITH_HEADER_CRC;
        }
        if with_plcrc {
            options |= OPT_WITH_PAYLOAD_CRC;
        }

        u16::from(IMPLEMENTATION_VERSION & 0x0f)
            | (ftype as u16 & 0x0f) << 4
            | u16::from(options) << 8
            | u16::from(meta & 0x0f) << 12
    }

    /// Assemble a header into `buf`, returning its size in bytes.
    #[allow(clippy::too_many_arguments)]
    fn encode_header(
        &self,
        buf: &mut [u8; HEADER_SIZE_MAX],
        units: Units,
        ftype: FrameType,
        meta: u8,
        sequence: u16,
        address: u32,
        n: usize,
        plcrc: u16,
    ) -> usize {
        let motv = self.make_motv(units, meta, ftype, n);

        let rest = binfmt::put_u16_be(buf, motv);
        let rest = binfmt::put_u16_be(rest, sequence);
        let rest = binfmt::put_u32_be(rest, address);
        let rest = binfmt::put_u32_be(rest, n as u32);
        let rest = binfmt::put_u16_be(rest, 0);
        binfmt::put_u16_be(rest, plcrc);

        let with_hdcrc = motv & (u16::from(OPT_WITH_HEADER_CRC) << 8) != 0;
        let with_plcrc = motv & (u16::from(OPT_WITH_PAYLOAD_CRC) << 8) != 0;
        let mut size = HEADER_SIZE_BARE;

        if with_hdcrc {
            let mut crc = crc16_arc(0, &buf[..HEADER_SIZE_BARE]);
            if with_plcrc {
                crc = crc16_arc(crc, &buf[14..16]);
            }
            binfmt::put_u16_be(&mut buf[12..], crc);
            size += 2;
        }
        if with_plcrc {
            size = HEADER_SIZE_MAX;
        }

        size
    }

    /// Push one frame, applying the channel's framing.
    fn send_memory(&mut self, header: &[u8], payload: &[u8]) -> IoResult<()> {
        match self.kind {
            ChannelKind::Tcp => {
                lenprefix::encode_chunks_to_sink(
                    PrefixKind::Octet,
                    &mut self.sink,
                    &[header, payload],
                )?;
                Ok(())
            }
            ChannelKind::Serial => {
                let chunks = [header, payload];
                let mut scatter = crate::endpoint::ScatterSource::new(&chunks);
                let mut source = Source::chunk(&mut scatter);
                Slip::new().encode(&mut source, &mut self.sink)
            }
        }
    }

    /*
     * Request API
     */

    /// Request to read `n` 16-bit words starting at `address`.
    pub fn req_read16(&mut self, address: u32, n: usize) -> IoResult<()> {
        let mut header = [0u8; HEADER_SIZE_MAX];
        let sequence = self.session.next();
        let size = self.encode_header(
            &mut header,
            Units::Words,
            FrameType::ReadRequest,
            0,
            sequence,
            address,
            n,
            0,
        );
        self.send_memory(&header[..size], &[])
    }

    /// Request to read `n` bytes starting at `address`.
    pub fn req_read8(&mut self, address: u32, n: usize) -> IoResult<()> {
        let mut header = [0u8; HEADER_SIZE_MAX];
        let sequence = self.session.next();
        let size = self.encode_header(
            &mut header,
            Units::Bytes,
            FrameType::ReadRequest,
            0,
            sequence,
            address,
            n,
            0,
        );
        self.send_memory(&header[..size], &[])
    }

    /// Request to write the given words starting at `address`.
    pub fn req_write16(&mut self, address: u32, words: &[u16]) -> IoResult<()> {
        let payload: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let plcrc = crc16_arc(0, &payload);
        let mut header = [0u8; HEADER_SIZE_MAX];
        let sequence = self.session.next();
        let size = self.encode_header(
            &mut header,
            Units::Words,
            FrameType::WriteRequest,
            0,
            sequence,
            address,
            words.len(),
            plcrc,
        );
        self.send_memory(&header[..size], &payload)
    }

    /// Request to write the given bytes starting at `address`.
    pub fn req_write8(&mut self, address: u32, bytes: &[u8]) -> IoResult<()> {
        let plcrc = crc16_arc(0, bytes);
        let mut header = [0u8; HEADER_SIZE_MAX];
        let sequence = self.session.next();
        let size = self.encode_header(
            &mut header,
            Units::Bytes,
            FrameType::WriteRequest,
            0,
            sequence,
            address,
            bytes.len(),
            plcrc,
        );
        self.send_memory(&header[..size], bytes)
    }

    /*
     * Response API
     *
     * These emit the protocol's response frames. Almost all of this is
     * driven by process(); the functions are public so custom memory
     * behaviour can be layered on top of the standard block semantics.
     */

    fn send_resp_0(&mut self, header: &Header, code: Response, units: Units) -> IoResult<()> {
        let mut buf = [0u8; HEADER_SIZE_MAX];
        let size = self.encode_header(
            &mut buf,
            units,
            header.ftype.response(),
            code as u8,
            header.sequence,
            header.address,
            0,
            0,
        );
        self.send_memory(&buf[..size], &[])
    }

    fn send_resp_32(&mut self, header: &Header, code: Response, value: u32) -> IoResult<()> {
        let mut payload = [0u8; 4];
        binfmt::put_u32_be(&mut payload, value);
        let plcrc = crc16_arc(0, &payload);

        let mut buf = [0u8; HEADER_SIZE_MAX];
        let size = self.encode_header(
            &mut buf,
            Units::Bytes,
            header.ftype.response(),
            code as u8,
            header.sequence,
            header.address,
            payload.len(),
            plcrc,
        );
        self.send_memory(&buf[..size], &payload)
    }

    /// Acknowledge a request. `payload` holds the response data in wire
    /// layout (16-bit words little-endian); empty for write responses.
    pub fn resp_ack(&mut self, frame: &Frame, payload: &[u8]) -> IoResult<()> {
        let n = payload.len() / self.memory.unit_size();
        let plcrc = crc16_arc(0, payload);
        let mut buf = [0u8; HEADER_SIZE_MAX];
        let size = self.encode_header(
            &mut buf,
            Units::Auto,
            frame.header.ftype.response(),
            Response::Ack as u8,
            frame.header.sequence,
            frame.header.address,
            n,
            plcrc,
        );
        self.send_memory(&buf[..size], payload)
    }

    /// Report a word-size mismatch.
    pub fn resp_ewordsize(&mut self, frame: &Frame) -> IoResult<()> {
        self.send_resp_0(&frame.header, Response::EWordSize, Units::Bytes)
    }

    /// Report a payload checksum mismatch.
    pub fn resp_epayloadcrc(&mut self, frame: &Frame) -> IoResult<()> {
        self.send_resp_0(&frame.header, Response::EPayloadCrc, Units::Bytes)
    }

    /// Report an implausible payload size.
    pub fn resp_epayloadsize(&mut self, frame: &Frame) -> IoResult<()> {
        self.send_resp_0(&frame.header, Response::EPayloadSize, Units::Bytes)
    }

    /// Report that the frame exceeded the receive buffer of `size` bytes.
    pub fn resp_erxoverflow(&mut self, frame: &Frame, size: u32) -> IoResult<()> {
        self.send_resp_32(&frame.header, Response::ERxOverflow, size)
    }

    /// Report that the response would exceed the transmit buffer of
    /// `size` bytes.
    pub fn resp_etxoverflow(&mut self, frame: &Frame, size: u32) -> IoResult<()> {
        self.send_resp_32(&frame.header, Response::ETxOverflow, size)
    }

    /// Report that no receive buffer was available.
    pub fn resp_ebusy(&mut self, frame: &Frame) -> IoResult<()> {
        self.send_resp_0(&frame.header, Response::EBusy, Units::Bytes)
    }

    /// Report an access into unmapped memory at `address`.
    pub fn resp_eunmapped(&mut self, frame: &Frame, address: u32) -> IoResult<()> {
        self.send_resp_32(&frame.header, Response::EUnmapped, address)
    }

    /// Report an access-policy violation at `address`.
    pub fn resp_eaccess(&mut self, frame: &Frame, address: u32) -> IoResult<()> {
        self.send_resp_32(&frame.header, Response::EAccess, address)
    }

    /// Report a validator rejection at `address`.
    pub fn resp_erange(&mut self, frame: &Frame, address: u32) -> IoResult<()> {
        self.send_resp_32(&frame.header, Response::ERange, address)
    }

    /// Report an invalid value at `address`.
    pub fn resp_einvalid(&mut self, frame: &Frame, address: u32) -> IoResult<()> {
        self.send_resp_32(&frame.header, Response::EInvalid, address)
    }

    /// Report a backend failure.
    pub fn resp_eio(&mut self, frame: &Frame) -> IoResult<()> {
        self.send_resp_0(&frame.header, Response::EIo, Units::Bytes)
    }

    /// Emit a meta frame with the given code.
    pub fn resp_meta(&mut self, code: MetaCode) -> IoResult<()> {
        let mut buf = [0u8; HEADER_SIZE_MAX];
        let size = self.encode_header(
            &mut buf,
            Units::Bytes,
            FrameType::Meta,
            code as u8,
            0,
            0,
            0,
            0,
        );
        self.send_memory(&buf[..size], &[])
    }

    /*
     * Receiving
     */

    /// Receive one frame from the channel.
    ///
    /// Transport-level failures (a source running dry, say) surface as
    /// errors. Everything at the protocol level surfaces through the
    /// returned [`Received`]:
    ///
    /// - [`RecvIssue::Busy`]: no buffer; the frame's header was captured
    ///   in a stack fallback and an `EBusy` response was sent.
    /// - [`RecvIssue::Overflow`]: frame larger than the buffer; the rest
    ///   of the frame was drained to keep the decoder synchronised and an
    ///   `ERxOverflow` response was sent.
    /// - [`RecvIssue::HeaderEncoding`], [`RecvIssue::HeaderCrc`]: the
    ///   header is unusable; a meta frame was sent to the peer.
    /// - [`RecvIssue::PayloadSize`], [`RecvIssue::PayloadCrc`]: the header
    ///   is fine, the payload is not; the frame is returned for
    ///   inspection and [`Protocol::process`] answers it.
    pub fn recv(&mut self) -> IoResult<Received> {
        let mut fsink = FrameSink::new(self.alloc.alloc(), self.alloc.block_size());

        match self.kind {
            ChannelKind::Tcp => {
                let mut sink = Sink::chunk(&mut fsink);
                lenprefix::decode_to_sink(PrefixKind::Octet, &mut self.source, &mut sink)?;
            }
            ChannelKind::Serial => {
                let mut sink = Sink::chunk(&mut fsink);
                Slip::new().decode(&mut self.source, &mut sink)?;
            }
        }

        let FrameSink {
            block,
            fallback,
            fallback_used,
            total,
            ..
        } = fsink;

        let Some(block) = block else {
            debug!("no frame buffer available, answering busy");
            self.early_response(&fallback[..fallback_used], Response::EBusy)?;
            return Ok(Received {
                frame: None,
                issue: Some(RecvIssue::Busy),
            });
        };

        if total > block.len() {
            debug!(framesize = total, "oversized frame, answering overflow");
            let capacity = self.alloc.block_size() as u32;
            let header_end = block.len().min(HEADER_SIZE_MAX);
            match parse_header(&block[..header_end]) {
                Ok((header, _)) => {
                    self.send_resp_32(&header, Response::ERxOverflow, capacity)?;
                }
                Err(IoError::IllegalSequence) => self.resp_meta(MetaCode::HeaderCrc)?,
                Err(_) => self.resp_meta(MetaCode::HeaderEncoding)?,
            }
            return Ok(Received {
                frame: None,
                issue: Some(RecvIssue::Overflow { framesize: total }),
            });
        }

        let (header, header_size) = match parse_header(&block) {
            Ok(parsed) => parsed,
            Err(IoError::IllegalSequence) => {
                self.resp_meta(MetaCode::HeaderCrc)?;
                return Ok(Received {
                    frame: None,
                    issue: Some(RecvIssue::HeaderCrc),
                });
            }
            Err(_) => {
                self.resp_meta(MetaCode::HeaderEncoding)?;
                return Ok(Received {
                    frame: None,
                    issue: Some(RecvIssue::HeaderEncoding),
                });
            }
        };

        let frame = Frame {
            header,
            payload: header_size..block.len(),
            block,
        };

        if let Err(issue) = payload_plausible(&frame) {
            return Ok(Received {
                frame: Some(frame),
                issue: Some(issue),
            });
        }
        if let Err(issue) = payload_checksum(&frame) {
            return Ok(Received {
                frame: Some(frame),
                issue: Some(issue),
            });
        }

        Ok(Received {
            frame: Some(frame),
            issue: None,
        })
    }

    /// Answer a frame whose body never made it into a buffer, from the
    /// captured header bytes alone.
    fn early_response(&mut self, header_bytes: &[u8], code: Response) -> IoResult<()> {
        match parse_header(header_bytes) {
            Ok((header, _)) => self.send_resp_0(&header, code, Units::Bytes),
            Err(IoError::IllegalSequence) => self.resp_meta(MetaCode::HeaderCrc),
            Err(_) => self.resp_meta(MetaCode::HeaderEncoding),
        }
    }

    /*
     * Processing
     */

    /// Serve one received frame with the protocol's standard semantics.
    ///
    /// Frames [`Self::recv`] already answered, and frames that are not
    /// requests, are ignored. Payload issues are answered with their
    /// respective error responses. Otherwise the request is forwarded to
    /// the memory backend and its result is returned to the peer.
    pub fn process(&mut self, received: &Received) -> IoResult<()> {
        let Some(frame) = &received.frame else {
            return Ok(());
        };

        match received.issue {
            None => {}
            Some(RecvIssue::PayloadCrc) => {
                if frame.is_request() {
                    return self.send_resp_0(&frame.header, Response::EPayloadCrc, Units::Bytes);
                }
                return Ok(());
            }
            Some(RecvIssue::PayloadSize) => {
                if frame.is_request() {
                    return self.send_resp_0(&frame.header, Response::EPayloadSize, Units::Bytes);
                }
                return Ok(());
            }
            Some(_) => return Ok(()),
        }

        if !frame.is_request() {
            return Ok(());
        }

        if frame.header.is_16bit_semantics() != self.memory.is_word_sized() {
            return self.send_resp_0(&frame.header, Response::EWordSize, Units::Bytes);
        }

        let address = frame.header.address;
        let blocksize = frame.header.blocksize as usize;
        let capacity = self.alloc.block_size() / self.memory.unit_size();

        let (access, payload) = if frame.is_read_request() {
            if blocksize > capacity {
                (
                    BlockAccess::error(Response::ETxOverflow, address),
                    Vec::new(),
                )
            } else {
                match &mut self.memory {
                    MemoryBackend::Words(memory) => {
                        let mut words = vec![0u16; blocksize];
                        let access = memory.read_block(address, &mut words);
                        let bytes = words.iter().flat_map(|w| w.to_le_bytes()).collect();
                        (access, bytes)
                    }
                    MemoryBackend::Bytes(memory) => {
                        let mut bytes = vec![0u8; blocksize];
                        let access = memory.read_block(address, &mut bytes);
                        (access, bytes)
                    }
                }
            }
        } else {
            let access = match &mut self.memory {
                MemoryBackend::Words(memory) => {
                    let words = frame.payload_words();
                    memory.write_block(address, &words)
                }
                MemoryBackend::Bytes(memory) => memory.write_block(address, frame.payload()),
            };
            (access, Vec::new())
        };

        match access.status {
            Response::Ack => self.resp_ack(frame, &payload),
            Response::EWordSize => self.resp_ewordsize(frame),
            Response::EPayloadCrc => self.resp_epayloadcrc(frame),
            Response::EPayloadSize => self.resp_epayloadsize(frame),
            Response::ERxOverflow => self.resp_erxoverflow(frame, self.alloc.block_size() as u32),
            Response::ETxOverflow => self.resp_etxoverflow(frame, self.alloc.block_size() as u32),
            Response::EBusy => self.resp_ebusy(frame),
            Response::EUnmapped => self.resp_eunmapped(frame, access.address),
            Response::EAccess => self.resp_eaccess(frame, access.address),
            Response::ERange => self.resp_erange(frame, access.address),
            Response::EInvalid => self.resp_einvalid(frame, access.address),
            Response::EIo => self.resp_eio(frame),
        }
    }
}

/// The sink the receive path reads frames into. It keeps accepting data
/// after its buffer is exhausted, so the stream decoder never loses
/// synchronisation; the condition is recorded instead.
struct FrameSink {
    /// The allocator-provided block; `None` when allocation failed.
    block: Option<Vec<u8>>,
    /// The configured block size; bytes beyond it are dropped.
    limit: usize,
    /// Captures the frame's first bytes when no block is available, so an
    /// `EBusy` response can still echo the request's header.
    fallback: [u8; HEADER_SIZE_MAX],
    fallback_used: usize,
    /// Total frame size seen, including dropped bytes.
    total: usize,
}

impl FrameSink {
    fn new(block: Option<Vec<u8>>, limit: usize) -> Self {
        let block = block.map(|mut b| {
            b.clear();
            b
        });
        Self {
            block,
            limit,
            fallback: [0; HEADER_SIZE_MAX],
            fallback_used: 0,
            total: 0,
        }
    }
}

impl crate::endpoint::ChunkSink for FrameSink {
    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        match &mut self.block {
            Some(block) => {
                let room = self.limit.saturating_sub(block.len());
                let n = data.len().min(room);
                block.extend_from_slice(&data[..n]);
            }
            None => {
                let room = self.fallback.len() - self.fallback_used;
                let n = data.len().min(room);
                self.fallback[self.fallback_used..self.fallback_used + n]
                    .copy_from_slice(&data[..n]);
                self.fallback_used += n;
            }
        }
        self.total += data.len();
        Ok(data.len())
    }
}

/// Parse an on-wire header. Returns the header and its size in bytes.
///
/// Errors: [`IoError::BadMessage`] for structural problems,
/// [`IoError::IllegalSequence`] for a checksum mismatch.
pub fn parse_header(raw: &[u8]) -> IoResult<(Header, usize)> {
    if raw.len() < HEADER_SIZE_BARE {
        return Err(IoError::BadMessage);
    }

    let motv = binfmt::get_u16_be(raw);
    let version = (motv & 0x0f) as u8;
    if version != IMPLEMENTATION_VERSION {
        return Err(IoError::BadMessage);
    }

    let ftype = FrameType::from_nibble(((motv >> 4) & 0x0f) as u8).ok_or(IoError::BadMessage)?;

    let options = ((motv >> 8) & 0x0f) as u8;
    if options & 0x08 != 0 {
        return Err(IoError::BadMessage);
    }

    let meta = ((motv >> 12) & 0x0f) as u8;
    match ftype {
        FrameType::ReadRequest | FrameType::WriteRequest => {
            if meta != 0 {
                return Err(IoError::BadMessage);
            }
        }
        FrameType::ReadResponse | FrameType::WriteResponse => {
            if meta > Response::EInvalid as u8 {
                return Err(IoError::BadMessage);
            }
        }
        FrameType::Meta => {
            if !(1..=2).contains(&meta) {
                return Err(IoError::BadMessage);
            }
        }
    }

    let mut header = Header {
        version,
        ftype,
        options,
        meta,
        sequence: binfmt::get_u16_be(&raw[2..]),
        address: binfmt::get_u32_be(&raw[4..]),
        blocksize: binfmt::get_u32_be(&raw[8..]),
        hdcrc: 0,
        plcrc: 0,
    };

    let with_hdcrc = header.has_hdcrc();
    let with_plcrc = header.has_plcrc();

    if with_hdcrc && with_plcrc && raw.len() < HEADER_SIZE_MAX {
        return Err(IoError::BadMessage);
    }
    if (with_hdcrc || with_plcrc) && raw.len() < HEADER_SIZE_MAX - 2 {
        return Err(IoError::BadMessage);
    }

    let mut offset = HEADER_SIZE_BARE;
    let mut crc = 0u16;

    if with_hdcrc {
        header.hdcrc = binfmt::get_u16_be(&raw[offset..]);
        crc = crc16_arc(0, &raw[..HEADER_SIZE_BARE]);
        if with_plcrc {
            crc = crc16_arc(crc, &raw[HEADER_SIZE_MAX - 2..HEADER_SIZE_MAX]);
        }
        offset += 2;
    }
    if with_plcrc {
        header.plcrc = binfmt::get_u16_be(&raw[offset..]);
        offset += 2;
    }

    if crc != header.hdcrc {
        return Err(IoError::IllegalSequence);
    }

    Ok((header, offset))
}

/// Check that a frame's payload size fits its declared type.
fn payload_plausible(frame: &Frame) -> Result<(), RecvIssue> {
    let mut actual = frame.payload().len();
    if frame.header.is_16bit_semantics() {
        actual /= 2;
    }
    let plausible = match frame.header.ftype {
        FrameType::ReadRequest | FrameType::WriteResponse | FrameType::Meta => actual == 0,
        FrameType::ReadResponse | FrameType::WriteRequest => {
            actual == frame.header.blocksize as usize
        }
    };
    if plausible {
        Ok(())
    } else {
        Err(RecvIssue::PayloadSize)
    }
}

/// Check a frame's payload checksum, where one is declared.
fn payload_checksum(frame: &Frame) -> Result<(), RecvIssue> {
    if !frame.header.has_plcrc() || frame.payload().is_empty() {
        return Ok(());
    }
    if crc16_arc(0, frame.payload()) == frame.header.plcrc {
        Ok(())
    } else {
        Err(RecvIssue::PayloadCrc)
    }
}
