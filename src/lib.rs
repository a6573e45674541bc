//! # regwire
//!
//! An embedded-firmware register-protocol stack: a binary request/response
//! protocol that lets a remote peer read and write ranges of a device's
//! logical memory through either a byte-stuffed serial stream or a
//! length-prefixed reliable stream.
//!
//! The stack has three tightly coupled layers:
//!
//! 1. A [register table](regtable) mapping a linear address space onto
//!    typed, validated entries backed by memory areas with per-area access
//!    policies.
//! 2. A [wire protocol](proto) that serialises read/write primitives
//!    against that table, with optional header and payload checksums.
//! 3. [Stream framing](framing) — SLIP-style byte stuffing for serial
//!    links, length prefixes for reliable links — over a generic
//!    [source/sink endpoint abstraction](endpoint).
//!
//! The supporting cast: a [byte-precise binary codec](binfmt), a
//! [cursor-tracking byte buffer](buffer), [CRC-16-ARC](crc16),
//! [LEB128 variable-length integers](varint), and a few generic utilities
//! (a [ring buffer](ring), a [low-pass filter](lowpass), an
//! [s-expression parser](sx) for instrumentation).
//!
//! A minimal server loop looks like this:
//!
//! ```no_run
//! use regwire::endpoint::{EmptySource, NullSink, Sink, Source};
//! use regwire::proto::{ChannelKind, HeapAllocator, MemoryBackend, Protocol};
//! use regwire::regtable::{Area, Entry, RegisterTable, Value};
//!
//! let mut table = RegisterTable::new(
//!     vec![Area::memory(0x0000, 0x100)],
//!     vec![Entry::new(0x0000, Value::U16(42))],
//! );
//! table.init().expect("table geometry is sound");
//!
//! // Real deployments plug their transport drivers in here.
//! let mut source_driver = EmptySource;
//! let mut sink_driver = NullSink;
//!
//! let alloc = HeapAllocator::default();
//! let mut server = Protocol::new(
//!     ChannelKind::Tcp,
//!     Source::chunk(&mut source_driver),
//!     Sink::chunk(&mut sink_driver),
//!     MemoryBackend::Words(&mut table),
//!     &alloc,
//! );
//!
//! loop {
//!     match server.recv() {
//!         Ok(received) => server.process(&received).expect("response goes out"),
//!         Err(_) => break,
//!     }
//! }
//! ```

pub mod binfmt;
pub mod buffer;
pub mod crc16;
pub mod endpoint;
pub mod framing;
pub mod lowpass;
pub mod proto;
pub mod regtable;
pub mod ring;
pub mod sx;
pub mod varint;
