mod cli;

use std::io::Read;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Framing};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use regwire::buffer::ByteBuffer;
use regwire::endpoint::{BufferSink, BufferSource, Sink, Source};
use regwire::proto::{
    parse_header, ChannelKind, Frame, HeapAllocator, MemoryBackend, Protocol, Received,
};
use regwire::regtable::{Area, Entry, RegisterTable, Validator, Value};

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        bail!("hex input has an odd number of digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex octets at position {i}"))
        })
        .collect()
}

fn hexdump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A small register table for the `--respond` mode: some scalar registers
/// behind a read/write area, plus a read-only identification area.
fn demo_table() -> Result<RegisterTable> {
    let mut table = RegisterTable::new(
        vec![
            Area::memory(0x0000, 0x100),
            Area::memory_ro(0x1000, 0x10),
        ],
        vec![
            Entry::new(0x0000, Value::U16(0x2342)).named("mode"),
            Entry::new(0x0001, Value::U32(0x1337_4242)).named("scratch"),
            Entry::new(0x0010, Value::U16(100))
                .validated(Validator::Range(Value::U16(10), Value::U16(1000)))
                .named("interval"),
            Entry::new(0x0020, Value::F32(1.0)).named("gain"),
            Entry::new(0x1000, Value::U64(0x0123_4567_89ab_cdef)).named("serial"),
        ],
    );
    table
        .init()
        .map_err(|e| anyhow::anyhow!("demo table failed to initialise: {e}"))?;
    Ok(table)
}

fn print_header(header: &regwire::proto::Header) {
    println!(".header.version   = {}", header.version);
    println!(".header.type      = {:?}", header.ftype);
    println!(".header.meta      = {:#x}", header.meta);
    println!(".header.options   = {:#x}", header.options);
    println!(".header.sequence  = {:#06x}", header.sequence);
    println!(".header.address   = {:#010x}", header.address);
    println!(".header.blocksize = {:#010x}", header.blocksize);
    println!(".header.hdcrc     = {:#06x}", header.hdcrc);
    println!(".header.plcrc     = {:#06x}", header.plcrc);
}

fn print_frame(frame: &Frame) {
    print_header(&frame.header);
    println!(".payload.size     = {:#x}", frame.payload().len());
    if !frame.payload().is_empty() {
        println!("payload: {}", hexdump(frame.payload()));
    }
}

fn parse_raw(raw: &[u8]) -> Result<()> {
    let (header, size) = match parse_header(raw) {
        Ok(parsed) => parsed,
        Err(e) => bail!("header does not parse: {e}"),
    };

    print_header(&header);
    println!(".payload.size     = {:#x}", raw.len() - size);
    if raw.len() > size {
        println!("payload: {}", hexdump(&raw[size..]));
    }
    Ok(())
}

fn run_framed(kind: ChannelKind, bytes: Vec<u8>, respond: bool) -> Result<()> {
    let mut table = demo_table()?;
    let alloc = HeapAllocator::default();

    let mut inbound = ByteBuffer::from_data(bytes);
    let mut outbound = ByteBuffer::with_capacity(1024);

    let mut source_driver = BufferSource::new(&mut inbound);
    let mut sink_driver = BufferSink::new(&mut outbound);

    let received: Received = {
        let mut server = Protocol::new(
            kind,
            Source::chunk(&mut source_driver),
            Sink::chunk(&mut sink_driver),
            MemoryBackend::Words(&mut table),
            &alloc,
        );

        let received = server
            .recv()
            .map_err(|e| anyhow::anyhow!("frame reception failed: {e}"))?;

        if let Some(issue) = received.issue {
            println!("reception issue: {issue:?}");
        }
        if respond {
            server
                .process(&received)
                .map_err(|e| anyhow::anyhow!("processing failed: {e}"))?;
        }
        received
    };

    if let Some(frame) = &received.frame {
        print_frame(frame);
    }

    if outbound.used() > 0 {
        println!("emitted: {}", hexdump(outbound.filled()));
    }

    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    let hex = match &args.frame {
        Some(text) => text.clone(),
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read frame from stdin")?;
            text
        }
    };
    let bytes = parse_hex(&hex)?;
    info!("parsing {} octets of input", bytes.len());

    match args.framing {
        Framing::Raw => parse_raw(&bytes),
        Framing::Serial => run_framed(ChannelKind::Serial, bytes, args.respond),
        Framing::Tcp => run_framed(ChannelKind::Tcp, bytes, args.respond),
    }
}
