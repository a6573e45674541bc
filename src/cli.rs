//! This module implements the CLI interface.
//!
//! The driver decodes register-protocol frames from hex input, optionally
//! serving them against a demo register table. Feeding it raw frame bytes
//! makes it usable as a fuzzing target for the frame parser.

use clap::{Parser, ValueEnum};

/// How the input bytes are delimited.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// A bare frame: header plus payload, no framing layer.
    Raw,
    /// A SLIP byte-stuffed capture of a serial channel.
    Serial,
    /// A length-prefixed frame from a reliable stream.
    Tcp,
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// The framing of the input bytes.
    #[arg(short, long, value_enum, default_value_t = Framing::Raw)]
    pub framing: Framing,

    /// Serve the frame against a demo register table and print the
    /// response frame.
    #[arg(short, long)]
    pub respond: bool,

    /// The frame as hexadecimal octets. Read from stdin when absent.
    pub frame: Option<String>,
}
