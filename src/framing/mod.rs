//! # Stream Framing
//!
//! Byte streams have no message boundaries of their own; these modules add
//! them. [`slip`] implements RFC-1055 style byte stuffing, which keeps a
//! receiver self-synchronising on lossy serial links. [`lenprefix`]
//! implements length-prefixed frames for reliable transports, where a
//! fixed-width or variable-length integer announces the payload size.

pub mod lenprefix;
pub mod slip;
