#![no_std]

//! Redirect a single USB device over a byte stream.
//!
//! One side of a connection owns the real device through a
//! [`UsbBackend`](backend::UsbBackend) implementation and runs a
//! [`Host`](host::Host); the other side emits requests and consumes the
//! asynchronous replies, usually feeding them into a virtual USB device
//! model. Between them runs a framed, versioned wire protocol handled by
//! [`Parser`](parser::Parser).
//!
//! The crate deliberately stops at two seams:
//! - the transport is anything implementing [`Channel`] (a TCP socket, a
//!   pipe, a test buffer), and
//! - the USB driver is anything implementing
//!   [`UsbBackend`](backend::UsbBackend).
//!
//! Everything in between (framing, capability negotiation, the device
//! state machine, transfer rings, cancellation, backpressure, device
//! filters) lives here.

extern crate alloc;

pub mod backend;
pub mod caps;
pub mod filter;
pub mod host;
pub mod parser;
pub mod proto;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use backend::UsbBackend;
pub use caps::{Cap, Caps};
pub use host::{Host, HostOptions, HostReadError};
pub use parser::{PacketSink, Parser, ParserOptions, ReadError, WriteError};
pub use proto::Role;
pub use types::{EndpointAddress, Speed, Status, TransferKind};

/// The transport failed; the session should be torn down.
///
/// Deliberately carries no detail: the embedder owns the concrete channel
/// and already knows why it failed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChannelError;

/// A non-blocking byte stream carrying the protocol.
///
/// Both methods distinguish three outcomes:
/// - `Ok(n)` with `n > 0`: bytes moved.
/// - `Ok(0)`: the channel would block right now; the caller resumes later
///   from exactly where it stopped.
/// - `Err(_)`: the channel is broken.
///
/// Note that `Ok(0)` means *would block*, never end-of-stream; report a
/// closed peer as an error.
pub trait Channel {
    /// Read up to `buf.len()` bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError>;

    /// Write bytes from `buf`, returning how many were accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError>;
}
