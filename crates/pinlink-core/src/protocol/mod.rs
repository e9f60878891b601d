//! Serial Protocol Communication
//!
//! Implements the line-based serial protocol spoken by FAST-style pinball
//! controllers: identification handshake, windowed flow control, framing and
//! IO board discovery.
//!
//! Every message is ASCII, `PREFIX:PAYLOAD` followed by a carriage return.

pub mod commands;
mod communicator;
mod connector;
mod discovery;
mod error;
mod flow;
mod framer;
pub mod identity;
mod link;
mod retry;
pub mod serial;

pub use commands::Command;
pub use communicator::{
    Communicator, LinkState, LinkTermination, PendingMessage, DMD_FRAME_PREFIX,
};
pub use connector::Connector;
pub use discovery::Discovery;
pub use error::{BoardMismatch, ProtocolError};
pub use flow::FlowWindow;
pub use framer::{Frame, MessageFramer};
pub use identity::{CommunicatorKind, FirmwareVersion, Identification, LinkProfile, Processor};
pub use link::Link;
pub use retry::RetryPolicy;
pub use serial::{list_ports, open_port, PortInfo};

/// Default baud rate of the controller's USB serial ports
pub const DEFAULT_BAUD_RATE: u32 = 921_600;

/// Byte ending every message in both directions
pub const TERMINATOR: u8 = b'\r';

/// Largest partial frame kept while waiting for a terminator
pub const MAX_FRAME_SIZE: usize = 8192;

/// Bytes requested per read in the receive loop
pub const READ_CHUNK_SIZE: usize = 128;

/// Spaces written before the handshake to flush half-received commands on the board
pub const WAKE_SEQUENCE_LEN: usize = 1024;
