//! Serial Protocol Communication
//!
//! Implements the XYZv3 serial protocol spoken by da Vinci printers: newline
//! terminated text commands and responses, interleaved during uploads with
//! binary transfer frames.

pub mod codec;
pub mod commands;
mod connection;
mod error;
pub mod frame;
pub mod serial;

pub use codec::LineCodec;
pub use commands::{CalibrationStep, Command, PrintAction, ResponseKind};
pub use connection::{
    collect_response, Connection, ConnectionConfig, ConnectionState, PollingGuard, PrinterLink,
    ReconnectPolicy,
};
pub use error::ProtocolError;
pub use frame::{Reassembler, TrailerKind, TransferFrame, TransferProfile, WireOrder};
pub use serial::{list_ports, BoxedStream, ByteStream, PortInfo, PortOpener, SerialOpener};

/// Default baud rate for printer communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;
