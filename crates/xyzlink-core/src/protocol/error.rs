//! Protocol errors

use thiserror::Error;

/// Errors that can occur on the serial channel
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Not connected to printer")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Printer returned error: {0}")]
    PrinterError(String),

    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Marker mismatch for block {index}: expected {expected:#010x}, got {actual:#010x}")]
    MarkerMismatch {
        index: u32,
        expected: u32,
        actual: u32,
    },

    #[error("Frame too short: need {needed} bytes, have {available}")]
    FrameTooShort { needed: usize, available: usize },

    #[error("Block {actual} arrived out of order (expected {expected})")]
    OutOfOrder { expected: u32, actual: u32 },

    #[error("Frame payload of {length} bytes exceeds the {max}-byte block size")]
    FrameTooLong { length: usize, max: usize },

    #[error("Reconnect abandoned after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<tokio_serial::Error> for ProtocolError {
    fn from(e: tokio_serial::Error) -> Self {
        match e.kind {
            tokio_serial::ErrorKind::NoDevice => ProtocolError::PortNotFound(e.description),
            _ => ProtocolError::SerialError(e.description),
        }
    }
}
