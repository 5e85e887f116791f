//! Printer events
//!
//! Everything a connection observes is published as a [`PrinterEvent`] on a
//! broadcast channel. Subscribers see events in arrival order.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::status::{CalibrationEvent, PrinterStatus};

/// An event observed on a printer connection
#[derive(Debug, Clone)]
pub enum PrinterEvent {
    /// A raw inbound line, published before it is classified
    Line(String),
    /// The cumulative status changed
    Status(Arc<PrinterStatus>),
    /// A calibration stage line
    Calibrate(CalibrationEvent),
    /// A line that carried nothing the status tracks
    Log(LogEvent),
    /// The printer issued a session token
    Token(String),
    /// Channel lifecycle change
    Connection(ConnectionEvent),
}

/// Diagnostic line that did not update the status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    /// The line as received
    pub raw: String,
    /// Parsed JSON payload, when the line carried one
    pub payload: Option<serde_json::Value>,
}

impl LogEvent {
    /// Unstructured log line
    pub fn text(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            payload: None,
        }
    }

    /// Log line with a structured payload
    pub fn structured(raw: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            raw: raw.into(),
            payload: Some(payload),
        }
    }
}

/// Serial channel lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionEvent {
    /// The port is open and being read
    Opened {
        /// Port name
        port: String,
    },
    /// The port closed
    Closed {
        /// Whether an upload session announced this closure in advance
        expected: bool,
        /// Read error that ended the stream, if any
        reason: Option<String>,
    },
    /// A backoff reconnect attempt is about to run
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Delay waited before this attempt
        delay: Duration,
    },
    /// The channel gave up or hit an error it could not recover from
    Error(String),
}
