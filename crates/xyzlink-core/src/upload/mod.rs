//! Upload/Print Session
//!
//! Sends a `.3w` file to the printer and starts it:
//!
//! `Idle → Handshaking → Streaming → Validating → AwaitingPrinterClose →
//! Reconnecting → ConfirmingToken → SendingStart → Complete | Failed`
//!
//! Only one session may run at a time. Soft failures (non-critical handshake
//! queries, validation, token confirmation) are collected as
//! [`UploadWarning`]s in the final [`UploadReport`].

mod error;
mod session;

pub use error::UploadError;
pub use session::Uploader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::frame::{TransferProfile, BLOCK_SIZE};

/// Upload timing and protocol settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Frame layout and handshake variant
    pub profile: TransferProfile,
    /// Bytes of file data per frame
    pub block_size: usize,
    /// Send a heartbeat after every this many blocks
    pub heartbeat_interval: u32,
    pub signature_timeout_ms: u64,
    pub tag_info_timeout_ms: u64,
    pub file_context_timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    /// Pause after the last block before looking for confirmation
    pub validation_settle_ms: u64,
    pub validation_timeout_ms: u64,
    /// How long to wait for the printer to drop the port
    pub close_timeout_ms: u64,
    /// Pause between the closure and the reopen
    pub reconnect_settle_ms: u64,
    pub token_timeout_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            profile: TransferProfile::default(),
            block_size: BLOCK_SIZE,
            heartbeat_interval: 10,
            signature_timeout_ms: 3000,
            tag_info_timeout_ms: 3000,
            file_context_timeout_ms: 5000,
            init_timeout_ms: 5000,
            ack_timeout_ms: 5000,
            validation_settle_ms: 1000,
            validation_timeout_ms: 10_000,
            close_timeout_ms: 15_000,
            reconnect_settle_ms: 2000,
            token_timeout_ms: 3000,
        }
    }
}

pub(crate) fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Upload session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    Idle,
    Handshaking,
    Streaming,
    Validating,
    AwaitingPrinterClose,
    Reconnecting,
    ConfirmingToken,
    SendingStart,
    Complete,
    Failed,
}

impl UploadState {
    /// Whether the session has finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Complete | UploadState::Failed)
    }
}

/// Live progress of the current session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub state: UploadState,
    /// Blocks written so far
    pub block: u32,
    pub blocks_total: u32,
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl Default for UploadProgress {
    fn default() -> Self {
        Self {
            state: UploadState::Idle,
            block: 0,
            blocks_total: 0,
            bytes_sent: 0,
            total_bytes: 0,
        }
    }
}

impl UploadProgress {
    /// Fraction of bytes written, 0.0-1.0
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.bytes_sent as f64 / self.total_bytes as f64
        }
    }
}

/// Soft failure recorded during a session that still completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadWarning {
    SignatureTimeout,
    TagInfoTimeout,
    ValidationTimeout,
    PrinterDidNotClose,
    TokenTimeout,
}

/// Outcome of a completed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub filename: String,
    pub total_bytes: u64,
    pub bytes_sent: u64,
    pub blocks_sent: u32,
    pub heartbeats: u32,
    /// The port was reopened after the printer closed it
    pub reconnected: bool,
    /// Token carried by the start command
    pub token: Option<String>,
    pub warnings: Vec<UploadWarning>,
}

impl UploadReport {
    fn new(filename: &str, total_bytes: u64) -> Self {
        Self {
            filename: filename.to_string(),
            total_bytes,
            bytes_sent: 0,
            blocks_sent: 0,
            heartbeats: 0,
            reconnected: false,
            token: None,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, warning: UploadWarning) {
        tracing::warn!(?warning, "upload continuing after soft failure");
        self.warnings.push(warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UploadConfig::default();
        assert_eq!(config.block_size, 8192);
        assert_eq!(config.heartbeat_interval, 10);
        assert_eq!(config.profile, TransferProfile::streaming());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: UploadConfig = serde_json::from_str(r#"{"ack_timeout_ms": 100}"#).unwrap();
        assert_eq!(config.ack_timeout_ms, 100);
        assert_eq!(config.token_timeout_ms, 3000);
    }

    #[test]
    fn test_progress_fraction() {
        let progress = UploadProgress {
            bytes_sent: 5000,
            total_bytes: 20000,
            ..Default::default()
        };
        assert_eq!(progress.fraction(), 0.25);
        assert_eq!(UploadProgress::default().fraction(), 0.0);
    }
}
