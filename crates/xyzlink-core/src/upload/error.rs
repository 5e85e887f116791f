//! Upload errors

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Reasons an upload session aborts
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("An upload is already in progress")]
    AlreadyInProgress,

    #[error("Nothing to upload: source file is empty")]
    EmptySource,

    #[error("Handshake failed at {stage}: {reason}")]
    Handshake {
        stage: &'static str,
        #[source]
        reason: ProtocolError,
    },

    #[error("Transfer failed at block {block}: {source}")]
    Transfer {
        block: u32,
        #[source]
        source: ProtocolError,
    },

    #[error("No acknowledgement for block {block}")]
    AckTimeout { block: u32 },

    #[error("Could not reopen the port after the transfer: {0}")]
    Reconnect(#[source] ProtocolError),

    #[error("Print start command failed: {0}")]
    StartCommand(#[source] ProtocolError),

    #[error("Cannot read source file: {0}")]
    Source(#[from] std::io::Error),
}
