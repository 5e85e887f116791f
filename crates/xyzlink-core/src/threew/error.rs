//! Container errors

use thiserror::Error;

/// Errors raised while reading or writing `.3w` containers
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Not a .3w container (bad magic)")]
    NotAContainer,

    #[error("Container truncated: {0}")]
    Truncated(String),

    #[error("Invalid padding byte {0:#04x}")]
    InvalidPadding(u8),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Embedded archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Embedded archive has no members")]
    EmptyArchive,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
