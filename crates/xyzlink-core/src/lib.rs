//! # xyzlink Core Library
//!
//! Host-side serial communication with XYZprinting da Vinci printers.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Line parsing and status normalization for the printer's telemetry
//! - The `.3w` container codec (encode, decode, legacy zip variant)
//! - A supervised serial channel with backoff reconnect
//! - The upload/print session that transfers a file and starts the job
//!
//! ## Example
//!
//! ```rust,ignore
//! use xyzlink_core::{config::Settings, printer::Printer, threew};
//!
//! let mut settings = Settings::default();
//! settings.connection.port_name = "/dev/ttyACM0".into();
//!
//! std::fs::write("cube.3w", threew::encode(&std::fs::read("cube.gcode")?)?)?;
//!
//! let printer = Printer::connect(settings).await?;
//! let report = printer.upload_file("cube.3w".as_ref(), "cube.3w").await?;
//! println!("sent {} blocks", report.blocks_sent);
//! ```

pub mod config;
pub mod events;
pub mod printer;
pub mod protocol;
pub mod status;
pub mod threew;
pub mod upload;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigError, Settings};
    pub use crate::events::{ConnectionEvent, LogEvent, PrinterEvent};
    pub use crate::printer::Printer;
    pub use crate::protocol::{
        CalibrationStep, Command, Connection, ConnectionConfig, ConnectionState, PrintAction,
        PrinterLink, ProtocolError, TransferProfile,
    };
    pub use crate::status::{CalibrationEvent, LineParser, PrinterStatus};
    pub use crate::threew::ContainerError;
    pub use crate::upload::{
        UploadConfig, UploadError, UploadProgress, UploadReport, UploadState, UploadWarning,
        Uploader,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
