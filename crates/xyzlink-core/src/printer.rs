//! Printer connection context
//!
//! A [`Printer`] ties one open [`Connection`] to the [`Uploader`] that drives
//! sessions over it. It exists from [`Printer::connect`] until
//! [`Printer::disconnect`]; collaborators borrow it instead of reaching for
//! global state.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::config::Settings;
use crate::events::PrinterEvent;
use crate::protocol::{
    Command, Connection, ConnectionState, PortOpener, PrinterLink, ProtocolError, SerialOpener,
    DEFAULT_TIMEOUT_MS,
};
use crate::status::PrinterStatus;
use crate::upload::{UploadError, UploadProgress, UploadReport, Uploader};

/// A connected printer
pub struct Printer {
    connection: Arc<Connection>,
    uploader: Uploader,
}

impl Printer {
    /// Open the serial port named in `settings`
    pub async fn connect(settings: Settings) -> Result<Self, ProtocolError> {
        Self::with_opener(settings, Arc::new(SerialOpener)).await
    }

    /// Connect through a custom port opener
    pub async fn with_opener(
        settings: Settings,
        opener: Arc<dyn PortOpener>,
    ) -> Result<Self, ProtocolError> {
        if settings.connection.port_name.is_empty() {
            return Err(ProtocolError::PortNotFound("no port configured".to_string()));
        }

        let connection = Arc::new(Connection::open(settings.connection, opener).await?);
        let uploader = Uploader::new(
            Arc::clone(&connection) as Arc<dyn PrinterLink>,
            settings.upload,
        );

        Ok(Self {
            connection,
            uploader,
        })
    }

    /// Close the port and stop background tasks
    pub async fn disconnect(self) {
        self.connection.close().await;
    }

    /// Receive printer events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
        self.connection.subscribe()
    }

    /// Current cumulative status
    pub fn status(&self) -> PrinterStatus {
        self.connection.status()
    }

    /// Channel state
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Underlying connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Fire-and-forget command
    pub async fn send(&self, command: &Command) -> Result<(), ProtocolError> {
        self.connection.send_command(command).await
    }

    /// Send a command and collect its response lines
    pub async fn exchange(
        &self,
        command: &Command,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>, ProtocolError> {
        let timeout = timeout.unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS));
        self.connection.exchange(command, timeout).await
    }

    /// Upload a `.3w` file and start printing it
    pub async fn upload_file(
        &self,
        path: &Path,
        filename: &str,
    ) -> Result<UploadReport, UploadError> {
        self.uploader.upload_file(path, filename).await
    }

    /// Progress of the current (or last) upload
    pub fn upload_progress(&self) -> watch::Receiver<UploadProgress> {
        self.uploader.progress()
    }

    /// Whether an upload is running
    pub fn is_uploading(&self) -> bool {
        self.uploader.is_active()
    }
}
