//! In-memory serial port for exercising the channel manager

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use xyzlink_core::events::{ConnectionEvent, PrinterEvent};
use xyzlink_core::protocol::{BoxedStream, PortOpener, ProtocolError};

/// Hands the printer side of every opened port to the test
pub struct FakeOpener {
    printers: mpsc::UnboundedSender<DuplexStream>,
    opens: AtomicUsize,
    failures: AtomicUsize,
}

impl FakeOpener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (printers, rx) = mpsc::unbounded_channel();
        (
            Self {
                printers,
                opens: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
            },
            rx,
        )
    }

    /// Make the next `n` opens fail
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortOpener for FakeOpener {
    async fn open(&self, port: &str, _baud_rate: u32) -> Result<BoxedStream, ProtocolError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProtocolError::PortNotFound(port.to_string()));
        }

        let (host, printer) = tokio::io::duplex(256 * 1024);
        let _ = self.printers.send(printer);
        Ok(Box::new(host))
    }
}

/// Next lifecycle event, skipping everything else
pub async fn next_connection_event(events: &mut broadcast::Receiver<PrinterEvent>) -> ConnectionEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(600), events.recv())
            .await
            .expect("timed out waiting for a connection event")
            .expect("event channel closed");
        if let PrinterEvent::Connection(event) = event {
            return event;
        }
    }
}

/// Printer end of a fake port
pub struct FakePrinter {
    reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
    writer: tokio::io::WriteHalf<DuplexStream>,
}

impl FakePrinter {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Send newline-terminated lines to the host
    pub async fn say(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
        if !text.ends_with('\n') {
            self.writer.write_all(b"\n").await.unwrap();
        }
        self.writer.flush().await.unwrap();
    }

    /// Read one command line from the host
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    /// Read exactly `n` raw bytes from the host
    pub async fn read_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf).await.unwrap();
        buf
    }
}
