//! Connection management
//!
//! Owns the serial port for the lifetime of a printer connection:
//!
//! - a supervisor task reads lines, feeds the [`LineParser`] and publishes
//!   [`PrinterEvent`]s on a broadcast channel
//! - writes (text commands and binary frames) go through one async mutex
//! - request/response exchanges take a separate lock so they never interleave
//!   with each other or with the status poll
//! - an unexpected closure triggers exponential backoff reconnect; a closure an
//!   upload announced in advance waits for the upload to call [`Connection::reopen`]

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::{
    codec::LineCodec,
    serial::{BoxedStream, PortOpener, SerialOpener},
    Command, ProtocolError, ResponseKind, DEFAULT_BAUD_RATE,
};
use crate::events::{ConnectionEvent, PrinterEvent};
use crate::status::{LineParser, PrinterStatus, DEFAULT_HISTORY_LINES};

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 1024;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Opening the port
    Connecting,
    /// Connected and reading
    Connected,
    /// Waiting out a backoff delay before reopening
    Reconnecting,
    /// Gave up reconnecting
    Error,
}

/// Exponential backoff for unexpected closures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub base_delay_ms: u64,
    /// Upper bound for the doubled delay
    pub max_delay_ms: u64,
    /// Give up after this many attempts (`None` retries forever)
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delay before the 1-based `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: None,
        }
    }
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Longest inbound line kept intact
    pub max_line_length: usize,
    /// Raw lines kept for diagnostics (50-200)
    pub history_lines: usize,
    /// Status poll interval; 0 disables polling
    pub poll_interval_ms: u64,
    /// Backoff for unexpected closures
    pub reconnect: ReconnectPolicy,
    /// How long an announced closure waits for the upload to reopen
    pub reopen_grace_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            max_line_length: 4096,
            history_lines: DEFAULT_HISTORY_LINES,
            poll_interval_ms: 0,
            reconnect: ReconnectPolicy::default(),
            reopen_grace_ms: 30_000,
        }
    }
}

/// Suspends status polling while alive
///
/// Guards nest; polling resumes when the last one drops.
#[derive(Debug)]
pub struct PollingGuard {
    paused: Arc<AtomicUsize>,
}

impl PollingGuard {
    pub fn new(paused: Arc<AtomicUsize>) -> Self {
        paused.fetch_add(1, Ordering::SeqCst);
        Self { paused }
    }
}

impl Drop for PollingGuard {
    fn drop(&mut self) {
        self.paused.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What an upload session needs from the printer channel
#[async_trait]
pub trait PrinterLink: Send + Sync {
    /// Receive every event published after this call
    fn subscribe(&self) -> broadcast::Receiver<PrinterEvent>;

    /// Write one text command
    async fn send_command(&self, command: &Command) -> Result<(), ProtocolError>;

    /// Write raw bytes (binary frames)
    async fn write_raw(&self, bytes: &[u8]) -> Result<(), ProtocolError>;

    /// Announce (or withdraw) an imminent printer-side closure
    fn set_close_expected(&self, expected: bool);

    /// Open the port again after an announced closure
    async fn reopen(&self) -> Result<(), ProtocolError>;

    /// Stop status polling until the guard drops
    fn pause_polling(&self) -> PollingGuard;

    /// Snapshot of the cumulative printer status
    fn status(&self) -> PrinterStatus;

    /// Send a command and collect its response lines
    async fn exchange(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<Vec<String>, ProtocolError> {
        let mut events = self.subscribe();
        self.send_command(command).await?;
        collect_response(&mut events, timeout).await
    }
}

/// Collect response lines until `ok`, an end marker, or an `E…` rejection
pub async fn collect_response(
    events: &mut broadcast::Receiver<PrinterEvent>,
    timeout: Duration,
) -> Result<Vec<String>, ProtocolError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut lines = Vec::new();

    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => return Err(ProtocolError::Timeout),
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                tracing::warn!("exchange missed {n} events");
                continue;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                return Err(ProtocolError::NotConnected)
            }
            Ok(Ok(event)) => event,
        };

        match event {
            PrinterEvent::Line(line) => match ResponseKind::classify(&line) {
                ResponseKind::Ok => return Ok(lines),
                ResponseKind::End => {
                    lines.push(line);
                    return Ok(lines);
                }
                ResponseKind::Error => return Err(ProtocolError::PrinterError(line)),
                ResponseKind::Data => lines.push(line),
            },
            PrinterEvent::Connection(ConnectionEvent::Closed { .. }) => {
                return Err(ProtocolError::ConnectionFailed(
                    "port closed during exchange".to_string(),
                ))
            }
            _ => {}
        }
    }
}

struct Shared {
    config: ConnectionConfig,
    opener: Arc<dyn PortOpener>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    parser: Mutex<LineParser>,
    events: broadcast::Sender<PrinterEvent>,
    state: Mutex<ConnectionState>,
    close_expected: AtomicBool,
    polling_paused: Arc<AtomicUsize>,
    exchange_lock: tokio::sync::Mutex<()>,
    reopened: mpsc::Sender<ReadHalf<BoxedStream>>,
    shutdown: CancellationToken,
}

impl Shared {
    fn emit(&self, event: PrinterEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Open the port and install its write half
    async fn open_port(&self) -> Result<ReadHalf<BoxedStream>, ProtocolError> {
        let port = &self.config.port_name;
        self.set_state(ConnectionState::Connecting);

        let stream = match self.opener.open(port, self.config.baud_rate).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);

        self.close_expected.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        tracing::info!(port = %port, "serial port open");
        self.emit(PrinterEvent::Connection(ConnectionEvent::Opened {
            port: port.clone(),
        }));
        Ok(reader)
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    fn handle_line(&self, line: String) {
        tracing::trace!("RX: {line}");
        self.emit(PrinterEvent::Line(line.clone()));
        let events = self.parser.lock().feed(&line);
        for event in events {
            self.emit(event);
        }
    }

    /// Read lines until the stream ends
    ///
    /// A read half delivered by `reopen()` replaces the current one. Returns
    /// `None` on shutdown, otherwise the read error that ended the stream.
    async fn read_until_closed(
        &self,
        reader: ReadHalf<BoxedStream>,
        reopened: &mut mpsc::Receiver<ReadHalf<BoxedStream>>,
    ) -> Option<Option<String>> {
        let codec = LineCodec::new(self.config.max_line_length);
        let mut lines = FramedRead::new(reader, codec.clone());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                Some(replacement) = reopened.recv() => {
                    tracing::debug!("switching to reopened port");
                    lines = FramedRead::new(replacement, codec.clone());
                }
                next = lines.next() => match next {
                    Some(Ok(line)) => self.handle_line(line),
                    Some(Err(e)) => {
                        tracing::warn!("serial read error: {e}");
                        return Some(Some(e.to_string()));
                    }
                    None => return Some(None),
                },
            }
        }
    }

    /// Reopen with exponential backoff; `None` when giving up or shutting down
    async fn backoff_reconnect(
        &self,
        reopened: &mut mpsc::Receiver<ReadHalf<BoxedStream>>,
    ) -> Option<ReadHalf<BoxedStream>> {
        let policy = &self.config.reconnect;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if let Some(max) = policy.max_attempts {
                if attempt > max {
                    let err = ProtocolError::ReconnectExhausted(max);
                    tracing::error!("{err}");
                    self.set_state(ConnectionState::Error);
                    self.emit(PrinterEvent::Connection(ConnectionEvent::Error(
                        err.to_string(),
                    )));
                    return None;
                }
            }

            let delay = policy.delay_for(attempt);
            self.set_state(ConnectionState::Reconnecting);
            tracing::info!(attempt, ?delay, "reconnecting");
            self.emit(PrinterEvent::Connection(ConnectionEvent::Reconnecting {
                attempt,
                delay,
            }));

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                Some(reader) = reopened.recv() => return Some(reader),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.open_port().await {
                Ok(reader) => return Some(reader),
                Err(e) => tracing::warn!(attempt, "reconnect failed: {e}"),
            }
        }
    }

    /// Wait for the upload to reopen; fall back to backoff after the grace period
    async fn await_reopen(
        &self,
        reopened: &mut mpsc::Receiver<ReadHalf<BoxedStream>>,
    ) -> Option<ReadHalf<BoxedStream>> {
        let grace = Duration::from_millis(self.config.reopen_grace_ms);
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            received = tokio::time::timeout(grace, reopened.recv()) => match received {
                Ok(Some(reader)) => Some(reader),
                Ok(None) => None,
                Err(_) => {
                    tracing::warn!("announced closure was not followed by a reopen");
                    self.backoff_reconnect(reopened).await
                }
            },
        }
    }

    async fn supervise(
        self: Arc<Self>,
        mut reader: ReadHalf<BoxedStream>,
        mut reopened: mpsc::Receiver<ReadHalf<BoxedStream>>,
    ) {
        loop {
            let Some(reason) = self.read_until_closed(reader, &mut reopened).await else {
                break;
            };

            self.writer.lock().await.take();
            self.set_state(ConnectionState::Disconnected);
            let expected = self.close_expected.load(Ordering::SeqCst);
            if expected {
                tracing::info!("port closed by printer (announced)");
            } else {
                tracing::warn!(reason = ?reason, "port closed unexpectedly");
            }
            self.emit(PrinterEvent::Connection(ConnectionEvent::Closed { expected, reason }));

            let next = if expected {
                self.await_reopen(&mut reopened).await
            } else {
                self.backoff_reconnect(&mut reopened).await
            };

            match next {
                Some(next) => reader = next,
                None => break,
            }
        }
        tracing::debug!("connection supervisor stopped");
    }

    async fn poll_status(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.polling_paused.load(Ordering::SeqCst) > 0 {
                continue;
            }
            let Ok(_exclusive) = self.exchange_lock.try_lock() else {
                continue;
            };
            if let Err(e) = self.write_all(&Command::QueryStatus.to_bytes()).await {
                tracing::debug!("status poll skipped: {e}");
            }
        }
    }
}

/// Printer connection over a serial channel
pub struct Connection {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Open the configured serial port
    pub async fn open_serial(config: ConnectionConfig) -> Result<Self, ProtocolError> {
        Self::open(config, Arc::new(SerialOpener)).await
    }

    /// Open a connection through `opener`
    pub async fn open(
        config: ConnectionConfig,
        opener: Arc<dyn PortOpener>,
    ) -> Result<Self, ProtocolError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (reopened_tx, reopened_rx) = mpsc::channel(1);
        let poll_interval = config.poll_interval_ms;

        let shared = Arc::new(Shared {
            parser: Mutex::new(LineParser::with_history(config.history_lines)),
            config,
            opener,
            writer: tokio::sync::Mutex::new(None),
            events,
            state: Mutex::new(ConnectionState::Disconnected),
            close_expected: AtomicBool::new(false),
            polling_paused: Arc::new(AtomicUsize::new(0)),
            exchange_lock: tokio::sync::Mutex::new(()),
            reopened: reopened_tx,
            shutdown: CancellationToken::new(),
        });

        let reader = shared.open_port().await?;

        let mut tasks = vec![tokio::spawn(
            Arc::clone(&shared).supervise(reader, reopened_rx),
        )];
        if poll_interval > 0 {
            tasks.push(tokio::spawn(
                Arc::clone(&shared).poll_status(Duration::from_millis(poll_interval)),
            ));
        }

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Snapshot of the cumulative printer status
    pub fn status(&self) -> PrinterStatus {
        self.shared.parser.lock().status().clone()
    }

    /// Most recent raw lines from the printer, oldest first
    pub fn recent_lines(&self) -> Vec<String> {
        self.shared.parser.lock().recent_lines().iter().cloned().collect()
    }

    /// Latest token the printer issued
    pub fn token(&self) -> Option<String> {
        self.shared.parser.lock().token().map(str::to_string)
    }

    /// Whether an announced closure is pending
    pub fn is_close_expected(&self) -> bool {
        self.shared.close_expected.load(Ordering::SeqCst)
    }

    /// Stop all tasks and release the port
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("port shutdown: {e}");
            }
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("connection task failed: {e}");
            }
        }

        self.shared.set_state(ConnectionState::Disconnected);
        tracing::info!(port = %self.shared.config.port_name, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[async_trait]
impl PrinterLink for Connection {
    fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
        self.shared.events.subscribe()
    }

    async fn send_command(&self, command: &Command) -> Result<(), ProtocolError> {
        tracing::debug!("TX: {}", command.line());
        self.shared.write_all(&command.to_bytes()).await
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.shared.write_all(bytes).await
    }

    fn set_close_expected(&self, expected: bool) {
        self.shared.close_expected.store(expected, Ordering::SeqCst);
    }

    async fn reopen(&self) -> Result<(), ProtocolError> {
        let reader = self.shared.open_port().await?;
        self.shared
            .reopened
            .send(reader)
            .await
            .map_err(|_| ProtocolError::NotConnected)
    }

    fn pause_polling(&self) -> PollingGuard {
        PollingGuard::new(Arc::clone(&self.shared.polling_paused))
    }

    fn status(&self) -> PrinterStatus {
        Connection::status(self)
    }

    async fn exchange(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<Vec<String>, ProtocolError> {
        let _exclusive = self.shared.exchange_lock.lock().await;
        let mut events = self.subscribe();
        self.send_command(command).await?;
        collect_response(&mut events, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.max_line_length, 4096);
        assert_eq!(config.history_lines, 200);
        assert_eq!(config.poll_interval_ms, 0);
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let policy = ReconnectPolicy {
            base_delay_ms: 500,
            max_delay_ms: 3000,
            max_attempts: None,
        };
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
    }

    #[test]
    fn test_backoff_large_attempt_saturates() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1000), Duration::from_millis(30_000));
    }

    #[test]
    fn test_polling_guards_nest() {
        let paused = Arc::new(AtomicUsize::new(0));
        let outer = PollingGuard::new(Arc::clone(&paused));
        let inner = PollingGuard::new(Arc::clone(&paused));
        assert_eq!(paused.load(Ordering::SeqCst), 2);
        drop(inner);
        assert_eq!(paused.load(Ordering::SeqCst), 1);
        drop(outer);
        assert_eq!(paused.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_collect_response_until_ok() {
        let (tx, mut rx) = broadcast::channel(16);
        tx.send(PrinterEvent::Line("j:9500,0".into())).unwrap();
        tx.send(PrinterEvent::Line("ok".into())).unwrap();
        let lines = collect_response(&mut rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(lines, vec!["j:9500,0"]);
    }

    #[tokio::test]
    async fn test_collect_response_rejection() {
        let (tx, mut rx) = broadcast::channel(16);
        tx.send(PrinterEvent::Line("E4".into())).unwrap();
        let err = collect_response(&mut rx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PrinterError(line) if line == "E4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_response_timeout() {
        let (_tx, mut rx) = broadcast::channel::<PrinterEvent>(16);
        let err = collect_response(&mut rx, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
    }
}
