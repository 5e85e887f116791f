//! Upload session state machine

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, watch};
use tracing::Instrument;
use uuid::Uuid;

use super::{ms, UploadConfig, UploadError, UploadProgress, UploadReport, UploadState, UploadWarning};
use crate::events::{ConnectionEvent, PrinterEvent};
use crate::protocol::{
    Command, PrintAction, PrinterLink, ProtocolError, ResponseKind, TransferFrame,
};

/// Runs upload sessions over a printer link, one at a time
pub struct Uploader {
    link: Arc<dyn PrinterLink>,
    config: UploadConfig,
    active: AtomicBool,
    progress: watch::Sender<UploadProgress>,
}

/// Clears the active flag when the session ends
struct ActiveSession<'a>(&'a AtomicBool);

impl<'a> ActiveSession<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, UploadError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| UploadError::AlreadyInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Withdraws the closure announcement however the session ends
struct CloseExpectation<'a>(&'a dyn PrinterLink);

impl Drop for CloseExpectation<'_> {
    fn drop(&mut self) {
        self.0.set_close_expected(false);
    }
}

/// Per-block acknowledgement outcome
enum Ack {
    Ok,
    Rejected(String),
    Closed,
}

/// How streaming ended
struct Streamed {
    closed: bool,
}

/// Wait for the first event `pick` accepts
async fn wait_for<T>(
    events: &mut broadcast::Receiver<PrinterEvent>,
    timeout: Duration,
    mut pick: impl FnMut(&PrinterEvent) -> Option<T>,
) -> Option<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => return None,
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                tracing::warn!("upload missed {n} printer events");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => return None,
            Ok(Ok(event)) => {
                if let Some(found) = pick(&event) {
                    return Some(found);
                }
            }
        }
    }
}

fn is_closed(event: &PrinterEvent) -> bool {
    matches!(
        event,
        PrinterEvent::Connection(ConnectionEvent::Closed { .. })
    )
}

/// Fill `buf` from `file`, stopping early only at end of file
async fn read_block(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

impl Uploader {
    pub fn new(link: Arc<dyn PrinterLink>, config: UploadConfig) -> Self {
        let (progress, _) = watch::channel(UploadProgress::default());
        Self {
            link,
            config,
            active: AtomicBool::new(false),
            progress,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Whether a session is running
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Observe session progress
    pub fn progress(&self) -> watch::Receiver<UploadProgress> {
        self.progress.subscribe()
    }

    fn set_state(&self, state: UploadState) {
        tracing::info!(?state, "upload state");
        self.progress.send_modify(|p| p.state = state);
    }

    /// Upload `path` to the printer as `filename` and start printing it
    ///
    /// Fails immediately with [`UploadError::AlreadyInProgress`] while another
    /// session is running.
    pub async fn upload_file(
        &self,
        path: &Path,
        filename: &str,
    ) -> Result<UploadReport, UploadError> {
        let _active = ActiveSession::acquire(&self.active)?;

        let size = tokio::fs::metadata(path).await?.len();
        let span = tracing::info_span!(
            "upload",
            session = %Uuid::new_v4(),
            file = %filename,
            size
        );

        let result = self.run(path, filename, size).instrument(span).await;
        match &result {
            Ok(report) => {
                self.set_state(UploadState::Complete);
                tracing::info!(
                    file = %filename,
                    blocks = report.blocks_sent,
                    warnings = report.warnings.len(),
                    "upload complete"
                );
            }
            Err(e) => {
                self.set_state(UploadState::Failed);
                tracing::error!(file = %filename, "upload failed: {e}");
            }
        }
        result
    }

    async fn run(&self, path: &Path, filename: &str, size: u64) -> Result<UploadReport, UploadError> {
        if size == 0 {
            return Err(UploadError::EmptySource);
        }

        let block_size = self.config.block_size.max(1);
        let blocks_total = size.div_ceil(block_size as u64) as u32;
        self.progress.send_replace(UploadProgress {
            state: UploadState::Idle,
            block: 0,
            blocks_total,
            bytes_sent: 0,
            total_bytes: size,
        });

        let mut report = UploadReport::new(filename, size);
        let _polling = self.link.pause_polling();

        self.set_state(UploadState::Handshaking);
        self.handshake(filename, size, &mut report).await?;

        let _close = CloseExpectation(self.link.as_ref());
        let mut events = self.link.subscribe();

        self.set_state(UploadState::Streaming);
        let streamed = self
            .stream(path, block_size, blocks_total, &mut events, &mut report)
            .await?;

        self.set_state(UploadState::Validating);
        let mut closed = streamed.closed;
        if !closed {
            closed = self.validate(&mut events, &mut report).await;
        }

        self.set_state(UploadState::AwaitingPrinterClose);
        if !closed {
            closed = wait_for(&mut events, ms(self.config.close_timeout_ms), |e| {
                is_closed(e).then_some(())
            })
            .await
            .is_some();
        }

        // Anything after this point must see a fresh token
        let mut events = self.link.subscribe();

        if closed {
            self.set_state(UploadState::Reconnecting);
            tokio::time::sleep(ms(self.config.reconnect_settle_ms)).await;
            self.link.reopen().await.map_err(UploadError::Reconnect)?;
            report.reconnected = true;
            tracing::info!("port reopened after transfer");
        } else {
            report.warn(UploadWarning::PrinterDidNotClose);
        }

        self.set_state(UploadState::ConfirmingToken);
        report.token = self.confirm_token(&mut events, &mut report).await;

        self.set_state(UploadState::SendingStart);
        self.link
            .send_command(&Command::Print {
                action: PrintAction::Start,
                token: report.token.clone(),
            })
            .await
            .map_err(UploadError::StartCommand)?;

        Ok(report)
    }

    async fn handshake(
        &self,
        filename: &str,
        size: u64,
        report: &mut UploadReport,
    ) -> Result<(), UploadError> {
        let link = self.link.as_ref();
        let config = &self.config;

        if let Err(e) = link
            .exchange(&Command::QuerySignature, ms(config.signature_timeout_ms))
            .await
        {
            tracing::warn!("signature query failed: {e}");
            report.warn(UploadWarning::SignatureTimeout);
        }

        if let Err(e) = link
            .exchange(&Command::QueryTagInfo, ms(config.tag_info_timeout_ms))
            .await
        {
            tracing::warn!("tag info query failed: {e}");
            report.warn(UploadWarning::TagInfoTimeout);
        }

        let file_context = Command::QueryFileContext {
            filename: filename.to_string(),
            size,
        };
        link.exchange(&file_context, ms(config.file_context_timeout_ms))
            .await
            .map_err(|reason| UploadError::Handshake {
                stage: "file context",
                reason,
            })?;

        if config.profile.explicit_init {
            let init = Command::UploadInit {
                filename: filename.to_string(),
                size,
            };
            link.exchange(&init, ms(config.init_timeout_ms))
                .await
                .map_err(|reason| UploadError::Handshake {
                    stage: "upload init",
                    reason,
                })?;
        }

        tracing::debug!("handshake complete");
        Ok(())
    }

    async fn stream(
        &self,
        path: &Path,
        block_size: usize,
        blocks_total: u32,
        events: &mut broadcast::Receiver<PrinterEvent>,
        report: &mut UploadReport,
    ) -> Result<Streamed, UploadError> {
        let profile = self.config.profile;
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; block_size];
        let mut closed = false;

        for index in 0..blocks_total {
            let n = read_block(&mut file, &mut buf).await?;
            if n == 0 {
                return Err(UploadError::Source(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "source file shrank during upload",
                )));
            }

            let last = index + 1 == blocks_total;
            if last {
                self.link.set_close_expected(true);
            }

            let frame = TransferFrame::new(index, buf[..n].to_vec()).encode(&profile);
            tracing::trace!(block = index, bytes = n, "TX frame");
            self.link
                .write_raw(&frame)
                .await
                .map_err(|source| UploadError::Transfer { block: index, source })?;

            report.blocks_sent += 1;
            report.bytes_sent += n as u64;
            self.progress.send_modify(|p| {
                p.block = index + 1;
                p.bytes_sent = report.bytes_sent;
            });

            if profile.per_block_ack {
                match self.await_ack(events).await {
                    Some(Ack::Ok) => {}
                    Some(Ack::Closed) if last => closed = true,
                    Some(Ack::Closed) => {
                        return Err(UploadError::Transfer {
                            block: index,
                            source: ProtocolError::ConnectionFailed(
                                "printer closed the port mid-transfer".to_string(),
                            ),
                        })
                    }
                    Some(Ack::Rejected(line)) => {
                        return Err(UploadError::Transfer {
                            block: index,
                            source: ProtocolError::PrinterError(line),
                        })
                    }
                    None => return Err(UploadError::AckTimeout { block: index }),
                }
            }

            let interval = self.config.heartbeat_interval;
            if interval > 0 && (index + 1) % interval == 0 && !last {
                self.link
                    .send_command(&Command::Heartbeat)
                    .await
                    .map_err(|source| UploadError::Transfer { block: index, source })?;
                report.heartbeats += 1;
            }
        }

        Ok(Streamed { closed })
    }

    async fn await_ack(&self, events: &mut broadcast::Receiver<PrinterEvent>) -> Option<Ack> {
        wait_for(events, ms(self.config.ack_timeout_ms), |event| match event {
            PrinterEvent::Line(line) => match ResponseKind::classify(line) {
                ResponseKind::Ok => Some(Ack::Ok),
                ResponseKind::Error => Some(Ack::Rejected(line.clone())),
                _ => None,
            },
            e if is_closed(e) => Some(Ack::Closed),
            _ => None,
        })
        .await
    }

    /// Look for a completion signal; returns whether the port closed meanwhile
    ///
    /// Progress already at 100% when validation starts does not count.
    async fn validate(
        &self,
        events: &mut broadcast::Receiver<PrinterEvent>,
        report: &mut UploadReport,
    ) -> bool {
        // Progress reported before or during the transfer is the baseline
        let mut last_percent = self.link.status().print_percent;
        loop {
            match events.try_recv() {
                Ok(PrinterEvent::Status(status)) => last_percent = status.print_percent,
                Ok(event) if is_closed(&event) => return true,
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("upload missed {n} printer events");
                }
                Err(_) => break,
            }
        }

        tokio::time::sleep(ms(self.config.validation_settle_ms)).await;

        let mut finish_sent = false;
        if self.config.profile.explicit_init {
            match self.link.send_command(&Command::UploadFinish).await {
                Ok(()) => finish_sent = true,
                Err(e) => tracing::warn!("upload finish command failed: {e}"),
            }
        }

        enum Signal {
            Confirmed,
            Closed,
        }

        let signal = wait_for(events, ms(self.config.validation_timeout_ms), |event| {
            match event {
                PrinterEvent::Status(status) => {
                    let reached = status.is_complete() && last_percent != Some(100);
                    last_percent = status.print_percent;
                    reached.then_some(Signal::Confirmed)
                }
                PrinterEvent::Line(line) if line.contains("uploadDidFinish") => {
                    Some(Signal::Confirmed)
                }
                PrinterEvent::Line(line) if finish_sent && line.eq_ignore_ascii_case("ok") => {
                    Some(Signal::Confirmed)
                }
                e if is_closed(e) => Some(Signal::Closed),
                _ => None,
            }
        })
        .await;

        match signal {
            Some(Signal::Confirmed) => {
                tracing::debug!("printer confirmed the transfer");
                false
            }
            Some(Signal::Closed) => true,
            None => {
                report.warn(UploadWarning::ValidationTimeout);
                false
            }
        }
    }

    async fn confirm_token(
        &self,
        events: &mut broadcast::Receiver<PrinterEvent>,
        report: &mut UploadReport,
    ) -> Option<String> {
        if let Err(e) = self.link.send_command(&Command::QueryStatus).await {
            tracing::warn!("status query failed: {e}");
        }

        let token = wait_for(events, ms(self.config.token_timeout_ms), |event| match event {
            PrinterEvent::Token(token) => Some(token.clone()),
            _ => None,
        })
        .await;

        if token.is_none() {
            report.warn(UploadWarning::TokenTimeout);
        }
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PollingGuard, TransferProfile};
    use crate::status::PrinterStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    /// Scripted stand-in for a printer connection
    #[derive(Default)]
    struct Script {
        silent_signature: bool,
        reject_file_context: bool,
        ack_frames: bool,
        close_after_last: bool,
        token: Option<String>,
        /// Progress reported with every frame
        percent_per_frame: Option<u8>,
    }

    struct FakeLink {
        events: broadcast::Sender<PrinterEvent>,
        script: Script,
        commands: Mutex<Vec<Command>>,
        frames: Mutex<Vec<Vec<u8>>>,
        close_expected: AtomicBool,
        reopens: AtomicUsize,
        paused: Arc<AtomicUsize>,
        /// Polling pause depth seen by each command
        paused_at_send: Mutex<Vec<usize>>,
        status: Mutex<PrinterStatus>,
    }

    impl FakeLink {
        fn new(script: Script) -> Arc<Self> {
            let (events, _) = broadcast::channel(256);
            Arc::new(Self {
                events,
                script,
                commands: Mutex::new(Vec::new()),
                frames: Mutex::new(Vec::new()),
                close_expected: AtomicBool::new(false),
                reopens: AtomicUsize::new(0),
                paused: Arc::new(AtomicUsize::new(0)),
                paused_at_send: Mutex::new(Vec::new()),
                status: Mutex::new(PrinterStatus::default()),
            })
        }

        fn line(&self, text: &str) {
            let _ = self.events.send(PrinterEvent::Line(text.to_string()));
        }

        fn percent(&self, percent: u8) {
            let mut status = self.status.lock();
            status.print_percent = Some(percent);
            let _ = self.events.send(PrinterEvent::Status(Arc::new(status.clone())));
        }

        fn count(&self, wanted: &Command) -> usize {
            self.commands.lock().iter().filter(|c| *c == wanted).count()
        }

        fn starts(&self) -> Vec<Option<String>> {
            self.commands
                .lock()
                .iter()
                .filter_map(|c| match c {
                    Command::Print {
                        action: PrintAction::Start,
                        token,
                    } => Some(token.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl PrinterLink for FakeLink {
        fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
            self.events.subscribe()
        }

        async fn send_command(&self, command: &Command) -> Result<(), ProtocolError> {
            self.commands.lock().push(command.clone());
            self.paused_at_send
                .lock()
                .push(self.paused.load(Ordering::SeqCst));
            match command {
                Command::QuerySignature if self.script.silent_signature => {}
                Command::QueryFileContext { .. } if self.script.reject_file_context => {
                    self.line("E4")
                }
                Command::QuerySignature
                | Command::QueryTagInfo
                | Command::QueryFileContext { .. }
                | Command::UploadInit { .. } => self.line("ok"),
                Command::QueryStatus => {
                    if let Some(token) = &self.script.token {
                        let _ = self.events.send(PrinterEvent::Token(token.clone()));
                    }
                }
                _ => {}
            }
            Ok(())
        }

        async fn write_raw(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
            self.frames.lock().push(bytes.to_vec());
            if let Some(percent) = self.script.percent_per_frame {
                self.percent(percent);
            }
            if self.script.ack_frames {
                self.line("ok");
            }
            if self.script.close_after_last && self.close_expected.load(Ordering::SeqCst) {
                let _ = self.events.send(PrinterEvent::Connection(ConnectionEvent::Closed {
                    expected: true,
                    reason: None,
                }));
            }
            Ok(())
        }

        fn set_close_expected(&self, expected: bool) {
            self.close_expected.store(expected, Ordering::SeqCst);
        }

        async fn reopen(&self) -> Result<(), ProtocolError> {
            self.reopens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn pause_polling(&self) -> PollingGuard {
            PollingGuard::new(Arc::clone(&self.paused))
        }

        fn status(&self) -> PrinterStatus {
            self.status.lock().clone()
        }
    }

    fn source_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        file.write_all(&data).unwrap();
        file
    }

    fn streaming_config() -> UploadConfig {
        UploadConfig::default()
    }

    fn acknowledged_config() -> UploadConfig {
        UploadConfig {
            profile: TransferProfile::acknowledged(),
            ..UploadConfig::default()
        }
    }

    fn decode_frames(frames: &[Vec<u8>], profile: &TransferProfile) -> Vec<TransferFrame> {
        frames
            .iter()
            .map(|bytes| TransferFrame::decode(bytes, profile).unwrap().0)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_block_upload() {
        let link = FakeLink::new(Script {
            close_after_last: true,
            token: Some("tok-1".into()),
            ..Default::default()
        });
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(20_000);

        let report = uploader.upload_file(file.path(), "cube.3w").await.unwrap();

        let frames = decode_frames(&link.frames.lock(), &TransferProfile::streaming());
        let sizes: Vec<usize> = frames.iter().map(|f| f.payload.len()).collect();
        let indices: Vec<u32> = frames.iter().map(|f| f.index).collect();
        assert_eq!(sizes, vec![8192, 8192, 3616]);
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(link.count(&Command::Heartbeat), 0);
        assert_eq!(report.blocks_sent, 3);
        assert_eq!(report.bytes_sent, 20_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closure_reconnects_once_and_starts_with_token() {
        let link = FakeLink::new(Script {
            close_after_last: true,
            token: Some("tok-1".into()),
            ..Default::default()
        });
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(20_000);

        let report = uploader.upload_file(file.path(), "cube.3w").await.unwrap();

        assert_eq!(link.reopens.load(Ordering::SeqCst), 1);
        assert_eq!(link.count(&Command::QueryStatus), 1);
        assert_eq!(link.starts(), vec![Some("tok-1".to_string())]);
        assert!(report.reconnected);
        assert_eq!(report.token.as_deref(), Some("tok-1"));
        assert!(!link.close_expected.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_starts_without_one() {
        let link = FakeLink::new(Script {
            close_after_last: true,
            ..Default::default()
        });
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(20_000);

        let report = uploader.upload_file(file.path(), "cube.3w").await.unwrap();

        assert_eq!(link.reopens.load(Ordering::SeqCst), 1);
        assert_eq!(link.count(&Command::QueryStatus), 1);
        assert_eq!(link.starts(), vec![None]);
        assert!(report.warnings.contains(&UploadWarning::TokenTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_every_ten_blocks() {
        let link = FakeLink::new(Script {
            close_after_last: true,
            ..Default::default()
        });
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(10 * 8192 + 1);

        let report = uploader.upload_file(file.path(), "big.3w").await.unwrap();

        assert_eq!(report.blocks_sent, 11);
        assert_eq!(report.heartbeats, 1);
        assert_eq!(link.count(&Command::Heartbeat), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_profile() {
        let link = FakeLink::new(Script {
            ack_frames: true,
            close_after_last: true,
            token: Some("abc".into()),
            ..Default::default()
        });
        let uploader = Uploader::new(link.clone(), acknowledged_config());
        let file = source_file(20_000);

        let report = uploader.upload_file(file.path(), "cube.3w").await.unwrap();

        let frames = decode_frames(&link.frames.lock(), &TransferProfile::acknowledged());
        assert_eq!(frames.len(), 3);
        assert_eq!(
            link.count(&Command::UploadInit {
                filename: "cube.3w".into(),
                size: 20_000
            }),
            1
        );
        assert_eq!(report.token.as_deref(), Some("abc"));
        assert_eq!(link.reopens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_aborts() {
        let link = FakeLink::new(Script::default());
        let uploader = Uploader::new(link.clone(), acknowledged_config());
        let file = source_file(20_000);

        let err = uploader.upload_file(file.path(), "cube.3w").await.unwrap_err();

        assert!(matches!(err, UploadError::AckTimeout { block: 0 }));
        assert_eq!(link.frames.lock().len(), 1);
        assert_eq!(*uploader.progress().borrow(), UploadProgress {
            state: UploadState::Failed,
            block: 1,
            blocks_total: 3,
            bytes_sent: 8192,
            total_bytes: 20_000,
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_context_rejection_aborts() {
        let link = FakeLink::new(Script {
            reject_file_context: true,
            ..Default::default()
        });
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(100);

        let err = uploader.upload_file(file.path(), "cube.3w").await.unwrap_err();

        assert!(matches!(
            err,
            UploadError::Handshake {
                stage: "file context",
                ..
            }
        ));
        assert!(link.frames.lock().is_empty());
        assert!(!uploader.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signature_timeout_is_soft() {
        let link = FakeLink::new(Script {
            silent_signature: true,
            close_after_last: true,
            ..Default::default()
        });
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(100);

        let report = uploader.upload_file(file.path(), "cube.3w").await.unwrap();

        assert!(report.warnings.contains(&UploadWarning::SignatureTimeout));
        assert_eq!(report.blocks_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_printer_that_never_closes() {
        let link = FakeLink::new(Script::default());
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(100);

        let report = uploader.upload_file(file.path(), "cube.3w").await.unwrap();

        assert_eq!(link.reopens.load(Ordering::SeqCst), 0);
        assert!(!report.reconnected);
        assert!(report.warnings.contains(&UploadWarning::ValidationTimeout));
        assert!(report.warnings.contains(&UploadWarning::PrinterDidNotClose));
        assert_eq!(link.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_reported_during_transfer_is_stale() {
        let link = FakeLink::new(Script {
            percent_per_frame: Some(100),
            ..Default::default()
        });
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(20_000);

        let report = uploader.upload_file(file.path(), "cube.3w").await.unwrap();

        assert!(report.warnings.contains(&UploadWarning::ValidationTimeout));
        assert!(report.warnings.contains(&UploadWarning::PrinterDidNotClose));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_already_in_snapshot_is_stale() {
        let link = FakeLink::new(Script::default());
        link.status.lock().print_percent = Some(100);
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(100);

        let repeat = {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                link.percent(100);
            })
        };
        let report = uploader.upload_file(file.path(), "cube.3w").await.unwrap();
        repeat.await.unwrap();

        assert!(report.warnings.contains(&UploadWarning::ValidationTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_completion_confirms_transfer() {
        let link = FakeLink::new(Script {
            percent_per_frame: Some(40),
            ..Default::default()
        });
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(100);

        let finish = {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                link.percent(100);
            })
        };
        let report = uploader.upload_file(file.path(), "cube.3w").await.unwrap();
        finish.await.unwrap();

        assert!(!report.warnings.contains(&UploadWarning::ValidationTimeout));
        assert!(report.warnings.contains(&UploadWarning::PrinterDidNotClose));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_ok_without_finish_command_ignored() {
        let link = FakeLink::new(Script::default());
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(100);

        let stray = {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                link.line("ok");
            })
        };
        let report = uploader.upload_file(file.path(), "cube.3w").await.unwrap();
        stray.await.unwrap();

        assert!(report.warnings.contains(&UploadWarning::ValidationTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_rejected() {
        // A silent signature query keeps the first session busy
        let link = FakeLink::new(Script {
            silent_signature: true,
            ..Default::default()
        });
        let uploader = Arc::new(Uploader::new(link.clone(), streaming_config()));
        let file = source_file(100);
        let path = file.path().to_path_buf();

        let first = {
            let uploader = Arc::clone(&uploader);
            let path = path.clone();
            tokio::spawn(async move { uploader.upload_file(&path, "a.3w").await })
        };
        while !uploader.is_active() {
            tokio::task::yield_now().await;
        }

        let err = uploader.upload_file(&path, "b.3w").await.unwrap_err();
        assert!(matches!(err, UploadError::AlreadyInProgress));

        first.await.unwrap().unwrap();
        assert!(!uploader.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_source_rejected() {
        let link = FakeLink::new(Script::default());
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(0);

        let err = uploader.upload_file(file.path(), "empty.3w").await.unwrap_err();
        assert!(matches!(err, UploadError::EmptySource));
        assert!(link.commands.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_paused_during_session() {
        let link = FakeLink::new(Script {
            close_after_last: true,
            ..Default::default()
        });
        let uploader = Uploader::new(link.clone(), streaming_config());
        let file = source_file(100);

        uploader.upload_file(file.path(), "cube.3w").await.unwrap();
        assert!(link.paused_at_send.lock().iter().all(|depth| *depth == 1));
        assert_eq!(link.paused.load(Ordering::SeqCst), 0);
    }
}
