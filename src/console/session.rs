//! Console session over a guest's serial stream
//!
//! A background task drains the stream into a [`ConsoleBuffer`] for as long
//! as the session is open, whether or not anyone is waiting. Waits take
//! `&mut self`, so at most one can be outstanding per session.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::buffer::{ConsoleBuffer, Cursor};
use crate::common::config::Config;
use crate::common::logging::CONSOLE_TARGET;
use crate::common::{Error, Result};

/// The two halves of a console byte stream
pub struct ConsoleTransport {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ConsoleTransport {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Text to wait for, with a deadline and an optional failure literal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub text: String,
    /// Seeing this before `text` fails the wait at once
    pub failure: Option<String>,
    pub timeout: Duration,
}

impl Pattern {
    pub fn new(text: impl Into<String>, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            failure: None,
            timeout,
        }
    }

    pub fn with_failure(mut self, failure: impl Into<String>) -> Self {
        self.failure = Some(failure.into());
        self
    }
}

/// A successful wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// The console line containing the match, without terminators
    pub text: String,
    pub start: Cursor,
    pub end: Cursor,
}

/// Session construction options
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_buffer_bytes: usize,
    /// Console bytes attached to errors
    pub tail_bytes: usize,
    /// Append the raw stream to this file
    pub log_file: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_buffer_bytes: config.console.max_buffer_kb * 1024,
            tail_bytes: config.console.tail_bytes,
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Byte range a wait may match in; `limit` holds back bytes not yet judged
#[derive(Debug, Clone, Copy)]
pub(crate) struct Window {
    pub from: Cursor,
    pub limit: Cursor,
}

/// State shared with the reader task
struct Shared {
    buffer: Mutex<ConsoleBuffer>,
    notify: Notify,
}

impl Shared {
    fn buffer(&self) -> MutexGuard<'_, ConsoleBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Incremental search position for one needle
///
/// Everything before `next` has been ruled out, so a rescan only covers
/// new bytes plus a needle-sized overlap.
struct Scan<'p> {
    needle: &'p [u8],
    next: Cursor,
}

impl<'p> Scan<'p> {
    fn new(needle: &'p str) -> Self {
        Self {
            needle: needle.as_bytes(),
            next: Cursor::START,
        }
    }

    fn step(&mut self, buffer: &ConsoleBuffer, window: Window) -> Option<Cursor> {
        let from = self.next.max(window.from);
        if let Some(found) = buffer.find(self.needle, from, window.limit) {
            return Some(found);
        }
        let overlap = self.needle.len().saturating_sub(1) as u64;
        let resume = window.limit.offset().saturating_sub(overlap);
        self.next = from.max(Cursor::from_offset(resume));
        None
    }
}

/// A live console attached to a guest
pub struct ConsoleSession {
    shared: Arc<Shared>,
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    reader_task: Option<JoinHandle<()>>,
    /// Where the next cursor-less wait starts searching
    consumed: Cursor,
    tail_bytes: usize,
    state: SessionState,
}

impl ConsoleSession {
    /// Start draining `transport` into a fresh buffer
    pub async fn open(transport: ConsoleTransport, options: &SessionOptions) -> Result<Self> {
        let log = match &options.log_file {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    tokio::fs::create_dir_all(dir).await?;
                }
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| Error::FileRead {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    })?;
                Some(file)
            }
            None => None,
        };

        let shared = Arc::new(Shared {
            buffer: Mutex::new(ConsoleBuffer::new(options.max_buffer_bytes)),
            notify: Notify::new(),
        });
        let reader_task = tokio::spawn(pump(transport.reader, shared.clone(), log));

        tracing::debug!("Console session opened");
        Ok(Self {
            shared,
            writer: Some(transport.writer),
            reader_task: Some(reader_task),
            consumed: Cursor::START,
            tail_bytes: options.tail_bytes,
            state: SessionState::Open,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Position just past the newest byte received so far
    pub fn cursor(&self) -> Cursor {
        self.shared.buffer().end()
    }

    /// Where a cursor-less wait would start searching
    pub fn consumed(&self) -> Cursor {
        self.consumed
    }

    /// Whether the guest side of the stream has hung up
    pub fn is_eof(&self) -> bool {
        self.shared.buffer().is_closed()
    }

    /// Last bytes of console output, for diagnostics
    pub fn tail(&self) -> String {
        self.shared.buffer().tail(self.tail_bytes)
    }

    /// Send raw bytes to the guest
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = match (&self.state, self.writer.as_mut()) {
            (SessionState::Open, Some(writer)) => writer,
            _ => return Err(Error::invalid_state("write to console", "console is closed")),
        };
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Wait for `pattern` in output not consumed by an earlier wait
    pub async fn wait_for_pattern(&mut self, pattern: &Pattern) -> Result<Match> {
        let from = self.consumed;
        self.wait_for_pattern_from(pattern, from).await
    }

    /// Wait for `pattern` in output received at or after `from`
    ///
    /// `Cursor::START` searches everything since the session opened that is
    /// still buffered.
    pub async fn wait_for_pattern_from(&mut self, pattern: &Pattern, from: Cursor) -> Result<Match> {
        self.wait_in(pattern, |buffer| Window {
            from,
            limit: buffer.end(),
        })
        .await
    }

    /// Core wait loop; `window` decides which bytes are eligible each pass
    pub(crate) async fn wait_in<F>(&mut self, pattern: &Pattern, mut window: F) -> Result<Match>
    where
        F: FnMut(&ConsoleBuffer) -> Window,
    {
        if self.state == SessionState::Closed {
            return Err(Error::invalid_state("wait for console output", "console is closed"));
        }

        let deadline = Instant::now() + pattern.timeout;
        let mut success = Scan::new(&pattern.text);
        let mut failure = pattern.failure.as_deref().map(Scan::new);
        tracing::debug!(pattern = %pattern.text, timeout_secs = pattern.timeout.as_secs(), "Waiting for console pattern");

        loop {
            // Register before looking so a wakeup between check and await is kept
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let buffer = self.shared.buffer();
                let win = window(&*buffer);
                let hit = success.step(&buffer, win);
                let bad = failure.as_mut().and_then(|scan| scan.step(&buffer, win));

                match (hit, bad) {
                    (Some(start), bad) if bad.map_or(true, |b| start < b) => {
                        let end = start.advance(pattern.text.len());
                        let text = buffer.line_around(start, end);
                        drop(buffer);
                        self.consumed = self.consumed.max(end);
                        tracing::debug!(pattern = %pattern.text, line = %text, "Console pattern matched");
                        return Ok(Match { text, start, end });
                    }
                    (_, Some(_)) => {
                        return Err(Error::ConsoleFailurePattern {
                            pattern: pattern.failure.clone().unwrap_or_default(),
                            tail: buffer.tail(self.tail_bytes),
                        });
                    }
                    _ => {}
                }

                if buffer.is_closed() {
                    return Err(Error::ConsoleClosed {
                        pattern: pattern.text.clone(),
                        tail: buffer.tail(self.tail_bytes),
                    });
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(Error::ConsoleTimeout {
                    pattern: pattern.text.clone(),
                    timeout: pattern.timeout,
                    tail: self.tail(),
                });
            }
        }
    }

    /// Stop reading and release the stream; safe to call more than once
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.state = SessionState::Closed;
        tracing::debug!("Console session closed");
    }
}

impl Drop for ConsoleSession {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Drain the stream into the buffer until EOF or a read error
async fn pump(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    shared: Arc<Shared>,
    mut log: Option<tokio::fs::File>,
) {
    let mut chunk = vec![0u8; 4096];
    let mut line = Vec::new();

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "Console read failed");
                break;
            }
        };
        let bytes = &chunk[..n];

        if let Some(file) = log.as_mut() {
            if let Err(e) = file.write_all(bytes).await {
                tracing::warn!(error = %e, "Console log write failed, disabling log");
                log = None;
            }
        }

        for &b in bytes {
            if b == b'\n' {
                emit_line(&line);
                line.clear();
            } else if b != b'\r' {
                line.push(b);
            }
        }

        shared.buffer().append(bytes);
        shared.notify.notify_waiters();
    }

    if !line.is_empty() {
        emit_line(&line);
    }
    if let Some(mut file) = log {
        let _ = file.flush().await;
    }
    shared.buffer().mark_closed();
    shared.notify.notify_waiters();
    tracing::debug!("Console stream reached end of file");
}

fn emit_line(line: &[u8]) {
    tracing::debug!(target: CONSOLE_TARGET, "{}", String::from_utf8_lossy(line));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, DuplexStream};

    /// A session plus the guest's end of the stream
    async fn session_pair() -> (ConsoleSession, DuplexStream) {
        let (ours, guest) = duplex(64 * 1024);
        let (reader, writer) = split(ours);
        let session = ConsoleSession::open(
            ConsoleTransport::new(reader, writer),
            &SessionOptions {
                max_buffer_bytes: 64 * 1024,
                tail_bytes: 256,
                log_file: None,
            },
        )
        .await
        .unwrap();
        (session, guest)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test]
    async fn test_match_returns_whole_line() {
        let (mut session, mut guest) = session_pair().await;
        guest
            .write_all(b"Linux version 4.5.0\r\nKernel command line: printk.time=0 console=ttyS0\r\n")
            .await
            .unwrap();

        let m = session
            .wait_for_pattern(&Pattern::new("console=ttyS0", secs(5)))
            .await
            .unwrap();
        assert_eq!(m.text, "Kernel command line: printk.time=0 console=ttyS0");
    }

    #[tokio::test]
    async fn test_output_before_wait_is_not_lost() {
        let (mut session, mut guest) = session_pair().await;
        guest.write_all(b"early banner\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(session
            .wait_for_pattern(&Pattern::new("early banner", secs(5)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_consumed_output_does_not_match_twice() {
        let (mut session, mut guest) = session_pair().await;
        guest.write_all(b"# \r\n").await.unwrap();

        let prompt = Pattern::new("# ", Duration::from_millis(200));
        session.wait_for_pattern(&prompt).await.unwrap();
        assert!(matches!(
            session.wait_for_pattern(&prompt).await,
            Err(Error::ConsoleTimeout { .. })
        ));

        // An explicit cursor still sees the whole history
        assert!(session
            .wait_for_pattern_from(&prompt, Cursor::START)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_timeout_is_bounded_and_session_stays_open() {
        let (mut session, mut guest) = session_pair().await;
        guest.write_all(b"still booting\r\n").await.unwrap();

        let started = std::time::Instant::now();
        let err = session
            .wait_for_pattern(&Pattern::new("login:", Duration::from_millis(300)))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(3));
        assert!(err.to_string().starts_with("Timed out after 300ms"));
        match err {
            Error::ConsoleTimeout { tail, .. } => assert!(tail.contains("still booting")),
            other => panic!("expected timeout, got {other}"),
        }

        // A timeout cancels only that wait
        assert_eq!(session.state(), SessionState::Open);
        guest.write_all(b"login: ").await.unwrap();
        assert!(session
            .wait_for_pattern(&Pattern::new("login:", secs(5)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_pattern_split_across_chunks() {
        let (mut session, mut guest) = session_pair().await;
        let writer = tokio::spawn(async move {
            for part in [&b"Boot suc"[..], b"cessful", b".\r\n"] {
                guest.write_all(part).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            guest
        });

        let m = session
            .wait_for_pattern(&Pattern::new("Boot successful", secs(5)))
            .await
            .unwrap();
        assert_eq!(m.text, "Boot successful.");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_literal_aborts_early() {
        let (mut session, mut guest) = session_pair().await;
        guest
            .write_all(b"Kernel panic - not syncing: VFS: Unable to mount root fs\r\n")
            .await
            .unwrap();

        let pattern = Pattern::new("Boot successful", secs(30)).with_failure("Kernel panic");
        let started = std::time::Instant::now();
        let err = session.wait_for_pattern(&pattern).await.unwrap_err();
        assert!(started.elapsed() < secs(5));
        assert!(matches!(err, Error::ConsoleFailurePattern { .. }));
    }

    #[tokio::test]
    async fn test_success_before_failure_wins() {
        let (mut session, mut guest) = session_pair().await;
        guest
            .write_all(b"Boot successful.\r\nKernel panic later\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let pattern = Pattern::new("Boot successful", secs(5)).with_failure("Kernel panic");
        assert!(session.wait_for_pattern(&pattern).await.is_ok());
    }

    #[tokio::test]
    async fn test_eof_fails_fast() {
        let (mut session, mut guest) = session_pair().await;
        guest.write_all(b"reboot: Restarting system\r\n").await.unwrap();
        drop(guest);

        let started = std::time::Instant::now();
        let err = session
            .wait_for_pattern(&Pattern::new("login:", secs(30)))
            .await
            .unwrap_err();
        assert!(started.elapsed() < secs(5));
        match err {
            Error::ConsoleClosed { tail, .. } => assert!(tail.contains("Restarting")),
            other => panic!("expected closed console, got {other}"),
        }
        assert!(session.is_eof());
    }

    #[tokio::test]
    async fn test_buffered_match_survives_eof() {
        let (mut session, mut guest) = session_pair().await;
        guest.write_all(b"reboot: Restarting system\r\n").await.unwrap();
        drop(guest);

        assert!(session
            .wait_for_pattern(&Pattern::new("Restarting", secs(5)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_write_reaches_guest_and_close_is_idempotent() {
        let (mut session, mut guest) = session_pair().await;
        session.write(b"uname -a\r").await.unwrap();

        let mut received = [0u8; 9];
        guest.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"uname -a\r");

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.write(b"x").await,
            Err(Error::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_raw_stream_is_logged_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("logs").join("boot.console.log");
        let (ours, mut guest) = duplex(1024);
        let (reader, writer) = split(ours);
        let mut session = ConsoleSession::open(
            ConsoleTransport::new(reader, writer),
            &SessionOptions {
                log_file: Some(log_file.clone()),
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap();

        guest.write_all(b"hello\r\n").await.unwrap();
        drop(guest);
        assert!(matches!(
            session.wait_for_pattern(&Pattern::new("never", secs(5))).await,
            Err(Error::ConsoleClosed { .. })
        ));
        // EOF is marked after the log is flushed
        assert_eq!(std::fs::read(&log_file).unwrap(), b"hello\r\n");
    }
}
