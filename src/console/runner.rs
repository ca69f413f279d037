//! Run a console command and wait for its effect
//!
//! Serial consoles echo input back, so a naive wait for `MARKER` after
//! typing `echo MARKER` would match the echo. The runner remembers where
//! output stood when the command was sent, skips the first line after
//! that point which carries the command text, and only matches past it.

use std::time::Duration;

use super::buffer::{find_bytes, ConsoleBuffer, Cursor};
use super::session::{ConsoleSession, Match, Pattern, Window};
use crate::common::config::Config;
use crate::common::Result;

/// Issues command lines on a console session
pub struct CommandRunner<'s> {
    session: &'s mut ConsoleSession,
    terminator: String,
}

impl<'s> CommandRunner<'s> {
    pub fn new(session: &'s mut ConsoleSession, terminator: impl Into<String>) -> Self {
        Self {
            session,
            terminator: terminator.into(),
        }
    }

    pub fn from_config(session: &'s mut ConsoleSession, config: &Config) -> Self {
        Self::new(session, config.console.line_terminator.clone())
    }

    /// Send a command line without waiting; returns where output stood
    pub async fn exec(&mut self, command: &str) -> Result<Cursor> {
        let issued = self.session.cursor();
        let mut line = Vec::with_capacity(command.len() + self.terminator.len());
        line.extend_from_slice(command.as_bytes());
        line.extend_from_slice(self.terminator.as_bytes());
        self.session.write(&line).await?;
        tracing::debug!(command, cursor = %issued, "Sent console command");
        Ok(issued)
    }

    /// Send a command line and wait for `pattern` in the output it caused
    pub async fn exec_and_wait(&mut self, command: &str, pattern: &Pattern) -> Result<Match> {
        let issued = self.exec(command).await?;
        let mut echo = EchoSkip::new(command, issued);
        self.session
            .wait_in(pattern, |buffer| echo.window(buffer))
            .await
    }

    /// Like [`exec_and_wait`](Self::exec_and_wait), failing early on `failure`
    pub async fn exec_and_wait_with_failure(
        &mut self,
        command: &str,
        success: &str,
        failure: &str,
        timeout: Duration,
    ) -> Result<Match> {
        let pattern = Pattern::new(success, timeout).with_failure(failure);
        self.exec_and_wait(command, &pattern).await
    }
}

/// Decides which bytes after a command was issued may satisfy a wait
struct EchoSkip<'c> {
    command: &'c [u8],
    issued: Cursor,
    /// Start of the first line after the echo, once the echo was seen
    after_echo: Option<Cursor>,
}

impl<'c> EchoSkip<'c> {
    fn new(command: &'c str, issued: Cursor) -> Self {
        Self {
            command: command.as_bytes(),
            issued,
            after_echo: None,
        }
    }

    fn window(&mut self, buffer: &ConsoleBuffer) -> Window {
        if let Some(from) = self.after_echo {
            return Window {
                from,
                limit: buffer.end(),
            };
        }

        let mut line_start = self.issued;
        while let Some((content_end, next)) = buffer.next_line(line_start) {
            if find_bytes(buffer.slice(line_start, content_end), self.command).is_some() {
                tracing::trace!(cursor = %next, "Skipped command echo");
                self.after_echo = Some(next);
                return Window {
                    from: next,
                    limit: buffer.end(),
                };
            }
            line_start = next;
        }

        // An unfinished line that may still turn into the echo is held back
        let partial = buffer.slice(line_start.max(buffer.start()), buffer.end());
        let partial = trim_cr(partial);
        let maybe_echo = could_become_echo(partial, self.command);
        Window {
            from: self.issued,
            limit: if maybe_echo { line_start } else { buffer.end() },
        }
    }
}

/// True while `partial` contains the command or ends in a prefix of it
///
/// The echo line may start with a prompt, so every suffix is a candidate.
fn could_become_echo(partial: &[u8], command: &[u8]) -> bool {
    if partial.is_empty() || command.is_empty() {
        return false;
    }
    find_bytes(partial, command).is_some()
        || (0..partial.len()).any(|i| command.starts_with(&partial[i..]))
}

fn trim_cr(mut bytes: &[u8]) -> &[u8] {
    while let [b'\r', rest @ ..] = bytes {
        bytes = rest;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use crate::console::session::{ConsoleTransport, SessionOptions};
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

    async fn session_pair() -> (ConsoleSession, DuplexStream) {
        let (ours, guest) = duplex(64 * 1024);
        let (reader, writer) = split(ours);
        let session = ConsoleSession::open(
            ConsoleTransport::new(reader, writer),
            &SessionOptions::default(),
        )
        .await
        .unwrap();
        (session, guest)
    }

    /// A guest that echoes each command and answers after a delay
    fn spawn_guest(guest: DuplexStream, echo: bool, reply: Option<&'static str>) {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(guest);
            let mut lines = BufReader::new(read).split(b'\r');
            while let Ok(Some(line)) = lines.next_segment().await {
                if echo {
                    write.write_all(b"# ").await.unwrap();
                    write.write_all(&line).await.unwrap();
                    write.write_all(b"\r\n").await.unwrap();
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                if let Some(reply) = reply {
                    write.write_all(reply.as_bytes()).await.unwrap();
                }
            }
        });
    }

    #[tokio::test]
    async fn test_echo_does_not_satisfy_wait() {
        let (mut session, guest) = session_pair().await;
        spawn_guest(guest, true, Some("MARKER\r\n# "));

        let mut runner = CommandRunner::new(&mut session, "\r");
        let m = runner
            .exec_and_wait("echo MARKER", &Pattern::new("MARKER", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(m.text, "MARKER");
    }

    #[tokio::test]
    async fn test_echo_alone_times_out() {
        let (mut session, guest) = session_pair().await;
        spawn_guest(guest, true, None);

        let mut runner = CommandRunner::new(&mut session, "\r");
        let err = runner
            .exec_and_wait(
                "echo MARKER",
                &Pattern::new("MARKER", Duration::from_millis(400)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConsoleTimeout { .. }));
    }

    #[tokio::test]
    async fn test_guest_without_echo() {
        let (mut session, guest) = session_pair().await;
        spawn_guest(guest, false, Some("processor\t\t: 0\r\nBogoMIPS\t\t: 326.86\r\n"));

        let mut runner = CommandRunner::new(&mut session, "\r");
        let m = runner
            .exec_and_wait(
                "cat /proc/cpuinfo",
                &Pattern::new("BogoMIPS", Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert!(m.text.contains("326.86"));
    }

    #[test]
    fn test_partial_echo_is_held_back() {
        let mut echo = EchoSkip::new("echo MARKER", Cursor::START);
        let mut buffer = ConsoleBuffer::new(1024);

        // Could still become the echo line, so nothing is eligible yet
        buffer.append(b"echo MAR");
        assert_eq!(echo.window(&buffer).limit, Cursor::START);

        buffer.append(b"KER\r\nMARK");
        let window = echo.window(&buffer);
        assert_eq!(window.from.offset(), 13);
        assert_eq!(window.limit, buffer.end());
    }

    #[test]
    fn test_prompted_partial_echo_is_held_back() {
        let mut echo = EchoSkip::new("ip addr add 10.0.2.15 dev eth0", Cursor::START);
        let mut buffer = ConsoleBuffer::new(1024);

        buffer.append(b"# ip addr");
        assert_eq!(echo.window(&buffer).limit, Cursor::START);

        buffer.append(b" add 10.0.2.15 dev eth0\r\n# ");
        let window = echo.window(&buffer);
        assert_eq!(window.from.offset(), 34);
        assert_eq!(window.limit, buffer.end());
    }

    #[test]
    fn test_could_become_echo() {
        assert!(could_become_echo(b"# ip a", b"ip addr"));
        assert!(could_become_echo(b"# ip addr show", b"ip addr"));
        assert!(could_become_echo(b"i", b"ip addr"));
        assert!(!could_become_echo(b"# ", b"ip addr"));
        assert!(!could_become_echo(b"MARKER", b"echo MARKER"));
        assert!(!could_become_echo(b"", b"ip addr"));
    }

    #[tokio::test]
    async fn test_echo_split_across_reads() {
        let (mut session, guest) = session_pair().await;
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(guest);
            let mut lines = BufReader::new(read).split(b'\r');
            if let Ok(Some(_)) = lines.next_segment().await {
                for chunk in ["# ip addr", " add 10.0.2.15 dev eth0\r\n", "# "] {
                    write.write_all(chunk.as_bytes()).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
            // Keep the console open until the test finishes
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut runner = CommandRunner::new(&mut session, "\r");
        let m = runner
            .exec_and_wait(
                "ip addr add 10.0.2.15 dev eth0",
                &Pattern::new("#", Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(m.start.offset(), 34);
    }

    #[test]
    fn test_unrelated_partial_line_is_eligible() {
        let mut echo = EchoSkip::new("echo MARKER", Cursor::START);
        let mut buffer = ConsoleBuffer::new(1024);
        buffer.append(b"MARKER");
        let window = echo.window(&buffer);
        assert_eq!(window.from, Cursor::START);
        assert_eq!(window.limit, buffer.end());
    }

    #[tokio::test]
    async fn test_output_before_command_is_ignored() {
        let (mut session, mut guest) = session_pair().await;
        guest.write_all(b"MARKER from an earlier command\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut runner = CommandRunner::new(&mut session, "\r");
        let err = runner
            .exec_and_wait("true", &Pattern::new("MARKER", Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConsoleTimeout { .. }));
    }

    #[tokio::test]
    async fn test_terminator_is_appended() {
        let (mut session, guest) = session_pair().await;
        let mut runner = CommandRunner::new(&mut session, "\r\n");
        runner.exec("uname -a").await.unwrap();

        let mut guest = guest;
        let mut received = [0u8; 10];
        guest.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"uname -a\r\n");
    }
}
