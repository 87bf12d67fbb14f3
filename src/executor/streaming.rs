// Line-oriented streaming of remote command output

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use super::Connection;
use crate::output::errors::PorterError;

/// Which stream a line came from. `Exit` carries the exit code as text and
/// is delivered once, after both streams have drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    Exit,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
            StreamKind::Exit => "exit",
        }
    }
}

/// One line of output, without its trailing newline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    #[serde(rename = "type")]
    pub kind: StreamKind,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        OutputLine {
            kind: StreamKind::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        OutputLine {
            kind: StreamKind::Stderr,
            text: text.into(),
        }
    }
}

/// Receiver for streamed lines. Called from reader workers; must not block.
pub type LineSink = Arc<dyn Fn(OutputLine) + Send + Sync>;

/// Create a connected stop handle/token pair
pub fn stop_pair(grace: Duration) -> (StopHandle, StopToken) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopToken { rx, grace })
}

/// Requests that a streaming command wind down
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observed by connections while a command streams. On stop, the remote
/// process gets SIGINT, then `grace` to exit before the session is closed.
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
    grace: Duration,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Resolves once stop has been requested. Never resolves if the handle
    /// is dropped without stopping.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Splits a byte stream into lines; the unterminated tail is kept until
/// more bytes arrive or [`LineSplitter::finish`] is called.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        LineSplitter::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Result of a streamed command
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    /// Both streams in arrival order, newline-joined
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl StreamOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Default)]
struct Captured {
    combined: Vec<String>,
    stdout: Vec<String>,
    stderr: Vec<String>,
}

/// Run one command, delivering every line to `callback` as it arrives.
///
/// A non-zero exit is reported through `exit_code`, not as an error; only
/// transport failures are errors. The callback sees a final `Exit` line
/// before this returns.
pub async fn run_streaming(
    conn: &dyn Connection,
    cmd: &str,
    callback: Option<LineSink>,
) -> Result<StreamOutcome, PorterError> {
    run_streaming_until(conn, cmd, callback, None).await
}

/// [`run_streaming`] that also winds the command down when `stop` fires
pub async fn run_streaming_until(
    conn: &dyn Connection,
    cmd: &str,
    callback: Option<LineSink>,
    stop: Option<StopToken>,
) -> Result<StreamOutcome, PorterError> {
    let captured = Arc::new(Mutex::new(Captured::default()));

    let sink: LineSink = {
        let captured = captured.clone();
        let callback = callback.clone();
        Arc::new(move |line: OutputLine| {
            {
                let mut buf = captured.lock();
                match line.kind {
                    StreamKind::Stdout => buf.stdout.push(line.text.clone()),
                    StreamKind::Stderr => buf.stderr.push(line.text.clone()),
                    StreamKind::Exit => return,
                }
                buf.combined.push(line.text.clone());
            }
            if let Some(ref cb) = callback {
                cb(line);
            }
        })
    };

    let exit_code = conn.exec_streaming(cmd, sink, stop).await?;

    if let Some(cb) = callback {
        cb(OutputLine {
            kind: StreamKind::Exit,
            text: exit_code.to_string(),
        });
    }

    let buf = std::mem::take(&mut *captured.lock());
    Ok(StreamOutcome {
        output: buf.combined.join("\n"),
        stdout: buf.stdout.join("\n"),
        stderr: buf.stderr.join("\n"),
        exit_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalConnection;

    #[test]
    fn test_line_splitter() {
        let mut splitter = LineSplitter::new();

        assert!(splitter.push(b"hel").is_empty());
        assert_eq!(splitter.push(b"lo\r\nwor"), vec!["hello"]);
        assert_eq!(splitter.push(b"ld\n\n"), vec!["world", ""]);
        assert_eq!(splitter.push(b"tail"), Vec::<String>::new());
        assert_eq!(splitter.finish(), Some("tail".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[tokio::test]
    async fn test_stop_token_resolves() {
        let (handle, mut token) = stop_pair(Duration::from_millis(5));
        assert!(!token.is_stopped());

        handle.stop();
        token.stopped().await;
        assert!(token.is_stopped());
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_stdout_lines_match_captured_stdout() {
        let conn = LocalConnection::new("localhost");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: LineSink = {
            let seen = seen.clone();
            Arc::new(move |line| seen.lock().push(line))
        };

        let outcome = run_streaming(
            &conn,
            "printf 'one\\ntwo\\n'; printf 'warn\\n' 1>&2; printf three",
            Some(sink),
        )
        .await
        .unwrap();

        let seen = seen.lock();
        let stdout: Vec<&str> = seen
            .iter()
            .filter(|l| l.kind == StreamKind::Stdout)
            .map(|l| l.text.as_str())
            .collect();

        assert_eq!(stdout.join("\n"), outcome.stdout);
        assert_eq!(outcome.stdout, "one\ntwo\nthree");
        assert_eq!(outcome.stderr, "warn");
        assert_eq!(seen.last().unwrap().kind, StreamKind::Exit);
        assert_eq!(seen.last().unwrap().text, "0");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let conn = LocalConnection::new("localhost");
        let outcome = run_streaming(&conn, "echo bye; exit 3", None).await.unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.success());
        assert_eq!(outcome.output, "bye");
    }
}
