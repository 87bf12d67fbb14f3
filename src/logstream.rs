// Long-lived log follow sessions (journalctl, tail -F, docker logs)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::executor::streaming::{stop_pair, LineSink, OutputLine, StopHandle, StreamKind};
use crate::executor::Connection;
use crate::modules::shell_quote;
use crate::output::errors::PorterError;

/// Receives `(source, line)`; stderr lines carry a `:stderr` source suffix
pub type LogCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

static TAIL_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^==> (.+) <==$").unwrap());

/// Tunables shared by the follow constructors
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// History lines to print before following
    pub lines: usize,
    /// How long `stop` waits after SIGINT before closing the session
    pub grace: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            lines: 50,
            grace: Duration::from_secs(2),
        }
    }
}

/// A running follow session. Ends once: by `stop`, by the remote command
/// exiting, or by a transport error.
pub struct LogStream {
    source: String,
    stop: StopHandle,
    stopping: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
    error: Arc<Mutex<Option<PorterError>>>,
}

impl LogStream {
    /// Start `cmd` on the connection and feed its lines to `callback`
    pub fn start(
        conn: Arc<dyn Connection>,
        source: impl Into<String>,
        cmd: impl Into<String>,
        callback: LogCallback,
        opts: &StreamOptions,
    ) -> LogStream {
        Self::start_with_sink(conn, source.into(), cmd.into(), opts, move |src: String| -> LineSink {
            let callback = callback.clone();
            Arc::new(move |line: OutputLine| match line.kind {
                StreamKind::Stdout => callback(&src, &line.text),
                StreamKind::Stderr => callback(&format!("{}:stderr", src), &line.text),
                StreamKind::Exit => {}
            })
        })
    }

    fn start_with_sink<F>(
        conn: Arc<dyn Connection>,
        source: String,
        cmd: String,
        opts: &StreamOptions,
        make_sink: F,
    ) -> LogStream
    where
        F: FnOnce(String) -> LineSink,
    {
        let (stop, token) = stop_pair(opts.grace);
        let (done_tx, done) = watch::channel(false);
        let error = Arc::new(Mutex::new(None));
        let stopping = Arc::new(AtomicBool::new(false));
        let sink = make_sink(source.clone());

        info!(host = %conn.host_name(), source = %source, "log stream started");

        let task_error = error.clone();
        let task_stopping = stopping.clone();
        let task_source = source.clone();
        tokio::spawn(async move {
            let result = conn.exec_streaming(&cmd, sink, Some(token)).await;
            let outcome = match result {
                Ok(0) => None,
                // Exit status after an interrupt is expected noise
                Ok(_) if task_stopping.load(Ordering::SeqCst) => None,
                Ok(code) => Some(PorterError::RemoteNonZero {
                    host: conn.host_name().to_string(),
                    command: cmd.clone(),
                    exit_code: code,
                    output: String::new(),
                }),
                Err(e) => Some(e),
            };
            *task_error.lock() = outcome;
            debug!(source = %task_source, "log stream finished");
            let _ = done_tx.send(true);
        });

        LogStream {
            source,
            stop,
            stopping,
            done,
            error,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Interrupt the remote command and return once output has drained.
    /// No-op after the stream has ended.
    pub async fn stop(&self) {
        if self.is_done() {
            return;
        }
        self.stopping.store(true, Ordering::SeqCst);
        self.stop.stop();
        self.done().await;
    }

    /// Wait for the stream to end by itself (or via another task's `stop`)
    pub async fn wait(&self) -> Result<(), PorterError> {
        self.done().await;
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolves once the stream has ended and all lines were delivered
    pub async fn done(&self) {
        let mut rx = self.done.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Terminal error, if the stream ended badly
    pub fn err(&self) -> Option<PorterError> {
        self.error.lock().clone()
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        // An abandoned stream still interrupts its remote command
        if !self.is_done() {
            self.stopping.store(true, Ordering::SeqCst);
            self.stop.stop();
        }
    }
}

/// `journalctl -f` for a systemd unit
pub fn journal_follow(
    conn: Arc<dyn Connection>,
    unit: &str,
    callback: LogCallback,
    opts: &StreamOptions,
) -> LogStream {
    let cmd = format!(
        "journalctl -f -n {} -u {} --no-pager -o short-iso",
        opts.lines,
        shell_quote(unit)
    );
    LogStream::start(conn, unit, cmd, callback, opts)
}

/// `tail -F` on one file
pub fn tail_follow(
    conn: Arc<dyn Connection>,
    path: &str,
    callback: LogCallback,
    opts: &StreamOptions,
) -> LogStream {
    let cmd = format!("tail -n {} -F {}", opts.lines, shell_quote(path));
    LogStream::start(conn, path, cmd, callback, opts)
}

/// `tail -F` on one file the login user cannot read
pub fn tail_follow_with_sudo(
    conn: Arc<dyn Connection>,
    path: &str,
    callback: LogCallback,
    opts: &StreamOptions,
) -> LogStream {
    let cmd = format!("sudo -n tail -n {} -F {}", opts.lines, shell_quote(path));
    LogStream::start(conn, path, cmd, callback, opts)
}

/// `tail -F` on several files; each line is tagged with the file it came
/// from, tracked through tail's `==> path <==` headers.
pub fn tail_follow_multiple(
    conn: Arc<dyn Connection>,
    paths: &[String],
    callback: LogCallback,
    opts: &StreamOptions,
) -> LogStream {
    let quoted: Vec<String> = paths.iter().map(|p| shell_quote(p)).collect();
    let cmd = format!("tail -n {} -F {}", opts.lines, quoted.join(" "));
    let first = paths.first().cloned().unwrap_or_default();

    LogStream::start_with_sink(conn, paths.join(","), cmd, opts, move |_: String| -> LineSink {
        let current = Mutex::new(first);
        Arc::new(move |line: OutputLine| {
            if line.kind == StreamKind::Exit {
                return;
            }
            if line.kind == StreamKind::Stdout {
                if let Some(caps) = TAIL_HEADER.captures(&line.text) {
                    *current.lock() = caps[1].to_string();
                    return;
                }
                if line.text.is_empty() {
                    // tail separates file sections with a blank line
                    return;
                }
            }
            let source = current.lock().clone();
            match line.kind {
                StreamKind::Stderr => callback(&format!("{}:stderr", source), &line.text),
                _ => callback(&source, &line.text),
            }
        })
    })
}

/// `docker logs -f` for a container
pub fn docker_logs(
    conn: Arc<dyn Connection>,
    container: &str,
    callback: LogCallback,
    opts: &StreamOptions,
) -> LogStream {
    let cmd = format!(
        "docker logs -f --tail {} {}",
        opts.lines,
        shell_quote(container)
    );
    LogStream::start(conn, container, cmd, callback, opts)
}

/// `docker compose logs -f` for a project, optionally one service
pub fn docker_compose_logs(
    conn: Arc<dyn Connection>,
    project_dir: &str,
    service: Option<&str>,
    callback: LogCallback,
    opts: &StreamOptions,
) -> LogStream {
    let mut cmd = format!(
        "cd {} && docker compose logs -f --no-color --tail {}",
        shell_quote(project_dir),
        opts.lines
    );
    if let Some(service) = service {
        cmd.push(' ');
        cmd.push_str(&shell_quote(service));
    }
    LogStream::start(conn, service.unwrap_or(project_dir), cmd, callback, opts)
}

/// Any follow-style command under a caller-chosen source tag
pub fn custom_log_stream(
    conn: Arc<dyn Connection>,
    source: &str,
    cmd: &str,
    callback: LogCallback,
    opts: &StreamOptions,
) -> LogStream {
    LogStream::start(conn, source, cmd, callback, opts)
}

/// Several streams sharing one callback
pub struct LogMultiplexer {
    callback: LogCallback,
    streams: Vec<LogStream>,
}

impl LogMultiplexer {
    pub fn new(callback: LogCallback) -> Self {
        LogMultiplexer {
            callback,
            streams: Vec::new(),
        }
    }

    /// The shared callback, for handing to stream constructors
    pub fn callback(&self) -> LogCallback {
        self.callback.clone()
    }

    pub fn add(&mut self, stream: LogStream) {
        self.streams.push(stream);
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub async fn stop_all(&self) {
        join_all(self.streams.iter().map(|s| s.stop())).await;
    }

    /// Wait for every stream; returns the errors of those that ended badly
    pub async fn wait_all(&self) -> Vec<(String, PorterError)> {
        let results = join_all(self.streams.iter().map(|s| s.wait())).await;
        self.streams
            .iter()
            .zip(results)
            .filter_map(|(s, r)| r.err().map(|e| (s.source().to_string(), e)))
            .collect()
    }
}
