// Local command execution without SSH

use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use super::streaming::{LineSink, LineSplitter, OutputLine, StopToken};
use super::{CommandResult, Connection};
use crate::output::errors::PorterError;

/// Local connection for executing commands on localhost
pub struct LocalConnection {
    host_name: String,
}

impl LocalConnection {
    /// Create a new local connection
    pub fn new(host_name: impl Into<String>) -> Self {
        LocalConnection {
            host_name: host_name.into(),
        }
    }

    /// Check if a host should use local connection
    pub fn should_use_local(host_name: &str) -> bool {
        host_name == "localhost" || host_name == "127.0.0.1" || host_name == "::1"
    }

    fn spawn_error(e: std::io::Error) -> PorterError {
        PorterError::Io {
            message: format!("Failed to spawn local command: {}", e),
            path: None,
        }
    }
}

/// Read lines from one pipe into the sink until EOF. Bytes are decoded
/// lossily so a stray non-UTF-8 byte never ends the stream early.
fn pump<R>(mut reader: R, sink: LineSink, stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let emit = |text: String| {
            if stderr {
                sink(OutputLine::stderr(text));
            } else {
                sink(OutputLine::stdout(text));
            }
        };

        let mut splitter = LineSplitter::new();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => splitter.push(&buf[..n]).into_iter().for_each(&emit),
                Err(e) => {
                    debug!("local pipe read failed: {}", e);
                    break;
                }
            }
        }
        if let Some(rest) = splitter.finish() {
            emit(rest);
        }
    })
}

/// Signal the child's whole process group
async fn signal_group(child: &Child, signal: &str) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .arg(format!("-{}", signal))
            .arg("--")
            .arg(format!("-{}", pid))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
}

async fn wait_interruptible(
    child: &mut Child,
    mut stop: StopToken,
) -> std::io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        _ = stop.stopped() => {
            debug!("interrupting local process group");
            signal_group(child, "INT").await;
            match tokio::time::timeout(stop.grace(), child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    signal_group(child, "KILL").await;
                    child.wait().await
                }
            }
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, PorterError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .await
            .map_err(Self::spawn_error)?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(CommandResult {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn exec_streaming(
        &self,
        cmd: &str,
        sink: LineSink,
        stop: Option<StopToken>,
    ) -> Result<i32, PorterError> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so a stop reaches grandchildren holding the pipes
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(Self::spawn_error)?;

        let stdout = child.stdout.take().ok_or_else(|| PorterError::Io {
            message: "Failed to capture stdout".to_string(),
            path: None,
        })?;
        let stderr = child.stderr.take().ok_or_else(|| PorterError::Io {
            message: "Failed to capture stderr".to_string(),
            path: None,
        })?;

        let stdout_task = pump(stdout, sink.clone(), false);
        let stderr_task = pump(stderr, sink, true);

        let status = match stop {
            Some(stop) => wait_interruptible(&mut child, stop).await,
            None => child.wait().await,
        }
        .map_err(|e| PorterError::Io {
            message: format!("Failed to wait for command: {}", e),
            path: None,
        })?;

        // Both readers drain before the command counts as finished
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        Ok(status.code().unwrap_or(-1))
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), PorterError> {
        tokio::fs::copy(local, remote)
            .await
            .map(|_| ())
            .map_err(|e| PorterError::Io {
                message: format!("Failed to copy {} to {}: {}", local.display(), remote, e),
                path: Some(local.to_path_buf()),
            })
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), PorterError> {
        tokio::fs::copy(remote, local)
            .await
            .map(|_| ())
            .map_err(|e| PorterError::Io {
                message: format!("Failed to copy {} to {}: {}", remote, local.display(), e),
                path: Some(local.to_path_buf()),
            })
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), PorterError> {
        tokio::fs::write(path, content)
            .await
            .map_err(|e| PorterError::Io {
                message: format!("Failed to write file: {}", e),
                path: Some(std::path::PathBuf::from(path)),
            })
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }

    fn is_local(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::streaming::stop_pair;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_local_exec() {
        let conn = LocalConnection::new("localhost");
        let result = conn.exec("echo 'hello world'").await.unwrap();

        assert!(result.success());
        assert!(result.stdout.contains("hello world"));
    }

    #[tokio::test]
    async fn test_local_exec_failure() {
        let conn = LocalConnection::new("localhost");
        let result = conn.exec("exit 1").await.unwrap();

        assert!(!result.success());
        assert_eq!(result.exit_code, 1);
    }

    #[test]
    fn test_should_use_local() {
        assert!(LocalConnection::should_use_local("localhost"));
        assert!(LocalConnection::should_use_local("127.0.0.1"));
        assert!(LocalConnection::should_use_local("::1"));
        assert!(!LocalConnection::should_use_local("example.com"));
    }

    #[tokio::test]
    async fn test_file_operations() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnection::new("localhost");
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");

        conn.write_file(src.to_str().unwrap(), b"test content")
            .await
            .unwrap();
        conn.upload(&src, dst.to_str().unwrap()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "test content");
    }

    fn collecting_sink() -> (LineSink, Arc<Mutex<Vec<OutputLine>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink: LineSink = {
            let lines = lines.clone();
            Arc::new(move |line| lines.lock().push(line))
        };
        (sink, lines)
    }

    #[tokio::test]
    async fn test_streaming_survives_invalid_utf8() {
        let conn = LocalConnection::new("localhost");
        let (sink, lines) = collecting_sink();

        let code = conn
            .exec_streaming("printf 'before\\n\\377bad\\nafter\\n'", sink, None)
            .await
            .unwrap();

        assert_eq!(code, 0);
        let texts: Vec<String> = lines.lock().iter().map(|l| l.text.clone()).collect();
        assert_eq!(texts, vec!["before", "\u{FFFD}bad", "after"]);
    }

    #[tokio::test]
    async fn test_streaming_keeps_output_after_bad_byte() {
        let conn = LocalConnection::new("localhost");
        let (sink, lines) = collecting_sink();

        conn.exec_streaming("printf '\\377\\n'; seq 1 20000; printf 'tail'", sink, None)
            .await
            .unwrap();

        let lines = lines.lock();
        assert_eq!(lines.len(), 20002);
        assert_eq!(lines[20000].text, "20000");
        assert_eq!(lines[20001].text, "tail");
    }

    #[tokio::test]
    async fn test_streaming_stop_interrupts_long_command() {
        let conn = LocalConnection::new("localhost");
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink: LineSink = {
            let lines = lines.clone();
            Arc::new(move |line| lines.lock().push(line))
        };
        let (handle, token) = stop_pair(Duration::from_millis(500));

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.stop();
        });

        let started = std::time::Instant::now();
        conn.exec_streaming(
            "while true; do echo tick; sleep 0.05; done",
            sink,
            Some(token),
        )
        .await
        .unwrap();
        stopper.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(lines.lock().iter().any(|l| l.text == "tick"));
    }
}
