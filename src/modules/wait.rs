// Wait actions - poll the target until a port, URL or path is ready

use tokio::time::Instant;

use super::{require, shell_quote, ActionContext, ActionOutput};
use crate::output::errors::PorterError;

/// Re-run `probe` until it exits zero or the task's timeout runs out
async fn poll_until(
    ctx: &ActionContext<'_>,
    operation: String,
    probe: String,
) -> Result<ActionOutput, PorterError> {
    let timeout = ctx
        .task
        .timeout
        .filter(|t| !t.is_zero())
        .unwrap_or(ctx.wait_timeout);
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        if ctx.conn.exec(&probe).await?.success() {
            return Ok(ActionOutput::message(format!(
                "{} ready after {:.1}s",
                operation,
                started.elapsed().as_secs_f64()
            )));
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PorterError::Timeout {
                operation,
                duration_secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(ctx.poll_interval.min(deadline - now)).await;
    }
}

pub(super) async fn port(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let host = if ctx.task.src.trim().is_empty() {
        "127.0.0.1"
    } else {
        ctx.task.src.trim()
    };
    let port: u16 = require(ctx.task, &ctx.task.body, "port")?
        .trim()
        .parse()
        .map_err(|_| PorterError::action("wait-port", format!("invalid port '{}'", ctx.task.body)))?;

    let probe = format!(
        "timeout 2 bash -c {} 2>/dev/null || nc -z -w 2 {} {} 2>/dev/null",
        shell_quote(&format!("</dev/tcp/{}/{}", host, port)),
        shell_quote(host),
        port
    );
    poll_until(ctx, format!("wait-port {}:{}", host, port), probe).await
}

pub(super) async fn http(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let url = require(ctx.task, &ctx.task.body, "url")?;
    let quoted = shell_quote(url);
    let probe = format!(
        "curl -fsS -o /dev/null --max-time 5 {url} 2>/dev/null || wget -q -O /dev/null -T 5 {url} 2>/dev/null",
        url = quoted
    );
    poll_until(ctx, format!("wait-http {}", url), probe).await
}

pub(super) async fn file(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let path = require(ctx.task, &ctx.task.dest, "path")?;
    let probe = format!("test -e {}", shell_quote(path));
    poll_until(ctx, format!("wait-file {}", path), probe).await
}

#[cfg(test)]
mod tests {
    use crate::executor::LocalConnection;
    use crate::modules::{dispatch, ActionContext};
    use crate::output::errors::PorterError;
    use crate::task::{wait_file, wait_port};
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_file_present() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let conn = LocalConnection::new("localhost");
        let task = wait_file(file.path().to_str().unwrap()).build();

        let out = dispatch(&ActionContext::new(&conn, &task)).await.unwrap();
        assert!(out.output.contains("ready"));
    }

    #[tokio::test]
    async fn test_wait_file_times_out() {
        let conn = LocalConnection::new("localhost");
        let task = wait_file("/nonexistent/porter-wait-target")
            .timeout(Duration::from_millis(150))
            .build();
        let ctx = ActionContext::new(&conn, &task)
            .with_wait(Duration::from_secs(30), Duration::from_millis(20));

        let err = dispatch(&ctx).await.unwrap_err();
        assert!(matches!(err, PorterError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_file_appears_while_polling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready.flag");
        let conn = LocalConnection::new("localhost");
        let task = wait_file(path.to_str().unwrap())
            .timeout(Duration::from_secs(5))
            .build();
        let ctx = ActionContext::new(&conn, &task)
            .with_wait(Duration::from_secs(5), Duration::from_millis(25));

        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                std::fs::write(path, "").unwrap();
            })
        };

        dispatch(&ctx).await.unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_port_rejects_bad_port() {
        let conn = LocalConnection::new("localhost");
        let mut task = wait_port("127.0.0.1", 80).build();
        task.body = "http".to_string();

        let err = dispatch(&ActionContext::new(&conn, &task))
            .await
            .unwrap_err();
        assert!(matches!(err, PorterError::Action { .. }));
    }
}
