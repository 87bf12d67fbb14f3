// Command actions - run and capture shell commands

use super::{require, ActionContext, ActionOutput};
use crate::output::errors::PorterError;

/// Marker of the trailer line carrying a wrapped command's exit status
pub const EXIT_CODE_PREFIX: &str = "EXIT_CODE:";

/// Run and Capture both stream; the executor stores the combined output
/// when the task registers a variable.
pub(super) async fn execute(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let cmd = require(ctx.task, &ctx.task.body, "command")?;
    ctx.stream(cmd).await
}

/// Make the remote print `EXIT_CODE:<n>` as its last line, so the status
/// survives transports that only hand back text.
pub fn wrap_with_exit_code(cmd: &str) -> String {
    format!("{}\necho \"{}$?\"", cmd, EXIT_CODE_PREFIX)
}

/// Strip the exit-code trailer. Returns the remaining output and the code,
/// or the untouched output and `None` when no trailer is present.
pub fn split_exit_code(output: &str) -> (String, Option<i32>) {
    let trimmed = output.trim_end_matches(|c: char| c == '\n' || c == '\r');
    let (body, last) = match trimmed.rfind('\n') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };

    match last
        .trim()
        .strip_prefix(EXIT_CODE_PREFIX)
        .and_then(|code| code.trim().parse::<i32>().ok())
    {
        Some(code) => (body.trim_end_matches('\r').to_string(), Some(code)),
        None => (output.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::streaming::OutputLine;
    use crate::executor::{LineSink, LocalConnection};
    use crate::modules::dispatch;
    use crate::task::{capture, run};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_split_exit_code() {
        assert_eq!(
            split_exit_code("hello\nworld\nEXIT_CODE:0\n"),
            ("hello\nworld".to_string(), Some(0))
        );
        assert_eq!(split_exit_code("EXIT_CODE:127"), (String::new(), Some(127)));
        assert_eq!(
            split_exit_code("no trailer here\n"),
            ("no trailer here\n".to_string(), None)
        );
        assert_eq!(
            split_exit_code("x\nEXIT_CODE:abc"),
            ("x\nEXIT_CODE:abc".to_string(), None)
        );
    }

    #[tokio::test]
    async fn test_wrapped_command_reports_exit_code() {
        let conn = LocalConnection::new("localhost");
        let result = crate::executor::Connection::exec(
            &conn,
            &wrap_with_exit_code("echo building; false"),
        )
        .await
        .unwrap();

        let (output, code) = split_exit_code(&result.stdout);
        assert_eq!(output, "building");
        assert_eq!(code, Some(1));
    }

    #[tokio::test]
    async fn test_run_streams_lines() {
        let conn = LocalConnection::new("localhost");
        let task = run("echo one; echo two").build();
        let lines = Arc::new(Mutex::new(Vec::<OutputLine>::new()));
        let sink: LineSink = {
            let lines = lines.clone();
            Arc::new(move |l| lines.lock().push(l))
        };

        let ctx = ActionContext::new(&conn, &task).with_sink(Some(sink));
        let out = dispatch(&ctx).await.unwrap();

        assert_eq!(out.stdout, "one\ntwo");
        let texts: Vec<String> = lines.lock().iter().map(|l| l.text.clone()).collect();
        assert_eq!(texts, vec!["one", "two", "0"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_output() {
        let conn = LocalConnection::new("localhost");
        let task = capture("echo nope; exit 4").build();

        let err = dispatch(&ActionContext::new(&conn, &task))
            .await
            .unwrap_err();
        match err {
            PorterError::RemoteNonZero {
                exit_code, output, ..
            } => {
                assert_eq!(exit_code, 4);
                assert_eq!(output, "nope");
            }
            other => panic!("unexpected error: {}", other.plain_message()),
        }
    }
}
