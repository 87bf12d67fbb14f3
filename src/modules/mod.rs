// Built-in actions for Porter tasks

mod command;
mod docker;
mod file;
mod package;
mod rsync;
mod service;
mod wait;
mod wibu;

pub use command::{split_exit_code, wrap_with_exit_code, EXIT_CODE_PREFIX};
pub use package::{detect_package_manager, PackageManager};
pub use rsync::rsync_push_command;

use std::time::Duration;

use crate::executor::streaming::{run_streaming_until, LineSink, StopToken, StreamOutcome};
use crate::executor::Connection;
use crate::output::errors::PorterError;
use crate::task::{Action, Task};

/// Everything an action needs: the target, the task with all templates
/// already expanded, and where streamed lines go.
pub struct ActionContext<'a> {
    pub conn: &'a dyn Connection,
    pub task: &'a Task,
    pub sink: Option<LineSink>,
    /// Applied to wait-* tasks without their own timeout
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    /// Fired when the task runs out of time; streamed commands are interrupted
    pub stop: Option<StopToken>,
}

impl<'a> ActionContext<'a> {
    pub fn new(conn: &'a dyn Connection, task: &'a Task) -> Self {
        ActionContext {
            conn,
            task,
            sink: None,
            wait_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            stop: None,
        }
    }

    pub fn with_sink(mut self, sink: Option<LineSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_wait(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.wait_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_stop(mut self, stop: StopToken) -> Self {
        self.stop = Some(stop);
        self
    }

    fn host(&self) -> String {
        self.conn.host_name().to_string()
    }

    /// Wrap with sudo / run-as according to the task
    fn wrap(&self, cmd: &str) -> String {
        wrap_command(cmd, self.task.sudo, &self.task.user)
    }

    /// Run a command on the target, failing on non-zero exit
    async fn run(&self, cmd: &str) -> Result<ActionOutput, PorterError> {
        self.exec_checked(cmd, self.wrap(cmd)).await
    }

    /// Like [`ActionContext::run`], but `user` is not a run-as target here
    /// (chown/upload use it as the owner), so only sudo applies.
    async fn run_sudo(&self, cmd: &str) -> Result<ActionOutput, PorterError> {
        self.exec_checked(cmd, wrap_command(cmd, self.task.sudo, ""))
            .await
    }

    async fn exec_checked(&self, cmd: &str, wrapped: String) -> Result<ActionOutput, PorterError> {
        let outcome = self.conn.exec(&wrapped).await?;
        if !outcome.success() {
            let mut output = outcome.stdout.trim_end().to_string();
            if !outcome.stderr.trim().is_empty() {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(outcome.stderr.trim_end());
            }
            return Err(PorterError::RemoteNonZero {
                host: self.host(),
                command: cmd.to_string(),
                exit_code: outcome.exit_code,
                output,
            });
        }
        Ok(ActionOutput {
            output: outcome.stdout.trim_end().to_string(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: 0,
        })
    }

    /// Run a command with its lines delivered to the sink as they arrive
    async fn stream(&self, cmd: &str) -> Result<ActionOutput, PorterError> {
        let wrapped = self.wrap(cmd);
        let outcome =
            run_streaming_until(self.conn, &wrapped, self.sink.clone(), self.stop.clone()).await?;
        if !outcome.success() {
            return Err(PorterError::RemoteNonZero {
                host: self.host(),
                command: cmd.to_string(),
                exit_code: outcome.exit_code,
                output: outcome.output,
            });
        }
        Ok(outcome.into())
    }
}

/// What an action produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    /// Both streams, newline-joined in arrival order
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ActionOutput {
    pub fn empty() -> Self {
        ActionOutput::default()
    }

    pub fn message(text: impl Into<String>) -> Self {
        let text = text.into();
        ActionOutput {
            output: text.clone(),
            stdout: text,
            ..Default::default()
        }
    }
}

impl From<StreamOutcome> for ActionOutput {
    fn from(outcome: StreamOutcome) -> Self {
        ActionOutput {
            output: outcome.output,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
        }
    }
}

/// Execute one attempt of a task's action
pub async fn dispatch(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    match ctx.task.action {
        Action::Noop => Ok(ActionOutput::empty()),
        Action::Run | Action::Capture => command::execute(ctx).await,
        Action::Upload => file::upload(ctx).await,
        Action::Download => file::download(ctx).await,
        Action::Chmod => file::chmod(ctx).await,
        Action::Chown => file::chown(ctx).await,
        Action::Rm => file::rm(ctx).await,
        Action::Copy => file::copy(ctx).await,
        Action::Symlink => file::symlink(ctx).await,
        Action::Service(state) => service::execute(ctx, state).await,
        Action::Docker(state) => docker::container(ctx, state).await,
        Action::Compose(state) => docker::compose(ctx, state).await,
        Action::Package(state) => package::execute(ctx, state).await,
        Action::Rsync => rsync::execute(ctx).await,
        Action::WaitPort => wait::port(ctx).await,
        Action::WaitHttp => wait::http(ctx).await,
        Action::WaitFile => wait::file(ctx).await,
        Action::WibuGenerate => wibu::generate(ctx).await,
        Action::WibuApply => wibu::apply(ctx).await,
        Action::WibuInfo => wibu::info(ctx).await,
        Action::WibuList => wibu::list(ctx).await,
    }
}

/// Single-quote a string for `sh`
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Wrap a command for sudo and/or a run-as user
pub fn wrap_command(cmd: &str, sudo: bool, user: &str) -> String {
    match (sudo, user.is_empty()) {
        (true, true) => format!("sudo -n -- sh -c {}", shell_quote(cmd)),
        (_, false) => format!(
            "sudo -n -u {} -- sh -c {}",
            shell_quote(user),
            shell_quote(cmd)
        ),
        (false, true) => cmd.to_string(),
    }
}

/// Reject a task whose required field is empty
pub(crate) fn require<'t>(
    task: &'t Task,
    field: &'t str,
    what: &str,
) -> Result<&'t str, PorterError> {
    if field.trim().is_empty() {
        Err(PorterError::action(
            task.action.as_str(),
            format!("missing {}", what),
        ))
    } else {
        Ok(field)
    }
}
