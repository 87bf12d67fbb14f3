// Rsync action - sync trees, either on the target or pushed from the controller

use super::{package, require, shell_quote, ActionContext, ActionOutput};
use crate::executor::streaming::run_streaming_until;
use crate::executor::{LocalConnection, SshEndpoint};
use crate::output::errors::PorterError;

/// rsync invocation run on the controller. With an endpoint the destination
/// is remote; `partial` keeps interrupted transfers for resume.
pub fn rsync_push_command(
    src: &str,
    dest: &str,
    endpoint: Option<&SshEndpoint>,
    partial: bool,
    sudo: bool,
) -> String {
    let mut cmd = String::from("rsync -a");
    if partial {
        cmd.push_str(" --partial");
    }
    match endpoint {
        Some(endpoint) => {
            cmd.push_str(&format!(" -z -e {}", shell_quote(&endpoint.rsync_shell())));
            if sudo {
                cmd.push_str(" --rsync-path='sudo -n rsync'");
            }
            cmd.push_str(&format!(
                " {} {}",
                shell_quote(src),
                shell_quote(&format!("{}:{}", endpoint.target(), dest))
            ));
        }
        None => {
            cmd.push_str(&format!(" {} {}", shell_quote(src), shell_quote(dest)));
        }
    }
    cmd
}

pub(super) async fn execute(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let src = require(ctx.task, &ctx.task.src, "source")?;
    let dest = require(ctx.task, &ctx.task.dest, "destination")?;

    if ctx.task.ensure {
        package::ensure_installed(ctx, "rsync").await?;
    }

    if !ctx.task.local || ctx.conn.is_local() {
        // Both paths live where the command runs
        let cmd = rsync_push_command(src, dest, None, ctx.task.partial, false);
        return ctx.stream(&cmd).await;
    }

    let endpoint = ctx.conn.ssh_endpoint().ok_or_else(|| {
        PorterError::action("rsync", "push needs an SSH-backed connection")
    })?;
    let cmd = rsync_push_command(
        src,
        dest,
        Some(&endpoint),
        ctx.task.partial,
        ctx.task.sudo,
    );

    let controller = LocalConnection::new("localhost");
    let outcome =
        run_streaming_until(&controller, &cmd, ctx.sink.clone(), ctx.stop.clone()).await?;
    if !outcome.success() {
        return Err(PorterError::RemoteNonZero {
            host: ctx.conn.host_name().to_string(),
            command: cmd,
            exit_code: outcome.exit_code,
            output: outcome.output,
        });
    }
    Ok(outcome.into())
}
