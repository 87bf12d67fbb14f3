// Docker actions - single containers and compose projects

use super::{require, shell_quote, ActionContext, ActionOutput};
use crate::output::errors::PorterError;
use crate::task::ContainerState;

fn container_command(name: &str, state: ContainerState) -> String {
    let name = shell_quote(name);
    match state {
        ContainerState::Up | ContainerState::Start => format!("docker start {}", name),
        ContainerState::Down | ContainerState::Stop => format!("docker stop {}", name),
        ContainerState::Restart => format!("docker restart {}", name),
        ContainerState::Pull => format!("docker pull {}", name),
    }
}

/// Prefers the compose plugin, falls back to the standalone binary
fn compose_command(dir: &str, state: ContainerState) -> String {
    let args = match state {
        ContainerState::Up => "up -d",
        ContainerState::Down => "down",
        ContainerState::Start => "start",
        ContainerState::Stop => "stop",
        ContainerState::Restart => "restart",
        ContainerState::Pull => "pull",
    };
    format!(
        "cd {} && if docker compose version >/dev/null 2>&1; then docker compose {args}; else docker-compose {args}; fi",
        shell_quote(dir),
        args = args
    )
}

pub(super) async fn container(
    ctx: &ActionContext<'_>,
    state: ContainerState,
) -> Result<ActionOutput, PorterError> {
    let name = require(ctx.task, &ctx.task.body, "container")?;
    ctx.stream(&container_command(name, state)).await
}

pub(super) async fn compose(
    ctx: &ActionContext<'_>,
    state: ContainerState,
) -> Result<ActionOutput, PorterError> {
    let dir = require(ctx.task, &ctx.task.dest, "compose directory")?;
    ctx.stream(&compose_command(dir, state)).await
}
