// Service action - manage systemd units

use super::{require, shell_quote, ActionContext, ActionOutput};
use crate::executor::Connection;
use crate::output::errors::PorterError;
use crate::task::ServiceState;

/// Current state of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UnitState {
    running: bool,
    enabled: bool,
}

async fn probe(conn: &dyn Connection, unit: &str) -> Result<UnitState, PorterError> {
    let active = conn
        .exec(&format!("systemctl is-active {} 2>/dev/null || true", unit))
        .await?;
    let enabled = conn
        .exec(&format!("systemctl is-enabled {} 2>/dev/null || true", unit))
        .await?;

    Ok(UnitState {
        running: active.stdout.trim() == "active",
        enabled: enabled.stdout.trim() == "enabled",
    })
}

/// The systemctl verb for a state, or `None` when the unit is already there
fn systemctl_verb(state: ServiceState, current: UnitState) -> Option<&'static str> {
    match state {
        ServiceState::Start if current.running => None,
        ServiceState::Stop if !current.running => None,
        ServiceState::Enable if current.enabled => None,
        ServiceState::Disable if !current.enabled => None,
        ServiceState::Status => None,
        s => Some(s.as_str()),
    }
}

pub(super) async fn execute(
    ctx: &ActionContext<'_>,
    state: ServiceState,
) -> Result<ActionOutput, PorterError> {
    let name = require(ctx.task, &ctx.task.body, "service name")?;
    let unit = shell_quote(name);
    let current = probe(ctx.conn, &unit).await?;

    if state == ServiceState::Status {
        let text = if current.running { "active" } else { "inactive" };
        return Ok(ActionOutput::message(format!(
            "{} {}{}",
            name,
            text,
            if current.enabled { ", enabled" } else { "" }
        )));
    }

    let Some(verb) = systemctl_verb(state, current) else {
        return Ok(ActionOutput::message(format!(
            "service {} unchanged ({})",
            name,
            state.as_str()
        )));
    };

    let cmd = format!("systemctl {} {}", verb, unit);
    match ctx.run(&cmd).await {
        Err(PorterError::RemoteNonZero { .. }) if state == ServiceState::Reload => {
            // Not every unit supports reload
            ctx.run(&format!("systemctl reload-or-restart {}", unit))
                .await
        }
        other => other,
    }
}
