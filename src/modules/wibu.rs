// Wibu actions - CodeMeter license handling through the `cmu` tool

use std::path::Path;

use super::{require, shell_quote, ActionContext, ActionOutput};
use crate::output::errors::PorterError;

/// Write a license request (RaC context file) for a container
pub(super) async fn generate(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let serial = require(ctx.task, &ctx.task.body, "container serial")?;
    let file = require(ctx.task, &ctx.task.dest, "context file")?;
    ctx.stream(&format!(
        "cmu --context --serial {} --file {}",
        shell_quote(serial),
        shell_quote(file)
    ))
    .await
}

/// Ship a license update (RaU) to the target, import it, clean up
pub(super) async fn apply(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let local = require(ctx.task, &ctx.task.src, "update file")?;
    let base = Path::new(local)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| PorterError::action("wibu_apply", format!("not a file: {}", local)))?;
    let staged = format!("/tmp/{}", base);

    ctx.conn.upload(Path::new(local), &staged).await?;
    let imported = ctx
        .stream(&format!("cmu --import --file {}", shell_quote(&staged)))
        .await;
    // The staged update is removed whether or not the import took
    let _ = ctx
        .conn
        .exec(&format!("rm -f {}", shell_quote(&staged)))
        .await;
    imported
}

pub(super) async fn info(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let serial = require(ctx.task, &ctx.task.body, "container serial")?;
    ctx.stream(&format!("cmu --list-content --serial {}", shell_quote(serial)))
        .await
}

pub(super) async fn list(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    ctx.stream("cmu --list").await
}
