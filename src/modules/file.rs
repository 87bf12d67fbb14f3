// File actions - transfer, permissions, copy, remove, link

use std::path::Path;

use super::{require, shell_quote, ActionContext, ActionOutput};
use crate::output::errors::PorterError;
use crate::transfer;

fn recursive_flag(ctx: &ActionContext<'_>) -> &'static str {
    if ctx.task.recursive {
        "-R "
    } else {
        ""
    }
}

pub(super) async fn upload(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let src = require(ctx.task, &ctx.task.src, "local source")?;
    let dest = require(ctx.task, &ctx.task.dest, "remote destination")?;

    if ctx.task.recursive {
        transfer::upload_dir(ctx.conn, Path::new(src), dest).await?;
    } else if ctx.task.sudo && !ctx.conn.is_local() {
        // Land in a scratch path first; only root may write the target
        let staging = format!(
            "/tmp/.porter-upload-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        ctx.conn.upload(Path::new(src), &staging).await?;
        ctx.run_sudo(&format!(
            "mv -f {} {}",
            shell_quote(&staging),
            shell_quote(dest)
        ))
        .await?;
    } else {
        ctx.conn.upload(Path::new(src), dest).await?;
    }

    if !ctx.task.mode.is_empty() {
        ctx.run_sudo(&format!(
            "chmod {}{} {}",
            recursive_flag(ctx),
            shell_quote(&ctx.task.mode),
            shell_quote(dest)
        ))
        .await?;
    }
    if !ctx.task.user.is_empty() {
        ctx.run_sudo(&format!(
            "chown {}{} {}",
            recursive_flag(ctx),
            shell_quote(&ctx.task.user),
            shell_quote(dest)
        ))
        .await?;
    }

    Ok(ActionOutput::message(format!("uploaded {} -> {}", src, dest)))
}

pub(super) async fn download(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let src = require(ctx.task, &ctx.task.src, "remote source")?;
    let dest = require(ctx.task, &ctx.task.dest, "local destination")?;

    if ctx.task.recursive {
        transfer::download_dir(ctx.conn, src, Path::new(dest)).await?;
    } else {
        ctx.conn.download(src, Path::new(dest)).await?;
    }

    Ok(ActionOutput::message(format!("downloaded {} -> {}", src, dest)))
}

pub(super) async fn chmod(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let path = require(ctx.task, &ctx.task.dest, "path")?;
    let mode = require(ctx.task, &ctx.task.mode, "mode")?;
    ctx.run_sudo(&format!(
        "chmod {}{} {}",
        recursive_flag(ctx),
        shell_quote(mode),
        shell_quote(path)
    ))
    .await
}

pub(super) async fn chown(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let path = require(ctx.task, &ctx.task.dest, "path")?;
    let owner = require(ctx.task, &ctx.task.user, "owner")?;
    ctx.run_sudo(&format!(
        "chown {}{} {}",
        recursive_flag(ctx),
        shell_quote(owner),
        shell_quote(path)
    ))
    .await
}

pub(super) async fn rm(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let path = require(ctx.task, &ctx.task.dest, "path")?;
    if matches!(path.trim(), "/" | "/*") {
        return Err(PorterError::action("rm", "refusing to remove the root directory"));
    }
    let flags = if ctx.task.recursive { "-rf" } else { "-f" };
    ctx.run(&format!("rm {} {}", flags, shell_quote(path))).await
}

pub(super) async fn copy(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let src = require(ctx.task, &ctx.task.src, "source")?;
    let dest = require(ctx.task, &ctx.task.dest, "destination")?;
    let flags = if ctx.task.recursive { "-a" } else { "-p" };
    ctx.run(&format!(
        "cp {} {} {}",
        flags,
        shell_quote(src),
        shell_quote(dest)
    ))
    .await
}

pub(super) async fn symlink(ctx: &ActionContext<'_>) -> Result<ActionOutput, PorterError> {
    let target = require(ctx.task, &ctx.task.src, "link target")?;
    let link = require(ctx.task, &ctx.task.dest, "link path")?;
    ctx.run(&format!(
        "ln -sfn {} {}",
        shell_quote(target),
        shell_quote(link)
    ))
    .await
}

#[cfg(test)]
mod tests {
    use crate::executor::LocalConnection;
    use crate::modules::{dispatch, ActionContext};
    use crate::output::errors::PorterError;
    use crate::task::{chmod, chown, copy, rm, symlink, upload};
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn test_upload_applies_mode() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("payload.sh");
        let dest = dir.path().join("deployed.sh");
        std::fs::write(&src, "#!/bin/sh\necho hi\n").unwrap();

        let conn = LocalConnection::new("localhost");
        let task = upload(src.to_str().unwrap(), dest.to_str().unwrap())
            .mode("750")
            .build();
        dispatch(&ActionContext::new(&conn, &task)).await.unwrap();

        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[tokio::test]
    async fn test_copy_link_chmod_rm() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let link = dir.path().join("current");
        std::fs::write(&a, "data").unwrap();
        let conn = LocalConnection::new("localhost");

        let steps = [
            copy(a.to_str().unwrap(), b.to_str().unwrap()).build(),
            chmod(b.to_str().unwrap()).mode("600").build(),
            symlink(b.to_str().unwrap(), link.to_str().unwrap()).build(),
        ];
        for task in &steps {
            dispatch(&ActionContext::new(&conn, task)).await.unwrap();
        }

        assert_eq!(std::fs::read_to_string(&link).unwrap(), "data");
        let mode = std::fs::metadata(&b).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let task = rm(b.to_str().unwrap()).build();
        dispatch(&ActionContext::new(&conn, &task)).await.unwrap();
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn test_mode_and_owner_are_not_shell_code() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let injected = dir.path().join("injected");
        std::fs::write(&target, "data").unwrap();
        let conn = LocalConnection::new("localhost");
        let path = target.to_str().unwrap();

        let task = chmod(path)
            .mode(format!("600; touch {}", injected.display()))
            .build();
        assert!(dispatch(&ActionContext::new(&conn, &task)).await.is_err());

        let task = chown(path, format!("nobody; touch {}", injected.display())).build();
        assert!(dispatch(&ActionContext::new(&conn, &task)).await.is_err());

        assert!(!injected.exists());
    }

    #[tokio::test]
    async fn test_chmod_requires_mode() {
        let conn = LocalConnection::new("localhost");
        let task = chmod("/tmp/whatever").build();

        let err = dispatch(&ActionContext::new(&conn, &task))
            .await
            .unwrap_err();
        assert!(matches!(err, PorterError::Action { .. }));
    }

    #[tokio::test]
    async fn test_rm_refuses_root() {
        let conn = LocalConnection::new("localhost");
        let task = rm("/").recursive().build();

        assert!(dispatch(&ActionContext::new(&conn, &task)).await.is_err());
    }
}
