// File transfer strategies - tar round-trips and single-file uploads

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::executor::streaming::run_streaming;
use crate::executor::{Connection, Executor, LocalConnection};
use crate::modules::{rsync_push_command, shell_quote, wrap_command};
use crate::output::errors::PorterError;
use crate::task::{capture, chmod, chown, tasks, Task, VarBag};

/// Largest file accepted by [`upload_file`]
pub const MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024 * 1024;

const VERIFY_VAR: &str = "upload_verify";

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

fn remote_scratch(ext: &str) -> String {
    format!(
        "/tmp/porter-{}-{}.{}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed),
        ext
    )
}

fn scratch_archive() -> Result<tempfile::NamedTempFile, PorterError> {
    tempfile::Builder::new()
        .prefix("porter-")
        .suffix(".tar.gz")
        .tempfile()
        .map_err(|e| PorterError::transfer("archive", e))
}

/// Run on the controller; non-zero exit becomes a transfer error for `stage`
async fn local_step(stage: &str, cmd: &str) -> Result<(), PorterError> {
    let result = LocalConnection::new("localhost").exec(cmd).await?;
    if !result.success() {
        return Err(PorterError::transfer(stage, result.stderr.trim()));
    }
    Ok(())
}

async fn remote_step(conn: &dyn Connection, stage: &str, cmd: &str) -> Result<(), PorterError> {
    let result = conn
        .exec(cmd)
        .await
        .map_err(|e| PorterError::transfer(stage, e.plain_message()))?;
    if !result.success() {
        return Err(PorterError::transfer(stage, result.stderr.trim()));
    }
    Ok(())
}

/// Tar and gzip `local`, ship it, unpack into `remote`, drop the remote tar
pub async fn upload_dir(conn: &dyn Connection, local: &Path, remote: &str) -> Result<(), PorterError> {
    if !local.is_dir() {
        return Err(PorterError::transfer(
            "archive",
            format!("{} is not a directory", local.display()),
        ));
    }
    let archive = scratch_archive()?;
    let remote_tar = remote_scratch("tar.gz");

    local_step(
        "archive",
        &format!(
            "tar -czf {} -C {} .",
            shell_quote(&archive.path().to_string_lossy()),
            shell_quote(&local.to_string_lossy())
        ),
    )
    .await?;

    conn.upload(archive.path(), &remote_tar)
        .await
        .map_err(|e| PorterError::transfer("upload", e.plain_message()))?;

    let extracted = remote_step(
        conn,
        "extract",
        &format!(
            "mkdir -p {dir} && tar -xzf {tar} -C {dir}",
            dir = shell_quote(remote),
            tar = shell_quote(&remote_tar)
        ),
    )
    .await;
    let cleaned = remote_step(conn, "cleanup", &format!("rm -f {}", shell_quote(&remote_tar))).await;

    extracted.and(cleaned)?;
    debug!(host = %conn.host_name(), remote, "directory uploaded");
    Ok(())
}

/// Symmetric to [`upload_dir`]: tar on the target, fetch, unpack locally
pub async fn download_dir(
    conn: &dyn Connection,
    remote: &str,
    local: &Path,
) -> Result<(), PorterError> {
    let remote_tar = remote_scratch("tar.gz");
    let archive = scratch_archive()?;

    remote_step(
        conn,
        "archive",
        &format!(
            "tar -czf {} -C {} .",
            shell_quote(&remote_tar),
            shell_quote(remote)
        ),
    )
    .await?;

    let fetched = conn
        .download(&remote_tar, archive.path())
        .await
        .map_err(|e| PorterError::transfer("download", e.plain_message()));
    let cleaned = remote_step(conn, "cleanup", &format!("rm -f {}", shell_quote(&remote_tar))).await;
    fetched.and(cleaned)?;

    local_step(
        "extract",
        &format!(
            "mkdir -p {dir} && tar -xzf {tar} -C {dir}",
            dir = shell_quote(&local.to_string_lossy()),
            tar = shell_quote(&archive.path().to_string_lossy())
        ),
    )
    .await?;
    debug!(host = %conn.host_name(), remote, "directory downloaded");
    Ok(())
}

/// How a file reached the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStrategy {
    Rsync,
    /// The connection's own upload (SCP with SFTP fallback over SSH)
    Direct,
}

/// Options for [`upload_file`]
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Octal mode, e.g. `755`
    pub mode: Option<String>,
    pub owner: Option<String>,
    pub create_dirs: bool,
    /// Compare SHA-256 of the remote copy against the local file
    pub verify: bool,
    pub sudo: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub remote_path: String,
    pub bytes: u64,
    pub strategy: UploadStrategy,
    pub sha256: String,
    /// `None` when verification was not requested
    pub verified: Option<bool>,
}

/// SHA-256 of a local file, hex encoded
pub async fn sha256_file(path: &Path) -> Result<String, PorterError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = File::open(&path).map_err(|e| PorterError::Io {
            message: format!("Failed to open file for hashing: {}", e),
            path: Some(path.clone()),
        })?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).map_err(|e| PorterError::Io {
            message: format!("Failed to hash file: {}", e),
            path: Some(path.clone()),
        })?;
        Ok(hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect())
    })
    .await
    .map_err(|e| PorterError::transfer("hash", e))?
}

/// Ship one file: rsync from the controller when the platform and the
/// connection allow it, the connection's own upload otherwise. Permissions,
/// owner and verification then run as ignored tasks so a restrictive target
/// does not fail an otherwise good transfer.
pub async fn upload_file(
    conn: Arc<dyn Connection>,
    local: &Path,
    remote: &str,
    opts: &UploadOptions,
) -> Result<UploadReport, PorterError> {
    let bytes = std::fs::metadata(local)
        .map_err(|e| PorterError::Io {
            message: format!("Cannot read upload source: {}", e),
            path: Some(local.to_path_buf()),
        })?
        .len();
    if bytes > MAX_UPLOAD_BYTES {
        return Err(PorterError::transfer(
            "size",
            format!("{} bytes exceeds the 5 GiB upload limit", bytes),
        ));
    }

    if opts.create_dirs {
        if let Some(parent) = Path::new(remote).parent().filter(|p| !p.as_os_str().is_empty()) {
            let cmd = format!("mkdir -p {}", shell_quote(&parent.to_string_lossy()));
            remote_step(conn.as_ref(), "mkdir", &wrap_command(&cmd, opts.sudo, "")).await?;
        }
    }

    let strategy = ship(conn.as_ref(), local, remote, opts.sudo).await?;
    info!(host = %conn.host_name(), remote, bytes, ?strategy, "file uploaded");

    let sha256 = sha256_file(local).await?;
    let followups = post_upload_tasks(remote, &sha256, opts);
    let mut vars = VarBag::new();
    if !followups.is_empty() {
        Executor::new(conn.clone())
            .run("post-upload", &followups, &mut vars)
            .await?;
    }

    Ok(UploadReport {
        remote_path: remote.to_string(),
        bytes,
        strategy,
        sha256,
        verified: opts.verify.then(|| vars.get(VERIFY_VAR) == Some("verified")),
    })
}

async fn ship(
    conn: &dyn Connection,
    local: &Path,
    remote: &str,
    sudo: bool,
) -> Result<UploadStrategy, PorterError> {
    let rsync_platform = cfg!(any(target_os = "linux", target_os = "macos"));
    if let (true, Some(endpoint)) = (rsync_platform, conn.ssh_endpoint()) {
        let controller = LocalConnection::new("localhost");
        if controller.exec("command -v rsync").await?.success() {
            let cmd = rsync_push_command(
                &local.to_string_lossy(),
                remote,
                Some(&endpoint),
                true,
                sudo,
            );
            let outcome = run_streaming(&controller, &cmd, None).await?;
            if outcome.success() {
                return Ok(UploadStrategy::Rsync);
            }
            debug!(host = %conn.host_name(), exit = outcome.exit_code, "rsync failed, using direct upload");
        }
    }

    conn.upload(local, remote)
        .await
        .map_err(|e| PorterError::transfer("upload", e.plain_message()))?;
    Ok(UploadStrategy::Direct)
}

fn post_upload_tasks(remote: &str, sha256: &str, opts: &UploadOptions) -> Vec<Task> {
    let mut list = Vec::new();
    if let Some(ref mode) = opts.mode {
        let mut task = chmod(remote).mode(mode.clone()).ignore();
        if opts.sudo {
            task = task.sudo();
        }
        list.push(task.build());
    }
    if let Some(ref owner) = opts.owner {
        let mut task = chown(remote, owner.clone()).ignore();
        if opts.sudo {
            task = task.sudo();
        }
        list.push(task.build());
    }
    if opts.verify {
        let check = format!(
            "if echo {} | sha256sum -c --status 2>/dev/null; then echo verified; else echo mismatch; fi",
            shell_quote(&format!("{}  {}", sha256, remote))
        );
        list.push(
            capture(check)
                .name(format!("verify {}", remote))
                .register(VERIFY_VAR)
                .ignore()
                .build(),
        );
    }
    tasks(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dir_round_trip() {
        let src = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let back = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("lib")).unwrap();
        std::fs::write(src.path().join("run.sh"), "echo run").unwrap();
        std::fs::write(src.path().join("lib/common.sh"), "x=1").unwrap();

        let conn = LocalConnection::new("localhost");
        let target = remote.path().join("deploy");
        upload_dir(&conn, src.path(), target.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(target.join("lib/common.sh")).unwrap(),
            "x=1"
        );

        download_dir(&conn, target.to_str().unwrap(), back.path())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(back.path().join("run.sh")).unwrap(),
            "echo run"
        );
    }

    #[tokio::test]
    async fn test_upload_dir_missing_source() {
        let conn = LocalConnection::new("localhost");
        let err = upload_dir(&conn, Path::new("/nonexistent/porter-src"), "/tmp/x")
            .await
            .unwrap_err();
        assert!(matches!(err, PorterError::Transfer { ref stage, .. } if stage == "archive"));
    }

    #[tokio::test]
    async fn test_sha256_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "abc").unwrap();

        assert_eq!(
            sha256_file(file.path()).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_upload_file_local_with_followups() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tool.sh");
        let dest = dir.path().join("bin/tool.sh");
        std::fs::write(&src, "#!/bin/sh\n").unwrap();

        let conn: Arc<dyn Connection> = Arc::new(LocalConnection::new("localhost"));
        let opts = UploadOptions {
            mode: Some("700".to_string()),
            create_dirs: true,
            verify: true,
            ..Default::default()
        };
        let report = upload_file(conn, &src, dest.to_str().unwrap(), &opts)
            .await
            .unwrap();

        assert_eq!(report.strategy, UploadStrategy::Direct);
        assert_eq!(report.bytes, 10);
        assert!(dest.exists());
        // sha256sum may be missing on some systems; verified is then false
        assert!(report.verified.is_some());
    }

    #[test]
    fn test_post_upload_tasks_are_ignored() {
        let opts = UploadOptions {
            mode: Some("644".to_string()),
            owner: Some("app".to_string()),
            verify: true,
            sudo: true,
            ..Default::default()
        };
        let list = post_upload_tasks("/opt/app/bin", "deadbeef", &opts);

        assert_eq!(list.len(), 3);
        assert!(list.iter().all(|t| t.ignore));
        assert!(list[0].sudo && list[1].sudo);
        assert_eq!(list[2].register.as_deref(), Some(VERIFY_VAR));
    }
}
