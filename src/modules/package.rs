// Package action - install/remove/update packages

use super::{require, shell_quote, ActionContext, ActionOutput};
use crate::executor::Connection;
use crate::output::errors::PorterError;
use crate::task::PackageState;

/// Supported package managers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Dnf,
    Yum,
    Apt,
    Zypper,
    Pacman,
    Apk,
}

impl PackageManager {
    pub fn install_cmd(&self, package: &str) -> String {
        match self {
            PackageManager::Dnf => format!("dnf install -y {}", package),
            PackageManager::Yum => format!("yum install -y {}", package),
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
                package
            ),
            PackageManager::Zypper => format!("zypper install -y {}", package),
            PackageManager::Pacman => format!("pacman -S --noconfirm {}", package),
            PackageManager::Apk => format!("apk add {}", package),
        }
    }

    pub fn remove_cmd(&self, package: &str) -> String {
        match self {
            PackageManager::Dnf => format!("dnf remove -y {}", package),
            PackageManager::Yum => format!("yum remove -y {}", package),
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get remove -y {}",
                package
            ),
            PackageManager::Zypper => format!("zypper remove -y {}", package),
            PackageManager::Pacman => format!("pacman -R --noconfirm {}", package),
            PackageManager::Apk => format!("apk del {}", package),
        }
    }

    pub fn update_cmd(&self, package: &str) -> String {
        match self {
            PackageManager::Dnf => format!("dnf upgrade -y {}", package),
            PackageManager::Yum => format!("yum update -y {}", package),
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install --only-upgrade -y {}",
                package
            ),
            PackageManager::Zypper => format!("zypper update -y {}", package),
            PackageManager::Pacman => format!("pacman -S --noconfirm {}", package),
            PackageManager::Apk => format!("apk upgrade {}", package),
        }
    }

    pub fn check_installed_cmd(&self, package: &str) -> String {
        match self {
            PackageManager::Dnf | PackageManager::Yum | PackageManager::Zypper => {
                format!("rpm -q {} >/dev/null 2>&1", package)
            }
            PackageManager::Apt => {
                format!("dpkg -l {} 2>/dev/null | grep -q '^ii'", package)
            }
            PackageManager::Pacman => format!("pacman -Q {} >/dev/null 2>&1", package),
            PackageManager::Apk => format!("apk info -e {} >/dev/null 2>&1", package),
        }
    }
}

/// Detect the package manager on a system
pub async fn detect_package_manager(conn: &dyn Connection) -> Result<PackageManager, PorterError> {
    let checks = [
        ("dnf", PackageManager::Dnf),
        ("yum", PackageManager::Yum),
        ("apt-get", PackageManager::Apt),
        ("zypper", PackageManager::Zypper),
        ("pacman", PackageManager::Pacman),
        ("apk", PackageManager::Apk),
    ];

    for (binary, manager) in checks {
        let result = conn
            .exec(&format!("command -v {} 2>/dev/null", binary))
            .await?;
        if result.success() && !result.stdout.trim().is_empty() {
            return Ok(manager);
        }
    }

    Err(PorterError::action(
        "package",
        format!(
            "could not detect a package manager on {}",
            conn.host_name()
        ),
    ))
}

/// Install a package when it is missing; used by `package` and rsync's ensure
pub(super) async fn ensure_installed(
    ctx: &ActionContext<'_>,
    name: &str,
) -> Result<ActionOutput, PorterError> {
    let manager = detect_package_manager(ctx.conn).await?;
    let name = shell_quote(name);
    if ctx.conn.exec(&manager.check_installed_cmd(&name)).await?.success() {
        return Ok(ActionOutput::message(format!("{} already installed", name)));
    }
    ctx.stream(&manager.install_cmd(&name)).await
}

pub(super) async fn execute(
    ctx: &ActionContext<'_>,
    state: PackageState,
) -> Result<ActionOutput, PorterError> {
    let name = require(ctx.task, &ctx.task.body, "package name")?;

    match state {
        PackageState::Present => ensure_installed(ctx, name).await,
        PackageState::Latest => {
            let manager = detect_package_manager(ctx.conn).await?;
            let quoted = shell_quote(name);
            let installed = ctx
                .conn
                .exec(&manager.check_installed_cmd(&quoted))
                .await?
                .success();
            if installed {
                ctx.stream(&manager.update_cmd(&quoted)).await
            } else {
                ctx.stream(&manager.install_cmd(&quoted)).await
            }
        }
        PackageState::Absent => {
            let manager = detect_package_manager(ctx.conn).await?;
            let quoted = shell_quote(name);
            if !ctx
                .conn
                .exec(&manager.check_installed_cmd(&quoted))
                .await?
                .success()
            {
                return Ok(ActionOutput::message(format!("{} not installed", name)));
            }
            ctx.stream(&manager.remove_cmd(&quoted)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_manager_commands() {
        let apt = PackageManager::Apt;
        assert!(apt.install_cmd("nginx").contains("apt-get install"));
        assert!(apt.check_installed_cmd("nginx").contains("dpkg"));
        assert!(apt.update_cmd("nginx").contains("--only-upgrade"));

        let dnf = PackageManager::Dnf;
        assert!(dnf.install_cmd("nginx").contains("dnf install"));
        assert!(dnf.check_installed_cmd("nginx").contains("rpm"));

        assert_eq!(PackageManager::Apk.remove_cmd("curl"), "apk del curl");
    }
}
