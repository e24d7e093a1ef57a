use fslock::LockFile;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use crate::driver::SessionCommand;
use crate::error::ProvisionError;

/// The linear shell-outs provisioning relies on: package manager, accounts,
/// firewall, downloads. None of them make decisions; the orchestrator does.
pub trait HostOps {
    fn find_program(&self, name: &str) -> Option<PathBuf>;
    fn install_container_runtime(&self) -> Result<(), ProvisionError>;
    fn install_compose_tooling(&self) -> Result<(), ProvisionError>;
    fn grant_socket_access(&self, account: &str) -> Result<(), ProvisionError>;
    /// Returns `true` when the account had to be created.
    fn ensure_service_account(&self, account: &str, home: &Path) -> Result<bool, ProvisionError>;
    fn configure_firewall(&self) -> Result<(), ProvisionError>;
    fn fetch_installer_script(&self, url: &str, dest: &Path) -> Result<(), ProvisionError>;
    fn set_owner(&self, path: &Path, account: &str) -> Result<(), ProvisionError>;
    fn run_installer_subcommand(&self, command: &SessionCommand) -> Result<(), ProvisionError>;
    fn remove_installation(&self, root: &Path) -> Result<(), ProvisionError>;
}

pub struct RealHostOps;

fn run_checked(program: &str, args: &[&str]) -> Result<(), ProvisionError> {
    let rendered = format!("{program} {}", args.join(" "));
    info!(command = %rendered, "running host command");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ProvisionError::MissingDependency {
                    name: program.to_string(),
                    hint: format!("`{program}` is required on this host."),
                }
            } else {
                ProvisionError::Process(format!("failed to run `{rendered}`: {err}"))
            }
        })?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.to_lowercase().contains("permission denied")
        || stderr.contains("Only root can")
        || stderr.contains("are you root")
    {
        return Err(ProvisionError::Permission {
            message: format!("`{rendered}` failed: {stderr}"),
            hint: "Re-run as root (e.g. with sudo).".to_string(),
        });
    }
    Err(ProvisionError::Process(format!(
        "`{rendered}` exited with {}: {stderr}",
        output.status
    )))
}

#[derive(Debug, Clone, Copy)]
enum PackageManager {
    Apt,
    Dnf,
}

impl RealHostOps {
    fn package_manager(&self) -> Result<PackageManager, ProvisionError> {
        if self.find_program("apt-get").is_some() {
            return Ok(PackageManager::Apt);
        }
        if self.find_program("dnf").is_some() {
            return Ok(PackageManager::Dnf);
        }
        Err(ProvisionError::MissingDependency {
            name: "package manager".to_string(),
            hint: "Neither apt-get nor dnf is available; install the container runtime manually."
                .to_string(),
        })
    }

    fn install_packages(&self, packages: &[&str]) -> Result<(), ProvisionError> {
        match self.package_manager()? {
            PackageManager::Apt => {
                run_checked("apt-get", &["update"])?;
                let mut args = vec!["install", "-y"];
                args.extend_from_slice(packages);
                run_checked("apt-get", &args)
            }
            PackageManager::Dnf => {
                let mut args = vec!["install", "-y"];
                args.extend_from_slice(packages);
                run_checked("dnf", &args)
            }
        }
    }
}

impl HostOps for RealHostOps {
    fn find_program(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    fn install_container_runtime(&self) -> Result<(), ProvisionError> {
        let package = match self.package_manager()? {
            PackageManager::Apt => "docker.io",
            PackageManager::Dnf => "docker",
        };
        self.install_packages(&[package])?;
        if let Err(err) = run_checked("systemctl", &["enable", "--now", "docker"]) {
            warn!(error = %err, "could not enable the docker service");
        }
        Ok(())
    }

    fn install_compose_tooling(&self) -> Result<(), ProvisionError> {
        self.install_packages(&["docker-compose-plugin"])
    }

    fn grant_socket_access(&self, account: &str) -> Result<(), ProvisionError> {
        run_checked("usermod", &["-aG", "docker", account])?;
        let socket = Path::new("/var/run/docker.sock");
        if socket.exists() {
            run_checked("chown", &["root:docker", "/var/run/docker.sock"])?;
            run_checked("chmod", &["660", "/var/run/docker.sock"])?;
        }
        Ok(())
    }

    fn ensure_service_account(&self, account: &str, home: &Path) -> Result<bool, ProvisionError> {
        let exists = Command::new("id")
            .arg("-u")
            .arg(account)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if exists {
            return Ok(false);
        }
        let home = home.to_string_lossy().to_string();
        run_checked(
            "useradd",
            &[
                "--create-home",
                "--home-dir",
                &home,
                "--shell",
                "/bin/bash",
                account,
            ],
        )?;
        if let Err(err) = run_checked("usermod", &["-aG", "docker", account]) {
            warn!(error = %err, account, "could not add service account to the docker group");
        }
        Ok(true)
    }

    fn configure_firewall(&self) -> Result<(), ProvisionError> {
        if self.find_program("ufw").is_some() {
            run_checked("ufw", &["allow", "80/tcp"])?;
            return run_checked("ufw", &["allow", "443/tcp"]);
        }
        if self.find_program("firewall-cmd").is_some() {
            run_checked("firewall-cmd", &["--permanent", "--add-service=http"])?;
            run_checked("firewall-cmd", &["--permanent", "--add-service=https"])?;
            return run_checked("firewall-cmd", &["--reload"]);
        }
        warn!("no supported firewall tool found; skipping firewall rules");
        Ok(())
    }

    fn fetch_installer_script(&self, url: &str, dest: &Path) -> Result<(), ProvisionError> {
        let client = reqwest::blocking::Client::new();
        let response = client.get(url).header("User-Agent", "vaultwright").send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::Process(format!(
                "download failed: {url} (HTTP {status})"
            )));
        }
        let bytes = response.bytes()?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, &bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dest, fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }

    fn set_owner(&self, path: &Path, account: &str) -> Result<(), ProvisionError> {
        let owner = format!("{account}:{account}");
        let path = path.to_string_lossy().to_string();
        run_checked("chown", &["-R", &owner, &path])
    }

    fn run_installer_subcommand(&self, command: &SessionCommand) -> Result<(), ProvisionError> {
        info!(command = %command.render(), "running installer subcommand");
        let output = command
            .to_command()
            .stdin(Stdio::null())
            .output()
            .map_err(|err| ProvisionError::Process(format!("failed to run installer: {err}")))?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!("{line}");
        }
        if !output.status.success() {
            return Err(ProvisionError::Process(format!(
                "`{}` exited with {}: {}",
                command.render(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn remove_installation(&self, root: &Path) -> Result<(), ProvisionError> {
        match fs::remove_dir_all(root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ProvisionError::Io(err)),
        }
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<u32>().ok()
}

fn lock_error(path: &Path, err: impl fmt::Display) -> ProvisionError {
    ProvisionError::Process(format!("cannot lock {}: {err}", path.display()))
}

/// Advisory single-instance lock held through an OS file lock. The kernel
/// drops it when the holder exits, so a leftover file never blocks a run.
/// The file stays in place after release; only the lock on it matters.
pub struct RunLock {
    _file: LockFile,
}

impl fmt::Debug for RunLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLock").finish_non_exhaustive()
    }
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self, ProvisionError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = LockFile::open(path).map_err(|err| lock_error(path, err))?;
        if !file.try_lock_with_pid().map_err(|err| lock_error(path, err))? {
            let holder = read_pid_file(path)
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(ProvisionError::Locked {
                path: path.to_path_buf(),
                holder,
            });
        }
        debug!(path = %path.display(), "provisioning lock acquired");
        Ok(Self { _file: file })
    }
}
