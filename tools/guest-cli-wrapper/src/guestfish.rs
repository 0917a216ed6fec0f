use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, warn};
use snafu::{ensure, OptionExt, ResultExt};
use tokio::process::Command;

use crate::cli::CommandLine;
use crate::{error, GuestBackend, GuestHandle, OsInfo, PackageManager, Result};

/// Backend over the libguestfs command line tools. Mounted access goes
/// through a `guestfish --listen` remote session; whole-image operations use
/// `virt-sysprep` and `virt-customize`.
#[derive(Debug)]
pub(crate) struct GuestfishCli {
    pub(crate) guestfish: PathBuf,
    pub(crate) virt_sysprep: PathBuf,
    pub(crate) virt_customize: PathBuf,
}

#[async_trait]
impl GuestBackend for GuestfishCli {
    async fn open(&self, image: &Path, readwrite: bool) -> Result<Box<dyn GuestHandle>> {
        let session = RemoteSession::listen(&self.guestfish, image, readwrite).await?;
        session.call(&["run"]).await?;

        // Exactly one OS root must be present.
        let roots_output = session.call(&["inspect-os"]).await?;
        let roots: Vec<&str> = roots_output.lines().filter(|l| !l.is_empty()).collect();
        ensure!(!roots.is_empty(), error::NoOsSnafu { image });
        ensure!(roots.len() == 1, error::MultiOsSnafu { image });
        let root = roots[0];

        let distribution = session.call(&["inspect-get-distro", root]).await?;
        let major_version = parse_version(&session.call(&["inspect-get-major-version", root]).await?)?;
        let minor_version = parse_version(&session.call(&["inspect-get-minor-version", root]).await?)?;
        let architecture = session.call(&["inspect-get-arch", root]).await?;
        let pkg_management = session.call(&["inspect-get-package-management", root]).await?;
        let os = OsInfo {
            distribution: distribution.trim().to_string(),
            major_version,
            minor_version,
            architecture: architecture.trim().to_string(),
            package_manager: PackageManager::try_from(pkg_management.trim())?,
        };

        // Mount parents before nested children, ignoring individual failures
        // (swap or unformatted partitions show up here on some images).
        let mountpoints_output = session.call(&["inspect-get-mountpoints", root]).await?;
        let mut mountpoints: Vec<(&str, &str)> = mountpoints_output
            .lines()
            .filter_map(|line| line.split_once(": "))
            .collect();
        mountpoints.sort_by_key(|(mountpoint, _)| mountpoint.len());
        for (mountpoint, device) in mountpoints {
            if let Err(e) = session.call(&["mount", device, mountpoint]).await {
                warn!("{} (ignored)", e);
            }
        }

        Ok(Box::new(GuestfishHandle { session, os }))
    }

    async fn reset_machine_identity(&self, image: &Path) -> Result<()> {
        let cli = CommandLine {
            path: self.virt_sysprep.clone(),
        };
        cli.output(
            &[
                "-a",
                path_str(image),
                "--enable",
                "logfiles,machine-id,ssh-hostkeys,dhcp-client-state",
            ],
            format!("failed to reset machine identity of '{}'", image.display()),
        )
        .await?;
        Ok(())
    }

    async fn selinux_relabel(&self, image: &Path) -> Result<()> {
        let cli = CommandLine {
            path: self.virt_customize.clone(),
        };
        cli.output(
            &["-a", path_str(image), "--selinux-relabel"],
            format!("failed to relabel SELinux contexts in '{}'", image.display()),
        )
        .await?;
        Ok(())
    }
}

#[derive(Debug)]
struct GuestfishHandle {
    session: RemoteSession,
    os: OsInfo,
}

#[async_trait]
impl GuestHandle for GuestfishHandle {
    fn os(&self) -> &OsInfo {
        &self.os
    }

    async fn sh(&self, command: &str) -> Result<String> {
        self.session.call(&["sh", command]).await
    }

    async fn upload(&self, host_path: &Path, guest_path: &str) -> Result<()> {
        self.session
            .call(&["upload", path_str(host_path), guest_path])
            .await?;
        Ok(())
    }

    async fn download(&self, guest_path: &str, host_path: &Path) -> Result<()> {
        self.session
            .call(&["download", guest_path, path_str(host_path)])
            .await?;
        Ok(())
    }

    async fn archive_out(&self, guest_dir: &str, host_path: &Path) -> Result<()> {
        self.session
            .call(&["tar-out", guest_dir, path_str(host_path), "compress:gzip"])
            .await?;
        Ok(())
    }

    async fn archive_in(&self, host_path: &Path, guest_dir: &str) -> Result<()> {
        self.session
            .call(&["tar-in", path_str(host_path), guest_dir, "compress:gzip"])
            .await?;
        Ok(())
    }

    async fn rm_rf(&self, guest_path: &str) -> Result<()> {
        self.session.call(&["rm-rf", guest_path]).await?;
        Ok(())
    }

    async fn exists(&self, guest_path: &str) -> Result<bool> {
        let output = self.session.call(&["exists", guest_path]).await?;
        Ok(output.trim() == "true")
    }

    async fn close(&mut self) -> Result<()> {
        self.session.call(&["umount-all"]).await?;
        self.session.call(&["exit"]).await?;
        Ok(())
    }
}

/// A `guestfish --listen` session addressed by pid via `--remote`.
#[derive(Debug)]
struct RemoteSession {
    guestfish: PathBuf,
    remote_arg: String,
}

impl RemoteSession {
    async fn listen(guestfish: &Path, image: &Path, readwrite: bool) -> Result<Self> {
        let mode = if readwrite { "--rw" } else { "--ro" };
        let cli = CommandLine {
            path: guestfish.to_path_buf(),
        };
        let output = cli
            .output(
                &["--listen", mode, "-a", path_str(image)],
                format!("failed to launch guestfish for '{}'", image.display()),
            )
            .await?;
        let output = String::from_utf8_lossy(&output).to_string();
        // guestfish prints `GUESTFISH_PID=1234; export GUESTFISH_PID` for
        // eval'ing in a shell; we only need the pid.
        let pid = output
            .split("GUESTFISH_PID=")
            .nth(1)
            .and_then(|rest| rest.split(';').next())
            .and_then(|pid| pid.trim().parse::<u32>().ok())
            .context(error::ListenSnafu { output: output.clone() })?;
        Ok(Self {
            guestfish: guestfish.to_path_buf(),
            remote_arg: format!("--remote={pid}"),
        })
    }

    async fn call(&self, args: &[&str]) -> Result<String> {
        debug!("guestfish {} {}", self.remote_arg, args.join(" "));
        let output = Command::new(&self.guestfish)
            .arg(&self.remote_arg)
            .arg("--")
            .args(args)
            .output()
            .await
            .context(error::CommandFailedSnafu {
                message: format!("unable to run guestfish {}", args.join(" ")),
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        ensure!(
            output.status.success(),
            error::ShellSnafu {
                command: args.join(" "),
                status: output.status.code().unwrap_or(1),
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            }
        );
        Ok(stdout)
    }
}

fn parse_version(output: &str) -> Result<u32> {
    output
        .trim()
        .parse::<u32>()
        .ok()
        .context(error::InspectParseSnafu {
            message: format!("expected a version number, got '{}'", output.trim()),
        })
}

fn path_str(path: &Path) -> &str {
    // Image and repository paths are produced by this program and are UTF-8.
    path.to_str().unwrap_or_default()
}
