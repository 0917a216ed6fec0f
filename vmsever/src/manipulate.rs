//! Package and home-directory surgery inside a mounted guest.
//!
//! The exact shell sequences differ per package manager family, but the
//! contract does not: after `export_packages` every listed package has a
//! resolvable file in the package store; after `remove_packages` neither the
//! main services nor their no-longer-needed dependencies remain installed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use guest_cli_wrapper::{error::Error as GuestError, GuestHandle, PackageManager};
use log::{debug, warn};

use crate::config::Config;
use crate::graph::PackageInfo;

/// Guest-side staging directories.
const EXPORT_DIR: &str = "/tmp/vmsever-export";
const IMPORT_DIR: &str = "/tmp/vmsever-import";

pub(crate) struct VmiManipulator<'a> {
    handle: &'a dyn GuestHandle,
    vmi_name: &'a str,
    config: &'a Config,
}

impl<'a> VmiManipulator<'a> {
    pub(crate) fn new(handle: &'a dyn GuestHandle, vmi_name: &'a str, config: &'a Config) -> Self {
        Self {
            handle,
            vmi_name,
            config,
        }
    }

    fn family(&self) -> PackageManager {
        self.handle.os().package_manager
    }

    /// Repackage the given installed packages as files and pull them into the
    /// package store. Each entry's `path` is set to its store location.
    pub(crate) async fn export_packages(
        &self,
        packages: &mut HashMap<String, PackageInfo>,
        distribution: &str,
    ) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        self.handle.sh(&format!("mkdir -p {EXPORT_DIR}")).await?;

        let mut names: Vec<&str> = packages.keys().map(|n| n.as_str()).collect();
        names.sort_unstable();
        match self.family() {
            PackageManager::Apt => {
                self.handle
                    .sh(&format!("cd {EXPORT_DIR} && dpkg-repack {}", names.join(" ")))
                    .await
                    .context("unable to repack packages in guest")?;
            }
            PackageManager::Dnf => {
                for name in &names {
                    self.handle
                        .sh(&format!("rpmrebuild --batch --directory={EXPORT_DIR} {name}"))
                        .await
                        .context(format!("unable to rebuild package '{name}' in guest"))?;
                }
            }
        }

        let pattern = match self.family() {
            PackageManager::Apt => "*.deb",
            PackageManager::Dnf => "*.rpm",
        };
        let listing = self
            .handle
            .sh(&format!("find {EXPORT_DIR} -type f -name '{pattern}'"))
            .await?;

        let store_dir = self.config.distribution_packages_dir(distribution);
        tokio::fs::create_dir_all(&store_dir).await.context(format!(
            "unable to create package store directory '{}'",
            store_dir.display()
        ))?;
        for guest_file in listing.lines().filter(|l| !l.is_empty()) {
            let file_name = guest_file.rsplit('/').next().unwrap_or(guest_file);
            let Some(package_name) = match_package_file(self.family(), file_name, packages) else {
                debug!("ignoring unexpected exported file '{file_name}'");
                continue;
            };
            let host_path = store_dir.join(file_name);
            self.handle.download(guest_file, &host_path).await?;
            if let Some(info) = packages.get_mut(&package_name) {
                info.path = Some(host_path);
            }
        }
        self.handle.rm_rf(EXPORT_DIR).await?;

        for info in packages.values() {
            if info.path.is_none() {
                bail!(
                    "export of VMI '{}' produced no file for package '{}'",
                    self.vmi_name,
                    info.name
                );
            }
        }
        Ok(())
    }

    /// Remove the main services and every dependency nothing else needs.
    pub(crate) async fn remove_packages(&self, main_services: &[String]) -> Result<()> {
        let joined = main_services.join(" ");
        match self.family() {
            PackageManager::Apt => {
                self.handle
                    .sh(&format!(
                        "DEBIAN_FRONTEND=noninteractive apt-get --yes purge {joined}"
                    ))
                    .await
                    .context("unable to remove main service packages")?;
                self.handle
                    .sh("DEBIAN_FRONTEND=noninteractive apt-get --yes --purge autoremove")
                    .await
                    .context("unable to remove unneeded dependencies")?;
            }
            PackageManager::Dnf => {
                self.handle
                    .sh(&format!("dnf --assumeyes remove {joined}"))
                    .await
                    .context("unable to remove main service packages")?;
            }
        }
        Ok(())
    }

    /// Pack `/home` into a compressed archive in the user folder store.
    pub(crate) async fn export_home_dir(&self) -> Result<PathBuf> {
        let archive = self
            .config
            .user_folders_dir()
            .join(format!("{}_home.tar.gz", self.vmi_name));
        if let Some(parent) = archive.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.handle.archive_out("/home", &archive).await?;
        Ok(archive)
    }

    pub(crate) async fn remove_home_dir(&self) -> Result<()> {
        self.handle.rm_rf("/home").await?;
        self.handle.sh("mkdir -m 755 /home").await?;
        Ok(())
    }

    pub(crate) async fn import_home_dir(&self, archive: &Path) -> Result<()> {
        self.handle.sh("mkdir -p /home").await?;
        self.handle.archive_in(archive, "/home").await?;
        Ok(())
    }

    /// Install previously exported package files. Installation errors are
    /// returned as text rather than failing: they are commonly caused by
    /// packages expecting an interactive terminal while the installed
    /// service works regardless.
    pub(crate) async fn import_packages(
        &self,
        main_services: &[String],
        package_files: &[&Path],
    ) -> Result<Option<String>> {
        if package_files.is_empty() {
            return Ok(None);
        }
        debug!(
            "importing {} package files for main services {}",
            package_files.len(),
            main_services.join(",")
        );
        self.handle.sh(&format!("mkdir -p {IMPORT_DIR}")).await?;
        for file in package_files {
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .context(format!("package file '{}' has no name", file.display()))?;
            self.handle
                .upload(file, &format!("{IMPORT_DIR}/{file_name}"))
                .await
                .context(format!("unable to upload package file '{}'", file.display()))?;
        }

        let install = match self.family() {
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive dpkg --install --force-confold {IMPORT_DIR}/*.deb"
            ),
            PackageManager::Dnf => {
                format!("rpm --upgrade --replacepkgs {IMPORT_DIR}/*.rpm")
            }
        };
        let errors = match self.handle.sh(&install).await {
            Ok(_) => None,
            Err(GuestError::Shell { stderr, .. }) => {
                warn!("package import emitted errors; continuing");
                Some(stderr)
            }
            Err(e) => return Err(e).context("unable to install packages in guest"),
        };
        if let Err(e) = self.handle.rm_rf(IMPORT_DIR).await {
            debug!("unable to clean import staging directory: {e}");
        }
        Ok(errors)
    }

    /// Whether the guest uses SELinux: either a relabel is already scheduled
    /// or the policy reports itself as enabled.
    pub(crate) async fn selinux_enabled(&self) -> Result<bool> {
        if self.handle.exists("/.autorelabel").await? {
            return Ok(true);
        }
        match self.handle.sh("selinuxenabled").await {
            Ok(_) => Ok(true),
            Err(GuestError::Shell { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Map an exported file name back to the package it belongs to.
///
/// Debian repack names are `<name>_<version>_<arch>.deb`; rpm files are
/// `<name>-<version>-<release>.<arch>.rpm`. Because rpm names may themselves
/// contain dashes the rpm match requires the `<name>-<version>` prefix.
fn match_package_file(
    family: PackageManager,
    file_name: &str,
    packages: &HashMap<String, PackageInfo>,
) -> Option<String> {
    match family {
        PackageManager::Apt => {
            let (name, _) = file_name.split_once('_')?;
            packages.contains_key(name).then(|| name.to_string())
        }
        PackageManager::Dnf => packages
            .values()
            .find(|info| file_name.starts_with(&format!("{}-{}-", info.name, info.version)))
            .map(|info| info.name.clone()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn package_map(entries: &[(&str, &str)]) -> HashMap<String, PackageInfo> {
        entries
            .iter()
            .map(|(name, version)| {
                (
                    name.to_string(),
                    PackageInfo {
                        name: name.to_string(),
                        version: version.to_string(),
                        architecture: "amd64".to_string(),
                        essential: false,
                        size: 1,
                        path: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn deb_files_match_on_the_name_prefix() {
        let packages = package_map(&[("nginx", "1.10.3")]);
        assert_eq!(
            match_package_file(PackageManager::Apt, "nginx_1.10.3_amd64.deb", &packages),
            Some("nginx".to_string())
        );
        assert_eq!(
            match_package_file(PackageManager::Apt, "stray_1.0_all.deb", &packages),
            None
        );
    }

    #[test]
    fn rpm_files_match_on_name_and_version() {
        // "httpd-tools" must not be swallowed by a package named "httpd"
        let packages = package_map(&[("httpd", "2.4.27"), ("httpd-tools", "2.4.27")]);
        assert_eq!(
            match_package_file(
                PackageManager::Dnf,
                "httpd-tools-2.4.27-1.fc26.x86_64.rpm",
                &packages
            ),
            Some("httpd-tools".to_string())
        );
        assert_eq!(
            match_package_file(
                PackageManager::Dnf,
                "httpd-2.4.27-1.fc26.x86_64.rpm",
                &packages
            ),
            Some("httpd".to_string())
        );
    }
}
