//! Test support: a guest backend that keeps its whole state inside the image
//! file, so copying or moving an image file behaves exactly like copying a
//! disk image.

mod scenarios;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use guest_cli_wrapper::{
    error::Error as GuestError, GuestBackend, GuestHandle, OsInfo, PackageManager,
    Result as GuestResult,
};
use serde::{Deserialize, Serialize};

/// A package as the fake guest knows it. `size` follows the conventions of
/// the package manager reporting it: KiB for apt, bytes for dnf. `auto`
/// marks packages installed as dependencies, which is what `autoremove`
/// cleans up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct FakePackage {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) arch: String,
    pub(crate) essential: bool,
    pub(crate) auto: bool,
    pub(crate) size: u64,
    pub(crate) depends: Vec<String>,
    pub(crate) predepends: Vec<String>,
}

/// The complete state of a fake image, serialized as the image file itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FakeImage {
    pub(crate) os: OsInfo,
    pub(crate) packages: Vec<FakePackage>,
    pub(crate) home_files: BTreeMap<String, String>,
    pub(crate) selinux: bool,
    pub(crate) autorelabel: bool,
    pub(crate) identity_resets: u32,
    pub(crate) relabels: u32,
}

impl FakeImage {
    pub(crate) fn load(path: &Path) -> std::io::Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub(crate) fn save(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self).expect("serializable image"))
    }

    pub(crate) fn package(&self, name: &str) -> Option<&FakePackage> {
        self.packages.iter().find(|p| p.name == name)
    }

    pub(crate) fn package_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.packages.iter().map(|p| p.name.clone()).collect();
        names.sort();
        names
    }
}

pub(crate) fn apt_package(
    name: &str,
    version: &str,
    essential: bool,
    auto: bool,
    size_kib: u64,
    depends: &[&str],
) -> FakePackage {
    FakePackage {
        name: name.to_string(),
        version: version.to_string(),
        arch: "amd64".to_string(),
        essential,
        auto,
        size: size_kib,
        depends: depends.iter().map(|d| d.to_string()).collect(),
        predepends: Vec::new(),
    }
}

pub(crate) fn dnf_package(
    name: &str,
    version: &str,
    auto: bool,
    size_bytes: u64,
    depends: &[&str],
) -> FakePackage {
    FakePackage {
        name: name.to_string(),
        version: version.to_string(),
        arch: "x86_64".to_string(),
        essential: false,
        auto,
        size: size_bytes,
        depends: depends.iter().map(|d| d.to_string()).collect(),
        predepends: Vec::new(),
    }
}

pub(crate) fn ubuntu_image(packages: Vec<FakePackage>) -> FakeImage {
    FakeImage {
        os: OsInfo {
            distribution: "ubuntu".to_string(),
            major_version: 16,
            minor_version: 4,
            architecture: "amd64".to_string(),
            package_manager: PackageManager::Apt,
        },
        packages,
        home_files: BTreeMap::new(),
        selinux: false,
        autorelabel: false,
        identity_resets: 0,
        relabels: 0,
    }
}

pub(crate) fn fedora_image(packages: Vec<FakePackage>) -> FakeImage {
    FakeImage {
        os: OsInfo {
            distribution: "fedora".to_string(),
            major_version: 26,
            minor_version: 0,
            architecture: "x86_64".to_string(),
            package_manager: PackageManager::Dnf,
        },
        packages,
        home_files: BTreeMap::new(),
        selinux: true,
        autorelabel: false,
        identity_resets: 0,
        relabels: 0,
    }
}

/// Backend whose images are [`FakeImage`] JSON files.
#[derive(Debug)]
pub(crate) struct FakeBackend;

#[async_trait]
impl GuestBackend for FakeBackend {
    async fn open(&self, image: &Path, _readwrite: bool) -> GuestResult<Box<dyn GuestHandle>> {
        let state = FakeImage::load(image).map_err(|e| GuestError::CommandFailed {
            message: format!("unable to open fake image '{}'", image.display()),
            source: e,
        })?;
        Ok(Box::new(FakeHandle {
            os: state.os.clone(),
            image_path: image.to_path_buf(),
            state: Mutex::new(state),
            guest_files: Mutex::new(HashMap::new()),
        }))
    }

    async fn reset_machine_identity(&self, image: &Path) -> GuestResult<()> {
        let mut state = FakeImage::load(image).map_err(io_error)?;
        state.identity_resets += 1;
        state.save(image).map_err(io_error)?;
        Ok(())
    }

    async fn selinux_relabel(&self, image: &Path) -> GuestResult<()> {
        let mut state = FakeImage::load(image).map_err(io_error)?;
        state.relabels += 1;
        state.save(image).map_err(io_error)?;
        Ok(())
    }
}

fn io_error(e: std::io::Error) -> GuestError {
    GuestError::CommandFailed {
        message: "fake image io".to_string(),
        source: e,
    }
}

fn shell_error(stderr: &str) -> GuestError {
    GuestError::Shell {
        command: String::new(),
        status: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[derive(Debug)]
pub(crate) struct FakeHandle {
    os: OsInfo,
    image_path: PathBuf,
    state: Mutex<FakeImage>,
    /// Files inside the guest filesystem outside the package database.
    guest_files: Mutex<HashMap<String, String>>,
}

impl FakeHandle {
    fn persist(&self, state: &FakeImage) {
        state.save(&self.image_path).expect("fake image writable");
    }

    fn render_dpkg_query(&self, state: &FakeImage) -> String {
        state
            .packages
            .iter()
            .map(|p| {
                format!(
                    "{};{};{};{};{};{};{}",
                    p.name,
                    p.version,
                    p.arch,
                    if p.essential { "yes" } else { "no" },
                    p.size,
                    p.depends.join(", "),
                    p.predepends.join(", "),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
            + "\n"
    }

    fn render_rpm_query(&self, state: &FakeImage) -> String {
        state
            .packages
            .iter()
            .map(|p| format!("{};{};{};{}", p.name, p.version, p.arch, p.size))
            .collect::<Vec<_>>()
            .join("\n")
            + "\n"
    }

    fn render_rpmdep(&self, state: &FakeImage) -> String {
        let mut lines = vec!["rpmdep scanning installed packages".to_string()];
        for p in &state.packages {
            for dep in &p.depends {
                lines.push(format!("(level 1) {} -> {}", p.name, dep));
            }
        }
        lines.join("\n") + "\n"
    }

    fn repack(&self, state: &FakeImage, names: &[&str]) -> GuestResult<()> {
        let mut files = self.guest_files.lock().expect("fake guest files");
        for name in names {
            let package = state
                .package(name)
                .ok_or_else(|| shell_error(&format!("dpkg-repack: package {name} not installed")))?;
            let file_name = match self.os.package_manager {
                PackageManager::Apt => {
                    format!("{}_{}_{}.deb", package.name, package.version, package.arch)
                }
                PackageManager::Dnf => {
                    format!("{}-{}-1.fake.{}.rpm", package.name, package.version, package.arch)
                }
            };
            files.insert(
                format!("/tmp/vmsever-export/{file_name}"),
                serde_json::to_string(package).expect("serializable package"),
            );
        }
        Ok(())
    }

    fn remove_named(
        &self,
        state: &mut FakeImage,
        names: &[&str],
        clean_requirements: bool,
    ) -> GuestResult<()> {
        for name in names {
            if state.package(name).is_none() {
                return Err(shell_error(&format!("package {name} is not installed")));
            }
        }
        state.packages.retain(|p| !names.contains(&p.name.as_str()));
        if clean_requirements {
            autoremove(&mut state.packages);
        }
        Ok(())
    }

    fn install_staged(&self, state: &mut FakeImage) -> GuestResult<()> {
        let files = self.guest_files.lock().expect("fake guest files");
        for (path, content) in files.iter() {
            if !path.starts_with("/tmp/vmsever-import/") {
                continue;
            }
            let package: FakePackage = serde_json::from_str(content)
                .map_err(|_| shell_error(&format!("unreadable package file {path}")))?;
            state.packages.retain(|p| p.name != package.name);
            state.packages.push(package);
        }
        Ok(())
    }
}

#[async_trait]
impl GuestHandle for FakeHandle {
    fn os(&self) -> &OsInfo {
        &self.os
    }

    async fn sh(&self, command: &str) -> GuestResult<String> {
        let mut state = self.state.lock().expect("fake image state");
        let output = if command.starts_with("dpkg-query --show") {
            self.render_dpkg_query(&state)
        } else if command.starts_with("rpm --query --all") {
            self.render_rpm_query(&state)
        } else if let Some(rest) = command.strip_prefix("rpmdep -level --all > ") {
            let listing = self.render_rpmdep(&state);
            self.guest_files
                .lock()
                .expect("fake guest files")
                .insert(rest.trim().to_string(), listing);
            String::new()
        } else if command.starts_with("mkdir ") {
            String::new()
        } else if let Some(rest) = command.strip_prefix("cd /tmp/vmsever-export && dpkg-repack ") {
            let names: Vec<&str> = rest.split_whitespace().collect();
            self.repack(&state, &names)?;
            String::new()
        } else if let Some(rest) = command.strip_prefix("rpmrebuild --batch --directory=/tmp/vmsever-export ")
        {
            self.repack(&state, &[rest.trim()])?;
            String::new()
        } else if command.starts_with("find /tmp/vmsever-export") {
            let extension = if command.contains("*.deb") { ".deb" } else { ".rpm" };
            let files = self.guest_files.lock().expect("fake guest files");
            let mut matches: Vec<&String> = files
                .keys()
                .filter(|k| k.starts_with("/tmp/vmsever-export/") && k.ends_with(extension))
                .collect();
            matches.sort();
            matches
                .into_iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join("\n")
                + "\n"
        } else if let Some(rest) =
            command.strip_prefix("DEBIAN_FRONTEND=noninteractive apt-get --yes purge ")
        {
            let names: Vec<&str> = rest.split_whitespace().collect();
            self.remove_named(&mut state, &names, false)?;
            self.persist(&state);
            String::new()
        } else if command == "DEBIAN_FRONTEND=noninteractive apt-get --yes --purge autoremove" {
            autoremove(&mut state.packages);
            self.persist(&state);
            String::new()
        } else if let Some(rest) = command.strip_prefix("dnf --assumeyes remove ") {
            let names: Vec<&str> = rest.split_whitespace().collect();
            self.remove_named(&mut state, &names, true)?;
            self.persist(&state);
            String::new()
        } else if command.starts_with("DEBIAN_FRONTEND=noninteractive dpkg --install")
            || command.starts_with("rpm --upgrade --replacepkgs")
        {
            self.install_staged(&mut state)?;
            self.persist(&state);
            String::new()
        } else if command == "selinuxenabled" {
            if state.selinux {
                String::new()
            } else {
                return Err(shell_error("selinuxenabled: disabled"));
            }
        } else {
            return Err(shell_error(&format!("sh: {command}: command not found")));
        };
        Ok(output)
    }

    async fn upload(&self, host_path: &Path, guest_path: &str) -> GuestResult<()> {
        let content = std::fs::read_to_string(host_path).map_err(io_error)?;
        self.guest_files
            .lock()
            .expect("fake guest files")
            .insert(guest_path.to_string(), content);
        Ok(())
    }

    async fn download(&self, guest_path: &str, host_path: &Path) -> GuestResult<()> {
        let files = self.guest_files.lock().expect("fake guest files");
        let content = files
            .get(guest_path)
            .ok_or_else(|| shell_error(&format!("download: {guest_path}: no such file")))?;
        std::fs::write(host_path, content).map_err(io_error)?;
        Ok(())
    }

    async fn archive_out(&self, guest_dir: &str, host_path: &Path) -> GuestResult<()> {
        if guest_dir != "/home" {
            return Err(shell_error(&format!("tar-out: {guest_dir}: unsupported")));
        }
        let state = self.state.lock().expect("fake image state");
        let file = std::fs::File::create(host_path).map_err(io_error)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, content) in &state.home_files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path.trim_start_matches('/'), content.as_bytes())
                .map_err(io_error)?;
        }
        builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .map_err(io_error)?;
        Ok(())
    }

    async fn archive_in(&self, host_path: &Path, guest_dir: &str) -> GuestResult<()> {
        use std::io::Read;

        if guest_dir != "/home" {
            return Err(shell_error(&format!("tar-in: {guest_dir}: unsupported")));
        }
        let file = std::fs::File::open(host_path).map_err(io_error)?;
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let mut home_files = BTreeMap::new();
        for entry in archive.entries().map_err(io_error)? {
            let mut entry = entry.map_err(io_error)?;
            let path = format!("/{}", entry.path().map_err(io_error)?.display());
            let mut content = String::new();
            entry.read_to_string(&mut content).map_err(io_error)?;
            home_files.insert(path, content);
        }
        let mut state = self.state.lock().expect("fake image state");
        state.home_files = home_files;
        self.persist(&state);
        Ok(())
    }

    async fn rm_rf(&self, guest_path: &str) -> GuestResult<()> {
        if guest_path == "/home" {
            let mut state = self.state.lock().expect("fake image state");
            state.home_files.clear();
            self.persist(&state);
            return Ok(());
        }
        let prefix = format!("{}/", guest_path.trim_end_matches('/'));
        let mut files = self.guest_files.lock().expect("fake guest files");
        files.retain(|k, _| k != guest_path && !k.starts_with(&prefix));
        Ok(())
    }

    async fn exists(&self, guest_path: &str) -> GuestResult<bool> {
        if guest_path == "/.autorelabel" {
            return Ok(self.state.lock().expect("fake image state").autorelabel);
        }
        Ok(self
            .guest_files
            .lock()
            .expect("fake guest files")
            .contains_key(guest_path))
    }

    async fn close(&mut self) -> GuestResult<()> {
        let state = self.state.lock().expect("fake image state");
        self.persist(&state);
        Ok(())
    }
}

/// First alternative's package name from an apt dependency string, or the
/// name itself for dnf dependencies.
fn dependency_name(dep: &str) -> String {
    let first = dep.split('|').next().unwrap_or(dep).trim();
    first
        .split([' ', ':', '('])
        .next()
        .unwrap_or(first)
        .to_string()
}

/// Drop auto-installed packages no remaining package depends on, repeating
/// until the set is stable.
fn autoremove(packages: &mut Vec<FakePackage>) {
    loop {
        let needed: HashSet<String> = packages
            .iter()
            .flat_map(|p| p.depends.iter().chain(p.predepends.iter()))
            .map(|dep| dependency_name(dep))
            .collect();
        let before = packages.len();
        packages.retain(|p| !p.auto || p.essential || needed.contains(&p.name));
        if packages.len() == before {
            break;
        }
    }
}

#[cfg(test)]
mod unit {
    use super::*;

    #[test]
    fn autoremove_cascades_through_orphans() {
        let mut packages = vec![
            apt_package("libc", "2.23", true, false, 100, &[]),
            apt_package("app", "1.0", false, false, 10, &["liba"]),
            apt_package("liba", "1.0", false, true, 5, &["libb"]),
            apt_package("libb", "1.0", false, true, 5, &[]),
            apt_package("orphan", "1.0", false, true, 5, &[]),
        ];
        autoremove(&mut packages);
        let names: Vec<&str> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["libc", "app", "liba", "libb"]);

        // removing the app cascades through its private dependency chain
        packages.retain(|p| p.name != "app");
        autoremove(&mut packages);
        let names: Vec<&str> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["libc"]);
    }

    #[test]
    fn dependency_names_strip_constraints_and_alternatives() {
        assert_eq!(dependency_name("libssl (>= 1.0)"), "libssl");
        assert_eq!(dependency_name("a | b"), "a");
        assert_eq!(dependency_name("lib:any"), "lib");
        assert_eq!(dependency_name("plain"), "plain");
    }
}
