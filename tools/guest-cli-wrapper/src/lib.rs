//! Guest introspection enablement library implements a standardized way of
//! calling the libguestfs command line tools to work with the filesystems
//! inside a virtual machine image.
//!
//! The real backend drives a `guestfish --listen` remote session for mounted
//! access (shell execution, file transfer, archive in/out) and shells out to
//! `virt-sysprep`/`virt-customize` for whole-image operations. Consumers only
//! see the [`GuestBackend`]/[`GuestHandle`] traits, so tests can substitute a
//! fake without any of the tools installed.

use std::fmt::{Display, Formatter};
use std::path::Path;

use async_trait::async_trait;
use guestfish::GuestfishCli;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use which::which;

mod cli;
mod guestfish;

#[derive(Debug)]
pub struct GuestTool {
    backend: Box<dyn GuestBackend>,
}

impl GuestTool {
    /// Locates the libguestfs tools in the unix search path.
    pub fn from_environment() -> Result<Self> {
        let backend = Box::new(GuestfishCli {
            guestfish: which("guestfish").context(error::NotFoundSnafu { name: "guestfish" })?,
            virt_sysprep: which("virt-sysprep")
                .context(error::NotFoundSnafu { name: "virt-sysprep" })?,
            virt_customize: which("virt-customize")
                .context(error::NotFoundSnafu { name: "virt-customize" })?,
        });
        Ok(Self { backend })
    }

    pub fn new(backend: Box<dyn GuestBackend>) -> Self {
        Self { backend }
    }

    /// Launch the backend for an image and mount the single OS it contains.
    ///
    /// Fails with [`error::Error::NoOs`]/[`error::Error::MultiOs`] unless
    /// inspection finds exactly one root filesystem.
    pub async fn open(&self, image: &Path, readwrite: bool) -> Result<Box<dyn GuestHandle>> {
        self.backend.open(image, readwrite).await
    }

    /// Clear machine identity (logs, machine-id, SSH host keys, DHCP client
    /// state) on a closed image.
    pub async fn reset_machine_identity(&self, image: &Path) -> Result<()> {
        self.backend.reset_machine_identity(image).await
    }

    /// Schedule an SELinux filesystem relabel pass on a closed image.
    pub async fn selinux_relabel(&self, image: &Path) -> Result<()> {
        self.backend.selinux_relabel(image).await
    }
}

#[async_trait]
pub trait GuestBackend: std::fmt::Debug + Send + Sync + 'static {
    /// Launch the backend for an image and mount the single OS it contains.
    async fn open(&self, image: &Path, readwrite: bool) -> Result<Box<dyn GuestHandle>>;
    /// Clear machine identity on a closed image.
    async fn reset_machine_identity(&self, image: &Path) -> Result<()>;
    /// Schedule an SELinux relabel pass on a closed image.
    async fn selinux_relabel(&self, image: &Path) -> Result<()>;
}

/// A mounted view of a guest filesystem. At most one handle may be open per
/// image file; [`GuestHandle::close`] must be called on every exit path.
#[async_trait]
pub trait GuestHandle: std::fmt::Debug + Send {
    /// Inspection data gathered while opening the handle.
    fn os(&self) -> &OsInfo;

    /// Run a shell command inside the guest, returning its stdout.
    ///
    /// A failing command surfaces as [`error::Error::Shell`] carrying the
    /// captured stderr so callers can decide whether the failure is benign.
    async fn sh(&self, command: &str) -> Result<String>;

    /// Copy a file from the host into the guest.
    async fn upload(&self, host_path: &Path, guest_path: &str) -> Result<()>;

    /// Copy a file out of the guest onto the host.
    async fn download(&self, guest_path: &str, host_path: &Path) -> Result<()>;

    /// Pack a guest directory into a gzip-compressed tarball on the host.
    async fn archive_out(&self, guest_dir: &str, host_path: &Path) -> Result<()>;

    /// Unpack a gzip-compressed host tarball into a guest directory.
    async fn archive_in(&self, host_path: &Path, guest_dir: &str) -> Result<()>;

    /// Recursively delete a guest path.
    async fn rm_rf(&self, guest_path: &str) -> Result<()>;

    /// Whether a guest path exists.
    async fn exists(&self, guest_path: &str) -> Result<bool>;

    /// Unmount everything and shut the backend down.
    async fn close(&mut self) -> Result<()>;
}

/// What inspection learned about the operating system on an image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsInfo {
    pub distribution: String,
    pub major_version: u32,
    pub minor_version: u32,
    pub architecture: String,
    pub package_manager: PackageManager,
}

impl OsInfo {
    /// Distribution version in the `major_minor` form used throughout the
    /// repository ("16_4", "26_0").
    pub fn version(&self) -> String {
        format!("{}_{}", self.major_version, self.minor_version)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
}

impl TryFrom<&str> for PackageManager {
    type Error = error::Error;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "apt" => Ok(PackageManager::Apt),
            // libguestfs reports "dnf" on current Fedora and "yum" on older
            // releases of the same family.
            "dnf" | "yum" => Ok(PackageManager::Dnf),
            _ => Err(error::Error::UnsupportedPackageManager {
                name: value.to_string(),
            }),
        }
    }
}

impl Display for PackageManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Apt => "apt",
            Self::Dnf => "dnf",
        })
    }
}

pub type Result<T> = std::result::Result<T, error::Error>;

pub mod error {
    use std::path::PathBuf;

    use snafu::Snafu;

    #[derive(Snafu, Debug)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to execute guest tool, {message}: {source}"))]
        CommandFailed {
            message: String,
            source: std::io::Error,
        },

        #[snafu(display("Failed to parse guest inspection output: {message}"))]
        InspectParse { message: String },

        #[snafu(display("guestfish did not report a listener pid: {output}"))]
        Listen { output: String },

        #[snafu(display("More than one operating system found in '{}'", image.display()))]
        MultiOs { image: PathBuf },

        #[snafu(display("No operating system found in '{}'", image.display()))]
        NoOs { image: PathBuf },

        #[snafu(display(
            "Unable to find '{}', please install libguestfs tools: {}",
            name,
            source
        ))]
        NotFound { name: String, source: which::Error },

        #[snafu(display("Failed to run operation with guest tool: {message}\n command: {} {}", program.display(), args.join(" ")))]
        OperationFailed {
            message: String,
            program: PathBuf,
            args: Vec<String>,
        },

        #[snafu(display("Guest command '{command}' failed with {status}: {stderr}"))]
        Shell {
            command: String,
            status: i32,
            stdout: String,
            stderr: String,
        },

        #[snafu(display("Unsupported package manager '{}'", name))]
        UnsupportedPackageManager { name: String },
    }
}
