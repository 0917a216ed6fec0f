use crate::graph::PackageInfo;
use std::path::{Path, PathBuf};

/// Names of the fixed entries inside the repository root.
const PACKAGES_DIR: &str = "packages";
const BASIC_PACKAGES_DIR: &str = "basic";
const BASE_IMAGES_DIR: &str = "BaseImages";
const USER_FOLDERS_DIR: &str = "UserFolders";
const CATALOG_FILE: &str = "db_repo_metadata.sqlite";

/// Process-wide settings, passed explicitly to the services that need them.
///
/// Everything here is convention rather than user choice: the repository
/// directory scheme, the accepted image formats, and the seed of packages
/// that cannot be repackaged from a running guest.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// Root of the component repository (`localRepository/`).
    pub(crate) repository_root: PathBuf,
    /// Workspace for reassembled output and source images (`VMIs/`).
    pub(crate) vmi_workspace: PathBuf,
    /// Where evaluation CSV files are written (`Evaluations/`).
    pub(crate) evaluations_dir: PathBuf,
    /// Host directory holding the pre-built basic package files copied into
    /// the store at reset.
    pub(crate) seed_source_dir: PathBuf,
    /// Accepted image file extensions.
    pub(crate) valid_formats: Vec<String>,
    /// Per-distribution packages seeded into the catalog at creation because
    /// they cannot be exported from a guest.
    pub(crate) basic_packages: Vec<(String, PackageInfo)>,
}

impl Config {
    pub(crate) fn default_layout() -> Self {
        let repository_root = PathBuf::from("localRepository");
        let basic_dir = repository_root.join(PACKAGES_DIR).join(BASIC_PACKAGES_DIR);
        Self {
            basic_packages: basic_seed(&basic_dir),
            repository_root,
            vmi_workspace: PathBuf::from("VMIs"),
            evaluations_dir: PathBuf::from("Evaluations"),
            seed_source_dir: PathBuf::from("files").join(BASIC_PACKAGES_DIR),
            valid_formats: vec!["qcow2".to_string()],
        }
    }

    /// Layout with every path anchored under `root`, used by tests.
    #[cfg(test)]
    pub(crate) fn rooted(root: &Path) -> Self {
        let defaults = Self::default_layout();
        let repository_root = root.join(&defaults.repository_root);
        let basic_dir = repository_root.join(PACKAGES_DIR).join(BASIC_PACKAGES_DIR);
        Self {
            basic_packages: basic_seed(&basic_dir),
            repository_root,
            vmi_workspace: root.join(defaults.vmi_workspace),
            evaluations_dir: root.join(defaults.evaluations_dir),
            seed_source_dir: root.join(defaults.seed_source_dir),
            valid_formats: defaults.valid_formats,
        }
    }

    pub(crate) fn packages_dir(&self) -> PathBuf {
        self.repository_root.join(PACKAGES_DIR)
    }

    pub(crate) fn basic_packages_dir(&self) -> PathBuf {
        self.packages_dir().join(BASIC_PACKAGES_DIR)
    }

    pub(crate) fn distribution_packages_dir(&self, distribution: &str) -> PathBuf {
        self.packages_dir().join(distribution)
    }

    pub(crate) fn base_images_dir(&self) -> PathBuf {
        self.repository_root.join(BASE_IMAGES_DIR)
    }

    pub(crate) fn user_folders_dir(&self) -> PathBuf {
        self.repository_root.join(USER_FOLDERS_DIR)
    }

    pub(crate) fn catalog_path(&self) -> PathBuf {
        self.repository_root.join(CATALOG_FILE)
    }

    /// Whether a file carries one of the accepted image extensions.
    pub(crate) fn is_valid_format(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.valid_formats.iter().any(|v| v == e))
            .unwrap_or(false)
    }
}

/// Packages that cannot be rebuilt from an installed system and therefore
/// ship with the repository instead of being exported on decomposition.
fn basic_seed(basic_dir: &Path) -> Vec<(String, PackageInfo)> {
    vec![
        (
            "fedora".to_string(),
            PackageInfo {
                name: "filesystem".to_string(),
                version: "3.2".to_string(),
                architecture: "x86_64".to_string(),
                essential: false,
                size: 0,
                path: Some(basic_dir.join("fedora/filesystem-3.2-40.fc26.x86_64.rpm")),
            },
        ),
        (
            "fedora".to_string(),
            PackageInfo {
                name: "jemalloc".to_string(),
                version: "4.5.0".to_string(),
                architecture: "x86_64".to_string(),
                essential: false,
                size: 666_211,
                path: Some(basic_dir.join("fedora/jemalloc-4.5.0-1.fc26.x86_64.rpm")),
            },
        ),
    ]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_format_by_extension() {
        let config = Config::default_layout();
        assert!(config.is_valid_format(Path::new("images/web.qcow2")));
        assert!(!config.is_valid_format(Path::new("images/web.vmdk")));
        assert!(!config.is_valid_format(Path::new("qcow2")));
    }

    #[test]
    fn catalog_lives_inside_repository() {
        let config = Config::default_layout();
        assert!(config.catalog_path().starts_with(&config.repository_root));
    }
}
