//! On-disk layout of the component repository and the workspace around it.
//!
//! ```text
//! localRepository/
//!   packages/            per-distribution package store, `basic/` seeded
//!   BaseImages/          retained base images + their graph files
//!   UserFolders/         one home archive per decomposed VMI
//!   db_repo_metadata.sqlite
//! VMIs/                  workspace for source images and reassembled output
//! Evaluations/           benchmark CSV files
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::Config;

/// Create any missing repository and workspace directories.
pub(crate) async fn ensure_layout(config: &Config) -> Result<()> {
    for dir in [
        config.repository_root.clone(),
        config.packages_dir(),
        config.basic_packages_dir(),
        config.base_images_dir(),
        config.user_folders_dir(),
        config.vmi_workspace.clone(),
    ] {
        tokio::fs::create_dir_all(&dir)
            .await
            .context(format!("unable to create directory '{}'", dir.display()))?;
    }
    Ok(())
}

/// Delete the repository and recreate it empty: fresh directory tree, the
/// basic package files copied back in, and a newly seeded catalog. Running
/// it twice leaves the same result.
pub(crate) async fn reset(config: &Config) -> Result<()> {
    info!("resetting repository at '{}'", config.repository_root.display());
    if config.repository_root.exists() {
        tokio::fs::remove_dir_all(&config.repository_root)
            .await
            .context("unable to remove old repository")?;
    }
    ensure_layout(config).await?;

    if config.seed_source_dir.is_dir() {
        copy_tree(&config.seed_source_dir, &config.basic_packages_dir()).context(format!(
            "unable to seed basic packages from '{}'",
            config.seed_source_dir.display()
        ))?;
    } else {
        warn!(
            "basic package source '{}' not found; store seeded without files",
            config.seed_source_dir.display()
        );
    }

    Catalog::open(config)?;
    Ok(())
}

/// Image files with an accepted extension directly inside `dir`, sorted
/// case-insensitively by file name.
pub(crate) fn vmi_paths(config: &Config, dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let entries = std::fs::read_dir(dir)
        .context(format!("unable to read directory '{}'", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && config.is_valid_format(&path) {
            paths.push(path);
        }
    }
    paths.sort_by_key(|path| {
        path.file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    });
    Ok(paths)
}

/// Total size in bytes of all files under `path`.
pub(crate) fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            total += dir_size(&entry_path);
        } else if let Ok(metadata) = entry.metadata() {
            total += metadata.len();
        }
    }
    total
}

/// Recursively copy a directory tree.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Move a file, falling back to copy-and-delete across filesystems.
pub(crate) async fn move_file(from: &Path, to: &Path) -> Result<()> {
    debug!("moving '{}' to '{}'", from.display(), to.display());
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(from, to).await.context(format!(
                "unable to copy '{}' to '{}'",
                from.display(),
                to.display()
            ))?;
            tokio::fs::remove_file(from)
                .await
                .context(format!("unable to remove '{}' after copy", from.display()))?;
            Ok(())
        }
    }
}
