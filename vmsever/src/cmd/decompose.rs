use std::path::Path;

use anyhow::{bail, ensure, Result};
use clap::Parser;
use guest_cli_wrapper::GuestTool;
use log::info;

use crate::cmd::{guest_tool, require_relative};
use crate::common::confirm;
use crate::config::Config;
use crate::decompose::{DecompositionOutcome, Decomposer};
use crate::repository;
use crate::sidecar::{sidecar_path, Sidecar};

/// Decompose a VMI (or every VMI in a folder) into the repository. Each VMI
/// needs the sidecar manifest written by `inspect`.
#[derive(Debug, Parser)]
pub(crate) struct Decompose {
    /// VMI file or folder of VMI files, relative to the working directory.
    path: std::path::PathBuf,
}

impl Decompose {
    pub(crate) async fn run(&self, config: &Config) -> Result<()> {
        require_relative(&self.path)?;
        repository::ensure_layout(config).await?;
        let tool = guest_tool()?;
        if self.path.is_file() {
            decompose_vmi(config, &tool, &self.path).await?;
            Ok(())
        } else if self.path.is_dir() {
            decompose_folder(config, &tool, &self.path).await
        } else {
            bail!("'{}' is not a valid path", self.path.display());
        }
    }
}

async fn decompose_folder(config: &Config, tool: &GuestTool, dir: &Path) -> Result<()> {
    let vmi_paths = repository::vmi_paths(config, dir)?;
    let (with_meta, without_meta): (Vec<_>, Vec<_>) = vmi_paths
        .iter()
        .cloned()
        .partition(|path| sidecar_path(path).is_file());
    info!(
        "decomposing VMIs in folder '{}': {} found, {} with meta files",
        dir.display(),
        vmi_paths.len(),
        with_meta.len()
    );

    ensure!(
        !with_meta.is_empty(),
        "meta files are required for decomposition; run `inspect` first"
    );
    let paths = if without_meta.is_empty() {
        with_meta
    } else {
        let names: Vec<String> = without_meta
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        let proceed = confirm(&format!(
            "There are missing meta files for the following VMIs. Continue with the remaining {}, yes or [no]?\n{}\n",
            with_meta.len(),
            names.join(", ")
        ))?;
        if !proceed {
            println!("Aborting decomposition of VMIs.");
            return Ok(());
        }
        with_meta
    };

    for (count, path) in paths.iter().enumerate() {
        println!("VMI {}/{}", count + 1, paths.len());
        decompose_vmi(config, tool, path).await?;
    }
    Ok(())
}

pub(crate) async fn decompose_vmi(
    config: &Config,
    tool: &GuestTool,
    path: &Path,
) -> Result<DecompositionOutcome> {
    ensure!(path.is_file(), "file '{}' does not exist", path.display());
    ensure!(
        config.is_valid_format(path),
        "file extension of '{}' is not supported; supported extensions: {}",
        path.display(),
        config.valid_formats.join(",")
    );
    let meta_path = sidecar_path(path);
    ensure!(
        meta_path.is_file(),
        "meta file '{}' does not exist; run `inspect` first",
        meta_path.display()
    );
    let sidecar = Sidecar::load(&meta_path)?;
    let vmi_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let outcome = Decomposer::new(config, tool)
        .decompose(path, &vmi_name, sidecar.main_services)
        .await?;
    tokio::fs::remove_file(&meta_path).await?;
    Ok(outcome)
}
