use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use guest_cli_wrapper::GuestTool;
use log::info;

use crate::cmd::{guest_tool, require_relative};
use crate::common::{confirm, prompt_line};
use crate::config::Config;
use crate::descriptor::VmiDescriptor;
use crate::repository;
use crate::sidecar::{sidecar_path, Sidecar};

/// Inspect a VMI (or every VMI in a folder) and write the sidecar manifest
/// that declares its main services.
#[derive(Debug, Parser)]
pub(crate) struct Inspect {
    /// VMI file or folder of VMI files, relative to the working directory.
    path: std::path::PathBuf,
}

impl Inspect {
    pub(crate) async fn run(&self, config: &Config) -> Result<()> {
        require_relative(&self.path)?;
        repository::ensure_layout(config).await?;
        let tool = guest_tool()?;
        if self.path.is_file() {
            inspect_vmi(config, &tool, &self.path, None).await
        } else if self.path.is_dir() {
            inspect_folder(config, &tool, &self.path).await
        } else {
            bail!("'{}' is not a valid path", self.path.display());
        }
    }
}

async fn inspect_folder(config: &Config, tool: &GuestTool, dir: &Path) -> Result<()> {
    let vmi_paths = repository::vmi_paths(config, dir)?;
    let (with_meta, without_meta): (Vec<_>, Vec<_>) = vmi_paths
        .iter()
        .cloned()
        .partition(|path| sidecar_path(path).is_file());
    info!(
        "inspecting VMIs in folder '{}': {} found, {} with existing meta files",
        dir.display(),
        vmi_paths.len(),
        with_meta.len()
    );

    let (paths, replace) = if with_meta.is_empty() {
        (vmi_paths, None)
    } else {
        let names: Vec<String> = with_meta
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        let overwrite = confirm(&format!(
            "There already exist meta files for the following VMIs. Replace all, yes or [no]?\n{}\n",
            names.join(", ")
        ))?;
        if overwrite {
            (vmi_paths, Some(true))
        } else {
            println!("Meta files will not be overridden.");
            (without_meta, Some(false))
        }
    };

    if paths.is_empty() {
        println!("No VMIs to inspect.");
        return Ok(());
    }
    for (count, path) in paths.iter().enumerate() {
        println!("VMI {}/{}", count + 1, paths.len());
        inspect_vmi(config, tool, path, replace).await?;
    }
    Ok(())
}

async fn inspect_vmi(
    config: &Config,
    tool: &GuestTool,
    path: &Path,
    replace: Option<bool>,
) -> Result<()> {
    info!("inspecting VMI '{}'", path.display());
    if !config.is_valid_format(path) {
        bail!(
            "file extension of '{}' is not supported; supported extensions: {}",
            path.display(),
            config.valid_formats.join(",")
        );
    }
    let meta_path = sidecar_path(path);
    if meta_path.is_file() {
        let overwrite = match replace {
            Some(overwrite) => overwrite,
            None => confirm(&format!(
                "There already exists a meta data file for the VMI '{}'. Replace, yes or [no]?",
                path.display()
            ))?,
        };
        if !overwrite {
            println!("Meta file will not be replaced.");
            return Ok(());
        }
        println!("Existing meta file will be replaced.");
    }

    info!("creating descriptor for '{}'", path.display());
    let mut handle = tool.open(path, false).await?;
    let descriptor = VmiDescriptor::from_guest(path, "inspection", Vec::new(), &*handle).await;
    let close_result = handle.close().await;
    let mut vmi = descriptor?;
    close_result.context("unable to close guest handle")?;

    // Main services are entered interactively and validated against the
    // installed packages before the sidecar is written.
    loop {
        let input = prompt_line("Enter Main Services in format \"MS1,MS2,...\":")?;
        vmi.main_services = input
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let mut all_found = !vmi.main_services.is_empty();
        for ms in &vmi.main_services {
            if !vmi.base.graph.contains(ms) {
                all_found = false;
                println!("Main Service \"{ms}\" does not exist");
                let similar = vmi.base.graph.names_containing(ms);
                if similar.is_empty() {
                    println!("No similar packages found.");
                } else {
                    println!("Did you mean one of the following?\n{}", similar.join(","));
                }
            }
        }
        if all_found {
            println!("Provided Main Services exist in VMI.");
            if confirm("Correct, yes or no?")? {
                break;
            }
        }
    }

    let sidecar = Sidecar {
        vmi_file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        install_size: vmi.base.graph.total_install_size(),
        main_services: vmi.main_services.clone(),
    };
    sidecar.save(&meta_path)?;
    info!(
        "finished inspection of '{}'; meta file written to '{}'",
        path.display(),
        meta_path.display()
    );
    Ok(())
}
