//! Reassembly of a decomposed VMI back into a bootable image.
//!
//! The base image is copied to the output workspace, its machine identity is
//! reset, the home archive is restored, and every recorded package the base
//! does not already carry is reinstalled. Package installation errors are
//! not fatal: they end up in an `_ERROR.log` next to the output image.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use guest_cli_wrapper::{GuestHandle, GuestTool};
use log::{info, warn};

use crate::catalog::{Catalog, VmiData};
use crate::config::Config;
use crate::manipulate::VmiManipulator;

pub(crate) struct Reassembler<'a> {
    config: &'a Config,
    tool: &'a GuestTool,
}

/// What one reassembly did, for reporting and evaluation.
#[derive(Debug)]
pub(crate) struct ReassemblyOutcome {
    pub(crate) output_path: PathBuf,
    /// Where import errors were written, when there were any.
    pub(crate) error_log: Option<PathBuf>,
    pub(crate) base_file_name: String,
    pub(crate) base_size: u64,
    pub(crate) main_services: Vec<String>,
    pub(crate) required_packages: usize,
    pub(crate) imported_packages: usize,
    pub(crate) required_size: u64,
    pub(crate) imported_size: u64,
    pub(crate) copy_secs: f64,
    pub(crate) reset_secs: f64,
    pub(crate) import_secs: f64,
    pub(crate) handle_creation_secs: f64,
}

impl<'a> Reassembler<'a> {
    pub(crate) fn new(config: &'a Config, tool: &'a GuestTool) -> Self {
        Self { config, tool }
    }

    pub(crate) async fn reassemble(&self, vmi_name: &str) -> Result<ReassemblyOutcome> {
        info!("reassembling VMI '{vmi_name}'");
        let catalog = Catalog::open(self.config)?;
        let data = catalog.vmi_record(vmi_name)?.context(format!(
            "cannot reassemble VMI '{vmi_name}': no VMI with that name exists in the catalog"
        ))?;
        ensure!(
            !data.main_services.is_empty() && !data.packages.is_empty(),
            "error while reassembling VMI '{vmi_name}': insufficient data in catalog"
        );
        ensure!(
            data.base.image_path.is_file(),
            "error while reassembling: base image '{}' does not exist",
            data.base.image_path.display()
        );
        ensure!(
            data.user_dir_path.is_file(),
            "error while reassembling: compressed user directory '{}' does not exist",
            data.user_dir_path.display()
        );

        let output_path = self.output_path(vmi_name, &data.base.image_path)?;
        ensure!(
            !output_path.exists(),
            "error while reassembling VMI '{vmi_name}': '{}' already exists. Was it reassembled before?",
            output_path.display()
        );

        info!("copying base image to '{}'", output_path.display());
        let start = Instant::now();
        tokio::fs::copy(&data.base.image_path, &output_path)
            .await
            .context("unable to copy base image")?;
        let copy_secs = start.elapsed().as_secs_f64();

        let start = Instant::now();
        self.tool.reset_machine_identity(&output_path).await?;
        let reset_secs = start.elapsed().as_secs_f64();

        let start = Instant::now();
        let mut handle = self.tool.open(&output_path, true).await?;
        let handle_creation_secs = start.elapsed().as_secs_f64();

        let guest_phase = self
            .guest_phase(&*handle, vmi_name, &data, &output_path)
            .await;
        let close_result = handle.close().await;
        let (selinux, import_errors, mut outcome) = guest_phase?;
        close_result.context("unable to close guest handle")?;

        if selinux {
            self.tool.selinux_relabel(&output_path).await?;
        }

        outcome.copy_secs = copy_secs;
        outcome.reset_secs = reset_secs;
        outcome.handle_creation_secs = handle_creation_secs;
        outcome.base_size = tokio::fs::metadata(&data.base.image_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        match import_errors {
            None => {
                info!("reassembling finished, VMI saved in '{}'", output_path.display());
            }
            Some(errors) => {
                let log_path = output_path.with_file_name(format!(
                    "{}_ERROR.log",
                    output_path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or(vmi_name)
                ));
                tokio::fs::write(&log_path, &errors)
                    .await
                    .context("unable to write import error log")?;
                warn!("importing packages exited with errors");
                warn!(
                    "it is assumed that the errors were due to missing user interaction \
                     and that the services work anyway; inspecting the log is advised"
                );
                warn!("log saved in '{}'", log_path.display());
                outcome.error_log = Some(log_path);
            }
        }
        Ok(outcome)
    }

    /// Steps against the open guest: SELinux detection, home restore, and
    /// the package import. Returns the detected SELinux state and any
    /// non-fatal import error output.
    async fn guest_phase(
        &self,
        handle: &dyn GuestHandle,
        vmi_name: &str,
        data: &VmiData,
        output_path: &Path,
    ) -> Result<(bool, Option<String>, ReassemblyOutcome)> {
        let manipulator = VmiManipulator::new(handle, vmi_name, self.config);
        let selinux = manipulator.selinux_enabled().await?;

        manipulator.import_home_dir(&data.user_dir_path).await?;

        // Packages already on the base (same name, version, and
        // architecture) need not be imported again.
        let base_packages = data.base.graph.node_data();
        let mut required_files = Vec::new();
        let mut required_size = 0u64;
        let mut total_size = 0u64;
        for (name, info) in &data.packages {
            total_size += info.size;
            let already_present = base_packages.get(name.as_str()).is_some_and(|present| {
                present.version == info.version && present.architecture == info.architecture
            });
            if !already_present {
                required_size += info.size;
                required_files.push(info.path.as_ref().context(format!(
                    "catalog corruption: package '{name}' has no stored file"
                ))?);
            }
        }
        info!(
            "package import: main services {}; {} package(s) required, {} already in base, {} to import",
            data.main_services.join(","),
            data.packages.len(),
            data.packages.len() - required_files.len(),
            required_files.len(),
        );

        let start = Instant::now();
        let file_refs: Vec<&Path> = required_files.iter().map(|p| p.as_path()).collect();
        let import_errors = manipulator
            .import_packages(&data.main_services, &file_refs)
            .await?;
        let import_secs = start.elapsed().as_secs_f64();

        let outcome = ReassemblyOutcome {
            output_path: output_path.to_path_buf(),
            error_log: None,
            base_file_name: data
                .base
                .image_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            base_size: 0,
            main_services: data.main_services.clone(),
            required_packages: data.packages.len(),
            imported_packages: file_refs.len(),
            required_size: total_size,
            imported_size: required_size,
            copy_secs: 0.0,
            reset_secs: 0.0,
            import_secs,
            handle_creation_secs: 0.0,
        };
        Ok((selinux, import_errors, outcome))
    }

    /// Output lands in the VMI workspace under the base image's extension.
    fn output_path(&self, vmi_name: &str, base_image: &Path) -> Result<PathBuf> {
        let extension = base_image
            .extension()
            .and_then(|e| e.to_str())
            .context(format!(
                "base image '{}' has no file extension",
                base_image.display()
            ))?;
        let stem = vmi_name
            .strip_suffix(".qcow2")
            .or_else(|| vmi_name.strip_suffix(".img"))
            .unwrap_or(vmi_name);
        if stem.is_empty() {
            bail!("VMI name '{vmi_name}' yields an empty output name");
        }
        Ok(self.config.vmi_workspace.join(format!("{stem}.{extension}")))
    }
}
